//! Configuration
//!
//! File-backed settings and the request and error types shared by every module.

pub mod config;
pub mod types;
