//! Mount management
//!
//! Hierarchy and snapshot mounts, with "not mounted" tolerated on teardown.

pub mod filesystem;

// Re-export commonly used items
pub use filesystem::*;
