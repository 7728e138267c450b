//! Safety and cleanup
//!
//! Workspaces that never outlive their lifecycle, and the unwind stack that
//! undoes a setup which failed halfway.

pub mod cleanup;
pub mod workspace;
