//! Thin wrappers around Linux kernel primitives.
//!
//! Dependency direction: namespace -> mount -> cgroup

pub mod cgroup;
pub mod mount;
pub mod namespace;
