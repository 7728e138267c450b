//! Group tracking
//!
//! A named cgroup v1 hierarchy with release notification, used to learn when
//! the last process using a snapshot has exited.

pub mod backend;
pub mod tracker;
pub mod v1;

// Re-export commonly used items
pub use backend::GroupBackend;
pub use tracker::{GroupTracker, HierarchyHandle, JoinedGroup};
pub use v1::CgroupV1;
