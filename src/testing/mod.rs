//! Testing infrastructure
//!
//! In-memory implementations of the mount, group and volume seams so the
//! whole lifecycle can be driven without root, LVM, or cgroup v1.

pub mod fakes;

pub use fakes::{FakeMountTable, FakeVolumeManager, MemoryGroupBackend};
