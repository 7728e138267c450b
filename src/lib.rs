//! lvpeek: throwaway read-only snapshots of logical volumes
//!
//! A setup invocation snapshots a volume, mounts it read-only in a private
//! mount namespace and execs the user's command there, after joining a group
//! in a named cgroup v1 hierarchy with `notify_on_release` set. When the last
//! process in that group exits, the kernel spawns the release agent, which
//! tears everything down from the group path alone.
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::namespace`]: private mount namespace
//! - [`kernel::cgroup`]: tracking hierarchy, group backend and tracker
//! - [`kernel::mount`]: hierarchy, snapshot and unmount operations
//!
//! ## Identity ([`core`])
//! - [`core::identity`]: snapshot identity and its group-path codec
//!
//! ## Volumes ([`volume`])
//! - [`volume::lvm`]: LVM2 commands behind the [`volume::VolumeManager`] seam
//!
//! ## Execution Control ([`exec`])
//! - [`exec::preexec`]: type-state setup chain ending in exec
//! - [`exec::controller`]: setup and kernel-triggered teardown
//!
//! ## Safety & Cleanup ([`safety`])
//! - [`safety::workspace`]: per-lifecycle workspace directories
//! - [`safety::cleanup`]: unwind stack for failed setups
//!
//! ## Observability ([`observability`])
//! - [`observability::journal`]: operator-facing teardown journal
//!
//! ## Configuration ([`config`])
//! - [`config::config`]: JSON configuration with defaults
//! - [`config::types`]: requests and the error taxonomy
//!
//! ## Testing Infrastructure ([`testing`])
//! - [`testing::fakes`]: in-memory mount table, group hierarchy and volume manager

// Kernel Primitives
pub mod kernel;

// Identity
pub mod core;

// Volumes
pub mod volume;

// Execution Control
pub mod exec;

// Safety & Cleanup
pub mod safety;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Testing Infrastructure
pub mod testing;

// CLI
pub mod cli;

pub use config::types::{LifecycleRequest, LvpeekError, Result, SetupRequest, TeardownRequest};
pub use exec::{SnapshotController, TeardownReport};
