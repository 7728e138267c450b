//! Lifecycle core.
//!
//! The identity that ties a tracked group, a snapshot, and a workspace
//! together across the setup and teardown invocations.

pub mod identity;

pub use identity::{decode, encode, SnapshotIdentity};
