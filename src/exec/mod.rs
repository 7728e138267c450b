//! Execution control
//!
//! The type-state setup chain and the controller driving both lifecycle phases.

pub mod controller;
pub mod preexec;

pub use controller::{SnapshotController, TeardownReport};
pub use preexec::{Handoff, Setup, SetupContext};
