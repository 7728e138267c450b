//! Observability
//!
//! Diagnostics go through the `log` facade; the journal keeps the
//! operator-facing record of every teardown.

pub mod journal;

pub use journal::Journal;
