//! Error taxonomy for the recoverable failure modes of [`crate::world::World`].
//!
//! Contract violations that would otherwise corrupt raw memory (an invalid
//! component id, an out-of-range system id) remain hard assertions at the
//! call site rather than `Result`s; see the module docs on
//! [`crate::world`] for the rationale. Only the two failure modes that can
//! arise from a correctly-used world, a task panicking mid-stage or a
//! system callback reporting failure, are modeled as errors here.

use thiserror::Error;

/// A system callback's own failure report, returned from its closure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("system {system_id} failed: {message}")]
pub struct SystemError {
    pub system_id: u32,
    pub message: String,
}

impl SystemError {
    pub fn new(system_id: u32, message: impl Into<String>) -> Self {
        Self {
            system_id,
            message: message.into(),
        }
    }
}

/// Failure surfaced from [`crate::world::World::progress`] or
/// [`crate::world::World::run_system`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProgressError {
    /// A task pool worker panicked while executing a system slice. Carries
    /// the numeric code used by the design this crate follows, kept for
    /// debugging parity with non-Rust embedders of the same model.
    #[error("task backend failed (code {code})")]
    TaskPanicked { code: i32 },
    /// A system callback returned an error; later stages were skipped but
    /// the world remains in a consistent, usable state.
    #[error("system failed: {0}")]
    SystemFailed(#[from] SystemError),
}
