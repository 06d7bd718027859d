//! Engine-level error types.
//!
//! Each subsystem keeps its own error enum (`ModelError`, `ToolError`,
//! `CheckpointError`, ...); `EngineError` is the umbrella the turn loop and
//! the thread facade return. Recoverable tool-side failures never surface
//! here; they are materialized into the message stream as error results so
//! the model can react to them.

use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::event::EventError;
use crate::model::ModelError;

/// Error returned by turn execution and the thread facade.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The model backend failed terminally (auth, invalid request, retries exhausted).
    #[error("model: {0}")]
    Model(#[from] ModelError),

    /// Checkpoint store failure that could not be absorbed (e.g. resume from
    /// a thread with no checkpoints).
    #[error("checkpoint: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Event coordination failure (bidirectional response timed out or the
    /// turn was cancelled while waiting).
    #[error("event: {0}")]
    Event(#[from] EventError),

    /// A middleware hook failed.
    #[error("middleware {name}: {message}")]
    Middleware { name: String, message: String },

    /// The turn was cancelled via its cancellation token (the per-turn
    /// wall-clock timeout trips the same token).
    #[error("cancelled")]
    Cancelled,

    /// Snapshot bytes could not be decoded.
    #[error("snapshot: {0}")]
    Snapshot(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: Display of each variant names its subsystem.
    #[test]
    fn engine_error_display_variants() {
        let e = EngineError::Middleware {
            name: "circuit_breaker".into(),
            message: "boom".into(),
        };
        assert!(e.to_string().contains("circuit_breaker"));
        assert!(EngineError::Cancelled.to_string().contains("cancelled"));
        assert!(EngineError::Snapshot("bad".into())
            .to_string()
            .contains("snapshot"));
    }
}
