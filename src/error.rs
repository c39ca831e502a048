//! Error types for the engine
//!
//! Every fallible operation returns [`EngineResult`]. Only
//! [`EngineError::RetryConflict`] is ever retried, and only by the
//! unit-of-work factory.

use crate::upcast::SortError;
use crate::validation::ValidationError;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur in the engine
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Another writer advanced the log first. Retried by the factory.
    #[error("write conflict: attempted version {attempted}, log expected {next}")]
    RetryConflict {
        /// Version the publisher tried to write
        attempted: i64,
        /// Next version the log would have accepted
        next: i64,
    },

    /// No policy grants the requested publish or read.
    #[error("unauthorized: {action}")]
    Unauthorized {
        /// Human-readable description of what was denied
        action: String,
    },

    /// Operation on a unit of work that is not active.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Upcaster dependency graph could not be ordered.
    #[error(transparent)]
    Sort(#[from] SortError),

    /// A validator rejected an event or aggregate.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A listener was folded out of order.
    #[error("listener fold out of order: expected version {expected}, got {found}")]
    VersionGap {
        /// Version the listener expected next
        expected: i64,
        /// Version that was offered
        found: i64,
    },

    /// A side-effect handler failed.
    #[error("side effect {handler} failed: {message}")]
    Handler {
        /// Name of the failing handler
        handler: &'static str,
        /// Failure description
        message: String,
    },

    /// The caller cancelled a wait.
    #[error("operation cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Build an `Unauthorized` error
    pub fn unauthorized(action: impl Into<String>) -> Self {
        Self::Unauthorized {
            action: action.into(),
        }
    }

    /// Build an `InvalidState` error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Whether this failure is an optimistic-concurrency collision
    pub fn is_retry_conflict(&self) -> bool {
        matches!(self, Self::RetryConflict { .. })
    }
}
