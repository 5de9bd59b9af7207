//! Error types for the admission layer.

use thiserror::Error;

use crate::priority::ClassId;

/// Result type alias for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Error variants surfaced to callers of the admission queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The request's intent was cancelled before it reached the sink.
    #[error("I/O request cancelled")]
    Cancelled,

    /// Failure reported by the execution backend, passed through verbatim.
    #[error("Backend error: {0}")]
    Backend(#[from] std::io::Error),

    /// The completion was dropped without being resolved.
    #[error("I/O request abandoned before completion")]
    Abandoned,

    /// The priority class was never registered with the capacity group.
    #[error("Unknown priority class: {class}")]
    UnknownClass {
        /// The class id that was not found.
        class: ClassId,
    },

    /// Configuration or registration was rejected.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the problem.
        reason: String,
    },
}

impl QueueError {
    /// Returns true for the cancellation outcome.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueueError::Cancelled)
    }
}
