//! Error types for the engine.

use driftsync_core::ErrorClass;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors returned by caller-supplied remote operations.
///
/// The variant determines how the engine reacts: transient errors are
/// retried with backoff and stay invisible to the caller; permanent errors
/// roll back the optimistic entity and reject the caller's settled handle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The network was unreachable or the request was dropped. Retried.
    #[error("network error: {0}")]
    Network(String),

    /// The operation exceeded its deadline. Retried; the original request
    /// may still have succeeded server-side, which is why create operations
    /// carry natural keys.
    #[error("remote operation timed out")]
    Timeout,

    /// The remote store rejected the input. Never retried.
    #[error("validation rejected: {0}")]
    Validation(String),

    /// The target entity was altered or removed remotely since the
    /// optimistic apply. Never retried; surfaced for manual reconciliation
    /// rather than silently overwritten.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl RemoteError {
    /// Returns the failure classification for this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            RemoteError::Network(_) | RemoteError::Timeout => ErrorClass::Retryable,
            RemoteError::Validation(_) | RemoteError::Conflict(_) => ErrorClass::Permanent,
        }
    }

    /// Returns true if the engine will retry this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }
}

/// Errors that can occur in the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The queue or cache layer failed.
    #[error("core error: {0}")]
    Core(#[from] driftsync_core::CoreError),

    /// The remote operation was permanently rejected.
    #[error("remote rejection: {0}")]
    Remote(#[from] RemoteError),

    /// No remote operation is registered for this entity type and action.
    #[error("no remote operation registered for {entity_type}/{action}")]
    NoRemoteOperation {
        /// Entity type of the record.
        entity_type: String,
        /// Action verb of the record.
        action: String,
    },

    /// The mutation was cancelled before going in-flight.
    #[error("mutation cancelled")]
    Cancelled,

    /// A drain is already in progress.
    #[error("drain already in progress")]
    DrainInProgress,

    /// The engine shut down before the mutation settled.
    #[error("engine shut down before settlement")]
    ShutDown,

    /// A record exhausted its retry budget.
    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The final transient error.
        last_error: String,
    },
}
