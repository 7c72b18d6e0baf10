//! Error types for the core crate.

use crate::record::{MutationId, MutationStatus};
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in the queue or cache.
#[derive(Error, Debug)]
pub enum CoreError {
    /// The persistence backend failed.
    #[error("storage error: {0}")]
    Storage(#[from] driftsync_storage::StorageError),

    /// A persisted record could not be deserialized.
    #[error("corrupt record under key {key}: {reason}")]
    Corrupt {
        /// Storage key of the record.
        key: String,
        /// Why deserialization failed.
        reason: String,
    },

    /// A record could not be serialized for persistence.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// No record exists with the given id.
    #[error("unknown mutation {0}")]
    UnknownMutation(MutationId),

    /// A status transition violated the record lifecycle.
    #[error("invalid status transition from {from:?} to {to:?} for mutation {id}")]
    InvalidTransition {
        /// Record id.
        id: MutationId,
        /// Current status.
        from: MutationStatus,
        /// Attempted status.
        to: MutationStatus,
    },

    /// The record is past the point where it can be cancelled.
    #[error("mutation {id} is {status:?} and can no longer be cancelled")]
    NotCancellable {
        /// Record id.
        id: MutationId,
        /// Current status.
        status: MutationStatus,
    },
}
