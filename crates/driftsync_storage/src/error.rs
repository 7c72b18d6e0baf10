//! Error types for storage backends.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in a storage backend.
#[derive(Error, Debug)]
pub enum StorageError {
    /// An I/O error from the underlying medium.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted frame failed its integrity check.
    #[error("corrupt frame at offset {offset}: {reason}")]
    CorruptFrame {
        /// Byte offset of the frame in the log.
        offset: u64,
        /// Why the frame was rejected.
        reason: String,
    },

    /// A key exceeded the maximum encodable length.
    #[error("key too large: {len} bytes (max {max})")]
    KeyTooLarge {
        /// Actual key length.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },
}
