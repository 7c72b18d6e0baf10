//! Key-value backend trait definition.

use crate::error::StorageResult;

/// A durable key-value store for driftsync queue records.
///
/// Backends are **opaque byte stores** keyed by string. They provide simple
/// operations for reading, writing, and enumerating values. driftsync owns
/// all record format interpretation - backends do not understand mutation
/// records or queue ordering.
///
/// # Invariants
///
/// - `get` returns exactly the bytes last `put` for that key, or `None`
/// - `delete` of a missing key is a no-op
/// - After `flush` returns, every prior write survives process termination
/// - Backends must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For testing
/// - [`super::FileLogBackend`] - For persistent storage
pub trait KvBackend: Send + Sync {
    /// Reads the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the write cannot be recorded.
    fn put(&self, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Removes the value stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the removal cannot be recorded.
    fn delete(&self, key: &str) -> StorageResult<()>;

    /// Returns all keys currently present, in unspecified order.
    ///
    /// # Errors
    ///
    /// Returns an error if the key set cannot be read.
    fn keys(&self) -> StorageResult<Vec<String>>;

    /// Flushes all pending writes to durable storage.
    ///
    /// After this returns successfully, all previously written data is
    /// guaranteed to survive process termination.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&self) -> StorageResult<()>;
}
