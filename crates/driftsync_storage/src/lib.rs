//! # driftsync Storage
//!
//! Durable key-value persistence for the driftsync mutation queue.
//!
//! This crate provides the lowest-level persistence abstraction for
//! driftsync. Backends are **opaque byte stores** keyed by string - they do
//! not interpret the records they hold. The queue owns all record format
//! interpretation.
//!
//! ## Design Principles
//!
//! - Backends are simple keyed byte stores (get, put, delete, keys)
//! - No knowledge of mutation records or queue ordering
//! - Must be `Send + Sync` for concurrent access
//! - `flush` makes every prior write durable
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral queues
//! - [`FileLogBackend`] - Append-only log with checksummed frames, replayed
//!   on open and compactable
//!
//! ## Example
//!
//! ```rust
//! use driftsync_storage::{InMemoryBackend, KvBackend};
//!
//! let backend = InMemoryBackend::new();
//! backend.put("mutation:1", b"payload").unwrap();
//! assert_eq!(backend.get("mutation:1").unwrap(), Some(b"payload".to_vec()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file_log;
mod memory;

pub use backend::KvBackend;
pub use error::{StorageError, StorageResult};
pub use file_log::FileLogBackend;
pub use memory::InMemoryBackend;
