//! # driftsync Core
//!
//! Mutation records, the durable mutation queue, and the optimistic cache.
//!
//! This crate provides:
//! - [`MutationRecord`] - a durable description of one user-initiated change
//! - [`MutationQueue`] - an ordered, persisted log of pending mutations
//! - [`OptimisticCache`] - a subscribable keyed store of entity collections
//!
//! ## Key Invariants
//!
//! - Exactly one `MutationRecord` exists per user-initiated change; it is
//!   removed only after commit or explicit discard of a failed record
//! - An optimistic entity's identifier equals its record's id until
//!   reconciliation replaces it with the server-assigned identifier
//! - Records sharing a target entity execute in submission order, never
//!   concurrently
//! - The queue is the single source of truth for unconfirmed work; the cache
//!   is a derived, disposable view

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod error;
mod queue;
mod record;

pub use cache::{CacheEntry, OptimisticCache};
pub use error::{CoreError, CoreResult};
pub use queue::MutationQueue;
pub use record::{
    now_ms, Action, ErrorClass, MutationId, MutationRecord, MutationStatus, NaturalKey, ScopeKey,
};
