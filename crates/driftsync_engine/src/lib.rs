//! # DriftSync Engine
//!
//! Connectivity-aware drain engine and offline-first facade for DriftSync.
//!
//! This crate provides:
//! - Drain state machine (idle → draining → idle)
//! - Connectivity monitoring with flap suppression
//! - Retry with exponential backoff and failure classification
//! - Remote operation abstraction and registry
//! - Cache reconciliation after commits and rollbacks
//! - Settlement handles for enqueued mutations
//!
//! ## Architecture
//!
//! The engine implements a **write-behind** model over the durable queue in
//! `driftsync_core`:
//! 1. Mutations persist locally and apply optimistically at enqueue time
//! 2. A background worker drains the queue when the network allows
//! 3. The authoritative server response reconciles the cache
//!
//! ## Key Invariants
//!
//! - A mutation's settlement handle and optimistic entry exist before its
//!   record becomes drainable; every outcome is observable
//! - Mutations against the same entity replay in submission order
//! - Transient failures retry with backoff, invisible to the caller
//! - Permanent failures roll back and surface; nothing is silently dropped
//! - Creates carrying natural keys are never applied twice server-side

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod connectivity;
mod engine;
mod error;
mod handle;
mod offline;
mod reconcile;
mod remote;

pub use config::{EngineConfig, RetryConfig};
pub use connectivity::{ConnectivityMonitor, ConnectivityStatus, Subscription};
pub use engine::{DrainOutcome, DrainState, DrainStats, SyncEngine};
pub use error::{EngineError, EngineResult, RemoteError};
pub use handle::SettledHandle;
pub use offline::{EnqueueOutcome, MutationDescriptor, OfflineEngine};
pub use reconcile::{NoopInvalidator, RecordingInvalidator, Reconciler, ScopeInvalidator};
pub use remote::{MockRemote, RemoteOperation, RemoteRegistry, ServerEntity};
