//! Drain state machine.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, RemoteError};
use crate::handle::Settlements;
use crate::reconcile::Reconciler;
use crate::remote::{RemoteOperation, RemoteRegistry, ServerEntity};
use driftsync_core::{now_ms, Action, ErrorClass, MutationQueue, MutationRecord};
use parking_lot::RwLock;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// The current state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    /// Engine is idle, not draining.
    Idle,
    /// Engine is executing pending records.
    Draining,
}

impl DrainState {
    /// Returns true if a drain is in progress.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        matches!(self, DrainState::Draining)
    }
}

/// Statistics about drain activity.
#[derive(Debug, Clone, Default)]
pub struct DrainStats {
    /// Total number of drain cycles completed.
    pub drains_completed: u64,
    /// Total number of records committed.
    pub records_committed: u64,
    /// Total number of records permanently failed.
    pub records_failed: u64,
    /// Total number of retries scheduled.
    pub retries_scheduled: u64,
    /// Last drain error message.
    pub last_error: Option<String>,
}

/// Result of one drain cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainOutcome {
    /// Records committed during the cycle.
    pub committed: u64,
    /// Records permanently failed during the cycle.
    pub failed: u64,
    /// Records returned to pending with a backoff gate.
    pub rescheduled: u64,
}

/// Executes pending queue records against their remote operations.
///
/// The state machine is `Idle → Draining → Idle`. A drain runs batches of
/// eligible records - at most `max_concurrency` in flight globally, at most
/// one per target entity - until none remain due. Each remote operation runs
/// on its own thread with a deadline; on expiry the attempt is reclassified
/// as retryable while the operation runs to completion in the background
/// (which is why create operations carry natural keys).
pub struct SyncEngine {
    config: EngineConfig,
    queue: Arc<MutationQueue>,
    registry: Arc<RemoteRegistry>,
    reconciler: Arc<Reconciler>,
    settlements: Arc<Settlements>,
    state: RwLock<DrainState>,
    stats: RwLock<DrainStats>,
}

impl SyncEngine {
    /// Creates a new engine over the queue and registry.
    pub(crate) fn new(
        config: EngineConfig,
        queue: Arc<MutationQueue>,
        registry: Arc<RemoteRegistry>,
        reconciler: Arc<Reconciler>,
        settlements: Arc<Settlements>,
    ) -> Self {
        Self {
            config,
            queue,
            registry,
            reconciler,
            settlements,
            state: RwLock::new(DrainState::Idle),
            stats: RwLock::new(DrainStats::default()),
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> DrainState {
        *self.state.read()
    }

    /// Returns a snapshot of the drain statistics.
    #[must_use]
    pub fn stats(&self) -> DrainStats {
        self.stats.read().clone()
    }

    /// Drains all eligible records, returning when none remain due.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DrainInProgress`] if another drain is running,
    /// or a core error if queue persistence fails mid-drain.
    pub fn drain(&self) -> EngineResult<DrainOutcome> {
        {
            let mut state = self.state.write();
            if state.is_draining() {
                return Err(EngineError::DrainInProgress);
            }
            *state = DrainState::Draining;
        }

        let result = self.drain_loop();
        *self.state.write() = DrainState::Idle;

        let mut stats = self.stats.write();
        match &result {
            Ok(outcome) => {
                stats.drains_completed += 1;
                stats.last_error = None;
                debug!(
                    committed = outcome.committed,
                    failed = outcome.failed,
                    rescheduled = outcome.rescheduled,
                    "drain completed"
                );
            }
            Err(e) => {
                stats.last_error = Some(e.to_string());
            }
        }
        result
    }

    fn drain_loop(&self) -> EngineResult<DrainOutcome> {
        let mut outcome = DrainOutcome::default();

        loop {
            let batch = self
                .queue
                .peek_next_batch(self.config.max_concurrency, now_ms());
            if batch.is_empty() {
                break;
            }

            // A storage failure anywhere in the batch must not abandon
            // records that already launched: every launched operation is
            // awaited and every record leaves `InFlight` before the error
            // propagates, otherwise its ordering key stays blocked for the
            // life of the process.
            let mut first_err: Option<EngineError> = None;
            let mut launched = Vec::new();
            let mut unregistered = Vec::new();
            for record in batch {
                match self.queue.mark_in_flight(record.id) {
                    Ok(()) => match self.registry.get(&record) {
                        Some(op) => {
                            let rx = spawn_remote(op, record.clone());
                            launched.push((record, rx));
                        }
                        None => unregistered.push(record),
                    },
                    Err(e) => {
                        // The record never left pending; stop growing the
                        // batch.
                        first_err = Some(e.into());
                        break;
                    }
                }
            }

            for record in unregistered {
                if let Err(e) = self.fail_unregistered(&record, &mut outcome) {
                    let _ = self.queue.release_in_flight(record.id);
                    first_err.get_or_insert(e);
                }
            }

            // All operations in the batch started together and share one
            // deadline.
            let deadline = Instant::now() + self.config.op_timeout;
            for (record, rx) in launched {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let result = match rx.recv_timeout(remaining) {
                    Ok(result) => result,
                    Err(_) => Err(RemoteError::Timeout),
                };
                if let Err(e) = self.finish(&record, result, &mut outcome) {
                    let _ = self.queue.release_in_flight(record.id);
                    first_err.get_or_insert(e);
                }
            }

            if let Some(e) = first_err {
                return Err(e);
            }
        }

        Ok(outcome)
    }

    fn finish(
        &self,
        record: &MutationRecord,
        result: Result<ServerEntity, RemoteError>,
        outcome: &mut DrainOutcome,
    ) -> EngineResult<()> {
        match result {
            Ok(server_entity) => {
                self.reconciler.commit(record, server_entity.clone());
                self.queue.mark_committed(record.id)?;
                self.settlements.settle(record.id, Ok(server_entity));
                outcome.committed += 1;
                self.stats.write().records_committed += 1;
            }
            Err(error) if error.is_retryable() => {
                let attempts = record.retry_count + 1;
                if attempts >= self.config.retry.max_attempts {
                    warn!(
                        mutation = %record.id,
                        attempts,
                        error = %error,
                        "retries exhausted, failing permanently"
                    );
                    self.queue.mark_failed(
                        record.id,
                        &error.to_string(),
                        ErrorClass::Permanent,
                        0,
                    )?;
                    self.reconciler.rollback(record);
                    self.settlements.settle(
                        record.id,
                        Err(EngineError::RetriesExhausted {
                            attempts,
                            last_error: error.to_string(),
                        }),
                    );
                    outcome.failed += 1;
                    self.stats.write().records_failed += 1;
                } else {
                    let delay = self.config.retry.delay_for_attempt(attempts);
                    debug!(
                        mutation = %record.id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "transient failure, rescheduling"
                    );
                    self.queue.mark_failed(
                        record.id,
                        &error.to_string(),
                        ErrorClass::Retryable,
                        now_ms() + delay.as_millis() as u64,
                    )?;
                    outcome.rescheduled += 1;
                    self.stats.write().retries_scheduled += 1;
                }
            }
            Err(error) => {
                warn!(mutation = %record.id, error = %error, "permanent failure");
                self.queue
                    .mark_failed(record.id, &error.to_string(), ErrorClass::Permanent, 0)?;
                self.reconciler.rollback(record);
                self.settlements
                    .settle(record.id, Err(EngineError::Remote(error)));
                outcome.failed += 1;
                self.stats.write().records_failed += 1;
            }
        }
        Ok(())
    }

    fn fail_unregistered(
        &self,
        record: &MutationRecord,
        outcome: &mut DrainOutcome,
    ) -> EngineResult<()> {
        let error = EngineError::NoRemoteOperation {
            entity_type: record.scope.entity_type.clone(),
            action: record.action.to_string(),
        };
        warn!(mutation = %record.id, "{error}");
        self.queue
            .mark_failed(record.id, &error.to_string(), ErrorClass::Permanent, 0)?;
        self.reconciler.rollback(record);
        self.settlements.settle(record.id, Err(error));
        outcome.failed += 1;
        self.stats.write().records_failed += 1;
        Ok(())
    }
}

/// Runs the remote operation on its own thread, returning a receiver for
/// the outcome.
fn spawn_remote(
    op: Arc<dyn RemoteOperation>,
    record: MutationRecord,
) -> Receiver<Result<ServerEntity, RemoteError>> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(run_remote(op.as_ref(), &record));
    });
    rx
}

/// Executes one remote attempt, applying the idempotent-replay check first.
///
/// A create carrying a natural key looks up the existing row before
/// inserting; if a prior attempt already succeeded server-side, that row is
/// returned and no second insert happens.
fn run_remote(
    op: &dyn RemoteOperation,
    record: &MutationRecord,
) -> Result<ServerEntity, RemoteError> {
    if record.action == Action::Create {
        if let Some(key) = &record.natural_key {
            if let Some(existing) = op.find_by_natural_key(key)? {
                debug!(mutation = %record.id, natural_key = %key, "create already applied server-side");
                return Ok(existing);
            }
        }
    }
    op.execute(record)
}
