//! Durable, ordered queue of pending mutation records.

use crate::error::{CoreError, CoreResult};
use crate::record::{ErrorClass, MutationId, MutationRecord, MutationStatus, ScopeKey};
use driftsync_storage::KvBackend;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Storage key prefix for mutation records.
const KEY_PREFIX: &str = "mutation:";

/// A durable, ordered log of pending mutation records.
///
/// Every state transition is persisted before it takes effect in memory, so
/// a crash mid-drain resumes correctly. Records recovered as `InFlight` at
/// open revert to `Pending`; the remote operation must therefore be safe to
/// re-attempt.
///
/// # Ordering
///
/// Records targeting the same entity drain strictly FIFO and never run
/// concurrently. Records targeting different entities may run up to a
/// bounded concurrency limit, enforced by [`MutationQueue::peek_next_batch`].
pub struct MutationQueue {
    backend: Arc<dyn KvBackend>,
    inner: RwLock<QueueInner>,
}

struct QueueInner {
    /// Records in submission order (ascending `seq`).
    records: Vec<MutationRecord>,
    next_seq: u64,
}

impl MutationQueue {
    /// Opens the queue, replaying persisted records from the backend.
    ///
    /// Records that fail to deserialize are deleted and logged - a corrupt
    /// entry is never allowed to take down the host application. Records
    /// found `InFlight` (a crash interrupted their drain) revert to
    /// `Pending`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    pub fn open(backend: Arc<dyn KvBackend>) -> CoreResult<Self> {
        let mut records = Vec::new();

        for key in backend.keys()? {
            if !key.starts_with(KEY_PREFIX) {
                continue;
            }
            let Some(bytes) = backend.get(&key)? else {
                continue;
            };
            match MutationRecord::decode(&bytes) {
                Ok(mut record) => {
                    if record.status == MutationStatus::InFlight {
                        // The drain was interrupted; re-attempt is safe
                        // because remote operations are idempotent.
                        record.status = MutationStatus::Pending;
                        backend.put(&key, &record.encode()?)?;
                    }
                    records.push(record);
                }
                Err(e) => {
                    warn!(key, error = %e, "dropping corrupt queue record");
                    backend.delete(&key)?;
                }
            }
        }
        backend.flush()?;

        records.sort_by_key(|r| r.seq);
        let next_seq = records.last().map(|r| r.seq + 1).unwrap_or(1);

        debug!(count = records.len(), "mutation queue opened");

        Ok(Self {
            backend,
            inner: RwLock::new(QueueInner { records, next_seq }),
        })
    }

    /// Appends a record, assigning its sequence number and persisting it.
    ///
    /// Returns the record as stored (with `seq` assigned).
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be persisted.
    pub fn enqueue(&self, mut record: MutationRecord) -> CoreResult<MutationRecord> {
        let mut inner = self.inner.write();
        record.seq = inner.next_seq;
        inner.next_seq += 1;

        self.backend.put(&record.storage_key(), &record.encode()?)?;
        self.backend.flush()?;

        inner.records.push(record.clone());
        Ok(record)
    }

    /// Returns the next batch of drainable records.
    ///
    /// A record is eligible when it is `Pending`, its backoff gate has
    /// elapsed, and no earlier record shares its ordering key. At most one
    /// record per ordering key is returned, and the batch size is capped so
    /// that selected plus already in-flight records never exceed
    /// `max_concurrency`.
    pub fn peek_next_batch(&self, max_concurrency: usize, now: u64) -> Vec<MutationRecord> {
        let inner = self.inner.read();

        let in_flight = inner
            .records
            .iter()
            .filter(|r| r.status == MutationStatus::InFlight)
            .count();
        let mut budget = max_concurrency.saturating_sub(in_flight);

        let mut blocked: HashSet<String> = HashSet::new();
        let mut batch = Vec::new();

        for record in &inner.records {
            let key = record.ordering_key();
            if blocked.contains(&key) {
                continue;
            }
            // Any earlier unsettled or failed record blocks later ones for
            // the same target, preserving per-entity FIFO.
            let eligible = record.is_due(now);
            blocked.insert(key);
            if eligible && budget > 0 {
                batch.push(record.clone());
                budget -= 1;
            }
        }

        batch
    }

    /// Marks a record as in-flight before its remote operation starts.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is unknown, the transition is invalid,
    /// or persistence fails.
    pub fn mark_in_flight(&self, id: MutationId) -> CoreResult<()> {
        self.transition(id, MutationStatus::InFlight, |record| {
            record.status = MutationStatus::InFlight;
        })
    }

    /// Removes a committed record from the queue and its storage.
    ///
    /// Returns the removed record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is unknown, not in-flight, or
    /// persistence fails.
    pub fn mark_committed(&self, id: MutationId) -> CoreResult<MutationRecord> {
        let mut inner = self.inner.write();
        let idx = inner
            .records
            .iter()
            .position(|r| r.id == id)
            .ok_or(CoreError::UnknownMutation(id))?;

        let current = inner.records[idx].status;
        if !current.can_transition_to(MutationStatus::Committed) {
            return Err(CoreError::InvalidTransition {
                id,
                from: current,
                to: MutationStatus::Committed,
            });
        }

        self.backend.delete(&inner.records[idx].storage_key())?;
        self.backend.flush()?;
        Ok(inner.records.remove(idx))
    }

    /// Records a failure outcome for an in-flight record.
    ///
    /// Retryable failures return the record to `Pending` with an incremented
    /// retry count and the given backoff gate; permanent failures leave it
    /// `Failed` and user-visible until explicitly discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is unknown, the transition is invalid,
    /// or persistence fails.
    pub fn mark_failed(
        &self,
        id: MutationId,
        error: &str,
        class: ErrorClass,
        not_before_ms: u64,
    ) -> CoreResult<()> {
        let next = match class {
            ErrorClass::Retryable => MutationStatus::Pending,
            ErrorClass::Permanent => MutationStatus::Failed,
        };
        self.transition(id, next, |record| {
            record.status = next;
            record.last_error = Some(error.to_string());
            match class {
                ErrorClass::Retryable => {
                    record.retry_count += 1;
                    record.not_before_ms = not_before_ms;
                }
                ErrorClass::Permanent => {}
            }
        })
    }

    /// Returns an in-flight record to `Pending` without recording an outcome.
    ///
    /// Used when the outcome of an attempt could not be persisted, so the
    /// record must not stay in-flight for the rest of the process lifetime.
    /// Unlike other transitions, the in-memory flip happens even when
    /// persistence fails: a record persisted as in-flight reverts to pending
    /// on reopen anyway.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is unknown, not in-flight, or
    /// persistence fails. The record is pending again in the last case.
    pub fn release_in_flight(&self, id: MutationId) -> CoreResult<()> {
        let mut inner = self.inner.write();
        let record = inner
            .records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(CoreError::UnknownMutation(id))?;

        if record.status != MutationStatus::InFlight {
            return Err(CoreError::InvalidTransition {
                id,
                from: record.status,
                to: MutationStatus::Pending,
            });
        }

        record.status = MutationStatus::Pending;
        let encoded = record.encode()?;
        let key = record.storage_key();
        self.backend.put(&key, &encoded)?;
        self.backend.flush()?;
        Ok(())
    }

    /// Returns a permanently failed record to `Pending` for another attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is unknown, not failed, or persistence
    /// fails.
    pub fn retry_failed(&self, id: MutationId) -> CoreResult<()> {
        self.transition(id, MutationStatus::Pending, |record| {
            record.status = MutationStatus::Pending;
            record.not_before_ms = 0;
        })
    }

    /// Discards a permanently failed record.
    ///
    /// Returns the removed record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is unknown, not failed, or persistence
    /// fails.
    pub fn discard_failed(&self, id: MutationId) -> CoreResult<MutationRecord> {
        let mut inner = self.inner.write();
        let idx = inner
            .records
            .iter()
            .position(|r| r.id == id)
            .ok_or(CoreError::UnknownMutation(id))?;

        let current = inner.records[idx].status;
        if current != MutationStatus::Failed {
            return Err(CoreError::InvalidTransition {
                id,
                from: current,
                to: MutationStatus::Failed,
            });
        }

        self.backend.delete(&inner.records[idx].storage_key())?;
        self.backend.flush()?;
        Ok(inner.records.remove(idx))
    }

    /// Cancels a record that has not yet gone in-flight.
    ///
    /// Returns the removed record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotCancellable`] once the record has left
    /// `Pending`.
    pub fn cancel(&self, id: MutationId) -> CoreResult<MutationRecord> {
        let mut inner = self.inner.write();
        let idx = inner
            .records
            .iter()
            .position(|r| r.id == id)
            .ok_or(CoreError::UnknownMutation(id))?;

        let current = inner.records[idx].status;
        if current != MutationStatus::Pending {
            return Err(CoreError::NotCancellable { id, status: current });
        }

        self.backend.delete(&inner.records[idx].storage_key())?;
        self.backend.flush()?;
        Ok(inner.records.remove(idx))
    }

    /// Returns the record with the given id, if present.
    #[must_use]
    pub fn get(&self, id: MutationId) -> Option<MutationRecord> {
        self.inner.read().records.iter().find(|r| r.id == id).cloned()
    }

    /// Counts unconfirmed records, optionally restricted to one scope.
    ///
    /// Counts `Pending` and `InFlight` records; permanently failed records
    /// are excluded (they surface through [`MutationQueue::failed_records`]).
    #[must_use]
    pub fn pending_count(&self, scope: Option<&ScopeKey>) -> usize {
        self.inner
            .read()
            .records
            .iter()
            .filter(|r| r.status.is_unsettled())
            .filter(|r| scope.is_none_or(|s| &r.scope == s))
            .count()
    }

    /// Returns all permanently failed records, in submission order.
    #[must_use]
    pub fn failed_records(&self) -> Vec<MutationRecord> {
        self.inner
            .read()
            .records
            .iter()
            .filter(|r| r.status == MutationStatus::Failed)
            .cloned()
            .collect()
    }

    /// Returns unsettled records for a scope, in submission order.
    ///
    /// Supports rebuilding the optimistic cache from committed server data
    /// plus the queue's pending entities.
    #[must_use]
    pub fn pending_for_scope(&self, scope: &ScopeKey) -> Vec<MutationRecord> {
        self.inner
            .read()
            .records
            .iter()
            .filter(|r| r.status.is_unsettled() && &r.scope == scope)
            .cloned()
            .collect()
    }

    /// Returns the total number of records held, in any status.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    /// Returns true if the queue holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().records.is_empty()
    }

    /// Applies a validated transition, persisting before the in-memory
    /// update takes effect.
    fn transition(
        &self,
        id: MutationId,
        to: MutationStatus,
        apply: impl FnOnce(&mut MutationRecord),
    ) -> CoreResult<()> {
        let mut inner = self.inner.write();
        let record = inner
            .records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(CoreError::UnknownMutation(id))?;

        if !record.status.can_transition_to(to) {
            return Err(CoreError::InvalidTransition {
                id,
                from: record.status,
                to,
            });
        }

        let mut updated = record.clone();
        apply(&mut updated);
        self.backend.put(&updated.storage_key(), &updated.encode()?)?;
        self.backend.flush()?;
        *record = updated;
        Ok(())
    }
}
