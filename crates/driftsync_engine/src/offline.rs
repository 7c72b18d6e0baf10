//! Offline-first facade tying the queue, cache, monitor and engine together.

use crate::config::EngineConfig;
use crate::connectivity::{ConnectivityMonitor, ConnectivityStatus, Subscription};
use crate::engine::{DrainOutcome, DrainStats, SyncEngine};
use crate::error::{EngineError, EngineResult};
use crate::handle::{SettledHandle, Settlements};
use crate::reconcile::{NoopInvalidator, Reconciler, ScopeInvalidator};
use crate::remote::{RemoteOperation, RemoteRegistry};
use driftsync_core::{
    now_ms, Action, CacheEntry, MutationId, MutationQueue, MutationRecord, NaturalKey,
    OptimisticCache, ScopeKey,
};
use driftsync_storage::KvBackend;
use parking_lot::{Condvar, Mutex};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How often the background worker re-checks connectivity and due records.
const WORKER_TICK: Duration = Duration::from_millis(200);

/// Everything needed to enqueue one mutation.
#[derive(Debug, Clone)]
pub struct MutationDescriptor {
    /// The entity collection the mutation belongs to.
    pub scope: ScopeKey,
    /// The action verb.
    pub action: Action,
    /// The payload sent to the remote operation.
    pub payload: serde_json::Value,
    /// Natural key for idempotent replay of creates.
    pub natural_key: Option<NaturalKey>,
    /// Server id of the entity being updated or deleted.
    pub target_id: Option<String>,
    /// Entity shown optimistically instead of the raw payload.
    pub optimistic_entity: Option<serde_json::Value>,
}

impl MutationDescriptor {
    /// Creates a descriptor with no natural key, target or optimistic
    /// override.
    #[must_use]
    pub fn new(scope: ScopeKey, action: Action, payload: serde_json::Value) -> Self {
        Self {
            scope,
            action,
            payload,
            natural_key: None,
            target_id: None,
            optimistic_entity: None,
        }
    }

    /// Attaches a natural key for duplicate-insert protection.
    #[must_use]
    pub fn with_natural_key(mut self, key: NaturalKey) -> Self {
        self.natural_key = Some(key);
        self
    }

    /// Targets an existing server entity.
    #[must_use]
    pub fn with_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    /// Overrides the entity shown optimistically.
    ///
    /// Useful when the payload is a sparse patch and the view needs the
    /// full projected entity.
    #[must_use]
    pub fn with_optimistic_entity(mut self, entity: serde_json::Value) -> Self {
        self.optimistic_entity = Some(entity);
        self
    }
}

/// What the caller gets back from [`OfflineEngine::enqueue_mutation`].
pub struct EnqueueOutcome {
    /// The durably persisted record.
    pub record: MutationRecord,
    /// The entity now visible in the cache, if the action shows one.
    pub optimistic: Option<serde_json::Value>,
    /// Settles when the mutation commits or permanently fails.
    pub settled: SettledHandle,
}

struct SignalState {
    wake: bool,
    shutdown: bool,
}

/// Wakes the background worker without busy-waiting.
struct DrainSignal {
    state: Mutex<SignalState>,
    condvar: Condvar,
}

impl DrainSignal {
    fn new() -> Self {
        Self {
            state: Mutex::new(SignalState {
                wake: false,
                shutdown: false,
            }),
            condvar: Condvar::new(),
        }
    }

    fn wake(&self) {
        self.state.lock().wake = true;
        self.condvar.notify_all();
    }
}

/// The offline-first mutation engine.
///
/// Callers enqueue mutations and immediately see their optimistic effect in
/// the cache; a background worker drains the durable queue to the remote
/// store whenever connectivity allows. The engine survives restarts: on
/// open, unsettled records are recovered from the backend and interrupted
/// attempts return to pending.
pub struct OfflineEngine {
    config: EngineConfig,
    queue: Arc<MutationQueue>,
    cache: Arc<OptimisticCache>,
    monitor: Arc<ConnectivityMonitor>,
    registry: Arc<RemoteRegistry>,
    reconciler: Arc<Reconciler>,
    settlements: Arc<Settlements>,
    engine: Arc<SyncEngine>,
    signal: Arc<DrainSignal>,
    worker: Mutex<Option<JoinHandle<()>>>,
    _conn_sub: Subscription,
}

impl OfflineEngine {
    /// Opens the engine over a storage backend with no read-layer
    /// invalidation.
    ///
    /// # Errors
    ///
    /// Returns an error if queue recovery from the backend fails.
    pub fn open(backend: Arc<dyn KvBackend>, config: EngineConfig) -> EngineResult<Self> {
        Self::open_with_invalidator(backend, config, Arc::new(NoopInvalidator))
    }

    /// Opens the engine with a read-scope invalidation seam.
    ///
    /// # Errors
    ///
    /// Returns an error if queue recovery from the backend fails.
    pub fn open_with_invalidator(
        backend: Arc<dyn KvBackend>,
        config: EngineConfig,
        invalidator: Arc<dyn ScopeInvalidator>,
    ) -> EngineResult<Self> {
        let queue = Arc::new(MutationQueue::open(backend)?);
        let cache = Arc::new(OptimisticCache::new());
        let monitor = Arc::new(ConnectivityMonitor::new(
            ConnectivityStatus::Online,
            config.debounce,
        ));
        let registry = Arc::new(RemoteRegistry::new());
        let reconciler = Arc::new(Reconciler::new(cache.clone(), invalidator));
        let settlements = Arc::new(Settlements::new());
        let engine = Arc::new(SyncEngine::new(
            config.clone(),
            queue.clone(),
            registry.clone(),
            reconciler.clone(),
            settlements.clone(),
        ));

        let signal = Arc::new(DrainSignal::new());
        let conn_sub = {
            let signal = Arc::clone(&signal);
            monitor.on_change(move |status| {
                if status == ConnectivityStatus::Online {
                    signal.wake();
                }
            })
        };

        Ok(Self {
            config,
            queue,
            cache,
            monitor,
            registry,
            reconciler,
            settlements,
            engine,
            signal,
            worker: Mutex::new(None),
            _conn_sub: conn_sub,
        })
    }

    /// Registers the remote operation for an entity type and action.
    pub fn register_remote(
        &self,
        entity_type: impl Into<String>,
        action: Action,
        op: Arc<dyn RemoteOperation>,
    ) {
        self.registry.register(entity_type, action, op);
    }

    /// Declares that a read scope recomputes from an entity type.
    pub fn register_dependency(&self, entity_type: impl Into<String>, scope: ScopeKey) {
        self.reconciler.register_dependency(entity_type, scope);
    }

    /// Enqueues a mutation: applies its optimistic effect to the cache,
    /// persists it durably, and schedules a drain if the network is up.
    ///
    /// Returns immediately; the [`EnqueueOutcome::settled`] handle reports
    /// the eventual outcome.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be persisted. The optimistic
    /// entity is rolled back in that case.
    pub fn enqueue_mutation(&self, descriptor: MutationDescriptor) -> EngineResult<EnqueueOutcome> {
        let mut record =
            MutationRecord::new(descriptor.scope, descriptor.action, descriptor.payload);
        if let Some(key) = descriptor.natural_key {
            record = record.with_natural_key(key);
        }
        if let Some(target) = descriptor.target_id {
            record = record.with_target(target);
        }

        // The settlement sender and the optimistic entry must exist before
        // the record is durable: the moment it hits the queue, a running
        // worker may drain and commit it.
        let settled = self.settlements.register(record.id);
        let optimistic = match &record.action {
            Action::Delete => None,
            _ => {
                let mut entity = descriptor
                    .optimistic_entity
                    .unwrap_or_else(|| record.payload.clone());
                if let Some(obj) = entity.as_object_mut() {
                    obj.entry("id")
                        .or_insert_with(|| serde_json::Value::String(record.id.to_string()));
                }
                self.cache.apply(&record.scope, record.id, entity.clone());
                Some(entity)
            }
        };

        let id = record.id;
        let scope = record.scope.clone();
        let record = match self.queue.enqueue(record) {
            Ok(record) => record,
            Err(e) => {
                self.settlements.forget(id);
                if optimistic.is_some() {
                    self.cache.rollback(&scope, id);
                }
                return Err(e.into());
            }
        };

        if record.action == Action::Delete {
            if let Some(target) = &record.target_id {
                let target = serde_json::Value::String(target.clone());
                self.cache
                    .remove_entity(&record.scope, |entity| entity["id"] == target);
            }
        }

        debug!(mutation = %record.id, scope = %record.scope, "enqueued");

        if self.monitor.status() == ConnectivityStatus::Online {
            self.signal.wake();
        }

        Ok(EnqueueOutcome {
            record,
            optimistic,
            settled,
        })
    }

    /// Cancels a pending mutation that has never gone in-flight.
    ///
    /// Rolls back its optimistic entity and rejects its settled handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the mutation is unknown or already in-flight,
    /// committed or failed.
    pub fn cancel(&self, id: MutationId) -> EngineResult<MutationRecord> {
        let record = self.queue.cancel(id)?;
        self.cache.rollback(&record.scope, record.id);
        self.settlements.settle(id, Err(EngineError::Cancelled));
        Ok(record)
    }

    /// Returns a failed mutation to pending and schedules a drain.
    ///
    /// # Errors
    ///
    /// Returns an error if the mutation is unknown or not failed.
    pub fn retry_failed(&self, id: MutationId) -> EngineResult<()> {
        self.queue.retry_failed(id)?;
        if self.monitor.status() == ConnectivityStatus::Online {
            self.signal.wake();
        }
        Ok(())
    }

    /// Drops a failed mutation for good.
    ///
    /// # Errors
    ///
    /// Returns an error if the mutation is unknown or not failed.
    pub fn discard_failed(&self, id: MutationId) -> EngineResult<MutationRecord> {
        Ok(self.queue.discard_failed(id)?)
    }

    /// Runs a drain cycle on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DrainInProgress`] if a drain is already
    /// running.
    pub fn drain(&self) -> EngineResult<DrainOutcome> {
        self.engine.drain()
    }

    /// Starts the background drain worker. Idempotent.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }

        {
            let mut state = self.signal.state.lock();
            state.shutdown = false;
            state.wake = self.config.drain_on_start && !self.queue.is_empty();
        }

        let signal = Arc::clone(&self.signal);
        let monitor = Arc::clone(&self.monitor);
        let engine = Arc::clone(&self.engine);
        let queue = Arc::clone(&self.queue);
        let spawned = std::thread::Builder::new()
            .name("driftsync-drain".into())
            .spawn(move || drain_worker(&signal, &monitor, &engine, &queue));
        match spawned {
            Ok(handle) => *worker = Some(handle),
            Err(e) => warn!(error = %e, "failed to spawn drain worker"),
        }
    }

    /// Stops the background drain worker and waits for it to exit.
    pub fn stop(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            {
                let mut state = self.signal.state.lock();
                state.shutdown = true;
            }
            self.signal.condvar.notify_all();
            let _ = handle.join();
        }
    }

    /// Returns the connectivity monitor, for feeding reachability reports.
    #[must_use]
    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    /// Returns the merged view of a scope.
    #[must_use]
    pub fn snapshot(&self, scope: &ScopeKey) -> Vec<CacheEntry> {
        self.cache.snapshot(scope)
    }

    /// Subscribes to changes in a scope. The current view is delivered
    /// immediately.
    pub fn subscribe(&self, scope: &ScopeKey) -> Receiver<Vec<CacheEntry>> {
        self.cache.subscribe(scope)
    }

    /// Replaces the authoritative entities for a scope after a re-fetch,
    /// preserving optimistic entries.
    pub fn replace_authoritative(&self, scope: &ScopeKey, entities: Vec<serde_json::Value>) {
        self.cache.replace_authoritative(scope, entities);
    }

    /// Counts unsettled mutations, optionally within one scope.
    #[must_use]
    pub fn pending_count(&self, scope: Option<&ScopeKey>) -> usize {
        self.queue.pending_count(scope)
    }

    /// Returns all permanently failed mutations awaiting review.
    #[must_use]
    pub fn failed_records(&self) -> Vec<MutationRecord> {
        self.queue.failed_records()
    }

    /// Returns drain statistics.
    #[must_use]
    pub fn stats(&self) -> DrainStats {
        self.engine.stats()
    }
}

impl Drop for OfflineEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn drain_worker(
    signal: &DrainSignal,
    monitor: &ConnectivityMonitor,
    engine: &SyncEngine,
    queue: &MutationQueue,
) {
    debug!("drain worker started");
    loop {
        let woke = {
            let mut state = signal.state.lock();
            if state.shutdown {
                break;
            }
            if !state.wake {
                let _ = signal.condvar.wait_for(&mut state, WORKER_TICK);
            }
            if state.shutdown {
                break;
            }
            std::mem::take(&mut state.wake)
        };

        monitor.poll(Instant::now());
        if monitor.status() != ConnectivityStatus::Online {
            continue;
        }

        let has_due = !queue.peek_next_batch(1, now_ms()).is_empty();
        if !(woke || has_due) {
            continue;
        }

        match engine.drain() {
            Ok(_) | Err(EngineError::DrainInProgress) => {}
            Err(e) => warn!(error = %e, "background drain failed"),
        }
    }
    debug!("drain worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::remote::MockRemote;
    use driftsync_core::MutationStatus;
    use driftsync_storage::InMemoryBackend;
    use serde_json::json;

    fn scope() -> ScopeKey {
        ScopeKey::new("product", "store-1")
    }

    fn engine_with_remote() -> (OfflineEngine, Arc<MockRemote>) {
        let engine = OfflineEngine::open(
            Arc::new(InMemoryBackend::new()),
            EngineConfig::new().without_startup_drain(),
        )
        .unwrap();
        let remote = Arc::new(MockRemote::new());
        engine.register_remote("product", Action::Create, remote.clone());
        engine.register_remote("product", Action::Update, remote.clone());
        engine.register_remote("product", Action::Delete, remote.clone());
        (engine, remote)
    }

    #[test]
    fn enqueue_shows_optimistic_entity() {
        let (engine, _) = engine_with_remote();
        let outcome = engine
            .enqueue_mutation(MutationDescriptor::new(
                scope(),
                Action::Create,
                json!({"name": "soap"}),
            ))
            .unwrap();

        let entity = outcome.optimistic.unwrap();
        assert_eq!(entity["id"], json!(outcome.record.id.to_string()));

        let entries = engine.snapshot(&scope());
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_optimistic);
        assert_eq!(engine.pending_count(None), 1);
    }

    #[test]
    fn optimistic_override_replaces_payload_view() {
        let (engine, _) = engine_with_remote();
        let outcome = engine
            .enqueue_mutation(
                MutationDescriptor::new(scope(), Action::Update, json!({"qty": 3}))
                    .with_target("srv-1")
                    .with_optimistic_entity(json!({"id": "srv-1", "name": "soap", "qty": 3})),
            )
            .unwrap();

        assert_eq!(outcome.optimistic.unwrap()["name"], json!("soap"));
    }

    #[test]
    fn delete_enqueue_removes_from_view() {
        let (engine, _) = engine_with_remote();
        engine.replace_authoritative(&scope(), vec![json!({"id": "srv-1", "name": "soap"})]);

        engine
            .enqueue_mutation(
                MutationDescriptor::new(scope(), Action::Delete, json!({})).with_target("srv-1"),
            )
            .unwrap();

        assert!(engine.snapshot(&scope()).is_empty());
        assert_eq!(engine.pending_count(Some(&scope())), 1);
    }

    #[test]
    fn manual_drain_settles_mutation() {
        let (engine, remote) = engine_with_remote();
        let outcome = engine
            .enqueue_mutation(MutationDescriptor::new(
                scope(),
                Action::Create,
                json!({"name": "soap"}),
            ))
            .unwrap();

        engine.drain().unwrap();

        assert_eq!(outcome.settled.wait().unwrap()["id"], json!("srv-1"));
        assert_eq!(engine.pending_count(None), 0);
        assert_eq!(remote.rows().len(), 1);
    }

    #[test]
    fn cancel_pending_rolls_back() {
        let (engine, _) = engine_with_remote();
        let outcome = engine
            .enqueue_mutation(MutationDescriptor::new(
                scope(),
                Action::Create,
                json!({"name": "soap"}),
            ))
            .unwrap();

        engine.cancel(outcome.record.id).unwrap();
        assert!(engine.snapshot(&scope()).is_empty());
        assert_eq!(engine.pending_count(None), 0);
        assert!(matches!(
            outcome.settled.wait(),
            Err(EngineError::Cancelled)
        ));
    }

    #[test]
    fn retry_failed_requeues_and_succeeds() {
        let (engine, remote) = engine_with_remote();
        remote.inject_failure(RemoteError::Validation("bad price".into()));

        let outcome = engine
            .enqueue_mutation(MutationDescriptor::new(
                scope(),
                Action::Create,
                json!({"price": -1}),
            ))
            .unwrap();
        engine.drain().unwrap();
        assert_eq!(engine.failed_records().len(), 1);

        engine.retry_failed(outcome.record.id).unwrap();
        assert_eq!(
            engine.queue.get(outcome.record.id).unwrap().status,
            MutationStatus::Pending
        );

        engine.drain().unwrap();
        assert!(engine.failed_records().is_empty());
        assert_eq!(remote.rows().len(), 1);
    }

    #[test]
    fn discard_failed_drops_record() {
        let (engine, remote) = engine_with_remote();
        remote.inject_failure(RemoteError::Conflict("edited remotely".into()));

        let outcome = engine
            .enqueue_mutation(
                MutationDescriptor::new(scope(), Action::Update, json!({"qty": 1}))
                    .with_target("srv-404"),
            )
            .unwrap();
        engine.drain().unwrap();

        engine.discard_failed(outcome.record.id).unwrap();
        assert!(engine.failed_records().is_empty());
        assert_eq!(engine.pending_count(None), 0);
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let (engine, _) = engine_with_remote();
        engine.start();
        engine.start();
        engine.stop();
        engine.stop();
    }
}
