//! Reconciliation of drained mutations against the cache.

use crate::remote::ServerEntity;
use driftsync_core::{Action, MutationRecord, OptimisticCache, ScopeKey};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Read-scope invalidation seam for the surrounding data-fetching layer.
///
/// After a commit, every scope that logically depends on the mutated entity
/// type is invalidated so aggregate views recompute from authoritative
/// data. The implementation typically triggers a re-fetch.
pub trait ScopeInvalidator: Send + Sync {
    /// Invalidates one read scope.
    fn invalidate(&self, scope: &ScopeKey);
}

/// An invalidator that does nothing. Useful when no read layer is attached.
#[derive(Debug, Default)]
pub struct NoopInvalidator;

impl ScopeInvalidator for NoopInvalidator {
    fn invalidate(&self, _scope: &ScopeKey) {}
}

/// An invalidator that records every call, for tests.
#[derive(Debug, Default)]
pub struct RecordingInvalidator {
    calls: parking_lot::Mutex<Vec<ScopeKey>>,
}

impl RecordingInvalidator {
    /// Creates an empty recording invalidator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all invalidated scopes, in call order.
    #[must_use]
    pub fn calls(&self) -> Vec<ScopeKey> {
        self.calls.lock().clone()
    }
}

impl ScopeInvalidator for RecordingInvalidator {
    fn invalidate(&self, scope: &ScopeKey) {
        self.calls.lock().push(scope.clone());
    }
}

/// Applies drain outcomes to the optimistic cache.
///
/// On success the authoritative server record replaces the optimistic
/// entity and dependent read scopes are invalidated. On permanent failure
/// the optimistic entity is rolled back.
pub struct Reconciler {
    cache: Arc<OptimisticCache>,
    invalidator: Arc<dyn ScopeInvalidator>,
    /// entity type -> read scopes that recompute from it.
    dependencies: RwLock<HashMap<String, HashSet<ScopeKey>>>,
}

impl Reconciler {
    /// Creates a reconciler over the given cache and invalidation seam.
    pub fn new(cache: Arc<OptimisticCache>, invalidator: Arc<dyn ScopeInvalidator>) -> Self {
        Self {
            cache,
            invalidator,
            dependencies: RwLock::new(HashMap::new()),
        }
    }

    /// Declares that `scope` logically depends on `entity_type`.
    ///
    /// Committing any mutation of that entity type will invalidate the
    /// scope (e.g. a finance summary recomputed from sales).
    pub fn register_dependency(&self, entity_type: impl Into<String>, scope: ScopeKey) {
        self.dependencies
            .write()
            .entry(entity_type.into())
            .or_default()
            .insert(scope);
    }

    /// Merges the authoritative server record into the cache and
    /// invalidates dependent read scopes.
    pub fn commit(&self, record: &MutationRecord, server_entity: ServerEntity) {
        match &record.action {
            Action::Delete => {
                // The optimistic removal already happened; drop any
                // provisional marker that may remain.
                self.cache.rollback(&record.scope, record.id);
            }
            _ => {
                self.cache
                    .commit(&record.scope, record.id, server_entity);
            }
        }

        debug!(mutation = %record.id, scope = %record.scope, "committed");
        self.invalidate_dependents(record);
    }

    /// Removes the optimistic entity for a permanently rejected mutation.
    ///
    /// For deletes, where the optimistic effect was a removal, dependent
    /// scopes are invalidated so the view restores the entity from
    /// authoritative data.
    pub fn rollback(&self, record: &MutationRecord) {
        self.cache.rollback(&record.scope, record.id);
        if record.action == Action::Delete {
            self.invalidator.invalidate(&record.scope);
        }
        debug!(mutation = %record.id, scope = %record.scope, "rolled back");
    }

    fn invalidate_dependents(&self, record: &MutationRecord) {
        self.invalidator.invalidate(&record.scope);
        let deps = self.dependencies.read();
        if let Some(scopes) = deps.get(&record.scope.entity_type) {
            for scope in scopes {
                if scope != &record.scope {
                    self.invalidator.invalidate(scope);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftsync_core::MutationId;
    use serde_json::json;

    fn scope() -> ScopeKey {
        ScopeKey::new("sale", "store-1")
    }

    fn setup() -> (Arc<OptimisticCache>, Arc<RecordingInvalidator>, Reconciler) {
        let cache = Arc::new(OptimisticCache::new());
        let invalidator = Arc::new(RecordingInvalidator::new());
        let reconciler = Reconciler::new(cache.clone(), invalidator.clone());
        (cache, invalidator, reconciler)
    }

    #[test]
    fn commit_swaps_entity_and_invalidates_scope() {
        let (cache, invalidator, reconciler) = setup();
        let record = MutationRecord::new(scope(), Action::Create, json!({"total": 1000}));
        cache.apply(&record.scope, record.id, record.payload.clone());

        reconciler.commit(&record, json!({"id": "srv-1", "total": 1000}));

        let entries = cache.snapshot(&scope());
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].is_optimistic);
        assert_eq!(invalidator.calls(), vec![scope()]);
    }

    #[test]
    fn commit_invalidates_registered_dependents() {
        let (_, invalidator, reconciler) = setup();
        let summary = ScopeKey::new("finance-summary", "store-1");
        reconciler.register_dependency("sale", summary.clone());

        let record = MutationRecord::new(scope(), Action::Create, json!({}));
        reconciler.commit(&record, json!({"id": "srv-1"}));

        let calls = invalidator.calls();
        assert!(calls.contains(&scope()));
        assert!(calls.contains(&summary));
    }

    #[test]
    fn rollback_removes_optimistic_entity() {
        let (cache, _, reconciler) = setup();
        let record = MutationRecord::new(scope(), Action::Create, json!({"total": 1}));
        cache.apply(&record.scope, record.id, record.payload.clone());

        reconciler.rollback(&record);
        assert!(cache.snapshot(&scope()).is_empty());
    }

    #[test]
    fn delete_rollback_refreshes_scope() {
        let (_, invalidator, reconciler) = setup();
        let record =
            MutationRecord::new(scope(), Action::Delete, json!({})).with_target("srv-1");

        reconciler.rollback(&record);
        assert_eq!(invalidator.calls(), vec![scope()]);
    }

    #[test]
    fn dependency_does_not_double_invalidate_own_scope() {
        let (_, invalidator, reconciler) = setup();
        reconciler.register_dependency("sale", scope());

        let record = MutationRecord::new(scope(), Action::Create, json!({}));
        reconciler.commit(&record, json!({"id": "srv-1"}));

        assert_eq!(invalidator.calls(), vec![scope()]);
    }

    #[test]
    fn unrelated_mutation_id_rollback_is_noop() {
        let (cache, _, reconciler) = setup();
        cache.apply(&scope(), MutationId::new_v4(), json!({"n": 1}));

        let record = MutationRecord::new(scope(), Action::Update, json!({}));
        reconciler.rollback(&record);
        assert_eq!(cache.snapshot(&scope()).len(), 1);
    }
}
