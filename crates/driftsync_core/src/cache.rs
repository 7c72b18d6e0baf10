//! Optimistic cache: a subscribable keyed store of entity collections.

use crate::record::{MutationId, ScopeKey};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};

/// One entity in a cached collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// The entity value.
    pub entity: serde_json::Value,
    /// True while the entity is provisional (not yet server-confirmed).
    pub is_optimistic: bool,
    /// The mutation that produced this entry, while it is optimistic.
    pub mutation_id: Option<MutationId>,
}

impl CacheEntry {
    /// Creates a provisional entry for a pending mutation.
    #[must_use]
    pub fn optimistic(mutation_id: MutationId, entity: serde_json::Value) -> Self {
        Self {
            entity,
            is_optimistic: true,
            mutation_id: Some(mutation_id),
        }
    }

    /// Creates an authoritative entry from server data.
    #[must_use]
    pub fn authoritative(entity: serde_json::Value) -> Self {
        Self {
            entity,
            is_optimistic: false,
            mutation_id: None,
        }
    }
}

/// An in-memory, subscribable store of entity collections.
///
/// Collections are keyed by [`ScopeKey`] and kept in insertion/update
/// order. The cache is a derived, disposable view: it can always be rebuilt
/// from committed server data plus the queue's pending optimistic entities.
///
/// # Atomicity
///
/// Every operation mutates the collection and notifies subscribers under a
/// single lock, so readers never observe a state where an optimistic entity
/// is both present and absent for the same mutation id.
pub struct OptimisticCache {
    inner: Mutex<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    collections: HashMap<ScopeKey, Vec<CacheEntry>>,
    subscribers: HashMap<ScopeKey, Vec<Sender<Vec<CacheEntry>>>>,
}

impl OptimisticCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Inserts or merges a provisional entity into the collection at
    /// `scope`.
    ///
    /// If an optimistic entry for `mutation_id` already exists it is
    /// replaced in place, otherwise the entry is appended.
    pub fn apply(&self, scope: &ScopeKey, mutation_id: MutationId, entity: serde_json::Value) {
        let mut inner = self.inner.lock();
        let collection = inner.collections.entry(scope.clone()).or_default();

        let entry = CacheEntry::optimistic(mutation_id, entity);
        match collection
            .iter_mut()
            .find(|e| e.mutation_id == Some(mutation_id))
        {
            Some(existing) => *existing = entry,
            None => collection.push(entry),
        }

        Self::notify(&mut inner, scope);
    }

    /// Replaces the optimistic entity for `mutation_id` with the
    /// authoritative server entity and clears its provisional flag.
    ///
    /// If no optimistic entry matches (the cache was rebuilt meanwhile) the
    /// authoritative entity is appended instead.
    pub fn commit(&self, scope: &ScopeKey, mutation_id: MutationId, server_entity: serde_json::Value) {
        let mut inner = self.inner.lock();
        let collection = inner.collections.entry(scope.clone()).or_default();

        let entry = CacheEntry::authoritative(server_entity);
        match collection
            .iter_mut()
            .find(|e| e.mutation_id == Some(mutation_id))
        {
            Some(existing) => *existing = entry,
            None => collection.push(entry),
        }

        Self::notify(&mut inner, scope);
    }

    /// Removes the optimistic entity for a permanently rejected mutation.
    pub fn rollback(&self, scope: &ScopeKey, mutation_id: MutationId) {
        let mut inner = self.inner.lock();
        if let Some(collection) = inner.collections.get_mut(scope) {
            collection.retain(|e| e.mutation_id != Some(mutation_id));
        }
        Self::notify(&mut inner, scope);
    }

    /// Removes an authoritative entity from a collection.
    ///
    /// Used when a delete mutation is applied optimistically.
    pub fn remove_entity(&self, scope: &ScopeKey, entity_matches: impl Fn(&serde_json::Value) -> bool) {
        let mut inner = self.inner.lock();
        if let Some(collection) = inner.collections.get_mut(scope) {
            collection.retain(|e| !entity_matches(&e.entity));
        }
        Self::notify(&mut inner, scope);
    }

    /// Replaces a collection wholesale with authoritative server data.
    ///
    /// Optimistic entries currently in the collection are preserved at the
    /// end, in their existing order, so pending work stays visible.
    pub fn replace_authoritative(&self, scope: &ScopeKey, entities: Vec<serde_json::Value>) {
        let mut inner = self.inner.lock();
        let collection = inner.collections.entry(scope.clone()).or_default();

        let optimistic: Vec<CacheEntry> = collection
            .iter()
            .filter(|e| e.is_optimistic)
            .cloned()
            .collect();

        *collection = entities
            .into_iter()
            .map(CacheEntry::authoritative)
            .chain(optimistic)
            .collect();

        Self::notify(&mut inner, scope);
    }

    /// Returns the current collection for a scope.
    #[must_use]
    pub fn snapshot(&self, scope: &ScopeKey) -> Vec<CacheEntry> {
        self.inner
            .lock()
            .collections
            .get(scope)
            .cloned()
            .unwrap_or_default()
    }

    /// Subscribes to a scope.
    ///
    /// The receiver is sent the current collection immediately, then every
    /// subsequent version. Disconnected receivers are cleaned up on the next
    /// notification.
    pub fn subscribe(&self, scope: &ScopeKey) -> Receiver<Vec<CacheEntry>> {
        let (tx, rx) = mpsc::channel();
        let mut inner = self.inner.lock();

        let snapshot = inner.collections.get(scope).cloned().unwrap_or_default();
        // A fresh channel cannot be disconnected yet
        let _ = tx.send(snapshot);

        inner.subscribers.entry(scope.clone()).or_default().push(tx);
        rx
    }

    /// Returns the number of live subscribers for a scope.
    #[must_use]
    pub fn subscriber_count(&self, scope: &ScopeKey) -> usize {
        self.inner
            .lock()
            .subscribers
            .get(scope)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    fn notify(inner: &mut CacheInner, scope: &ScopeKey) {
        let snapshot = inner.collections.get(scope).cloned().unwrap_or_default();
        if let Some(subscribers) = inner.subscribers.get_mut(scope) {
            subscribers.retain(|tx| tx.send(snapshot.clone()).is_ok());
        }
    }
}

impl Default for OptimisticCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> ScopeKey {
        ScopeKey::new("sale", "store-1")
    }

    #[test]
    fn apply_inserts_optimistic_entry() {
        let cache = OptimisticCache::new();
        let id = MutationId::new_v4();

        cache.apply(&scope(), id, json!({"total": 1000}));

        let entries = cache.snapshot(&scope());
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_optimistic);
        assert_eq!(entries[0].mutation_id, Some(id));
        assert_eq!(entries[0].entity, json!({"total": 1000}));
    }

    #[test]
    fn apply_twice_merges_in_place() {
        let cache = OptimisticCache::new();
        let id = MutationId::new_v4();

        cache.apply(&scope(), id, json!({"total": 1000}));
        cache.apply(&scope(), id, json!({"total": 1500}));

        let entries = cache.snapshot(&scope());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entity, json!({"total": 1500}));
    }

    #[test]
    fn commit_swaps_in_server_entity() {
        let cache = OptimisticCache::new();
        let id = MutationId::new_v4();

        cache.apply(&scope(), id, json!({"id": id.to_string(), "total": 1000}));
        cache.commit(&scope(), id, json!({"id": "srv-42", "total": 1000}));

        let entries = cache.snapshot(&scope());
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].is_optimistic);
        assert_eq!(entries[0].mutation_id, None);
        assert_eq!(entries[0].entity["id"], json!("srv-42"));
    }

    #[test]
    fn commit_without_optimistic_entry_appends() {
        let cache = OptimisticCache::new();
        let id = MutationId::new_v4();

        cache.commit(&scope(), id, json!({"id": "srv-1"}));

        let entries = cache.snapshot(&scope());
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].is_optimistic);
    }

    #[test]
    fn rollback_removes_entry() {
        let cache = OptimisticCache::new();
        let keep = MutationId::new_v4();
        let drop_id = MutationId::new_v4();

        cache.apply(&scope(), keep, json!({"n": 1}));
        cache.apply(&scope(), drop_id, json!({"n": 2}));
        cache.rollback(&scope(), drop_id);

        let entries = cache.snapshot(&scope());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].mutation_id, Some(keep));
    }

    #[test]
    fn subscribe_delivers_snapshot_then_versions() {
        let cache = OptimisticCache::new();
        let id = MutationId::new_v4();
        cache.apply(&scope(), id, json!({"n": 1}));

        let rx = cache.subscribe(&scope());
        let initial = rx.recv().unwrap();
        assert_eq!(initial.len(), 1);

        cache.commit(&scope(), id, json!({"id": "srv", "n": 1}));
        let updated = rx.recv().unwrap();
        assert!(!updated[0].is_optimistic);
    }

    #[test]
    fn dropped_subscribers_are_cleaned_up() {
        let cache = OptimisticCache::new();
        let rx = cache.subscribe(&scope());
        assert_eq!(cache.subscriber_count(&scope()), 1);

        drop(rx);
        cache.apply(&scope(), MutationId::new_v4(), json!({}));
        assert_eq!(cache.subscriber_count(&scope()), 0);
    }

    #[test]
    fn replace_authoritative_preserves_optimistic() {
        let cache = OptimisticCache::new();
        let pending = MutationId::new_v4();

        cache.apply(&scope(), pending, json!({"pending": true}));
        cache.replace_authoritative(
            &scope(),
            vec![json!({"id": "srv-1"}), json!({"id": "srv-2"})],
        );

        let entries = cache.snapshot(&scope());
        assert_eq!(entries.len(), 3);
        assert!(!entries[0].is_optimistic);
        assert!(!entries[1].is_optimistic);
        assert!(entries[2].is_optimistic);
        assert_eq!(entries[2].mutation_id, Some(pending));
    }

    #[test]
    fn remove_entity_by_predicate() {
        let cache = OptimisticCache::new();
        cache.replace_authoritative(
            &scope(),
            vec![json!({"id": "a"}), json!({"id": "b"})],
        );

        cache.remove_entity(&scope(), |e| e["id"] == json!("a"));

        let entries = cache.snapshot(&scope());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entity["id"], json!("b"));
    }

    #[test]
    fn scopes_are_isolated() {
        let cache = OptimisticCache::new();
        let other = ScopeKey::new("sale", "store-2");

        cache.apply(&scope(), MutationId::new_v4(), json!({"n": 1}));

        assert_eq!(cache.snapshot(&scope()).len(), 1);
        assert!(cache.snapshot(&other).is_empty());
    }
}
