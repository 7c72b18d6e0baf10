//! Remote operation seam and test double.

use crate::error::RemoteError;
use driftsync_core::{Action, MutationRecord, NaturalKey};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

/// The authoritative entity returned by the remote store.
pub type ServerEntity = serde_json::Value;

/// A caller-supplied remote operation for one `(entity_type, action)` pair.
///
/// Implementations perform the actual network create/update/delete and
/// return the authoritative entity or a classified [`RemoteError`]. Because
/// the engine re-attempts operations after crashes and timeouts, every
/// implementation must be safe to invoke more than once with the same
/// record.
pub trait RemoteOperation: Send + Sync {
    /// Executes the remote mutation with the record's original payload.
    fn execute(&self, record: &MutationRecord) -> Result<ServerEntity, RemoteError>;

    /// Looks up an existing row matching a natural key.
    ///
    /// Called before a create operation that carries a natural key, so that
    /// a prior attempt whose confirmation was lost is detected and its row
    /// returned instead of inserted twice. The default reports no match,
    /// which disables the dedup check.
    fn find_by_natural_key(
        &self,
        key: &NaturalKey,
    ) -> Result<Option<ServerEntity>, RemoteError> {
        let _ = key;
        Ok(None)
    }
}

/// Registry of remote operations keyed by `(entity_type, action)`.
#[derive(Default)]
pub struct RemoteRegistry {
    ops: RwLock<HashMap<(String, Action), std::sync::Arc<dyn RemoteOperation>>>,
}

impl RemoteRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the operation for an entity type and action.
    pub fn register(
        &self,
        entity_type: impl Into<String>,
        action: Action,
        op: std::sync::Arc<dyn RemoteOperation>,
    ) {
        self.ops.write().insert((entity_type.into(), action), op);
    }

    /// Returns the operation for a record, if registered.
    #[must_use]
    pub fn get(&self, record: &MutationRecord) -> Option<std::sync::Arc<dyn RemoteOperation>> {
        self.ops
            .read()
            .get(&(record.scope.entity_type.clone(), record.action.clone()))
            .cloned()
    }
}

/// An in-memory remote store for testing.
///
/// Behaves like a small server: creates assign `srv-N` identifiers, updates
/// merge the payload into the stored row, deletes remove it. Errors can be
/// injected ahead of time to script transient and permanent failures.
#[derive(Default)]
pub struct MockRemote {
    rows: Mutex<Vec<ServerEntity>>,
    /// Maps natural keys to server ids; ids stay valid across deletes.
    by_natural_key: Mutex<HashMap<NaturalKey, String>>,
    injected: Mutex<VecDeque<RemoteError>>,
    next_id: AtomicU64,
    executions: AtomicU64,
}

impl MockRemote {
    /// Creates an empty mock remote.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an error to be returned by the next execution.
    pub fn inject_failure(&self, error: RemoteError) {
        self.injected.lock().push_back(error);
    }

    /// Returns all stored rows.
    #[must_use]
    pub fn rows(&self) -> Vec<ServerEntity> {
        self.rows.lock().clone()
    }

    /// Returns the number of `execute` calls that reached the store.
    #[must_use]
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::SeqCst)
    }

    /// Returns the stored row with the given server id.
    #[must_use]
    pub fn row(&self, id: &str) -> Option<ServerEntity> {
        self.rows
            .lock()
            .iter()
            .find(|r| r["id"] == serde_json::Value::String(id.to_string()))
            .cloned()
    }

    fn create(&self, record: &MutationRecord) -> ServerEntity {
        let id = format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let mut entity = record.payload.clone();
        if let Some(obj) = entity.as_object_mut() {
            obj.insert("id".into(), serde_json::Value::String(id.clone()));
        }

        self.rows.lock().push(entity.clone());
        if let Some(key) = &record.natural_key {
            self.by_natural_key.lock().insert(key.clone(), id);
        }
        entity
    }

    fn update(&self, record: &MutationRecord) -> Result<ServerEntity, RemoteError> {
        let target = record.target_id.as_deref().ok_or_else(|| {
            RemoteError::Validation("update without target id".into())
        })?;

        let mut rows = self.rows.lock();
        let row = rows
            .iter_mut()
            .find(|r| r["id"] == serde_json::Value::String(target.to_string()))
            .ok_or_else(|| RemoteError::Conflict(format!("{target} no longer exists")))?;

        if let (Some(obj), Some(patch)) = (row.as_object_mut(), record.payload.as_object()) {
            for (k, v) in patch {
                obj.insert(k.clone(), v.clone());
            }
        }
        Ok(row.clone())
    }

    fn delete(&self, record: &MutationRecord) -> Result<ServerEntity, RemoteError> {
        let target = record.target_id.as_deref().ok_or_else(|| {
            RemoteError::Validation("delete without target id".into())
        })?;

        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|r| r["id"] != serde_json::Value::String(target.to_string()));
        if rows.len() == before {
            return Err(RemoteError::Conflict(format!("{target} no longer exists")));
        }
        Ok(serde_json::json!({ "id": target, "deleted": true }))
    }
}

impl RemoteOperation for MockRemote {
    fn execute(&self, record: &MutationRecord) -> Result<ServerEntity, RemoteError> {
        if let Some(error) = self.injected.lock().pop_front() {
            return Err(error);
        }
        self.executions.fetch_add(1, Ordering::SeqCst);

        match &record.action {
            Action::Create => Ok(self.create(record)),
            Action::Update | Action::Custom(_) => self.update(record),
            Action::Delete => self.delete(record),
        }
    }

    fn find_by_natural_key(
        &self,
        key: &NaturalKey,
    ) -> Result<Option<ServerEntity>, RemoteError> {
        let by_key = self.by_natural_key.lock();
        let rows = self.rows.lock();
        Ok(by_key.get(key).and_then(|id| {
            rows.iter()
                .find(|r| r["id"] == serde_json::Value::String(id.clone()))
                .cloned()
        }))
    }
}
