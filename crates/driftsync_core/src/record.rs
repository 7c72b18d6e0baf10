//! Mutation records and their status lifecycle.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Client-generated mutation identifier.
///
/// Stable across retries; doubles as the provisional primary key for the
/// optimistic entity until the server assigns one.
pub type MutationId = Uuid;

/// Returns the current wall-clock time in milliseconds since the epoch.
#[must_use]
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Identifies an entity collection: entity type plus the scope it belongs
/// to (e.g. a store id or plan id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeKey {
    /// The entity type, e.g. `"sale"` or `"product"`.
    pub entity_type: String,
    /// The scope the collection belongs to, e.g. a store id.
    pub scope_id: String,
}

impl ScopeKey {
    /// Creates a new scope key.
    pub fn new(entity_type: impl Into<String>, scope_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            scope_id: scope_id.into(),
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.scope_id)
    }
}

/// The verb a mutation performs against the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    /// Create a new entity.
    Create,
    /// Update an existing entity.
    Update,
    /// Delete an existing entity.
    Delete,
    /// A domain-specific verb, e.g. `"withdraw-partial"`.
    #[serde(untagged)]
    Custom(String),
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Create => write!(f, "create"),
            Action::Update => write!(f, "update"),
            Action::Delete => write!(f, "delete"),
            Action::Custom(verb) => write!(f, "{verb}"),
        }
    }
}

/// A caller-supplied tuple identifying a create operation server-side.
///
/// Used to detect that an operation already succeeded despite a lost
/// response, preventing duplicate inserts on retry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NaturalKey(pub Vec<String>);

impl NaturalKey {
    /// Creates a natural key from its parts.
    pub fn new(parts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self(parts.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.0.join(", "))
    }
}

/// Classification of a failed remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Transient; the record returns to pending and is retried with backoff.
    Retryable,
    /// Permanent; the record stays failed until the caller discards it.
    Permanent,
}

/// Status of a mutation record.
///
/// Transitions are monotonic: `Pending → InFlight → Committed | Failed`.
/// The only backward edges are `InFlight → Pending` (retryable failure or
/// crash recovery) and `Failed → Pending` (manual retry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationStatus {
    /// Waiting to be drained.
    Pending,
    /// A remote operation is currently executing.
    InFlight,
    /// The remote store confirmed the mutation.
    Committed,
    /// The mutation was permanently rejected.
    Failed,
}

impl MutationStatus {
    /// Returns true if the transition to `next` is allowed.
    #[must_use]
    pub fn can_transition_to(self, next: MutationStatus) -> bool {
        matches!(
            (self, next),
            (MutationStatus::Pending, MutationStatus::InFlight)
                | (MutationStatus::InFlight, MutationStatus::Committed)
                | (MutationStatus::InFlight, MutationStatus::Failed)
                | (MutationStatus::InFlight, MutationStatus::Pending)
                | (MutationStatus::Failed, MutationStatus::Pending)
        )
    }

    /// Returns true if the record still occupies the queue's active path.
    #[must_use]
    pub fn is_unsettled(self) -> bool {
        matches!(self, MutationStatus::Pending | MutationStatus::InFlight)
    }
}

/// A durable description of one user-initiated change.
///
/// Exactly one record exists per change. It is created on enqueue, mutated
/// only by the queue and the sync engine, and destroyed when committed or
/// when a failed record is explicitly discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRecord {
    /// Client-generated id, stable across retries.
    pub id: MutationId,
    /// Queue sequence number; defines submission order. Assigned on enqueue.
    pub seq: u64,
    /// The collection this mutation affects.
    pub scope: ScopeKey,
    /// The verb to perform remotely.
    pub action: Action,
    /// The operation input as submitted by the caller.
    pub payload: serde_json::Value,
    /// Optional duplicate-detection tuple for create operations.
    pub natural_key: Option<NaturalKey>,
    /// Server id of the entity being updated or deleted, if known.
    pub target_id: Option<String>,
    /// Current lifecycle status.
    pub status: MutationStatus,
    /// Creation time, milliseconds since the epoch.
    pub created_at_ms: u64,
    /// Number of retry attempts so far.
    pub retry_count: u32,
    /// Message of the most recent failure, if any.
    pub last_error: Option<String>,
    /// Earliest time this record may be drained again (backoff gate).
    pub not_before_ms: u64,
}

impl MutationRecord {
    /// Creates a new pending record for the given scope and action.
    pub fn new(scope: ScopeKey, action: Action, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            seq: 0,
            scope,
            action,
            payload,
            natural_key: None,
            target_id: None,
            status: MutationStatus::Pending,
            created_at_ms: now_ms(),
            retry_count: 0,
            last_error: None,
            not_before_ms: 0,
        }
    }

    /// Attaches a natural key for idempotent-replay detection.
    #[must_use]
    pub fn with_natural_key(mut self, key: NaturalKey) -> Self {
        self.natural_key = Some(key);
        self
    }

    /// Targets an existing entity by its identifier.
    ///
    /// Records with equal targets are drained strictly in submission order
    /// and never run concurrently.
    #[must_use]
    pub fn with_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    /// Returns the identity used for per-entity ordering.
    ///
    /// For updates and deletes this is the targeted entity id; for creates
    /// it is the record's own (provisional) id.
    #[must_use]
    pub fn ordering_key(&self) -> String {
        self.target_id
            .clone()
            .unwrap_or_else(|| self.id.to_string())
    }

    /// Returns true if the record is pending and its backoff gate has
    /// elapsed.
    #[must_use]
    pub fn is_due(&self, now: u64) -> bool {
        self.status == MutationStatus::Pending && self.not_before_ms <= now
    }

    /// The storage key this record persists under.
    #[must_use]
    pub fn storage_key(&self) -> String {
        format!("mutation:{}", self.id)
    }

    /// Serializes the record for persistence.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Deserializes a persisted record.
    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn sample_record() -> MutationRecord {
        MutationRecord::new(
            ScopeKey::new("sale", "store-1"),
            Action::Create,
            json!({"total": 1000}),
        )
        .with_natural_key(NaturalKey::new(["store-1", "2024-05-01"]))
    }

    #[test]
    fn record_roundtrip() {
        let record = sample_record();
        let bytes = record.encode().unwrap();
        let decoded = MutationRecord::decode(&bytes).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn custom_action_roundtrip() {
        let record = MutationRecord::new(
            ScopeKey::new("savings", "plan-7"),
            Action::Custom("withdraw-partial".into()),
            json!({"amount": 250}),
        );
        let decoded = MutationRecord::decode(&record.encode().unwrap()).unwrap();
        assert_eq!(
            decoded.action,
            Action::Custom("withdraw-partial".to_string())
        );
    }

    #[test]
    fn action_serializes_as_verb() {
        assert_eq!(
            serde_json::to_value(Action::Create).unwrap(),
            json!("create")
        );
        assert_eq!(
            serde_json::to_value(Action::Custom("withdraw-partial".into())).unwrap(),
            json!("withdraw-partial")
        );
    }

    #[test]
    fn status_transitions() {
        use MutationStatus::*;

        assert!(Pending.can_transition_to(InFlight));
        assert!(InFlight.can_transition_to(Committed));
        assert!(InFlight.can_transition_to(Failed));
        assert!(InFlight.can_transition_to(Pending));
        assert!(Failed.can_transition_to(Pending));

        assert!(!Pending.can_transition_to(Committed));
        assert!(!Committed.can_transition_to(Pending));
        assert!(!Committed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(InFlight));
    }

    #[test]
    fn ordering_key_prefers_target() {
        let create = sample_record();
        assert_eq!(create.ordering_key(), create.id.to_string());

        let update = MutationRecord::new(
            ScopeKey::new("product", "store-1"),
            Action::Update,
            json!({"threshold": 5}),
        )
        .with_target("product-9");
        assert_eq!(update.ordering_key(), "product-9");
    }

    #[test]
    fn due_respects_backoff_gate() {
        let mut record = sample_record();
        assert!(record.is_due(record.created_at_ms));

        record.not_before_ms = record.created_at_ms + 1000;
        assert!(!record.is_due(record.created_at_ms));
        assert!(record.is_due(record.created_at_ms + 1000));
    }

    #[test]
    fn scope_key_display() {
        let scope = ScopeKey::new("loan", "store-3");
        assert_eq!(scope.to_string(), "loan/store-3");
    }

    proptest! {
        #[test]
        fn no_transition_escapes_committed(next in prop_oneof![
            Just(MutationStatus::Pending),
            Just(MutationStatus::InFlight),
            Just(MutationStatus::Committed),
            Just(MutationStatus::Failed),
        ]) {
            prop_assert!(!MutationStatus::Committed.can_transition_to(next));
        }
    }
}
