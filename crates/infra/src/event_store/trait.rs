use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use eventline_core::EntityId;
use eventline_events::{EventEntry, MaterializationSink, NewEventEntry, SinkError};
use std::sync::Arc;

/// Persistence error.
///
/// `UniqueViolation` is the only concurrency signal: two writers computed the
/// same next version for one entity and the store kept the first.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entry ({entity_id}, {version}) already exists")]
    UniqueViolation { entity_id: EntityId, version: u64 },

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("failed to decode stored row: {0}")]
    Decode(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation { .. })
    }
}

/// Append-only entry log plus the keyed materialization tables.
///
/// ## Append semantics
///
/// Entries are only written inside a [`StoreTransaction`]. The store never
/// assigns versions; it rejects a second `(entity_id, version)` with
/// [`StoreError::UniqueViolation`]. Entries are never updated or deleted.
///
/// ## Load semantics
///
/// `load_stream` returns the entity's entries with `created_at <= as_of`,
/// ordered by version. An unknown entity yields an empty vector.
pub trait EventStore: Send + Sync {
    fn load_stream(
        &self,
        entity_id: EntityId,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<EventEntry>, StoreError>;

    /// Open an atomic scope. Dropping it without `commit` discards its writes.
    fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>, StoreError>;

    /// Latest stored snapshot of `model` for `entity_id`.
    fn load_materialization(
        &self,
        model: &str,
        entity_id: EntityId,
    ) -> Result<Option<JsonValue>, StoreError>;
}

/// One atomic unit of work against an [`EventStore`].
pub trait StoreTransaction {
    fn insert_entry(&mut self, entry: NewEventEntry) -> Result<EventEntry, StoreError>;

    /// Insert-or-replace the snapshot keyed by `(model, entity_id)`.
    fn upsert_materialization(
        &mut self,
        model: &str,
        entity_id: EntityId,
        state: JsonValue,
    ) -> Result<(), StoreError>;

    fn commit(self: Box<Self>) -> Result<(), StoreError>;

    fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Adapts a transaction to the projection crate's sink interface.
pub struct TransactionSink<'t, 'a> {
    tx: &'t mut (dyn StoreTransaction + 'a),
}

impl<'t, 'a> TransactionSink<'t, 'a> {
    pub fn new(tx: &'t mut (dyn StoreTransaction + 'a)) -> Self {
        Self { tx }
    }
}

impl MaterializationSink for TransactionSink<'_, '_> {
    fn upsert_materialization(
        &mut self,
        model: &str,
        entity_id: EntityId,
        state: JsonValue,
    ) -> Result<(), SinkError> {
        self.tx
            .upsert_materialization(model, entity_id, state)
            .map_err(|e| Box::new(e) as SinkError)
    }
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn load_stream(
        &self,
        entity_id: EntityId,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<EventEntry>, StoreError> {
        (**self).load_stream(entity_id, as_of)
    }

    fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>, StoreError> {
        (**self).begin()
    }

    fn load_materialization(
        &self,
        model: &str,
        entity_id: EntityId,
    ) -> Result<Option<JsonValue>, StoreError> {
        (**self).load_materialization(model, entity_id)
    }
}
