use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use eventline_core::EntityId;
use eventline_events::{EventEntry, NewEventEntry};

use super::r#trait::{EventStore, StoreError, StoreTransaction};

type CheckFn = dyn Fn(&JsonValue) -> bool + Send + Sync;

struct CheckConstraint {
    model: String,
    name: String,
    check: Arc<CheckFn>,
}

#[derive(Default)]
struct State {
    streams: HashMap<EntityId, Vec<EventEntry>>,
    materializations: HashMap<(String, EntityId), JsonValue>,
}

/// In-memory event store.
///
/// Intended for tests/dev. A transaction holds the store lock for its whole
/// lifetime, so transactions are fully serialized; writes are staged and only
/// become visible on `commit`.
#[derive(Default)]
pub struct InMemoryEventStore {
    state: Mutex<State>,
    constraints: Vec<CheckConstraint>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject materialization upserts into `model` whose state fails `check`,
    /// the way a table CHECK constraint would.
    pub fn with_check_constraint<F>(mut self, model: impl Into<String>, name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&JsonValue) -> bool + Send + Sync + 'static,
    {
        self.constraints.push(CheckConstraint {
            model: model.into(),
            name: name.into(),
            check: Arc::new(check),
        });
        self
    }

    /// Number of committed entries for `entity_id`.
    pub fn stream_len(&self, entity_id: EntityId) -> Result<usize, StoreError> {
        Ok(self.lock()?.streams.get(&entity_id).map_or(0, Vec::len))
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("event store lock poisoned".to_string()))
    }

    fn check_constraints(&self, model: &str, state: &JsonValue) -> Result<(), StoreError> {
        for constraint in self.constraints.iter().filter(|c| c.model == model) {
            if !(constraint.check)(state) {
                return Err(StoreError::ConstraintViolation(format!(
                    "{} violates check constraint '{}'",
                    model, constraint.name
                )));
            }
        }
        Ok(())
    }
}

impl core::fmt::Debug for InMemoryEventStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryEventStore")
            .field("constraints", &self.constraints.iter().map(|c| &c.name).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl EventStore for InMemoryEventStore {
    fn load_stream(
        &self,
        entity_id: EntityId,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<EventEntry>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .streams
            .get(&entity_id)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|e| e.created_at <= as_of)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>, StoreError> {
        Ok(Box::new(InMemoryTransaction {
            store: self,
            state: self.lock()?,
            entries: Vec::new(),
            materializations: Vec::new(),
        }))
    }

    fn load_materialization(
        &self,
        model: &str,
        entity_id: EntityId,
    ) -> Result<Option<JsonValue>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .materializations
            .get(&(model.to_string(), entity_id))
            .cloned())
    }
}

struct InMemoryTransaction<'a> {
    store: &'a InMemoryEventStore,
    state: MutexGuard<'a, State>,
    entries: Vec<EventEntry>,
    materializations: Vec<(String, EntityId, JsonValue)>,
}

impl StoreTransaction for InMemoryTransaction<'_> {
    fn insert_entry(&mut self, entry: NewEventEntry) -> Result<EventEntry, StoreError> {
        let taken = |e: &EventEntry| e.entity_id == entry.entity_id && e.version == entry.version;
        let committed = self
            .state
            .streams
            .get(&entry.entity_id)
            .is_some_and(|stream| stream.iter().any(taken));

        if committed || self.entries.iter().any(taken) {
            return Err(StoreError::UniqueViolation {
                entity_id: entry.entity_id,
                version: entry.version,
            });
        }

        let entry = EventEntry::from(entry);
        self.entries.push(entry.clone());
        Ok(entry)
    }

    fn upsert_materialization(
        &mut self,
        model: &str,
        entity_id: EntityId,
        state: JsonValue,
    ) -> Result<(), StoreError> {
        self.store.check_constraints(model, &state)?;
        self.materializations.push((model.to_string(), entity_id, state));
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let InMemoryTransaction {
            mut state,
            entries,
            materializations,
            ..
        } = *self;

        for entry in entries {
            let stream = state.streams.entry(entry.entity_id).or_default();
            stream.push(entry);
            stream.sort_by_key(|e| e.version);
        }
        for (model, entity_id, json) in materializations {
            state.materializations.insert((model, entity_id), json);
        }
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_entry(entity_id: EntityId, version: u64, at: DateTime<Utc>) -> NewEventEntry {
        NewEventEntry {
            entity_id,
            version,
            event_type: "counter.added".to_string(),
            attributes: json!({ "value": version }),
            created_at: at,
        }
    }

    fn append(store: &InMemoryEventStore, entry: NewEventEntry) -> Result<EventEntry, StoreError> {
        let mut tx = store.begin()?;
        let stored = tx.insert_entry(entry)?;
        tx.commit()?;
        Ok(stored)
    }

    #[test]
    fn committed_entries_are_loaded_in_version_order() {
        let store = InMemoryEventStore::new();
        let id = EntityId::new();
        let now = Utc::now();

        append(&store, new_entry(id, 1, now)).unwrap();
        append(&store, new_entry(id, 2, now)).unwrap();

        let versions: Vec<u64> = store.load_stream(id, now).unwrap().iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 2]);
        assert!(store.load_stream(EntityId::new(), now).unwrap().is_empty());
    }

    #[test]
    fn load_is_bounded_by_as_of() {
        let store = InMemoryEventStore::new();
        let id = EntityId::new();
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::seconds(10);

        append(&store, new_entry(id, 1, t1)).unwrap();
        append(&store, new_entry(id, 2, t2)).unwrap();

        assert_eq!(store.load_stream(id, t1).unwrap().len(), 1);
        assert_eq!(store.load_stream(id, t2).unwrap().len(), 2);
        assert!(store.load_stream(id, t1 - chrono::Duration::seconds(1)).unwrap().is_empty());
    }

    #[test]
    fn duplicate_version_is_a_unique_violation() {
        let store = InMemoryEventStore::new();
        let id = EntityId::new();
        let now = Utc::now();

        append(&store, new_entry(id, 1, now)).unwrap();
        let err = append(&store, new_entry(id, 1, now)).unwrap_err();

        assert!(err.is_unique_violation());
        assert_eq!(store.stream_len(id).unwrap(), 1);
    }

    #[test]
    fn dropped_transaction_discards_writes() {
        let store = InMemoryEventStore::new();
        let id = EntityId::new();
        let now = Utc::now();

        {
            let mut tx = store.begin().unwrap();
            tx.insert_entry(new_entry(id, 1, now)).unwrap();
            tx.upsert_materialization("counters", id, json!({ "value": 1 })).unwrap();
        }
        let mut tx = store.begin().unwrap();
        tx.insert_entry(new_entry(id, 1, now)).unwrap();
        tx.rollback().unwrap();

        assert_eq!(store.stream_len(id).unwrap(), 0);
        assert_eq!(store.load_materialization("counters", id).unwrap(), None);
    }

    #[test]
    fn materializations_are_upserted_on_commit() {
        let store = InMemoryEventStore::new();
        let id = EntityId::new();

        for value in [1, 2] {
            let mut tx = store.begin().unwrap();
            tx.upsert_materialization("counters", id, json!({ "value": value })).unwrap();
            tx.commit().unwrap();
        }

        assert_eq!(
            store.load_materialization("counters", id).unwrap(),
            Some(json!({ "value": 2 }))
        );
    }

    #[test]
    fn check_constraint_rejects_upsert() {
        let store = InMemoryEventStore::new().with_check_constraint("counters", "value_non_negative", |state| {
            state["value"].as_i64().is_some_and(|v| v >= 0)
        });
        let id = EntityId::new();

        let mut tx = store.begin().unwrap();
        let err = tx
            .upsert_materialization("counters", id, json!({ "value": -1 }))
            .unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));
        tx.upsert_materialization("others", id, json!({ "value": -1 })).unwrap();
    }
}
