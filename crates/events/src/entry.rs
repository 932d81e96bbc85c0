//! Durable event records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use eventline_core::EntityId;

use crate::event::{Event, EventCodecError};

/// An entry ready to be inserted at an explicit version.
///
/// The version is computed by the caller from already-committed state; the
/// store only guarantees `(entity_id, version)` uniqueness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEventEntry {
    pub entity_id: EntityId,
    pub version: u64,
    pub event_type: String,
    pub attributes: JsonValue,
    pub created_at: DateTime<Utc>,
}

impl NewEventEntry {
    pub fn from_event<E: Event>(
        entity_id: EntityId,
        version: u64,
        event: &E,
        created_at: DateTime<Utc>,
    ) -> Result<Self, EventCodecError> {
        Ok(Self {
            entity_id,
            version,
            event_type: event.event_type().to_string(),
            attributes: event.to_attributes()?,
            created_at,
        })
    }
}

/// A committed, immutable entry in an entity's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEntry {
    pub entity_id: EntityId,
    /// Position in the entity's log, starting at 1 with no gaps.
    pub version: u64,
    pub event_type: String,
    pub attributes: JsonValue,
    pub created_at: DateTime<Utc>,
}

impl EventEntry {
    /// Reconstruct the typed event recorded by this entry.
    pub fn decode<E: Event>(&self) -> Result<E, EventCodecError> {
        E::from_attributes(&self.event_type, self.attributes.clone())
    }
}

impl From<NewEventEntry> for EventEntry {
    fn from(value: NewEventEntry) -> Self {
        Self {
            entity_id: value.entity_id,
            version: value.version,
            event_type: value.event_type,
            attributes: value.attributes,
            created_at: value.created_at,
        }
    }
}
