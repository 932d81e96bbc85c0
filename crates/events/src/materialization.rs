//! Materialized (read-side) state derived by folding events.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;

use eventline_core::{EntityId, ValidationErrors};

/// Error type reported by a [`MaterializationSink`].
pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// The shape of a projection's derived state.
///
/// `Default` is the empty instance a fold starts from unless the projection
/// configures its own initial state. `validate` decides whether the state is
/// acceptable; consistency projections reject appends that make it invalid.
pub trait Materialization: Default + Clone + core::fmt::Debug + Serialize + Send + Sync + 'static {
    fn validate(&self) -> ValidationErrors {
        ValidationErrors::new()
    }

    /// Called before a durable upsert so the stored row carries its key.
    fn assign_entity_id(&mut self, _entity_id: EntityId) {}
}

/// Where (if anywhere) a materialization is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaterializationModel {
    /// Computed in memory for validation/inspection only; never stored.
    Ephemeral,
    /// Upserted under `model`, keyed by entity id.
    Durable { model: String },
}

impl MaterializationModel {
    pub fn durable(model: impl Into<String>) -> Self {
        Self::Durable {
            model: model.into(),
        }
    }

    pub fn is_durable(&self) -> bool {
        matches!(self, Self::Durable { .. })
    }

    pub fn model_name(&self) -> Option<&str> {
        match self {
            Self::Ephemeral => None,
            Self::Durable { model } => Some(model),
        }
    }
}

/// Destination of durable upserts (a store, or a store transaction).
pub trait MaterializationSink {
    /// Insert-or-replace the snapshot stored for `(model, entity_id)`.
    fn upsert_materialization(
        &mut self,
        model: &str,
        entity_id: EntityId,
        state: JsonValue,
    ) -> Result<(), SinkError>;
}

/// A computed materialization, returned whether valid or not.
#[derive(Debug, Clone)]
pub struct Materialized<M> {
    pub entity_id: EntityId,
    pub as_of: DateTime<Utc>,
    pub state: M,
    pub errors: ValidationErrors,
    /// Whether the state was written to a sink.
    pub stored: bool,
}

impl<M> Materialized<M> {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}
