use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::trace;

use eventline_core::{EntityId, ValidationErrors};

use crate::event::Event;
use crate::materialization::{
    Materialization, MaterializationModel, MaterializationSink, Materialized, SinkError,
};

type InterpretFn<E, M> = dyn Fn(M, &E, DateTime<Utc>) -> M + Send + Sync;
type InitialStateFn<M> = dyn Fn(DateTime<Utc>) -> M + Send + Sync;
type FinalStateFn<M> = dyn Fn(M, DateTime<Utc>) -> M + Send + Sync;

#[derive(Debug, Error)]
pub enum ProjectionError {
    /// Strict projection folded an event it has no interpretation for.
    #[error("projection '{projection}' has no interpretation for event type '{event_type}'")]
    UnknownEvent {
        projection: String,
        event_type: String,
    },

    #[error("projection '{projection}' has no materialization model")]
    MissingMaterializationModel { projection: String },

    #[error("failed to serialize state of projection '{projection}': {source}")]
    Serialize {
        projection: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to store materialization of projection '{projection}': {source}")]
    Sink {
        projection: String,
        #[source]
        source: SinkError,
    },
}

impl ProjectionError {
    /// Programming defects (as opposed to downstream storage failures).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProjectionError::UnknownEvent { .. } | ProjectionError::MissingMaterializationModel { .. }
        )
    }
}

/// A named fold from an event sequence to a materialized state.
///
/// Immutable once built and shared across all entities; per-call state lives
/// only inside [`process_events`](Projection::process_events).
///
/// ```ignore
/// let balance = Projection::<CounterEvent, Counter>::builder("counter")
///     .interpretation_for("counter.added", |mut s, e, _| { s.value += e.amount(); s })
///     .materialization_model(MaterializationModel::durable("counters"))
///     .build();
/// ```
pub struct Projection<E, M> {
    name: String,
    interpretations: HashMap<&'static str, Arc<InterpretFn<E, M>>>,
    initial_state: Option<Arc<InitialStateFn<M>>>,
    final_state: Option<Arc<FinalStateFn<M>>>,
    model: Option<MaterializationModel>,
    strict: bool,
}

impl<E, M> Projection<E, M>
where
    E: Event,
    M: Materialization,
{
    pub fn builder(name: impl Into<String>) -> ProjectionBuilder<E, M> {
        ProjectionBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> Option<&MaterializationModel> {
        self.model.as_ref()
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn interprets(&self, event_type: &str) -> bool {
        self.interpretations.contains_key(event_type)
    }

    /// Fold `events` in order, starting from the initial state at `as_of`.
    pub fn process_events<'a, I>(&self, events: I, as_of: DateTime<Utc>) -> Result<M, ProjectionError>
    where
        I: IntoIterator<Item = &'a E>,
    {
        let mut state = match &self.initial_state {
            Some(init) => init(as_of),
            None => M::default(),
        };

        for event in events {
            let event_type = event.event_type();
            match self.interpretations.get(event_type) {
                Some(interpret) => state = interpret(state, event, as_of),
                None if self.strict => {
                    return Err(ProjectionError::UnknownEvent {
                        projection: self.name.clone(),
                        event_type: event_type.to_string(),
                    });
                }
                None => trace!(projection = %self.name, event_type, "no interpretation; skipping"),
            }
        }

        Ok(match &self.final_state {
            Some(finish) => finish(state, as_of),
            None => state,
        })
    }

    /// Fold `events` and, for durable models, upsert the result keyed by `entity_id`.
    ///
    /// The computed instance is returned whether or not it is valid.
    pub fn materialize<'a, I>(
        &self,
        events: I,
        entity_id: EntityId,
        as_of: DateTime<Utc>,
        sink: &mut dyn MaterializationSink,
    ) -> Result<Materialized<M>, ProjectionError>
    where
        I: IntoIterator<Item = &'a E>,
    {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| ProjectionError::MissingMaterializationModel {
                projection: self.name.clone(),
            })?;

        let mut state = self.process_events(events, as_of)?;
        let errors = state.validate();

        let stored = match model {
            MaterializationModel::Ephemeral => false,
            MaterializationModel::Durable { model } => {
                state.assign_entity_id(entity_id);
                let json = serde_json::to_value(&state).map_err(|source| ProjectionError::Serialize {
                    projection: self.name.clone(),
                    source,
                })?;
                sink.upsert_materialization(model, entity_id, json)
                    .map_err(|source| ProjectionError::Sink {
                        projection: self.name.clone(),
                        source,
                    })?;
                true
            }
        };

        Ok(Materialized {
            entity_id,
            as_of,
            state,
            errors,
            stored,
        })
    }
}

impl<E, M> Clone for Projection<E, M> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            interpretations: self.interpretations.clone(),
            initial_state: self.initial_state.clone(),
            final_state: self.final_state.clone(),
            model: self.model.clone(),
            strict: self.strict,
        }
    }
}

impl<E, M> core::fmt::Debug for Projection<E, M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut interpreted: Vec<_> = self.interpretations.keys().collect();
        interpreted.sort();
        f.debug_struct("Projection")
            .field("name", &self.name)
            .field("interpretations", &interpreted)
            .field("model", &self.model)
            .field("strict", &self.strict)
            .finish()
    }
}

/// Accumulates a projection's configuration; [`build`](ProjectionBuilder::build)
/// freezes it.
pub struct ProjectionBuilder<E, M> {
    inner: Projection<E, M>,
}

impl<E, M> ProjectionBuilder<E, M>
where
    E: Event,
    M: Materialization,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Projection {
                name: name.into(),
                interpretations: HashMap::new(),
                initial_state: None,
                final_state: None,
                model: None,
                strict: false,
            },
        }
    }

    /// Register the fold step for `event_type`. A later registration for the
    /// same type replaces the earlier one.
    pub fn interpretation_for<F>(mut self, event_type: &'static str, f: F) -> Self
    where
        F: Fn(M, &E, DateTime<Utc>) -> M + Send + Sync + 'static,
    {
        self.inner.interpretations.insert(event_type, Arc::new(f));
        self
    }

    pub fn initial_state<F>(mut self, f: F) -> Self
    where
        F: Fn(DateTime<Utc>) -> M + Send + Sync + 'static,
    {
        self.inner.initial_state = Some(Arc::new(f));
        self
    }

    pub fn final_state<F>(mut self, f: F) -> Self
    where
        F: Fn(M, DateTime<Utc>) -> M + Send + Sync + 'static,
    {
        self.inner.final_state = Some(Arc::new(f));
        self
    }

    pub fn materialization_model(mut self, model: MaterializationModel) -> Self {
        self.inner.model = Some(model);
        self
    }

    /// Treat events without an interpretation as a fatal fold error.
    pub fn raise_on_unknown_events(mut self) -> Self {
        self.inner.strict = true;
        self
    }

    pub fn build(self) -> Projection<E, M> {
        self.inner
    }
}

/// Object-safe view of a projection over event type `E`, independent of its
/// state type. Streams hold their projections through this trait.
pub trait Materializer<E>: Send + Sync {
    fn name(&self) -> &str;

    fn model(&self) -> Option<&MaterializationModel>;

    /// Fold and return the validation errors of the resulting state.
    fn check(&self, events: &[&E], as_of: DateTime<Utc>) -> Result<ValidationErrors, ProjectionError>;

    /// Fold and write through `sink`; returns the validation errors of the state.
    fn materialize_into(
        &self,
        events: &[&E],
        entity_id: EntityId,
        as_of: DateTime<Utc>,
        sink: &mut dyn MaterializationSink,
    ) -> Result<ValidationErrors, ProjectionError>;
}

impl<E, M> Materializer<E> for Projection<E, M>
where
    E: Event,
    M: Materialization,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> Option<&MaterializationModel> {
        self.model.as_ref()
    }

    fn check(&self, events: &[&E], as_of: DateTime<Utc>) -> Result<ValidationErrors, ProjectionError> {
        let state = self.process_events(events.iter().copied(), as_of)?;
        Ok(state.validate())
    }

    fn materialize_into(
        &self,
        events: &[&E],
        entity_id: EntityId,
        as_of: DateTime<Utc>,
        sink: &mut dyn MaterializationSink,
    ) -> Result<ValidationErrors, ProjectionError> {
        let materialized = self.materialize(events.iter().copied(), entity_id, as_of, sink)?;
        Ok(materialized.errors)
    }
}
