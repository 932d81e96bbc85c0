//! The append protocol.
//!
//! ```text
//! event
//!   ↓
//! 1. own validation             → rejected: own_errors, store untouched
//!   ↓
//! 2. consistency projection over history + event (in memory, at the stream's as-of)
//!                               → rejected: state_errors, store untouched
//!   ↓
//! 3. one store transaction:
//!      insert (entity_id, version = last known + 1)  → duplicate: "racing condition"
//!      transactional projections, in registration order → failure: full rollback, "racing condition"
//!      resolve async as-of values                      → invalid: ConfigurationError
//!   commit
//!   ↓
//! 4. schedule async projections (after commit, fire-and-forget)
//! ```
//!
//! Rejections are reported on the returned [`AppendedEvent`]; `Err` is
//! reserved for programming defects and for failures to read the stream.
//!
//! No in-process locking: concurrent writers are arbitrated solely by the
//! store's `(entity_id, version)` uniqueness. A writer that loses the race gets
//! a racing-condition error and retries by [`reload`](EventStream::reload)ing.

use std::collections::HashSet;
use std::iter;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use eventline_core::{EntityId, ValidationErrors};
use eventline_events::{
    AppendedEvent, AsOf, AsOfError, Event, EventCodecError, EventEntry, Materialization, Materializer,
    NewEventEntry, Projection, ProjectionError,
};

use crate::clock::{Clock, SystemClock};
use crate::dispatch::{MaterializeRequest, ProjectionDispatcher, ScheduleOptions};
use crate::event_store::{EventStore, StoreError, StoreTransaction};

/// Base-level message attached when another writer committed the same version
/// first, or when a transactional projection failed and the write was rolled back.
pub const RACING_CONDITION: &str = "racing condition";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("projection '{projection}' is registered more than once as {tier}")]
    DuplicateProjection {
        projection: String,
        tier: &'static str,
    },

    #[error("{tier} projection '{projection}' has no materialization model")]
    MissingMaterializationModel {
        projection: String,
        tier: &'static str,
    },

    #[error("no {tier} projection '{projection}' is registered on this stream")]
    UnknownProjection {
        projection: String,
        tier: &'static str,
    },

    #[error("invalid as-of strategy: {0}")]
    AsOf(#[from] AsOfError),
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Projection(#[from] ProjectionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Codec(#[from] EventCodecError),

    #[error("corrupt stream for entity {entity_id}: {reason}")]
    CorruptStream { entity_id: EntityId, reason: String },
}

/// The registration list a projection belongs to.
///
/// A name is unique within a tier but may be reused across tiers, so lookups
/// by name always say which tier they search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionTier {
    Transactional,
    Async,
}

impl ProjectionTier {
    pub fn as_str(self) -> &'static str {
        match self {
            ProjectionTier::Transactional => "transactional",
            ProjectionTier::Async => "async",
        }
    }
}

impl core::fmt::Display for ProjectionTier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-registration options of an async projection.
#[derive(Debug, Clone, Default)]
pub struct AsyncOptions {
    pub as_of: AsOf,
    pub schedule: ScheduleOptions,
}

impl AsyncOptions {
    pub fn as_of(mut self, as_of: AsOf) -> Self {
        self.as_of = as_of;
        self
    }

    pub fn schedule(mut self, schedule: ScheduleOptions) -> Self {
        self.schedule = schedule;
        self
    }
}

struct AsyncRegistration<E> {
    projection: Arc<dyn Materializer<E>>,
    options: AsyncOptions,
}

/// The three projection tiers attached to one kind of stream. Immutable once built.
pub struct StreamDefinition<E> {
    consistency: Option<Arc<dyn Materializer<E>>>,
    transactional: Vec<Arc<dyn Materializer<E>>>,
    asynchronous: Vec<AsyncRegistration<E>>,
}

impl<E: Event> StreamDefinition<E> {
    pub fn builder() -> StreamDefinitionBuilder<E> {
        StreamDefinitionBuilder {
            consistency: None,
            transactional: Vec::new(),
            asynchronous: Vec::new(),
        }
    }

    pub fn consistency_projection(&self) -> Option<&dyn Materializer<E>> {
        self.consistency.as_deref()
    }

    pub fn transactional_projections(&self) -> impl Iterator<Item = &dyn Materializer<E>> {
        self.transactional.iter().map(|p| p.as_ref())
    }

    pub fn async_projections(&self) -> impl Iterator<Item = (&dyn Materializer<E>, &AsyncOptions)> {
        self.asynchronous.iter().map(|r| (r.projection.as_ref(), &r.options))
    }

    /// The projection registered as `name` in `tier`.
    pub fn projection(&self, tier: ProjectionTier, name: &str) -> Option<&dyn Materializer<E>> {
        let found = match tier {
            ProjectionTier::Transactional => self.transactional.iter().find(|p| p.name() == name),
            ProjectionTier::Async => self
                .asynchronous
                .iter()
                .map(|r| &r.projection)
                .find(|p| p.name() == name),
        };
        found.map(|p| p.as_ref())
    }
}

impl<E> core::fmt::Debug for StreamDefinition<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StreamDefinition")
            .field("consistency", &self.consistency.as_ref().map(|p| p.name().to_string()))
            .field(
                "transactional",
                &self.transactional.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .field(
                "asynchronous",
                &self.asynchronous.iter().map(|r| r.projection.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

pub struct StreamDefinitionBuilder<E> {
    consistency: Option<Arc<dyn Materializer<E>>>,
    transactional: Vec<Arc<dyn Materializer<E>>>,
    asynchronous: Vec<AsyncRegistration<E>>,
}

impl<E: Event> StreamDefinitionBuilder<E> {
    /// Replaces any previously configured consistency projection.
    pub fn consistency_projection<M: Materialization>(mut self, projection: Projection<E, M>) -> Self {
        self.consistency = Some(Arc::new(projection));
        self
    }

    pub fn add_transactional_projection<M: Materialization>(mut self, projection: Projection<E, M>) -> Self {
        self.transactional.push(Arc::new(projection));
        self
    }

    pub fn add_async_projection<M: Materialization>(
        mut self,
        projection: Projection<E, M>,
        options: AsyncOptions,
    ) -> Self {
        self.asynchronous.push(AsyncRegistration {
            projection: Arc::new(projection),
            options,
        });
        self
    }

    pub fn build(self) -> Result<StreamDefinition<E>, ConfigurationError> {
        check_tier(ProjectionTier::Transactional, self.transactional.iter())?;
        check_tier(ProjectionTier::Async, self.asynchronous.iter().map(|r| &r.projection))?;

        Ok(StreamDefinition {
            consistency: self.consistency,
            transactional: self.transactional,
            asynchronous: self.asynchronous,
        })
    }
}

fn check_tier<'a, E: 'a>(
    tier: ProjectionTier,
    projections: impl Iterator<Item = &'a Arc<dyn Materializer<E>>>,
) -> Result<(), ConfigurationError> {
    let mut seen = HashSet::new();
    for projection in projections {
        if !seen.insert(projection.name().to_string()) {
            return Err(ConfigurationError::DuplicateProjection {
                projection: projection.name().to_string(),
                tier: tier.as_str(),
            });
        }
        if projection.model().is_none() {
            return Err(ConfigurationError::MissingMaterializationModel {
                projection: projection.name().to_string(),
                tier: tier.as_str(),
            });
        }
    }
    Ok(())
}

/// Opens [`EventStream`]s of one definition against one store and dispatcher.
pub struct EventStreams<E, S, D> {
    definition: Arc<StreamDefinition<E>>,
    store: S,
    dispatcher: D,
    clock: Arc<dyn Clock>,
}

impl<E, S, D> EventStreams<E, S, D>
where
    E: Event,
    S: EventStore,
    D: ProjectionDispatcher,
{
    pub fn new(definition: impl Into<Arc<StreamDefinition<E>>>, store: S, dispatcher: D) -> Self {
        Self {
            definition: definition.into(),
            store,
            dispatcher,
            clock: Arc::new(SystemClock),
        }
    }

    /// Source of `created_at` timestamps and of the default as-of.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn definition(&self) -> &Arc<StreamDefinition<E>> {
        &self.definition
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The entity's stream as of now.
    pub fn for_entity(&self, entity_id: EntityId) -> Result<EventStream<'_, E, S, D>, StreamError> {
        self.for_entity_as_of(entity_id, self.clock.now())
    }

    /// The entity's stream restricted to entries created at or before `as_of`.
    pub fn for_entity_as_of(
        &self,
        entity_id: EntityId,
        as_of: DateTime<Utc>,
    ) -> Result<EventStream<'_, E, S, D>, StreamError> {
        let mut stream = EventStream {
            streams: self,
            entity_id,
            as_of,
            entries: Vec::new(),
            events: Vec::new(),
        };
        stream.reload()?;
        Ok(stream)
    }
}

enum WriteOutcome {
    Committed {
        entry: EventEntry,
        scheduled: Vec<(usize, MaterializeRequest)>,
    },
    Rejected(String),
}

/// Request-scoped view of one entity's history plus whatever this instance appended.
pub struct EventStream<'a, E, S, D> {
    streams: &'a EventStreams<E, S, D>,
    entity_id: EntityId,
    as_of: DateTime<Utc>,
    entries: Vec<EventEntry>,
    events: Vec<E>,
}

impl<E, S, D> EventStream<'_, E, S, D>
where
    E: Event,
    S: EventStore,
    D: ProjectionDispatcher,
{
    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    pub fn as_of(&self) -> DateTime<Utc> {
        self.as_of
    }

    /// Reconstructed events, oldest first.
    pub fn events(&self) -> &[E] {
        &self.events
    }

    pub fn entries(&self) -> &[EventEntry] {
        &self.entries
    }

    /// Highest known version (0 for an empty stream).
    pub fn version(&self) -> u64 {
        self.entries.last().map_or(0, |e| e.version)
    }

    /// Re-read the visible history from the store, dropping the in-memory view.
    pub fn reload(&mut self) -> Result<(), StreamError> {
        let entries = self.streams.store.load_stream(self.entity_id, self.as_of)?;
        validate_loaded_stream(self.entity_id, &entries)?;
        self.events = entries.iter().map(EventEntry::decode).collect::<Result<_, _>>()?;
        self.entries = entries;
        Ok(())
    }

    /// Attempt to append `event` as the next version of this entity.
    pub fn append(&mut self, event: E) -> Result<AppendedEvent<E>, StreamError> {
        let entity_id = self.entity_id;
        let event_type = event.event_type();

        let own_errors = event.validate();
        if !own_errors.is_empty() {
            debug!(%entity_id, event_type, errors = %own_errors, "event rejected by its own validation");
            return Ok(AppendedEvent::new(event).with_own_errors(own_errors));
        }

        let state_errors = self.check_consistency(&event)?;
        if !state_errors.is_empty() {
            debug!(%entity_id, event_type, errors = %state_errors, "event rejected by consistency projection");
            return Ok(AppendedEvent::new(event).with_state_errors(state_errors));
        }

        let version = self.version() + 1;
        let created_at = self.streams.clock.now();
        let new_entry = NewEventEntry::from_event(entity_id, version, &event, created_at)?;

        let (entry, scheduled) = match self.write(new_entry, &event)? {
            WriteOutcome::Committed { entry, scheduled } => (entry, scheduled),
            WriteOutcome::Rejected(message) => return Ok(AppendedEvent::new(event).with_base_error(message)),
        };
        debug!(%entity_id, event_type, version, "event appended");

        self.entries.push(entry);
        self.events.push(event.clone());

        let registrations: Vec<_> = self.streams.definition.async_projections().collect();
        for (index, request) in scheduled {
            let (projection, options) = registrations[index];
            if let Err(e) = self.streams.dispatcher.schedule(&options.schedule, request) {
                warn!(%entity_id, version, projection = projection.name(), error = %e, "failed to schedule async projection");
            }
        }

        Ok(AppendedEvent::new(event).persisted(version, created_at))
    }

    /// Re-run the durable projection registered as `projection` in `tier`
    /// over the visible history and store the result. Returns the validation
    /// errors of the computed state.
    pub fn rematerialize(&self, tier: ProjectionTier, projection: &str) -> Result<ValidationErrors, StreamError> {
        let definition = &self.streams.definition;
        let projection = definition
            .projection(tier, projection)
            .ok_or_else(|| ConfigurationError::UnknownProjection {
                projection: projection.to_string(),
                tier: tier.as_str(),
            })?;

        let as_of = self.entries.last().map_or(self.as_of, |e| e.created_at.max(self.as_of));
        let history: Vec<&E> = self.events.iter().collect();

        let mut tx = self.streams.store.begin()?;
        match self
            .streams
            .dispatcher
            .run_now(tx.as_mut(), projection, self.entity_id, as_of, &history)
        {
            Ok(errors) => {
                tx.commit()?;
                Ok(errors)
            }
            Err(e) => {
                rollback(tx, self.entity_id);
                Err(e.into())
            }
        }
    }

    fn check_consistency(&self, candidate: &E) -> Result<ValidationErrors, StreamError> {
        let Some(consistency) = self.streams.definition.consistency_projection() else {
            return Ok(ValidationErrors::new());
        };
        let history: Vec<&E> = self.events.iter().chain(iter::once(candidate)).collect();
        Ok(consistency.check(&history, self.as_of)?)
    }

    /// Insert the entry, run transactional projections and resolve async
    /// as-of values, all inside one transaction.
    fn write(&self, new_entry: NewEventEntry, event: &E) -> Result<WriteOutcome, StreamError> {
        let entity_id = self.entity_id;
        let version = new_entry.version;
        let definition = &self.streams.definition;

        let mut tx = match self.streams.store.begin() {
            Ok(tx) => tx,
            Err(e) => {
                warn!(%entity_id, version, error = %e, "could not open transaction");
                return Ok(WriteOutcome::Rejected(format!("could not persist event: {e}")));
            }
        };

        let entry = match tx.insert_entry(new_entry) {
            Ok(entry) => entry,
            Err(e) if e.is_unique_violation() => {
                warn!(%entity_id, version, "racing condition: version already taken");
                rollback(tx, entity_id);
                return Ok(WriteOutcome::Rejected(RACING_CONDITION.to_string()));
            }
            Err(e) => {
                warn!(%entity_id, version, error = %e, "insert failed");
                rollback(tx, entity_id);
                return Ok(WriteOutcome::Rejected(format!("could not persist event: {e}")));
            }
        };

        let history: Vec<&E> = self.events.iter().chain(iter::once(event)).collect();
        for projection in definition.transactional_projections() {
            match self
                .streams
                .dispatcher
                .run_now(tx.as_mut(), projection, entity_id, entry.created_at, &history)
            {
                Ok(errors) if !errors.is_empty() => {
                    debug!(%entity_id, version, projection = projection.name(), %errors, "transactional materialization is invalid");
                }
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    rollback(tx, entity_id);
                    return Err(e.into());
                }
                Err(e) => {
                    warn!(%entity_id, version, projection = projection.name(), error = %e, "transactional projection failed; rolling back");
                    rollback(tx, entity_id);
                    return Ok(WriteOutcome::Rejected(RACING_CONDITION.to_string()));
                }
            }
        }

        let mut scheduled = Vec::new();
        for (index, (projection, options)) in definition.async_projections().enumerate() {
            match options.as_of.resolve(&entry) {
                Ok(as_of) => scheduled.push((
                    index,
                    MaterializeRequest {
                        entity_id,
                        projection: projection.name().to_string(),
                        as_of,
                    },
                )),
                Err(e) => {
                    rollback(tx, entity_id);
                    return Err(ConfigurationError::from(e).into());
                }
            }
        }

        match tx.commit() {
            Ok(()) => Ok(WriteOutcome::Committed { entry, scheduled }),
            Err(e) if e.is_unique_violation() => {
                warn!(%entity_id, version, "racing condition detected at commit");
                Ok(WriteOutcome::Rejected(RACING_CONDITION.to_string()))
            }
            Err(e) => {
                warn!(%entity_id, version, error = %e, "commit failed");
                Ok(WriteOutcome::Rejected(format!("could not persist event: {e}")))
            }
        }
    }
}

fn rollback(tx: Box<dyn StoreTransaction + '_>, entity_id: EntityId) {
    if let Err(e) = tx.rollback() {
        warn!(%entity_id, error = %e, "rollback failed");
    }
}

fn validate_loaded_stream(entity_id: EntityId, stream: &[EventEntry]) -> Result<(), StreamError> {
    let corrupt = |reason: String| StreamError::CorruptStream { entity_id, reason };

    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if e.entity_id != entity_id {
            return Err(corrupt(format!("entry at index {idx} belongs to {}", e.entity_id)));
        }
        if e.version <= last {
            return Err(corrupt(format!(
                "non-monotonic version in loaded stream (last={last}, found={})",
                e.version
            )));
        }
        last = e.version;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventline_events::{MaterializationModel, decode_attributes, encode_attributes};
    use serde::{Deserialize, Serialize};
    use serde_json::Value as JsonValue;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    impl Event for Ping {
        fn event_type(&self) -> &'static str {
            "ping"
        }

        fn to_attributes(&self) -> Result<JsonValue, EventCodecError> {
            encode_attributes("ping", self)
        }

        fn from_attributes(event_type: &str, attributes: JsonValue) -> Result<Self, EventCodecError> {
            match event_type {
                "ping" => decode_attributes(event_type, attributes),
                other => Err(EventCodecError::UnknownType(other.to_string())),
            }
        }
    }

    #[derive(Debug, Clone, Default, Serialize)]
    struct Pings {
        count: u32,
    }

    impl Materialization for Pings {}

    fn pings(name: &str, model: Option<MaterializationModel>) -> Projection<Ping, Pings> {
        let builder = Projection::builder(name).interpretation_for("ping", |mut s: Pings, _e: &Ping, _| {
            s.count += 1;
            s
        });
        match model {
            Some(model) => builder.materialization_model(model).build(),
            None => builder.build(),
        }
    }

    #[test]
    fn duplicate_names_in_a_tier_are_rejected() {
        let err = StreamDefinition::builder()
            .add_transactional_projection(pings("pings", Some(MaterializationModel::durable("pings"))))
            .add_transactional_projection(pings("pings", Some(MaterializationModel::durable("pings"))))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::DuplicateProjection {
                projection: "pings".to_string(),
                tier: "transactional"
            }
        );
    }

    #[test]
    fn same_name_may_appear_in_different_tiers() {
        let definition = StreamDefinition::builder()
            .add_transactional_projection(pings("pings", Some(MaterializationModel::durable("tx_pings"))))
            .add_async_projection(pings("pings", Some(MaterializationModel::durable("async_pings"))), AsyncOptions::default())
            .build()
            .unwrap();
        assert_eq!(definition.transactional_projections().count(), 1);
        assert_eq!(definition.async_projections().count(), 1);

        let model_of = |tier| {
            definition
                .projection(tier, "pings")
                .and_then(|p| p.model())
                .and_then(|m| m.model_name())
                .map(str::to_string)
        };
        assert_eq!(model_of(ProjectionTier::Transactional).as_deref(), Some("tx_pings"));
        assert_eq!(model_of(ProjectionTier::Async).as_deref(), Some("async_pings"));
    }

    #[test]
    fn async_projection_without_model_is_rejected() {
        let err = StreamDefinition::builder()
            .add_async_projection(pings("pings", None), AsyncOptions::default())
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::MissingMaterializationModel { tier: "async", .. }));
    }

    #[test]
    fn consistency_projection_needs_no_model() {
        let definition = StreamDefinition::builder()
            .consistency_projection(pings("pings", None))
            .build()
            .unwrap();
        assert_eq!(definition.consistency_projection().map(|p| p.name()), Some("pings"));
        assert!(definition.projection(ProjectionTier::Transactional, "pings").is_none());
        assert!(definition.projection(ProjectionTier::Async, "pings").is_none());
    }

    #[test]
    fn loaded_stream_must_be_monotonic() {
        let id = EntityId::new();
        let entry = |version| EventEntry {
            entity_id: id,
            version,
            event_type: "ping".to_string(),
            attributes: serde_json::json!({ "n": 1 }),
            created_at: Utc::now(),
        };

        assert!(validate_loaded_stream(id, &[entry(1), entry(2)]).is_ok());
        assert!(matches!(
            validate_loaded_stream(id, &[entry(1), entry(1)]),
            Err(StreamError::CorruptStream { .. })
        ));
        assert!(validate_loaded_stream(EntityId::new(), &[entry(1)]).is_err());
    }
}
