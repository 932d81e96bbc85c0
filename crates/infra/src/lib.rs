//! Storage, scheduling and the append protocol.
//!
//! - [`event_store`]: the persistence interface, with in-memory and Postgres backends
//! - [`stream`]: [`EventStream`](stream::EventStream) and its projection tiers
//! - [`dispatch`]: synchronous and scheduled projection dispatch
//! - [`jobs`] / [`worker`]: the background queue that runs async projections

pub mod clock;
pub mod config;
pub mod dispatch;
pub mod event_store;
pub mod jobs;
pub mod stream;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, InfraConfig, PostgresConfig};
pub use dispatch::{DispatchError, JobQueueDispatcher, MaterializeRequest, ProjectionDispatcher, ScheduleOptions};
pub use event_store::{EventStore, InMemoryEventStore, PostgresEventStore, StoreError, StoreTransaction};
pub use stream::{
    AsyncOptions, ConfigurationError, EventStream, EventStreams, ProjectionTier, RACING_CONDITION,
    StreamDefinition, StreamDefinitionBuilder, StreamError,
};
pub use worker::MaterializationWorker;
