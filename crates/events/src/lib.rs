//! Events, durable entries and projection folds (no IO).
//!
//! Storage, scheduling and the append protocol live in `eventline-infra`;
//! everything here is deterministic and side-effect free, apart from the
//! [`MaterializationSink`] a caller hands to [`Projection::materialize`].

pub mod appended;
pub mod as_of;
pub mod entry;
pub mod event;
pub mod materialization;
pub mod projection;

pub use appended::AppendedEvent;
pub use as_of::{AsOf, AsOfError};
pub use entry::{EventEntry, NewEventEntry};
pub use event::{Event, EventCodecError, decode_attributes, encode_attributes};
pub use materialization::{
    Materialization, MaterializationModel, MaterializationSink, Materialized, SinkError,
};
pub use projection::{Materializer, Projection, ProjectionBuilder, ProjectionError};
