//! Append-only entry log and materialization tables.
//!
//! The store is deliberately dumb: it persists what it is given, enforces
//! `(entity_id, version)` uniqueness and reports violations. Versioning,
//! validation and projection dispatch belong to [`crate::stream`].

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::{EventStore, StoreError, StoreTransaction, TransactionSink};
