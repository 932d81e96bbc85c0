//! Postgres-backed event store implementation.
//!
//! ## Schema
//!
//! ```sql
//! CREATE TABLE event_entries (
//!     entity_id  UUID        NOT NULL,
//!     version    BIGINT      NOT NULL CHECK (version > 0),
//!     event_type TEXT        NOT NULL,
//!     attributes JSONB       NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL,
//!     PRIMARY KEY (entity_id, version)
//! );
//!
//! CREATE TABLE materializations (
//!     model      TEXT        NOT NULL,
//!     entity_id  UUID        NOT NULL,
//!     state      JSONB       NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     PRIMARY KEY (model, entity_id)
//! );
//! ```
//!
//! The primary key on `event_entries` is the concurrency guard: the append
//! protocol never locks, it relies on the insert of a duplicate version failing.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `UniqueViolation` |
//! | Database (check / foreign key / not-null) | `23514` / `23503` / `23502` | `ConstraintViolation` |
//! | Database (other) | Any other | `Backend` |
//! | Row decoding | N/A | `Decode` |
//! | PoolClosed, network, etc. | N/A | `Backend` |
//!
//! ## Runtime
//!
//! The [`EventStore`] trait is synchronous. Calls are bridged with
//! `tokio::runtime::Handle::block_on`, so they must be made from a thread that
//! is *not* driving the runtime (e.g. inside `spawn_blocking` or a plain thread).

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::instrument;

use eventline_core::EntityId;
use eventline_events::{EventEntry, NewEventEntry};

use super::r#trait::{EventStore, StoreError, StoreTransaction};
use crate::config::PostgresConfig;

/// Postgres-backed append-only event store.
///
/// Uses SQLx's connection pool, so the store is cheap to clone and can be
/// shared across threads.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool from configuration.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Load an entity's entries created at or before `as_of`, in version order.
    #[instrument(skip(self), fields(entity_id = %entity_id), err)]
    pub async fn fetch_stream(
        &self,
        entity_id: EntityId,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<EventEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT entity_id, version, event_type, attributes, created_at
            FROM event_entries
            WHERE entity_id = $1 AND created_at <= $2
            ORDER BY version ASC
            "#,
        )
        .bind(entity_id.as_uuid())
        .bind(as_of)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_stream", e))?;

        rows.iter().map(entry_from_row).collect()
    }

    #[instrument(skip(self), fields(entity_id = %entity_id), err)]
    pub async fn fetch_materialization(
        &self,
        model: &str,
        entity_id: EntityId,
    ) -> Result<Option<JsonValue>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT state
            FROM materializations
            WHERE model = $1 AND entity_id = $2
            "#,
        )
        .bind(model)
        .bind(entity_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_materialization", e))?;

        row.map(|r| {
            r.try_get::<JsonValue, _>("state")
                .map_err(|e| StoreError::Decode(e.to_string()))
        })
        .transpose()
    }
}

fn runtime() -> Result<Handle, StoreError> {
    Handle::try_current().map_err(|_| {
        StoreError::Backend(
            "PostgresEventStore requires a tokio runtime; call it from within a runtime context"
                .to_string(),
        )
    })
}

impl EventStore for PostgresEventStore {
    fn load_stream(
        &self,
        entity_id: EntityId,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<EventEntry>, StoreError> {
        runtime()?.block_on(self.fetch_stream(entity_id, as_of))
    }

    fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>, StoreError> {
        let handle = runtime()?;
        let tx = handle
            .block_on(self.pool.begin())
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PostgresTransaction { handle, tx }))
    }

    fn load_materialization(
        &self,
        model: &str,
        entity_id: EntityId,
    ) -> Result<Option<JsonValue>, StoreError> {
        runtime()?.block_on(self.fetch_materialization(model, entity_id))
    }
}

/// An open SQL transaction. Dropping it without `commit` rolls back.
struct PostgresTransaction {
    handle: Handle,
    tx: Transaction<'static, Postgres>,
}

impl StoreTransaction for PostgresTransaction {
    #[instrument(skip(self, entry), fields(entity_id = %entry.entity_id, version = entry.version), err)]
    fn insert_entry(&mut self, entry: NewEventEntry) -> Result<EventEntry, StoreError> {
        let version = i64::try_from(entry.version)
            .map_err(|_| StoreError::ConstraintViolation(format!("version {} out of range", entry.version)))?;

        let query = sqlx::query(
            r#"
            INSERT INTO event_entries (entity_id, version, event_type, attributes, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(entry.entity_id.as_uuid())
        .bind(version)
        .bind(&entry.event_type)
        .bind(&entry.attributes)
        .bind(entry.created_at);

        self.handle
            .block_on(query.execute(&mut *self.tx))
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::UniqueViolation {
                        entity_id: entry.entity_id,
                        version: entry.version,
                    }
                } else {
                    map_sqlx_error("insert_entry", e)
                }
            })?;

        Ok(entry.into())
    }

    #[instrument(skip(self, state), fields(entity_id = %entity_id), err)]
    fn upsert_materialization(
        &mut self,
        model: &str,
        entity_id: EntityId,
        state: JsonValue,
    ) -> Result<(), StoreError> {
        let query = sqlx::query(
            r#"
            INSERT INTO materializations (model, entity_id, state, updated_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (model, entity_id)
            DO UPDATE SET state = EXCLUDED.state, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(model)
        .bind(entity_id.as_uuid())
        .bind(&state);

        self.handle
            .block_on(query.execute(&mut *self.tx))
            .map_err(|e| map_sqlx_error("upsert_materialization", e))?;
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let PostgresTransaction { handle, tx } = *self;
        handle
            .block_on(tx.commit())
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let PostgresTransaction { handle, tx } = *self;
        handle
            .block_on(tx.rollback())
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

fn entry_from_row(row: &PgRow) -> Result<EventEntry, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Decode(e.to_string());
    let version: i64 = row.try_get("version").map_err(decode)?;
    Ok(EventEntry {
        entity_id: EntityId::from_uuid(row.try_get("entity_id").map_err(decode)?),
        version: u64::try_from(version).map_err(|_| StoreError::Decode(format!("negative version {version}")))?,
        event_type: row.try_get("event_type").map_err(decode)?,
        attributes: row.try_get("attributes").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
    })
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // 23505 only reaches here outside insert_entry, where the key is unknown.
                Some("23505") | Some("23514") | Some("23503") | Some("23502") => {
                    StoreError::ConstraintViolation(msg)
                }
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => StoreError::Backend(format!("connection pool closed in {}", operation)),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Decode(format!("{} in {}", err, operation))
        }
        _ => StoreError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code == "23505";
        }
    }
    false
}
