//! Postgres-backed outbox reader and cursor store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | OutboxError |
//! |------------|----------------------|-------------|
//! | Database | `23514` (check violation) | `Storage` (cursor invariant would break) |
//! | Database | any other | `Storage` |
//! | Column decode | N/A | `Decode` |
//! | Other | N/A | `Storage` |
//!
//! ## Ordering
//!
//! Sequences come from a `BIGSERIAL`, which alone does not guarantee that
//! sequence order matches commit order: a transaction holding sequence 7
//! may commit after one holding 8. Writers therefore take a transaction
//! scoped advisory lock keyed on the outbox table before inserting (see
//! [`insert_record`]), so a reader that has seen `n` never later finds a
//! committed record below `n`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};

use txevents_core::EventId;
use txevents_events::Metadata;

use super::r#trait::{Cursor, CursorStore, NewOutboxRecord, OutboxError, OutboxReader, OutboxRecord};
use crate::schema::OutboxTables;

/// SQL text for one forwarder topic, rendered once.
#[derive(Debug, Clone)]
struct Statements {
    fetch_after: String,
    load_cursor: String,
    mark_consumed: String,
    mark_acked: String,
}

impl Statements {
    fn render(tables: &OutboxTables) -> Self {
        let records = tables.records();
        let offsets = tables.offsets();
        Self {
            fetch_after: format!(
                r#"
                SELECT "sequence", id, topic, created_at, payload, metadata
                FROM {records}
                WHERE "sequence" > $1
                ORDER BY "sequence" ASC
                LIMIT $2
                "#
            ),
            load_cursor: format!(
                r#"
                SELECT consumer_group, offset_acked, offset_consumed
                FROM {offsets}
                WHERE consumer_group = $1
                "#
            ),
            mark_consumed: format!(
                r#"
                INSERT INTO {offsets} AS o (consumer_group, offset_acked, offset_consumed)
                VALUES ($1, 0, $2)
                ON CONFLICT (consumer_group) DO UPDATE
                SET offset_consumed = GREATEST(o.offset_consumed, EXCLUDED.offset_consumed)
                RETURNING consumer_group, offset_acked, offset_consumed
                "#
            ),
            mark_acked: format!(
                r#"
                INSERT INTO {offsets} AS o (consumer_group, offset_acked, offset_consumed)
                VALUES ($1, $2, $2)
                ON CONFLICT (consumer_group) DO UPDATE
                SET offset_acked    = GREATEST(o.offset_acked, EXCLUDED.offset_acked),
                    offset_consumed = GREATEST(o.offset_consumed, EXCLUDED.offset_acked)
                RETURNING consumer_group, offset_acked, offset_consumed
                "#
            ),
        }
    }
}

/// Outbox reader and cursor store for one forwarder topic.
#[derive(Debug, Clone)]
pub struct PostgresOutbox {
    pool: Arc<PgPool>,
    tables: OutboxTables,
    statements: Arc<Statements>,
}

impl PostgresOutbox {
    pub fn new(pool: PgPool, tables: OutboxTables) -> Self {
        Self::from_shared(Arc::new(pool), tables)
    }

    pub fn from_shared(pool: Arc<PgPool>, tables: OutboxTables) -> Self {
        let statements = Arc::new(Statements::render(&tables));
        Self {
            pool,
            tables,
            statements,
        }
    }
}

#[async_trait]
impl OutboxReader for PostgresOutbox {
    #[instrument(skip(self), fields(table = self.tables.records()), err)]
    async fn fetch_after(&self, after: i64, limit: u32) -> Result<Vec<OutboxRecord>, OutboxError> {
        let rows = sqlx::query(&self.statements.fetch_after)
            .bind(after)
            .bind(i64::from(limit))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_after", e))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let row = OutboxRow::from_row(&row)
                .map_err(|e| OutboxError::Decode(format!("outbox row: {e}")))?;
            records.push(row.try_into()?);
        }

        debug!(count = records.len(), "fetched outbox records");
        Ok(records)
    }
}

#[async_trait]
impl CursorStore for PostgresOutbox {
    #[instrument(skip(self), fields(table = self.tables.offsets()), err)]
    async fn load_cursor(&self, consumer_group: &str) -> Result<Option<Cursor>, OutboxError> {
        let row = sqlx::query(&self.statements.load_cursor)
            .bind(consumer_group)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_cursor", e))?;

        row.map(|r| {
            CursorRow::from_row(&r)
                .map(Cursor::from)
                .map_err(|e| OutboxError::Decode(format!("cursor row: {e}")))
        })
        .transpose()
    }

    #[instrument(skip(self), fields(table = self.tables.offsets()), err)]
    async fn mark_consumed(&self, consumer_group: &str, sequence: i64) -> Result<Cursor, OutboxError> {
        self.upsert_cursor(&self.statements.mark_consumed, "mark_consumed", consumer_group, sequence)
            .await
    }

    #[instrument(skip(self), fields(table = self.tables.offsets()), err)]
    async fn mark_acked(&self, consumer_group: &str, sequence: i64) -> Result<Cursor, OutboxError> {
        self.upsert_cursor(&self.statements.mark_acked, "mark_acked", consumer_group, sequence)
            .await
    }
}

impl PostgresOutbox {
    async fn upsert_cursor(
        &self,
        sql: &str,
        operation: &str,
        consumer_group: &str,
        sequence: i64,
    ) -> Result<Cursor, OutboxError> {
        let row = sqlx::query(sql)
            .bind(consumer_group)
            .bind(sequence.max(0))
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        CursorRow::from_row(&row)
            .map(Cursor::from)
            .map_err(|e| OutboxError::Decode(format!("cursor row: {e}")))
    }
}

/// Insert `record` into the outbox inside the caller's transaction.
///
/// Takes the per-table advisory lock first, so the lock is held until the
/// caller commits or rolls back. Returns the assigned sequence.
pub(crate) async fn insert_record(
    tx: &mut Transaction<'static, Postgres>,
    tables: &OutboxTables,
    record: &NewOutboxRecord,
) -> Result<i64, sqlx::Error> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(tables.records())
        .execute(&mut **tx)
        .await?;

    let metadata = serde_json::to_value(&record.metadata)
        .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

    let sql = format!(
        r#"
        INSERT INTO {records} (id, topic, payload, metadata)
        VALUES ($1, $2, $3, $4)
        RETURNING "sequence"
        "#,
        records = tables.records()
    );

    let row = sqlx::query(&sql)
        .bind(record.id.as_uuid())
        .bind(&record.topic)
        .bind(&record.payload)
        .bind(metadata)
        .fetch_one(&mut **tx)
        .await?;

    row.try_get("sequence")
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> OutboxError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23514") => OutboxError::Storage(format!("cursor invariant violated: {msg}")),
                _ => OutboxError::Storage(msg),
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            OutboxError::Decode(format!("{operation}: {err}"))
        }
        sqlx::Error::PoolClosed => {
            OutboxError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => OutboxError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

// SQLx row types

#[derive(Debug)]
struct OutboxRow {
    sequence: i64,
    id: uuid::Uuid,
    topic: String,
    created_at: DateTime<Utc>,
    payload: serde_json::Value,
    metadata: serde_json::Value,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for OutboxRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutboxRow {
            sequence: row.try_get("sequence")?,
            id: row.try_get("id")?,
            topic: row.try_get("topic")?,
            created_at: row.try_get("created_at")?,
            payload: row.try_get("payload")?,
            metadata: row.try_get("metadata")?,
        })
    }
}

impl TryFrom<OutboxRow> for OutboxRecord {
    type Error = OutboxError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        let metadata = decode_metadata(row.metadata)
            .map_err(|e| OutboxError::Decode(format!("metadata of sequence {}: {e}", row.sequence)))?;

        Ok(OutboxRecord {
            sequence: row.sequence,
            id: EventId::from_uuid(row.id),
            topic: row.topic,
            created_at: row.created_at,
            payload: row.payload,
            metadata,
        })
    }
}

/// Metadata column to annotations. SQL `null` and `{}` are both empty.
fn decode_metadata(value: serde_json::Value) -> Result<Metadata, serde_json::Error> {
    if value.is_null() {
        return Ok(Metadata::new());
    }
    serde_json::from_value(value)
}

#[derive(Debug)]
struct CursorRow {
    consumer_group: String,
    offset_acked: i64,
    offset_consumed: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for CursorRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(CursorRow {
            consumer_group: row.try_get("consumer_group")?,
            offset_acked: row.try_get("offset_acked")?,
            offset_consumed: row.try_get("offset_consumed")?,
        })
    }
}

impl From<CursorRow> for Cursor {
    fn from(row: CursorRow) -> Self {
        Cursor {
            consumer_group: row.consumer_group,
            offset_acked: row.offset_acked,
            offset_consumed: row.offset_consumed,
        }
    }
}
