//! Postgres-backed transactional writer.
//!
//! `insert_winner` runs one transaction:
//! 1. insert the winner row
//! 2. take the outbox advisory lock (held until commit)
//! 3. insert the `LotteryConcluded` outbox record
//!
//! If any step fails the transaction is rolled back, so neither row becomes
//! visible. The bus is never contacted here.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database | `23505` (unique violation) | `Conflict` |
//! | Database | `23514` (check violation) | `Invalid` |
//! | Database | any other | `Storage` |
//! | Other | N/A | `Storage` |
//!
//! The table describes the winner statements. Any failure of the outbox
//! insert is a `Storage` error: the winner itself was fine.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use txevents_lottery::{StoreError, Winner, WinnerStore};

use super::concluded_record;
use crate::outbox::postgres::insert_record;
use crate::schema::{OutboxTables, WINNERS_TABLE};
use crate::tx::{TxError, in_transaction};

#[derive(Debug, Clone)]
pub struct PostgresWinnerStore {
    pool: Arc<PgPool>,
    tables: OutboxTables,
    event_topic: String,
}

impl PostgresWinnerStore {
    /// `tables` picks the outbox to write into; `event_topic` is the bus
    /// topic stamped on every record.
    pub fn new(pool: PgPool, tables: OutboxTables, event_topic: impl Into<String>) -> Self {
        Self::from_shared(Arc::new(pool), tables, event_topic)
    }

    pub fn from_shared(pool: Arc<PgPool>, tables: OutboxTables, event_topic: impl Into<String>) -> Self {
        Self {
            pool,
            tables,
            event_topic: event_topic.into(),
        }
    }
}

#[async_trait]
impl WinnerStore for PostgresWinnerStore {
    #[instrument(
        skip(self, winner),
        fields(winner_id = winner.id, topic = %self.event_topic),
        err
    )]
    async fn insert_winner(&self, winner: Winner) -> Result<Winner, StoreError> {
        winner.validate()?;
        // Serialize before touching the database so a bad payload costs no transaction.
        let record = concluded_record(&self.event_topic, &winner)?;
        let tables = self.tables.clone();
        let row = winner.clone();

        let sequence = in_transaction(&self.pool, move |tx| {
            Box::pin(async move {
                sqlx::query(&format!("INSERT INTO {WINNERS_TABLE} (id, name) VALUES ($1, $2)"))
                    .bind(row.id)
                    .bind(&row.name)
                    .execute(&mut **tx)
                    .await
                    .map_err(|e| map_sqlx_error("insert_winner", e))?;

                insert_record(tx, &tables, &record)
                    .await
                    .map_err(|e| StoreError::Storage(format!("insert_outbox_record: {e}")))
            })
        })
        .await
        .map_err(|e| match e {
            TxError::Body(err) => err,
            other => StoreError::Storage(other.to_string()),
        })?;

        debug!(sequence, "winner and outbox record committed");
        Ok(winner)
    }

    #[instrument(skip(self), err)]
    async fn get_winner_by_id(&self, id: i64) -> Result<Winner, StoreError> {
        let row = sqlx::query(&format!("SELECT id, name FROM {WINNERS_TABLE} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_winner_by_id", e))?
            .ok_or(StoreError::NotFound(id))?;

        Ok(Winner {
            id: row
                .try_get("id")
                .map_err(|e| StoreError::Storage(format!("decoding winner row: {e}")))?,
            name: row
                .try_get("name")
                .map_err(|e| StoreError::Storage(format!("decoding winner row: {e}")))?,
        })
    }
}

impl PostgresWinnerStore {
    /// First lottery id not yet taken: one past the highest recorded winner.
    #[instrument(skip(self), err)]
    pub async fn next_free_id(&self) -> Result<i64, StoreError> {
        let row = sqlx::query(&format!("SELECT COALESCE(MAX(id), 0) + 1 AS next_id FROM {WINNERS_TABLE}"))
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("next_free_id", e))?;

        row.try_get("next_id")
            .map_err(|e| StoreError::Storage(format!("decoding next id: {e}")))
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                Some("23514") => StoreError::Invalid(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::Encode(e) => StoreError::Serialization(format!("{operation}: {e}")),
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => StoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}
