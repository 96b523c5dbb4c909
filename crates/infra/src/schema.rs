//! Outbox schema: the winners table, the outbox table and the cursor table.
//!
//! The outbox and cursor tables are named after the forwarder topic, so
//! several forwarders can share one database. Creation is idempotent and runs
//! in a single transaction.

use sqlx::PgPool;
use thiserror::Error;
use tracing::info;

use crate::tx::{TxError, in_transaction};

/// Domain table written together with each outbox record.
pub const WINNERS_TABLE: &str = "winners";

const MAX_TOPIC_LEN: usize = 48;

/// Serializes concurrent migrations from several starting processes.
const MIGRATION_LOCK: &str = "txevents.schema";

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("invalid forwarder topic {0:?}: use 1-48 ASCII letters, digits or '_'")]
    InvalidTopic(String),

    #[error("schema migration failed: {0}")]
    Migration(String),
}

/// Table names for one forwarder topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxTables {
    topic: String,
    records: String,
    offsets: String,
}

impl OutboxTables {
    /// Derive table names from a forwarder topic.
    ///
    /// The topic ends up inside SQL identifiers, hence the strict alphabet.
    pub fn for_topic(topic: &str) -> Result<Self, SchemaError> {
        let valid = !topic.is_empty()
            && topic.len() <= MAX_TOPIC_LEN
            && topic.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(SchemaError::InvalidTopic(topic.to_string()));
        }

        let topic = topic.to_ascii_lowercase();
        Ok(Self {
            records: format!("outbox_{topic}"),
            offsets: format!("outbox_offsets_{topic}"),
            topic,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Outbox (unforwarded event) table.
    pub fn records(&self) -> &str {
        &self.records
    }

    /// Cursor table, one row per consumer group.
    pub fn offsets(&self) -> &str {
        &self.offsets
    }

    /// `CREATE TABLE IF NOT EXISTS` statements, in creation order.
    pub fn create_statements(&self) -> [String; 3] {
        [
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {WINNERS_TABLE} (
                    id   BIGINT  NOT NULL PRIMARY KEY,
                    name VARCHAR NOT NULL
                )
                "#
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {records} (
                    "sequence" BIGSERIAL    NOT NULL PRIMARY KEY,
                    id         UUID         NOT NULL UNIQUE,
                    topic      VARCHAR(255) NOT NULL,
                    created_at TIMESTAMPTZ  NOT NULL DEFAULT now(),
                    payload    JSONB        NOT NULL,
                    metadata   JSONB        NOT NULL DEFAULT '{{}}'::jsonb
                )
                "#,
                records = self.records
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {offsets} (
                    consumer_group  VARCHAR(255) NOT NULL PRIMARY KEY,
                    offset_acked    BIGINT       NOT NULL DEFAULT 0,
                    offset_consumed BIGINT       NOT NULL DEFAULT 0,
                    CHECK (offset_acked <= offset_consumed)
                )
                "#,
                offsets = self.offsets
            ),
        ]
    }
}

/// Create all tables for `tables` if they do not exist yet.
///
/// Safe to call on every start. Any failure rolls back the whole migration.
pub async fn migrate(pool: &PgPool, tables: &OutboxTables) -> Result<(), SchemaError> {
    let statements = tables.create_statements();

    in_transaction(pool, move |tx| {
        Box::pin(async move {
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(MIGRATION_LOCK)
                .execute(&mut **tx)
                .await
                .map_err(|e| format!("taking migration lock: {e}"))?;

            for statement in &statements {
                sqlx::query(statement)
                    .execute(&mut **tx)
                    .await
                    .map_err(|e| format!("executing {}: {e}", first_line(statement)))?;
            }
            Ok::<(), String>(())
        })
    })
    .await
    .map_err(|e| match e {
        TxError::Body(msg) => SchemaError::Migration(msg),
        other => SchemaError::Migration(other.to_string()),
    })?;

    info!(
        records = tables.records(),
        offsets = tables.offsets(),
        "outbox schema ready"
    );
    Ok(())
}

fn first_line(statement: &str) -> &str {
    statement
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_tables_after_the_topic() {
        let tables = OutboxTables::for_topic("Lottery_Forwarded").unwrap();
        assert_eq!(tables.topic(), "lottery_forwarded");
        assert_eq!(tables.records(), "outbox_lottery_forwarded");
        assert_eq!(tables.offsets(), "outbox_offsets_lottery_forwarded");
    }

    #[test]
    fn rejects_topics_that_are_not_plain_identifiers() {
        for bad in ["", "a-b", "x; DROP TABLE winners", "ü", &"t".repeat(49)] {
            assert!(
                matches!(OutboxTables::for_topic(bad), Err(SchemaError::InvalidTopic(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn every_statement_is_idempotent() {
        let tables = OutboxTables::for_topic("fwd").unwrap();
        let statements = tables.create_statements();

        assert!(statements.iter().all(|s| s.contains("IF NOT EXISTS")));
        assert!(statements[1].contains("CREATE TABLE IF NOT EXISTS outbox_fwd"));
        assert!(statements[1].contains("'{}'::jsonb"));
        assert!(statements[2].contains("CHECK (offset_acked <= offset_consumed)"));
    }

    #[test]
    fn first_line_skips_leading_blank_lines() {
        assert_eq!(first_line("\n   \n  CREATE TABLE x (\n a INT)"), "CREATE TABLE x (");
    }
}
