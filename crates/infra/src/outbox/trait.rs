use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use txevents_core::EventId;
use txevents_events::{Event, Message, Metadata};

/// Metadata key carrying the event type name.
pub const META_EVENT_TYPE: &str = "event_type";
/// Metadata key carrying the event schema version.
pub const META_EVENT_VERSION: &str = "event_version";

/// An outbox record that has not been committed yet (no sequence assigned).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOutboxRecord {
    pub id: EventId,
    /// Destination topic on the bus.
    pub topic: String,
    pub payload: JsonValue,
    pub metadata: Metadata,
}

impl NewOutboxRecord {
    /// Serialize `event` into a record bound for `topic`, with a fresh id.
    ///
    /// `extra` annotations are merged over the event type/version metadata.
    pub fn from_event<E: Event>(
        topic: impl Into<String>,
        event: &E,
        extra: Metadata,
    ) -> Result<Self, OutboxError> {
        let payload = serde_json::to_value(event)
            .map_err(|e| OutboxError::Serialization(format!("{}: {e}", event.event_type())))?;

        let mut metadata = Metadata::new();
        metadata.insert(META_EVENT_TYPE.to_string(), event.event_type().to_string());
        metadata.insert(META_EVENT_VERSION.to_string(), event.version().to_string());
        metadata.extend(extra);

        Ok(Self {
            id: EventId::new(),
            topic: topic.into(),
            payload,
            metadata,
        })
    }
}

/// A committed outbox record.
///
/// `sequence` is assigned by the store at insert time and defines the global
/// forwarding order. Records are never updated or deleted by this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub sequence: i64,
    pub id: EventId,
    pub topic: String,
    pub created_at: DateTime<Utc>,
    pub payload: JsonValue,
    pub metadata: Metadata,
}

impl OutboxRecord {
    /// The bus message for this record. The id is preserved for de-duplication.
    pub fn to_message(&self) -> Message {
        Message::new(self.id, self.payload.clone(), self.metadata.clone())
    }
}

/// Relay progress for one consumer group.
///
/// Invariant: `offset_acked <= offset_consumed`. Both only ever grow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub consumer_group: String,
    /// Highest sequence read from the outbox.
    pub offset_consumed: i64,
    /// Highest sequence confirmed published to the bus.
    pub offset_acked: i64,
}

impl Cursor {
    /// Cursor of a group that has not forwarded anything yet.
    pub fn start(consumer_group: impl Into<String>) -> Self {
        Self {
            consumer_group: consumer_group.into(),
            offset_consumed: 0,
            offset_acked: 0,
        }
    }

    /// First sequence the relay still has to publish.
    pub fn resume_from(&self) -> i64 {
        self.offset_acked + 1
    }
}

/// Outbox store operation error.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// The event could not be turned into a payload.
    #[error("event serialization failed: {0}")]
    Serialization(String),

    /// A stored row could not be read back.
    #[error("failed to decode outbox row: {0}")]
    Decode(String),

    /// Connectivity or any other storage failure.
    #[error("outbox storage error: {0}")]
    Storage(String),
}

/// Read side of the outbox, used by the relay.
#[async_trait]
pub trait OutboxReader: Send + Sync {
    /// Records with `sequence > after`, ascending, at most `limit` of them.
    async fn fetch_after(&self, after: i64, limit: u32) -> Result<Vec<OutboxRecord>, OutboxError>;
}

/// Durable relay cursors.
///
/// Both mark operations are monotonic: a lower sequence than the stored one
/// leaves the cursor unchanged. The updated cursor is returned.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load_cursor(&self, consumer_group: &str) -> Result<Option<Cursor>, OutboxError>;

    /// Record that records up to `sequence` have been read.
    async fn mark_consumed(&self, consumer_group: &str, sequence: i64) -> Result<Cursor, OutboxError>;

    /// Record that records up to `sequence` have been published.
    ///
    /// Also raises `offset_consumed` so the invariant holds.
    async fn mark_acked(&self, consumer_group: &str, sequence: i64) -> Result<Cursor, OutboxError>;
}

#[async_trait]
impl<S> OutboxReader for std::sync::Arc<S>
where
    S: OutboxReader + ?Sized,
{
    async fn fetch_after(&self, after: i64, limit: u32) -> Result<Vec<OutboxRecord>, OutboxError> {
        (**self).fetch_after(after, limit).await
    }
}

#[async_trait]
impl<S> CursorStore for std::sync::Arc<S>
where
    S: CursorStore + ?Sized,
{
    async fn load_cursor(&self, consumer_group: &str) -> Result<Option<Cursor>, OutboxError> {
        (**self).load_cursor(consumer_group).await
    }

    async fn mark_consumed(&self, consumer_group: &str, sequence: i64) -> Result<Cursor, OutboxError> {
        (**self).mark_consumed(consumer_group, sequence).await
    }

    async fn mark_acked(&self, consumer_group: &str, sequence: i64) -> Result<Cursor, OutboxError> {
        (**self).mark_acked(consumer_group, sequence).await
    }
}
