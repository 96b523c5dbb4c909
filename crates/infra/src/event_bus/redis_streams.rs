//! Redis Streams-backed bus (durable, at-least-once delivery).
//!
//! - **Stream key**: the topic name, one stream per topic
//! - **Publish**: `XADD <topic> * id <event id> payload <json> metadata <json>`
//! - **Subscribe**: `XREADGROUP` in a consumer group; a delivery is removed
//!   from the pending list with `XACK` once the consumer acknowledges it
//! - **Redelivery**: on start a subscriber first walks its own pending
//!   entries once (delivered before a crash but never acknowledged), then
//!   switches to new entries

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, instrument, warn};

use txevents_core::EventId;
use txevents_events::{Delivery, Message, Metadata, Publisher, Subscriber, Subscription};

const DEFAULT_CONSUMER_GROUP: &str = "default";
const READ_COUNT: usize = 10;
const BLOCK_MS: usize = 1_000;
const READ_RETRY: Duration = Duration::from_secs(1);
const SUBSCRIPTION_BUFFER: usize = 64;
const NEW_ENTRIES: &str = ">";

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),
}

#[derive(Debug, Clone)]
pub struct RedisStreamsBus {
    client: Arc<redis::Client>,
    publish_conn: Arc<Mutex<Option<MultiplexedConnection>>>,
    consumer_group: String,
    consumer_name: String,
}

impl RedisStreamsBus {
    /// Create a bus for `redis_url` (e.g. `redis://localhost:6379`).
    ///
    /// No connection is made until the first publish or subscribe.
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, RedisStreamsError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            publish_conn: Arc::new(Mutex::new(None)),
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            consumer_name: format!("consumer-{}", EventId::new()),
        })
    }

    /// Consumer group and consumer name used by [`Subscriber::subscribe`].
    pub fn with_consumer(mut self, group: impl Into<String>, consumer: impl Into<String>) -> Self {
        self.consumer_group = group.into();
        self.consumer_name = consumer.into();
        self
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    async fn connect(&self) -> Result<MultiplexedConnection, RedisStreamsError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))
    }

    /// Shared publish connection, opened on first use.
    async fn publish_connection(&self) -> Result<MultiplexedConnection, RedisStreamsError> {
        let mut slot = self.publish_conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.connect().await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Ensure the consumer group exists on `stream` (idempotent).
    ///
    /// A new group starts at the beginning of the stream, so messages
    /// published before the first subscriber are still delivered.
    pub async fn ensure_consumer_group(&self, stream: &str) -> Result<(), RedisStreamsError> {
        let mut conn = self.connect().await?;
        let created: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(stream, &self.consumer_group, "0")
            .await;

        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(RedisStreamsError::ConsumerGroup(format!(
                "creating {} on {stream}: {e}",
                self.consumer_group
            ))),
        }
    }
}

#[async_trait]
impl Publisher for RedisStreamsBus {
    type Error = RedisStreamsError;

    #[instrument(skip(self, message), fields(stream_key = %topic, event_id = %message.id()), err)]
    async fn publish(&self, topic: &str, message: &Message) -> Result<(), Self::Error> {
        let payload = serde_json::to_string(message.payload())
            .map_err(|e| RedisStreamsError::Serialization(e.to_string()))?;
        let metadata = serde_json::to_string(message.metadata())
            .map_err(|e| RedisStreamsError::Serialization(e.to_string()))?;

        let mut conn = self.publish_connection().await?;
        let added: redis::RedisResult<String> = redis::cmd("XADD")
            .arg(topic)
            .arg("*")
            .arg("id")
            .arg(message.id().to_string())
            .arg("payload")
            .arg(&payload)
            .arg("metadata")
            .arg(&metadata)
            .query_async(&mut conn)
            .await;

        match added {
            Ok(entry_id) => {
                debug!(entry_id = %entry_id, "message appended to stream");
                Ok(())
            }
            Err(e) => {
                if e.is_io_error() || e.is_connection_dropped() {
                    // Reconnect on the next publish.
                    *self.publish_conn.lock().await = None;
                }
                Err(RedisStreamsError::Command(format!("XADD failed: {e}")))
            }
        }
    }
}

#[async_trait]
impl Subscriber for RedisStreamsBus {
    type Error = RedisStreamsError;

    async fn subscribe(&self, topic: &str) -> Result<Subscription, Self::Error> {
        self.ensure_consumer_group(topic).await?;
        let source = GroupSource {
            bus: self.clone(),
            stream: topic.to_string(),
            read_conn: self.connect().await?,
            ack_conn: self.connect().await?,
        };

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(StreamReader::new(source).run(tx));

        Ok(Subscription::new(rx))
    }
}

/// Where a [`StreamReader`] gets its entries from: one consumer in one group.
#[async_trait]
trait StreamSource: Clone + Send + Sync + 'static {
    /// `XREADGROUP` from `cursor`: an entry id walks this consumer's pending
    /// list, `>` asks for entries never delivered to the group.
    async fn read(&mut self, cursor: &str) -> Result<Vec<StreamId>, RedisStreamsError>;

    async fn ack(&self, entry_id: &str) -> Result<(), RedisStreamsError>;

    /// Called after a failed read.
    async fn reconnect(&mut self);

    fn stream(&self) -> &str;
}

#[derive(Clone)]
struct GroupSource {
    bus: RedisStreamsBus,
    stream: String,
    read_conn: MultiplexedConnection,
    ack_conn: MultiplexedConnection,
}

#[async_trait]
impl StreamSource for GroupSource {
    async fn read(&mut self, cursor: &str) -> Result<Vec<StreamId>, RedisStreamsError> {
        let mut opts = StreamReadOptions::default()
            .group(&self.bus.consumer_group, &self.bus.consumer_name)
            .count(READ_COUNT);
        if cursor == NEW_ENTRIES {
            opts = opts.block(BLOCK_MS);
        }

        let reply: Option<StreamReadReply> = self
            .read_conn
            .xread_options(&[&self.stream], &[cursor], &opts)
            .await
            .map_err(|e| RedisStreamsError::Command(format!("XREADGROUP failed: {e}")))?;

        Ok(reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
            .unwrap_or_default())
    }

    async fn ack(&self, entry_id: &str) -> Result<(), RedisStreamsError> {
        let mut conn = self.ack_conn.clone();
        let _: u64 = conn
            .xack(&self.stream, &self.bus.consumer_group, &[entry_id])
            .await
            .map_err(|e| RedisStreamsError::Command(format!("XACK failed: {e}")))?;
        Ok(())
    }

    async fn reconnect(&mut self) {
        if let Ok(conn) = self.bus.connect().await {
            self.read_conn = conn;
        }
    }

    fn stream(&self) -> &str {
        &self.stream
    }
}

/// Read position of a [`StreamReader`].
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReadCursor {
    /// Walking the pending list, strictly after this entry id.
    Pending(String),
    New,
}

impl ReadCursor {
    fn start() -> Self {
        ReadCursor::Pending("0".to_string())
    }

    fn as_str(&self) -> &str {
        match self {
            ReadCursor::Pending(after) => after,
            ReadCursor::New => NEW_ENTRIES,
        }
    }

    /// Move past a batch. The pending list is walked once; an empty page ends it.
    fn advance(&mut self, entries: &[StreamId]) {
        if let ReadCursor::Pending(after) = self {
            match entries.last() {
                Some(last) => *after = last.id.clone(),
                None => *self = ReadCursor::New,
            }
        }
    }
}

/// Background task feeding one subscription.
struct StreamReader<S> {
    source: S,
    cursor: ReadCursor,
}

impl<S: StreamSource> StreamReader<S> {
    fn new(source: S) -> Self {
        Self {
            source,
            cursor: ReadCursor::start(),
        }
    }

    async fn run(mut self, tx: mpsc::Sender<Delivery>) {
        while !tx.is_closed() {
            let entries = match self.source.read(self.cursor.as_str()).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(stream = %self.source.stream(), error = %e, "stream read failed");
                    tokio::time::sleep(READ_RETRY).await;
                    self.source.reconnect().await;
                    continue;
                }
            };
            self.cursor.advance(&entries);

            for entry in entries {
                match decode_entry(&entry) {
                    Ok(message) => {
                        let (ack_tx, ack_rx) = oneshot::channel();
                        if tx.send(Delivery::new(message, ack_tx)).await.is_err() {
                            return;
                        }
                        self.spawn_ack(entry.id, ack_rx);
                    }
                    Err(e) => {
                        warn!(stream = %self.source.stream(), entry_id = %entry.id, error = %e, "dropping undecodable stream entry");
                        if let Err(e) = self.source.ack(&entry.id).await {
                            warn!(stream = %self.source.stream(), entry_id = %entry.id, error = %e, "ack failed");
                        }
                    }
                }
            }
        }
        debug!(stream = %self.source.stream(), "subscription closed");
    }

    fn spawn_ack(&self, entry_id: String, ack_rx: oneshot::Receiver<()>) {
        let source = self.source.clone();

        tokio::spawn(async move {
            // A dropped sender means the consumer gave up on the message; it stays pending.
            if ack_rx.await.is_err() {
                return;
            }
            if let Err(e) = source.ack(&entry_id).await {
                warn!(stream = %source.stream(), entry_id = %entry_id, error = %e, "ack failed");
            }
        });
    }
}

/// Turn a stream entry written by [`RedisStreamsBus::publish`] back into a message.
fn decode_entry(entry: &StreamId) -> Result<Message, RedisStreamsError> {
    let field = |name: &str| -> Result<String, RedisStreamsError> {
        entry
            .get::<String>(name)
            .ok_or_else(|| RedisStreamsError::Deserialization(format!("missing {name} field")))
    };

    let id: EventId = field("id")?
        .parse()
        .map_err(|e| RedisStreamsError::Deserialization(format!("invalid id: {e}")))?;
    let payload = serde_json::from_str(&field("payload")?)
        .map_err(|e| RedisStreamsError::Deserialization(format!("invalid payload: {e}")))?;
    let metadata: Metadata = match entry.get::<String>("metadata") {
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|e| RedisStreamsError::Deserialization(format!("invalid metadata: {e}")))?,
        None => Metadata::new(),
    };

    Ok(Message::new(id, payload, metadata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn entry(fields: &[(&str, &str)]) -> StreamId {
        entry_with_id("1700000000000-0", fields)
    }

    fn entry_with_id(id: &str, fields: &[(&str, &str)]) -> StreamId {
        let map: HashMap<String, redis::Value> = fields
            .iter()
            .map(|(k, v)| (k.to_string(), redis::Value::Data(v.as_bytes().to_vec())))
            .collect();
        StreamId {
            id: id.to_string(),
            map,
        }
    }

    fn stream_entry(id: &str) -> (StreamId, EventId) {
        let event_id = EventId::new();
        let event_str = event_id.to_string();
        (entry_with_id(id, &[("id", event_str.as_str()), ("payload", "{}")]), event_id)
    }

    fn entry_seq(id: &str) -> (u64, u64) {
        let (ms, seq) = id.split_once('-').unwrap_or((id, "0"));
        (ms.parse().unwrap_or(0), seq.parse().unwrap_or(0))
    }

    #[derive(Default)]
    struct Group {
        pending: Vec<StreamId>,
        undelivered: Vec<StreamId>,
        reads: Vec<String>,
    }

    /// One consumer of a consumer group, with XREADGROUP pending-list semantics.
    #[derive(Clone, Default)]
    struct FakeSource {
        group: Arc<std::sync::Mutex<Group>>,
    }

    impl FakeSource {
        fn with_pending(entries: Vec<StreamId>) -> Self {
            let source = Self::default();
            source.group.lock().unwrap().pending = entries;
            source
        }

        fn append(&self, entry: StreamId) {
            self.group.lock().unwrap().undelivered.push(entry);
        }

        fn pending_ids(&self) -> Vec<String> {
            self.group.lock().unwrap().pending.iter().map(|e| e.id.clone()).collect()
        }

        fn reads(&self) -> Vec<String> {
            self.group.lock().unwrap().reads.clone()
        }
    }

    #[async_trait]
    impl StreamSource for FakeSource {
        async fn read(&mut self, cursor: &str) -> Result<Vec<StreamId>, RedisStreamsError> {
            let page = {
                let mut group = self.group.lock().unwrap();
                group.reads.push(cursor.to_string());
                if cursor == NEW_ENTRIES {
                    let fresh: Vec<StreamId> = group.undelivered.drain(..).collect();
                    group.pending.extend(fresh.iter().cloned());
                    fresh
                } else {
                    let after = entry_seq(cursor);
                    group
                        .pending
                        .iter()
                        .filter(|e| entry_seq(&e.id) > after)
                        .take(READ_COUNT)
                        .cloned()
                        .collect()
                }
            };
            if page.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok(page)
        }

        async fn ack(&self, entry_id: &str) -> Result<(), RedisStreamsError> {
            self.group.lock().unwrap().pending.retain(|e| e.id != entry_id);
            Ok(())
        }

        async fn reconnect(&mut self) {}

        fn stream(&self) -> &str {
            "lottery"
        }
    }

    async fn next_id(sub: &mut Subscription) -> (EventId, Delivery) {
        let delivery = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("delivery within timeout")
            .expect("subscription open");
        (delivery.message().id(), delivery)
    }

    #[tokio::test]
    async fn unacked_pending_entry_does_not_block_new_entries() {
        let (stale, stale_id) = stream_entry("1-0");
        let (replayed, replayed_id) = stream_entry("2-0");
        let source = FakeSource::with_pending(vec![stale, replayed]);

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(StreamReader::new(source.clone()).run(tx));
        let mut sub = Subscription::new(rx);

        let (id, first) = next_id(&mut sub).await;
        assert_eq!(id, stale_id);
        drop(first);
        let (id, second) = next_id(&mut sub).await;
        assert_eq!(id, replayed_id);
        second.ack();

        let (fresh, fresh_id) = stream_entry("3-0");
        source.append(fresh);
        let (id, third) = next_id(&mut sub).await;
        assert_eq!(id, fresh_id);
        third.ack();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(source.pending_ids(), vec!["1-0".to_string()]);
        assert!(sub.try_recv().is_none());

        let reads = source.reads();
        assert_eq!(&reads[..3], &["0".to_string(), "2-0".to_string(), ">".to_string()]);
        assert!(reads[2..].iter().all(|c| c == ">"));
    }

    #[tokio::test]
    async fn pending_list_is_walked_page_by_page() {
        let entries: Vec<(StreamId, EventId)> =
            (1..=READ_COUNT as u64 + 3).map(|n| stream_entry(&format!("{n}-0"))).collect();
        let expected: Vec<EventId> = entries.iter().map(|(_, id)| *id).collect();
        let source = FakeSource::with_pending(entries.into_iter().map(|(e, _)| e).collect());

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(StreamReader::new(source.clone()).run(tx));
        let mut sub = Subscription::new(rx);

        let mut seen = Vec::new();
        for _ in 0..expected.len() {
            let (id, delivery) = next_id(&mut sub).await;
            delivery.ack();
            seen.push(id);
        }
        assert_eq!(seen, expected);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sub.try_recv().is_none());
        let reads = source.reads();
        assert_eq!(reads[1], format!("{READ_COUNT}-0"));
    }

    #[test]
    fn cursor_switches_to_new_entries_after_an_empty_page() {
        let mut cursor = ReadCursor::start();
        assert_eq!(cursor.as_str(), "0");

        cursor.advance(&[entry_with_id("5-1", &[])]);
        assert_eq!(cursor.as_str(), "5-1");

        cursor.advance(&[]);
        assert_eq!(cursor, ReadCursor::New);

        cursor.advance(&[entry_with_id("9-0", &[])]);
        assert_eq!(cursor.as_str(), ">");
    }

    #[test]
    fn decodes_what_publish_writes() {
        let id = EventId::new();
        let id_str = id.to_string();
        let decoded = decode_entry(&entry(&[
            ("id", id_str.as_str()),
            ("payload", r#"{"winner_id":2}"#),
            ("metadata", r#"{"event_type":"lottery.concluded"}"#),
        ]))
        .unwrap();

        assert_eq!(decoded.id(), id);
        assert_eq!(decoded.payload(), &json!({ "winner_id": 2 }));
        assert_eq!(decoded.metadata_value("event_type"), Some("lottery.concluded"));
    }

    #[test]
    fn metadata_field_is_optional() {
        let id_str = EventId::new().to_string();
        let decoded = decode_entry(&entry(&[("id", id_str.as_str()), ("payload", "{}")])).unwrap();
        assert!(decoded.metadata().is_empty());
    }

    #[test]
    fn rejects_entries_without_a_valid_id() {
        let err = decode_entry(&entry(&[("payload", "{}")])).unwrap_err();
        assert!(matches!(err, RedisStreamsError::Deserialization(msg) if msg.contains("id")));

        let err = decode_entry(&entry(&[("id", "nope"), ("payload", "{}")])).unwrap_err();
        assert!(matches!(err, RedisStreamsError::Deserialization(_)));
    }

    #[test]
    fn consumer_defaults_can_be_overridden() {
        let bus = RedisStreamsBus::new("redis://localhost:6379")
            .unwrap()
            .with_consumer("prizer", "prizer-1");
        assert_eq!(bus.consumer_group(), "prizer");
    }
}
