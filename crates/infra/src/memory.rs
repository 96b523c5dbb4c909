//! In-memory store: winners, outbox and cursors behind one lock.
//!
//! Intended for tests/dev. A write stages its changes on a copy of the
//! database and swaps the copy in only when every step succeeded, which
//! mirrors the commit/rollback behaviour of the Postgres store.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::Utc;

use txevents_lottery::{StoreError, Winner, WinnerStore};

use crate::outbox::{Cursor, CursorStore, NewOutboxRecord, OutboxError, OutboxReader, OutboxRecord};
use crate::winners::concluded_record;

#[derive(Debug, Clone, Default)]
struct Database {
    winners: BTreeMap<i64, Winner>,
    outbox: Vec<OutboxRecord>,
    last_sequence: i64,
    cursors: HashMap<String, Cursor>,
}

impl Database {
    fn append(&mut self, record: NewOutboxRecord) -> Result<i64, StoreError> {
        if self.outbox.iter().any(|r| r.id == record.id) {
            return Err(StoreError::Conflict(format!("outbox id {} already stored", record.id)));
        }
        self.last_sequence += 1;
        self.outbox.push(OutboxRecord {
            sequence: self.last_sequence,
            id: record.id,
            topic: record.topic,
            created_at: Utc::now(),
            payload: record.payload,
            metadata: record.metadata,
        });
        Ok(self.last_sequence)
    }

    fn cursor_mut(&mut self, consumer_group: &str) -> &mut Cursor {
        self.cursors
            .entry(consumer_group.to_string())
            .or_insert_with(|| Cursor::start(consumer_group))
    }
}

#[derive(Debug)]
pub struct InMemoryStore {
    event_topic: String,
    db: RwLock<Database>,
    fail_outbox_inserts: AtomicU32,
    fail_fetches: AtomicU32,
    fail_acks: AtomicU32,
}

impl InMemoryStore {
    pub fn new(event_topic: impl Into<String>) -> Self {
        Self {
            event_topic: event_topic.into(),
            db: RwLock::new(Database::default()),
            fail_outbox_inserts: AtomicU32::new(0),
            fail_fetches: AtomicU32::new(0),
            fail_acks: AtomicU32::new(0),
        }
    }

    /// Make the next outbox insert fail after the winner insert was staged.
    pub fn fail_next_outbox_insert(&self) {
        self.fail_outbox_inserts.fetch_add(1, Ordering::SeqCst);
    }

    /// Make the next `n` outbox reads fail.
    pub fn fail_next_fetch(&self, n: u32) {
        self.fail_fetches.fetch_add(n, Ordering::SeqCst);
    }

    /// Make the next `n` `mark_acked` calls fail without writing.
    pub fn fail_next_ack(&self, n: u32) {
        self.fail_acks.fetch_add(n, Ordering::SeqCst);
    }

    /// Snapshot of every outbox record, in sequence order.
    pub fn outbox_records(&self) -> Vec<OutboxRecord> {
        self.read(|db| db.outbox.clone())
    }

    pub fn winners(&self) -> Vec<Winner> {
        self.read(|db| db.winners.values().cloned().collect())
    }

    pub fn cursor(&self, consumer_group: &str) -> Option<Cursor> {
        self.read(|db| db.cursors.get(consumer_group).cloned())
    }

    fn read<T: Default>(&self, f: impl FnOnce(&Database) -> T) -> T {
        self.db.read().map(|db| f(&db)).unwrap_or_default()
    }

    /// Take one injected failure from `counter`, if any is pending.
    fn take_fault(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl WinnerStore for InMemoryStore {
    async fn insert_winner(&self, winner: Winner) -> Result<Winner, StoreError> {
        winner.validate()?;
        let record = concluded_record(&self.event_topic, &winner)?;

        let mut db = self
            .db
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;

        let mut staged = db.clone();
        if staged.winners.contains_key(&winner.id) {
            return Err(StoreError::Conflict(format!("winner {} already exists", winner.id)));
        }
        staged.winners.insert(winner.id, winner.clone());

        if Self::take_fault(&self.fail_outbox_inserts) {
            return Err(StoreError::Storage("injected outbox insert failure".to_string()));
        }
        staged.append(record)?;

        *db = staged;
        Ok(winner)
    }

    async fn get_winner_by_id(&self, id: i64) -> Result<Winner, StoreError> {
        let db = self
            .db
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;
        db.winners.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }
}

#[async_trait]
impl OutboxReader for InMemoryStore {
    async fn fetch_after(&self, after: i64, limit: u32) -> Result<Vec<OutboxRecord>, OutboxError> {
        if Self::take_fault(&self.fail_fetches) {
            return Err(OutboxError::Storage("injected fetch failure".to_string()));
        }
        let db = self
            .db
            .read()
            .map_err(|_| OutboxError::Storage("lock poisoned".to_string()))?;

        Ok(db
            .outbox
            .iter()
            .filter(|r| r.sequence > after)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CursorStore for InMemoryStore {
    async fn load_cursor(&self, consumer_group: &str) -> Result<Option<Cursor>, OutboxError> {
        let db = self
            .db
            .read()
            .map_err(|_| OutboxError::Storage("lock poisoned".to_string()))?;
        Ok(db.cursors.get(consumer_group).cloned())
    }

    async fn mark_consumed(&self, consumer_group: &str, sequence: i64) -> Result<Cursor, OutboxError> {
        let mut db = self
            .db
            .write()
            .map_err(|_| OutboxError::Storage("lock poisoned".to_string()))?;

        let cursor = db.cursor_mut(consumer_group);
        cursor.offset_consumed = cursor.offset_consumed.max(sequence);
        Ok(cursor.clone())
    }

    async fn mark_acked(&self, consumer_group: &str, sequence: i64) -> Result<Cursor, OutboxError> {
        if Self::take_fault(&self.fail_acks) {
            return Err(OutboxError::Storage("injected ack failure".to_string()));
        }
        let mut db = self
            .db
            .write()
            .map_err(|_| OutboxError::Storage("lock poisoned".to_string()))?;

        let cursor = db.cursor_mut(consumer_group);
        cursor.offset_acked = cursor.offset_acked.max(sequence);
        cursor.offset_consumed = cursor.offset_consumed.max(sequence);
        Ok(cursor.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_writes_winner_and_outbox_record_together() {
        let store = InMemoryStore::new("events");

        store.insert_winner(Winner::new(1, "Mike")).await.unwrap();

        assert_eq!(store.get_winner_by_id(1).await.unwrap().name, "Mike");
        let records = store.outbox_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sequence, 1);
        assert_eq!(records[0].topic, "events");
        assert_eq!(records[0].payload["winner_id"], 1);
    }

    #[tokio::test]
    async fn failed_outbox_insert_leaves_nothing_behind() {
        let store = InMemoryStore::new("events");
        store.fail_next_outbox_insert();

        let err = store.insert_winner(Winner::new(1, "Mike")).await.unwrap_err();

        assert!(matches!(err, StoreError::Storage(_)));
        assert!(store.get_winner_by_id(1).await.unwrap_err().is_not_found());
        assert!(store.outbox_records().is_empty());

        // The fault is consumed; the retry goes through.
        store.insert_winner(Winner::new(1, "Mike")).await.unwrap();
        assert_eq!(store.outbox_records().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_winner_is_a_conflict_without_a_second_event() {
        let store = InMemoryStore::new("events");
        store.insert_winner(Winner::new(1, "Mike")).await.unwrap();

        let err = store.insert_winner(Winner::new(1, "Dwight")).await.unwrap_err();

        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.get_winner_by_id(1).await.unwrap().name, "Mike");
        assert_eq!(store.outbox_records().len(), 1);
    }

    #[tokio::test]
    async fn invalid_winner_is_rejected_before_writing() {
        let store = InMemoryStore::new("events");
        let err = store.insert_winner(Winner::new(0, "Mike")).await.unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
        assert!(store.outbox_records().is_empty());
    }

    #[tokio::test]
    async fn fetch_after_is_ordered_and_bounded() {
        let store = InMemoryStore::new("events");
        for (id, name) in [(1, "Mike"), (2, "Dwight"), (3, "Jim")] {
            store.insert_winner(Winner::new(id, name)).await.unwrap();
        }

        let seqs: Vec<i64> = store
            .fetch_after(1, 10)
            .await
            .unwrap()
            .iter()
            .map(|r| r.sequence)
            .collect();
        assert_eq!(seqs, vec![2, 3]);

        assert_eq!(store.fetch_after(0, 2).await.unwrap().len(), 2);
        assert!(store.fetch_after(3, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cursor_never_moves_backwards() {
        let store = InMemoryStore::new("events");

        assert!(store.load_cursor("g").await.unwrap().is_none());

        store.mark_consumed("g", 5).await.unwrap();
        store.mark_acked("g", 3).await.unwrap();
        let cursor = store.mark_consumed("g", 2).await.unwrap();
        assert_eq!((cursor.offset_acked, cursor.offset_consumed), (3, 5));

        let cursor = store.mark_acked("g", 1).await.unwrap();
        assert_eq!((cursor.offset_acked, cursor.offset_consumed), (3, 5));

        let cursor = store.mark_acked("g", 7).await.unwrap();
        assert_eq!((cursor.offset_acked, cursor.offset_consumed), (7, 7));
    }

    #[tokio::test]
    async fn cursors_are_per_group() {
        let store = InMemoryStore::new("events");
        store.mark_acked("a", 4).await.unwrap();

        assert_eq!(store.cursor("a").map(|c| c.offset_acked), Some(4));
        assert!(store.cursor("b").is_none());
    }

    #[tokio::test]
    async fn injected_faults_are_consumed_one_by_one() {
        let store = InMemoryStore::new("events");
        store.fail_next_fetch(1);
        store.fail_next_ack(1);

        assert!(store.fetch_after(0, 10).await.is_err());
        assert!(store.fetch_after(0, 10).await.is_ok());
        assert!(store.mark_acked("g", 1).await.is_err());
        assert!(store.cursor("g").is_none());
        assert!(store.mark_acked("g", 1).await.is_ok());
    }
}
