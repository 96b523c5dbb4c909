//! Transactional writer: winners and their outbox events.

pub mod postgres;

pub use postgres::PostgresWinnerStore;

use txevents_events::Metadata;
use txevents_lottery::{LotteryConcluded, StoreError, Winner};

use crate::outbox::NewOutboxRecord;

/// Build the outbox record announcing `winner` on `event_topic`.
///
/// Shared by every `WinnerStore` so the payload and annotations do not
/// depend on the backing store.
pub(crate) fn concluded_record(event_topic: &str, winner: &Winner) -> Result<NewOutboxRecord, StoreError> {
    let mut extra = Metadata::new();
    extra.insert("winner_id".to_string(), winner.id.to_string());

    NewOutboxRecord::from_event(event_topic, &LotteryConcluded { winner_id: winner.id }, extra)
        .map_err(|e| StoreError::Serialization(e.to_string()))
}
