//! The outbox: records waiting to be forwarded, and the relay's cursors.
//!
//! Records are inserted by the transactional writer inside its own
//! transaction and are read-only afterwards. Cursors are written only by the
//! relay that owns the consumer group.

pub mod postgres;
pub mod r#trait;

pub use postgres::PostgresOutbox;
pub use r#trait::{Cursor, CursorStore, NewOutboxRecord, OutboxError, OutboxReader, OutboxRecord};
