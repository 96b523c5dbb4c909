//! Infrastructure layer: the Postgres store, the outbox relay, bus adapters.

pub mod backoff;
pub mod config;
pub mod connector;
pub mod event_bus;
pub mod memory;
pub mod outbox;
pub mod relay;
pub mod schema;
pub mod tx;
pub mod winners;


#[cfg(feature = "redis")]
pub use event_bus::{RedisStreamsBus, RedisStreamsError};

pub use backoff::CappedLinearBackoff;
pub use config::{ConfigError, DbConfig, OutboxConfig};
pub use connector::{ConnectError, PgDriver, StoreDriver, connect, connect_with};
pub use memory::InMemoryStore;
pub use outbox::{
    Cursor, CursorStore, NewOutboxRecord, OutboxError, OutboxReader, OutboxRecord, PostgresOutbox,
};
pub use relay::{
    CycleOutcome, OutboxRelay, RelayConfig, RelayError, RelayHandle, RelayPhase, RelayStats,
};
pub use schema::{OutboxTables, SchemaError, WINNERS_TABLE, migrate};
pub use tx::{TxError, TxFuture, in_transaction};
pub use winners::PostgresWinnerStore;
