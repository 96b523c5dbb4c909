//! Infrastructure bus implementations.
//!
//! The bus capability lives in `txevents-events` as pure mechanics. This
//! module provides infrastructure-backed implementations (e.g. Redis).

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsBus, RedisStreamsError};
