//! `txevents-core`: identifiers and the shared domain error.
//!
//! Nothing in here knows about the store or the bus.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::EventId;
