//! Lottery domain: the winner record, the event it raises, the store
//! capability the service writes through, and the service loop itself.
//!
//! Storage lives in `txevents-infra`; this crate only states what it needs.

pub mod event;
pub mod service;
pub mod store;
pub mod winner;

pub use event::LotteryConcluded;
pub use service::{LotteryConfig, LotteryService};
pub use store::{StoreError, WinnerStore};
pub use winner::Winner;
