//! Downstream consumer of `LotteryConcluded`: sends the prize.

pub mod service;

pub use service::{PrizeError, PrizeSender, Prized};
