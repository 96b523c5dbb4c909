//! Process wiring for the `lottery` and `prizer` binaries.

pub mod config;
pub mod shutdown;

pub use config::{LotteryAppConfig, PrizerAppConfig};
