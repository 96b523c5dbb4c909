//! The lottery loop: periodically picks a winner and records it.
//!
//! This is the caller of the transactional writer. It never publishes; the
//! `LotteryConcluded` event reaches the bus through the outbox relay.

use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::store::{StoreError, WinnerStore};
use crate::winner::Winner;

/// Lottery service configuration.
#[derive(Debug, Clone)]
pub struct LotteryConfig {
    /// Time between draws.
    pub interval: Duration,
    /// Candidates drawn from.
    pub users: Vec<String>,
    /// Id of the first lottery drawn by this process.
    pub first_lottery_id: i64,
}

impl Default for LotteryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            users: ["Mike", "Dwight", "Jim", "Pamela"]
                .into_iter()
                .map(String::from)
                .collect(),
            first_lottery_id: 1,
        }
    }
}

impl LotteryConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_first_lottery_id(mut self, id: i64) -> Self {
        self.first_lottery_id = id;
        self
    }
}

pub struct LotteryService<S> {
    store: S,
    config: LotteryConfig,
    next_lottery_id: i64,
}

impl<S: WinnerStore> LotteryService<S> {
    pub fn new(store: S, config: LotteryConfig) -> Self {
        let next_lottery_id = config.first_lottery_id;
        Self {
            store,
            config,
            next_lottery_id,
        }
    }

    pub fn next_lottery_id(&self) -> i64 {
        self.next_lottery_id
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Draw until `shutdown` flips to `true`.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(service = "lottery", interval = ?self.config.interval, "lottery started");
        let mut ticker = tokio::time::interval(self.config.interval);
        // The first tick completes immediately; draws start one interval in.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let Some(user) = self.config.users.choose(&mut rand::thread_rng()).cloned() else {
                warn!(service = "lottery", "no users configured, nothing to draw");
                continue;
            };

            // Errors are reported inside `run_round`; the loop keeps drawing.
            let _ = self.run_round(&user).await;
        }

        info!(service = "lottery", "lottery stopped");
    }

    /// One draw: record `user` as the winner of the next lottery.
    ///
    /// The lottery id advances whether or not the write succeeds, so a
    /// conflicting id left over from a previous run is skipped.
    pub async fn run_round(&mut self, user: &str) -> Result<Winner, StoreError> {
        let lottery_id = self.next_lottery_id;
        self.next_lottery_id += 1;

        info!(service = "lottery", user, lottery_id, "user has been picked as a winner");

        match self.store.insert_winner(Winner::new(lottery_id, user)).await {
            Ok(winner) => {
                info!(service = "lottery", user, lottery_id, "winner recorded");
                Ok(winner)
            }
            Err(err @ StoreError::Conflict(_)) => {
                warn!(service = "lottery", user, lottery_id, error = %err, "lottery id already taken, skipping");
                Err(err)
            }
            Err(err) => {
                error!(service = "lottery", user, lottery_id, error = %err, "failed to record winner");
                Err(err)
            }
        }
    }
}
