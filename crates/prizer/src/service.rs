//! Prize sender: consumes `LotteryConcluded` events from the bus.
//!
//! Delivery is at-least-once, so the same event may arrive twice after a
//! relay restart. Duplicates are recognised by message id within this
//! process and acknowledged without sending a second prize.

use std::collections::HashSet;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use txevents_core::EventId;
use txevents_events::{Delivery, Subscriber, Subscription};
use txevents_lottery::LotteryConcluded;

#[derive(Debug, Error)]
pub enum PrizeError {
    #[error("failed to subscribe to {topic}: {reason}")]
    Subscribe { topic: String, reason: String },
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prized {
    Sent { winner_id: i64 },
    Duplicate,
    /// The payload was not a `LotteryConcluded`; acknowledged and dropped.
    Poison,
}

pub struct PrizeSender {
    topic: String,
    seen: HashSet<EventId>,
    sent: u64,
}

impl PrizeSender {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            seen: HashSet::new(),
            sent: 0,
        }
    }

    /// Prizes sent so far.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Subscribe to the topic on `bus`.
    pub async fn subscribe<B: Subscriber>(&self, bus: &B) -> Result<Subscription, PrizeError> {
        bus.subscribe(&self.topic).await.map_err(|e| PrizeError::Subscribe {
            topic: self.topic.clone(),
            reason: e.to_string(),
        })
    }

    /// Consume `subscription` until `shutdown` flips to `true` or the bus goes away.
    pub async fn run(&mut self, mut subscription: Subscription, mut shutdown: watch::Receiver<bool>) {
        info!(service = "prizer", topic = %self.topic, "prize sender started");

        loop {
            tokio::select! {
                delivery = subscription.recv() => match delivery {
                    Some(delivery) => {
                        self.handle(delivery);
                    }
                    None => {
                        warn!(service = "prizer", topic = %self.topic, "subscription closed by the bus");
                        break;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(service = "prizer", sent = self.sent, "prize sender stopped");
    }

    /// Process and acknowledge one delivery.
    pub fn handle(&mut self, delivery: Delivery) -> Prized {
        let message = delivery.message();
        let id = message.id();

        let outcome = if !self.seen.insert(id) {
            debug!(service = "prizer", event_id = %id, "duplicate delivery, already handled");
            Prized::Duplicate
        } else {
            match message.decode::<LotteryConcluded>() {
                Ok(event) => {
                    self.sent += 1;
                    info!(service = "prizer", event_id = %id, winner_id = event.winner_id, "sending a prize to the winner");
                    Prized::Sent {
                        winner_id: event.winner_id,
                    }
                }
                Err(err) => {
                    warn!(service = "prizer", event_id = %id, error = %err, "undecodable event, dropping it");
                    Prized::Poison
                }
            }
        };

        delivery.ack();
        outcome
    }
}
