//! In-memory bus for tests/dev.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use txevents_core::EventId;

use crate::bus::{Delivery, Publisher, Subscriber, Subscription};
use crate::message::Message;

const SUBSCRIPTION_BUFFER: usize = 1024;

#[derive(Debug, Error)]
pub enum InMemoryBusError {
    /// Internal lock poisoning.
    #[error("in-memory bus lock poisoned")]
    Poisoned,

    /// A failure requested through one of the fault-injection hooks.
    #[error("injected publish failure for {0}")]
    Injected(EventId),

    /// A subscriber stopped draining its buffer.
    #[error("subscriber buffer full on topic {0}")]
    SubscriberFull(String),
}

#[derive(Debug, Default)]
struct Inner {
    published: Vec<(String, Message)>,
    subscribers: HashMap<String, Vec<mpsc::Sender<Delivery>>>,
    fail_next: u32,
    fail_ids: HashMap<EventId, u32>,
    stall_next: u32,
    attempts: u64,
}

/// In-memory pub/sub bus.
///
/// - Records every accepted message in publish order
/// - Fans out to subscribers of the topic (acknowledgements are not tracked);
///   a publish is refused, and nobody sees it, while any subscriber is full
/// - Fault injection: fail the next N publishes, fail a given id N times, or
///   stall the next N publishes forever (to exercise publish timeouts)
#[derive(Debug, Default)]
pub struct InMemoryBus {
    inner: Mutex<Inner>,
}

enum Verdict {
    Accept,
    Fail,
    Stall,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` publish calls fail.
    pub fn fail_next(&self, n: u32) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_next += n;
        }
    }

    /// Make publishes of message `id` fail `times` times before succeeding.
    pub fn fail_message(&self, id: EventId, times: u32) {
        if let Ok(mut inner) = self.inner.lock() {
            *inner.fail_ids.entry(id).or_default() += times;
        }
    }

    /// Make the next `n` publish calls never complete.
    pub fn stall_next(&self, n: u32) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.stall_next += n;
        }
    }

    /// Every accepted `(topic, message)` in publish order.
    pub fn published(&self) -> Vec<(String, Message)> {
        self.inner
            .lock()
            .map(|inner| inner.published.clone())
            .unwrap_or_default()
    }

    /// Accepted messages for one topic, in publish order.
    pub fn published_on(&self, topic: &str) -> Vec<Message> {
        self.published()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, m)| m)
            .collect()
    }

    /// Number of publish calls seen, including failed and stalled ones.
    pub fn attempts(&self) -> u64 {
        self.inner.lock().map(|inner| inner.attempts).unwrap_or(0)
    }

    fn verdict(inner: &mut Inner, id: EventId) -> Verdict {
        inner.attempts += 1;

        if inner.stall_next > 0 {
            inner.stall_next -= 1;
            return Verdict::Stall;
        }
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Verdict::Fail;
        }
        if let Some(remaining) = inner.fail_ids.get_mut(&id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Verdict::Fail;
            }
        }
        Verdict::Accept
    }
}

#[async_trait]
impl Publisher for InMemoryBus {
    type Error = InMemoryBusError;

    async fn publish(&self, topic: &str, message: &Message) -> Result<(), Self::Error> {
        let verdict = {
            let mut inner = self.inner.lock().map_err(|_| InMemoryBusError::Poisoned)?;
            let verdict = Self::verdict(&mut inner, message.id());

            if let Verdict::Accept = verdict {
                if let Some(subs) = inner.subscribers.get_mut(topic) {
                    subs.retain(|tx| !tx.is_closed());
                    // All or nothing: a full subscriber rejects the message for everyone.
                    if subs.iter().any(|tx| tx.capacity() == 0) {
                        return Err(InMemoryBusError::SubscriberFull(topic.to_string()));
                    }
                    for tx in subs.iter() {
                        let _ = tx.try_send(Delivery::untracked(message.clone()));
                    }
                }
                inner.published.push((topic.to_string(), message.clone()));
            }
            verdict
        };

        match verdict {
            Verdict::Accept => Ok(()),
            Verdict::Fail => Err(InMemoryBusError::Injected(message.id())),
            Verdict::Stall => std::future::pending().await,
        }
    }
}

#[async_trait]
impl Subscriber for InMemoryBus {
    type Error = InMemoryBusError;

    async fn subscribe(&self, topic: &str) -> Result<Subscription, Self::Error> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let mut inner = self.inner.lock().map_err(|_| InMemoryBusError::Poisoned)?;
        inner.subscribers.entry(topic.to_string()).or_default().push(tx);
        Ok(Subscription::new(rx))
    }
}
