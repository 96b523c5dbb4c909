//! Bus capability (mechanics only).
//!
//! The outbox relay only needs [`Publisher`]: a message goes to a topic and the
//! call either succeeds or returns an error. There is no acknowledgement
//! callback; a successful return is the acknowledgement.
//!
//! [`Subscriber`] exists for downstream consumers. Delivery is
//! **at-least-once**: the relay republishes after a crash between publish and
//! cursor commit, so consumers must de-duplicate on [`Message::id`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::message::Message;

/// Publish side of a message bus.
///
/// Implementations must be safe to call concurrently, but the relay never
/// does so within one consumer group: ordering is the caller's job.
#[async_trait]
pub trait Publisher: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Publish one message to `topic`. Returning `Ok` means the bus accepted it.
    async fn publish(&self, topic: &str, message: &Message) -> Result<(), Self::Error>;
}

/// Subscribe side of a message bus.
#[async_trait]
pub trait Subscriber: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Start receiving messages published to `topic`.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, Self::Error>;
}

#[async_trait]
impl<P> Publisher for Arc<P>
where
    P: Publisher + ?Sized,
{
    type Error = P::Error;

    async fn publish(&self, topic: &str, message: &Message) -> Result<(), Self::Error> {
        (**self).publish(topic, message).await
    }
}

#[async_trait]
impl<S> Subscriber for Arc<S>
where
    S: Subscriber + ?Sized,
{
    type Error = S::Error;

    async fn subscribe(&self, topic: &str) -> Result<Subscription, Self::Error> {
        (**self).subscribe(topic).await
    }
}

/// A message handed to a consumer, together with its acknowledgement handle.
///
/// Dropping a delivery without calling [`Delivery::ack`] leaves it
/// unacknowledged; buses that track acknowledgements will redeliver it.
#[derive(Debug)]
pub struct Delivery {
    message: Message,
    ack: Option<oneshot::Sender<()>>,
}

impl Delivery {
    /// A delivery whose acknowledgement is reported on `ack`.
    pub fn new(message: Message, ack: oneshot::Sender<()>) -> Self {
        Self {
            message,
            ack: Some(ack),
        }
    }

    /// A delivery from a bus that does not track acknowledgements.
    pub fn untracked(message: Message) -> Self {
        Self { message, ack: None }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Acknowledge receipt.
    pub fn ack(mut self) {
        if let Some(tx) = self.ack.take() {
            let _ = tx.send(());
        }
    }
}

/// A stream of deliveries for one topic.
///
/// Designed for a single consuming task. `recv` returns `None` once the bus
/// side has gone away.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::Receiver<Delivery>,
}

impl Subscription {
    pub fn new(receiver: mpsc::Receiver<Delivery>) -> Self {
        Self { receiver }
    }

    /// Wait for the next delivery.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    /// Take a delivery if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.receiver.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Metadata;
    use serde_json::json;
    use txevents_core::EventId;

    #[tokio::test]
    async fn ack_reaches_the_bus_side() {
        let (tx, rx) = oneshot::channel();
        let delivery = Delivery::new(Message::new(EventId::new(), json!(1), Metadata::new()), tx);
        delivery.ack();
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn dropped_delivery_is_not_acked() {
        let (tx, rx) = oneshot::channel();
        let delivery = Delivery::new(Message::new(EventId::new(), json!(1), Metadata::new()), tx);
        drop(delivery);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn subscription_ends_when_sender_is_gone() {
        let (tx, rx) = mpsc::channel(4);
        let mut sub = Subscription::new(rx);
        tx.send(Delivery::untracked(Message::new(EventId::new(), json!(2), Metadata::new())))
            .await
            .unwrap();
        drop(tx);

        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }
}
