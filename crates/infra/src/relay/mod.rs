//! Outbox relay: forwards committed outbox records to the bus in sequence
//! order and durably tracks progress per consumer group.
//!
//! One cycle goes `Idle → Polling → Publishing → Advancing → Idle`:
//! - **Polling** loads the cursor (absent means nothing forwarded yet),
//!   fetches up to `batch_size` records after `offset_acked` and raises
//!   `offset_consumed` to the last fetched sequence.
//! - **Publishing** sends records one at a time under `publish_timeout`.
//!   A failure or timeout stops the batch at that record.
//! - **Advancing** sets `offset_acked` to the record's sequence right after
//!   its publish succeeded, before the next record is sent.
//!
//! A crash between a publish and its cursor write republishes that one
//! record on restart. Records are never skipped.
//!
//! At most one relay should run per consumer group; nothing here elects a
//! leader.

mod worker;

pub use worker::RelayHandle;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use txevents_events::Publisher;

use crate::outbox::{Cursor, CursorStore, OutboxError, OutboxReader, OutboxRecord};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Cursor row owned by this relay.
    pub consumer_group: String,
    /// Maximum records fetched per cycle.
    pub batch_size: u32,
    /// Pause after a cycle that found nothing to do.
    pub poll_interval: Duration,
    /// Pause after a cycle that hit a publish or store failure.
    pub retry_interval: Duration,
    /// Upper bound on a single publish call.
    pub publish_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            consumer_group: "outbox-relay".to_string(),
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
            retry_interval: Duration::from_secs(1),
            publish_timeout: Duration::from_secs(10),
        }
    }
}

impl RelayConfig {
    pub fn new(consumer_group: impl Into<String>) -> Self {
        Self {
            consumer_group: consumer_group.into(),
            ..Self::default()
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayPhase {
    #[default]
    Idle,
    Polling,
    Publishing,
    Advancing,
}

/// Counters exposed through [`RelayHandle::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub phase: RelayPhase,
    pub cycles: u64,
    /// Records published and acknowledged in the cursor.
    pub published: u64,
    /// Failed publish attempts, including timeouts.
    pub publish_failures: u64,
    /// Publish failures since the last successful publish.
    pub consecutive_failures: u32,
    pub store_errors: u64,
    pub last_acked: i64,
    pub last_error: Option<String>,
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    /// Records fetched from the outbox.
    pub polled: usize,
    /// Records published and acknowledged.
    pub published: usize,
    /// Sequence whose publish failed; the batch stopped there.
    pub failed_at: Option<i64>,
    /// Shutdown was observed before the batch was finished.
    pub cancelled: bool,
}

impl CycleOutcome {
    fn drained_full_batch(&self, batch_size: u32) -> bool {
        self.failed_at.is_none()
            && !self.cancelled
            && self.polled > 0
            && self.published == self.polled
            && self.polled >= batch_size as usize
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    /// Reading the outbox or writing the cursor failed. The cycle ended early.
    #[error("outbox store error: {0}")]
    Store(#[from] OutboxError),

    #[error("publish of sequence {sequence} failed: {reason}")]
    Publish { sequence: i64, reason: String },

    #[error("publish of sequence {sequence} timed out after {after:?}")]
    Timeout { sequence: i64, after: Duration },
}

pub struct OutboxRelay<S, P> {
    store: S,
    publisher: P,
    config: RelayConfig,
    stats: Arc<Mutex<RelayStats>>,
}

impl<S, P> OutboxRelay<S, P>
where
    S: OutboxReader + CursorStore,
    P: Publisher,
{
    pub fn new(store: S, publisher: P, config: RelayConfig) -> Self {
        Self {
            store,
            publisher,
            config,
            stats: Arc::new(Mutex::new(RelayStats::default())),
        }
    }

    pub fn stats(&self) -> RelayStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Run a single cycle without a cancellation signal.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, RelayError> {
        self.cycle(None).await
    }

    /// Cycle until `shutdown` turns `true` (or its sender is dropped).
    ///
    /// Shutdown is checked between cycles and before each publish. A publish
    /// that already started is allowed to finish and is acknowledged.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let group = self.config.consumer_group.clone();
        info!(consumer_group = %group, batch_size = self.config.batch_size, "outbox relay started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.cycle(Some(&shutdown)).await {
                Ok(outcome) if outcome.cancelled => break,
                Ok(outcome) if outcome.failed_at.is_some() => self.config.retry_interval,
                Ok(outcome) if outcome.drained_full_batch(self.config.batch_size) => Duration::ZERO,
                Ok(_) => self.config.poll_interval,
                Err(err) => {
                    warn!(consumer_group = %group, error = %err, "relay cycle aborted");
                    self.config.retry_interval
                }
            };

            if pause.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.set_phase(RelayPhase::Idle);
        info!(consumer_group = %group, "outbox relay stopped");
    }

    async fn cycle(&self, shutdown: Option<&watch::Receiver<bool>>) -> Result<CycleOutcome, RelayError> {
        self.update(|s| s.cycles += 1);
        let result = self.forward_batch(shutdown).await;
        if let Err(err) = &result {
            self.update(|s| {
                s.store_errors += 1;
                s.last_error = Some(err.to_string());
            });
        }
        self.set_phase(RelayPhase::Idle);
        result
    }

    async fn forward_batch(&self, shutdown: Option<&watch::Receiver<bool>>) -> Result<CycleOutcome, RelayError> {
        let group = self.config.consumer_group.as_str();
        let mut outcome = CycleOutcome::default();

        self.set_phase(RelayPhase::Polling);
        let cursor = self
            .store
            .load_cursor(group)
            .await?
            .unwrap_or_else(|| Cursor::start(group));

        let batch = self
            .store
            .fetch_after(cursor.offset_acked, self.config.batch_size)
            .await?;
        outcome.polled = batch.len();

        let Some(last) = batch.last().map(|r| r.sequence) else {
            return Ok(outcome);
        };
        self.store.mark_consumed(group, last).await?;
        debug!(consumer_group = group, from = cursor.resume_from(), to = last, "polled outbox batch");

        for record in &batch {
            if shutdown.is_some_and(|rx| *rx.borrow()) {
                outcome.cancelled = true;
                break;
            }

            self.set_phase(RelayPhase::Publishing);
            if let Err(err) = self.publish(record).await {
                let consecutive = self.update(|s| {
                    s.publish_failures += 1;
                    s.consecutive_failures = s.consecutive_failures.saturating_add(1);
                    s.last_error = Some(err.to_string());
                    s.consecutive_failures
                });
                warn!(
                    consumer_group = group,
                    sequence = record.sequence,
                    event_id = %record.id,
                    topic = %record.topic,
                    consecutive_failures = consecutive,
                    error = %err,
                    "publish failed, will retry"
                );
                outcome.failed_at = Some(record.sequence);
                break;
            }

            self.set_phase(RelayPhase::Advancing);
            self.store.mark_acked(group, record.sequence).await?;
            self.update(|s| {
                s.published += 1;
                s.consecutive_failures = 0;
                s.last_acked = record.sequence;
            });
            outcome.published += 1;
            debug!(
                consumer_group = group,
                sequence = record.sequence,
                event_id = %record.id,
                "record forwarded"
            );
        }

        Ok(outcome)
    }

    async fn publish(&self, record: &OutboxRecord) -> Result<(), RelayError> {
        let message = record.to_message();
        let publish = self.publisher.publish(&record.topic, &message);

        match tokio::time::timeout(self.config.publish_timeout, publish).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(RelayError::Publish {
                sequence: record.sequence,
                reason: err.to_string(),
            }),
            Err(_) => Err(RelayError::Timeout {
                sequence: record.sequence,
                after: self.config.publish_timeout,
            }),
        }
    }

    fn set_phase(&self, phase: RelayPhase) {
        self.update(|s| s.phase = phase);
    }

    fn update<T: Default>(&self, f: impl FnOnce(&mut RelayStats) -> T) -> T {
        self.stats.lock().map(|mut s| f(&mut s)).unwrap_or_default()
    }
}
