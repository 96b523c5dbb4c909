use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use txevents_events::Publisher;

use super::{OutboxRelay, RelayStats};
use crate::outbox::{CursorStore, OutboxReader};

/// Handle to control and join a spawned relay.
#[derive(Debug)]
pub struct RelayHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<RelayStats>>,
}

impl RelayHandle {
    /// Request graceful shutdown and wait for the relay task to stop.
    ///
    /// A publish already in flight completes and is acknowledged first.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                warn!(error = %err, "outbox relay task ended abnormally");
            }
        }
    }

    pub fn stats(&self) -> RelayStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl<S, P> OutboxRelay<S, P>
where
    S: OutboxReader + CursorStore + 'static,
    P: Publisher + 'static,
{
    /// Run the relay on its own task.
    pub fn spawn(self) -> RelayHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let join = tokio::spawn(self.run(shutdown_rx));

        RelayHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}
