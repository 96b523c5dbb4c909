//! Store connection acquisition with bounded retries.
//!
//! Only the *open* step is retried under the backoff policy. Once a
//! connection is open, a failed liveness check is returned immediately:
//! a store that accepts connections but cannot answer `SELECT 1` is treated
//! as misconfigured rather than transiently unavailable.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tracing::{info, warn};

use crate::backoff::CappedLinearBackoff;

#[derive(Debug, Error)]
pub enum ConnectError {
    /// The retry budget ran out before the store could be opened.
    #[error("failed to acquire store connection after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    /// The store opened but did not answer the liveness check.
    #[error("store liveness check failed: {0}")]
    Liveness(String),
}

/// Something that can open a store and check that it answers.
#[async_trait]
pub trait StoreDriver: Send + Sync {
    type Connection: Send;
    type Error: std::error::Error + Send + Sync + 'static;

    async fn open(&self, dsn: &str) -> Result<Self::Connection, Self::Error>;

    async fn ping(&self, conn: &Self::Connection) -> Result<(), Self::Error>;
}

/// Postgres driver backed by an sqlx pool.
#[derive(Debug, Clone)]
pub struct PgDriver {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PgDriver {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl StoreDriver for PgDriver {
    type Connection = PgPool;
    type Error = sqlx::Error;

    async fn open(&self, dsn: &str) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect(dsn)
            .await
    }

    async fn ping(&self, pool: &PgPool) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(pool).await.map(|_| ())
    }
}

/// Connect to Postgres at `dsn`, retrying the open step under `policy`.
pub async fn connect(dsn: &str, policy: &mut CappedLinearBackoff) -> Result<PgPool, ConnectError> {
    connect_with(&PgDriver::default(), dsn, policy).await
}

/// Connect through any [`StoreDriver`].
///
/// Runs as a bounded loop: at most `policy.max_retries` opens. After a failed
/// attempt `n` it sleeps `policy.delay_for(n + 1)`, unless no attempt is left.
pub async fn connect_with<D: StoreDriver>(
    driver: &D,
    dsn: &str,
    policy: &mut CappedLinearBackoff,
) -> Result<D::Connection, ConnectError> {
    let mut last_error = String::from("no attempt was made");

    loop {
        let attempt = policy.next_attempt();
        if policy.is_exhausted(attempt) {
            return Err(ConnectError::Exhausted {
                attempts: attempt,
                last_error,
            });
        }

        match driver.open(dsn).await {
            Ok(conn) => {
                driver
                    .ping(&conn)
                    .await
                    .map_err(|e| ConnectError::Liveness(e.to_string()))?;
                info!(attempt, "store connection established");
                return Ok(conn);
            }
            Err(err) => {
                last_error = err.to_string();
                if policy.is_exhausted(attempt + 1) {
                    warn!(attempt, error = %err, "failed connecting to store, no retries left");
                    continue;
                }
                let delay = policy.delay_for(attempt + 1);
                warn!(attempt, ?delay, error = %err, "failed connecting to store, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Error)]
    #[error("{0}")]
    struct FakeError(&'static str);

    /// Fails `open` a set number of times, then succeeds.
    struct FakeDriver {
        open_failures: u32,
        ping_fails: bool,
        opens: AtomicU32,
        pings: AtomicU32,
        open_times: Mutex<Vec<tokio::time::Instant>>,
    }

    impl FakeDriver {
        fn new(open_failures: u32, ping_fails: bool) -> Self {
            Self {
                open_failures,
                ping_fails,
                opens: AtomicU32::new(0),
                pings: AtomicU32::new(0),
                open_times: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl StoreDriver for FakeDriver {
        type Connection = &'static str;
        type Error = FakeError;

        async fn open(&self, _dsn: &str) -> Result<&'static str, FakeError> {
            self.open_times.lock().unwrap().push(tokio::time::Instant::now());
            let n = self.opens.fetch_add(1, Ordering::SeqCst);
            if n < self.open_failures {
                Err(FakeError("connection refused"))
            } else {
                Ok("conn")
            }
        }

        async fn ping(&self, _conn: &&'static str) -> Result<(), FakeError> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            if self.ping_fails {
                Err(FakeError("ping timeout"))
            } else {
                Ok(())
            }
        }
    }

    fn policy() -> CappedLinearBackoff {
        CappedLinearBackoff::new(2, Duration::from_secs(10), 10)
    }

    #[tokio::test(start_paused = true)]
    async fn first_try_success_does_not_sleep() {
        let driver = FakeDriver::new(0, false);
        let start = tokio::time::Instant::now();

        let conn = connect_with(&driver, "dsn", &mut policy()).await.unwrap();

        assert_eq!(conn, "conn");
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(driver.pings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_capped_linear_delays() {
        let driver = FakeDriver::new(3, false);

        connect_with(&driver, "dsn", &mut policy()).await.unwrap();

        let times = driver.open_times.lock().unwrap().clone();
        let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![Duration::from_secs(2), Duration::from_secs(4), Duration::from_secs(6)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries_opens() {
        let driver = FakeDriver::new(u32::MAX, false);

        let err = connect_with(&driver, "dsn", &mut policy()).await.unwrap_err();

        assert!(matches!(
            err,
            ConnectError::Exhausted { attempts: 10, ref last_error } if last_error == "connection refused"
        ));
        assert_eq!(driver.opens.load(Ordering::SeqCst), 10);
        assert_eq!(driver.pings.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn total_wait_respects_the_cap() {
        let driver = FakeDriver::new(u32::MAX, false);
        let start = tokio::time::Instant::now();

        let _ = connect_with(&driver, "dsn", &mut policy()).await;

        // 2+4+6+8 then 10s for the remaining five gaps between ten opens.
        assert_eq!(start.elapsed(), Duration::from_secs(20 + 5 * 10));
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_failure_is_not_retried() {
        let driver = FakeDriver::new(0, true);

        let err = connect_with(&driver, "dsn", &mut policy()).await.unwrap_err();

        assert!(matches!(err, ConnectError::Liveness(msg) if msg == "ping timeout"));
        assert_eq!(driver.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_budget_never_opens() {
        let driver = FakeDriver::new(0, false);
        let mut policy = CappedLinearBackoff::new(2, Duration::from_secs(10), 0);

        let err = connect_with(&driver, "dsn", &mut policy).await.unwrap_err();

        assert!(matches!(err, ConnectError::Exhausted { attempts: 0, .. }));
        assert_eq!(driver.opens.load(Ordering::SeqCst), 0);
    }
}
