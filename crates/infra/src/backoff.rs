//! Retry pacing for acquiring the store connection.
//!
//! This is a **capped linear** backoff: the delay grows by `coefficient`
//! seconds per attempt and stops growing at `max_delay`. It is not
//! exponential, and callers rely on the exact linear schedule.

use std::time::Duration;

/// Capped linear backoff with a hard retry budget.
///
/// `delay_for(n) = min(n * coefficient * 1s, max_delay)`.
/// Once an attempt index reaches `max_retries` the resource is considered
/// unavailable and the caller must give up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CappedLinearBackoff {
    /// Seconds added to the delay per attempt.
    pub coefficient: u32,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Attempt budget; attempt indices `0..max_retries` are allowed.
    pub max_retries: u32,
    attempt: u32,
}

impl Default for CappedLinearBackoff {
    fn default() -> Self {
        Self::new(2, Duration::from_secs(10), 10)
    }
}

impl CappedLinearBackoff {
    pub fn new(coefficient: u32, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            coefficient,
            max_delay,
            max_retries,
            attempt: 0,
        }
    }

    /// Return the current attempt index and advance the counter.
    pub fn next_attempt(&mut self) -> u32 {
        let current = self.attempt;
        self.attempt = self.attempt.saturating_add(1);
        current
    }

    /// Delay associated with `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let secs = u64::from(attempt).saturating_mul(u64::from(self.coefficient));
        Duration::from_secs(secs).min(self.max_delay)
    }

    /// Whether `attempt` is past the retry budget.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_retries
    }

    /// How many attempts have been handed out so far.
    pub fn attempts_made(&self) -> u32 {
        self.attempt
    }
}
