//! Plain-data retry configuration. The engine that walks this policy lives
//! in the driver crate (it needs `tokio::time`); this struct is kept here so
//! both the driver and any caller building a `RetryParameters` by hand don't
//! need to depend on the driver crate's async machinery to describe one.

use std::time::Duration;

/// Configuration for `with_retries`. Defaults match spec.md section 4.7.
#[derive(Debug, Clone, Copy)]
pub struct RetryParameters {
    pub max_retries: u32,
    pub backoff_ceiling: Duration,
    pub backoff_slot: Duration,
    pub deadline: Duration,
}

impl Default for RetryParameters {
    fn default() -> Self {
        Self {
            max_retries: 10,
            backoff_ceiling: Duration::from_secs(10),
            backoff_slot: Duration::from_millis(50),
            deadline: Duration::from_secs(30),
        }
    }
}

impl RetryParameters {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// `delay = min(ceiling, slot * 2^attempt)`; jitter is added by the
    /// caller (it needs an `rng`, which this pure-data struct doesn't own).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = 2u64.saturating_pow(attempt.min(32));
        let scaled = self.backoff_slot.saturating_mul(exp.min(u32::MAX as u64) as u32);
        scaled.min(self.backoff_ceiling)
    }
}
