//! Retry policy for failed flush tasks.
//!
//! Implements exponential backoff with configurable parameters.

use crate::config::FlushWorkerSettings;
use crate::flush_queue::FlushError;
use std::time::Duration;

/// Retry policy implementing exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of execution attempts before permanent failure.
    pub max_attempts: u32,
    /// Backoff after the first failed attempt; doubles on each further one.
    pub backoff_base: Duration,
}

impl RetryPolicy {
    /// Create a new RetryPolicy from configuration settings.
    pub fn new(config: &FlushWorkerSettings) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff_base: config.retry_backoff_base,
        }
    }

    /// Check if a failed execution should be retried.
    ///
    /// `attempts_made` counts completed executions, including the one that
    /// just failed.
    pub fn should_retry(&self, error: &FlushError, attempts_made: i64) -> bool {
        error.is_retryable() && attempts_made < self.max_attempts as i64
    }

    /// Backoff duration after `attempts_made` failed executions:
    /// `base * 2^(attempts_made - 1)`.
    pub fn backoff(&self, attempts_made: i64) -> Duration {
        let exponent = (attempts_made - 1).clamp(0, 30) as u32;
        self.backoff_base.saturating_mul(1u32 << exponent)
    }

    /// Epoch millis at which the next attempt becomes due.
    pub fn next_retry_at(&self, attempts_made: i64) -> i64 {
        chrono::Utc::now().timestamp_millis() + self.backoff(attempts_made).as_millis() as i64
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(2000),
        }
    }
}
