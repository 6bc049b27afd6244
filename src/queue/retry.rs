//! Pluggable retry policy.
//!
//! The queue asks the policy two things: may this failure be retried, and
//! how long to wait before the retried job re-enters the queue. The default
//! keeps the tail-requeue behavior with no delay; swapping in exponential
//! backoff is a field change, not a queue change.

use std::time::Duration;

use crate::pipeline::PipelineError;

/// Retry policy for failed pipeline runs
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first try)
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds
    pub initial_delay_ms: u64,

    /// Cap on the delay between retries, in milliseconds
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay grows by this factor per retry)
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 0,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Default policy with a different attempt cap
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Delay before the given retry (1-indexed by failed attempts so far)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Whether a job with `attempts` failures so far may be requeued after
    /// this error. Permanent errors are never retried.
    pub fn should_retry(&self, attempts: u32, error: &PipelineError) -> bool {
        error.is_retryable() && attempts < self.max_attempts
    }
}
