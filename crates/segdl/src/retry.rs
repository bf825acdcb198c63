// Retry policy: decides whether a failed fetch attempt gets another try, and how long to wait.
//
// Exponential backoff with optional jitter and a hard delay cap. One policy instance is
// attached to each segment task and shared by all of that task's phases.

use std::sync::Arc;
use std::time::Duration;

use rand::RngExt;

use crate::error::DownloadError;
use crate::progress::Phase;

/// Configuration for the default backoff policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the initial attempt).
    pub max_retries: u32,
    /// Base delay between retries. Actual delay = base * 2^attempt + jitter.
    pub base_delay: Duration,
    /// Hard cap on the computed delay.
    pub max_delay: Duration,
    /// When true, adds random jitter of [0, base_delay/2).
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Compute the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // 2^attempt with a checked shift so attempts >= 32 saturate.
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let exp_delay = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay);
        let capped = exp_delay.min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        // Jitter never pushes the final delay past `max_delay`.
        let jitter_range_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        if jitter_range_ms == 0 {
            return capped;
        }

        let remaining_ms =
            u64::try_from(self.max_delay.saturating_sub(capped).as_millis()).unwrap_or(0);
        let jitter_limit_ms = jitter_range_ms.min(remaining_ms);
        if jitter_limit_ms == 0 {
            return capped;
        }

        let jitter_ms = rand::rng().random_range(0..jitter_limit_ms);
        (capped + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }

    /// Factory producing a fresh [`BackoffRetry`] per task.
    pub fn factory(&self) -> RetryPolicyFactory {
        let config = self.clone();
        Arc::new(move || Box::new(BackoffRetry::new(config.clone())) as Box<dyn RetryPolicy>)
    }
}

/// What the policy gets to look at when an attempt fails.
#[derive(Debug)]
pub struct AttemptContext<'a> {
    /// Failed attempts so far for this task, including this one (1-based).
    pub attempt: u32,
    pub phase: Phase,
    pub error: &'a DownloadError,
}

/// Decides whether a failed attempt should be retried.
pub trait RetryPolicy: Send + Sync {
    /// Consumes one attempt when it returns `true`.
    fn should_retry(&mut self, ctx: &AttemptContext<'_>) -> bool;

    fn remaining_attempts(&self) -> u32;

    /// Delay before re-entering the failed phase.
    fn backoff(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

pub type RetryPolicyFactory = Arc<dyn Fn() -> Box<dyn RetryPolicy> + Send + Sync>;

/// Default policy: bounded retries of transient errors with exponential backoff.
#[derive(Debug, Clone)]
pub struct BackoffRetry {
    config: RetryConfig,
    used: u32,
}

impl BackoffRetry {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, used: 0 }
    }
}

impl RetryPolicy for BackoffRetry {
    fn should_retry(&mut self, ctx: &AttemptContext<'_>) -> bool {
        if !ctx.error.is_retryable() || self.used >= self.config.max_retries {
            return false;
        }
        self.used += 1;
        true
    }

    fn remaining_attempts(&self) -> u32 {
        self.config.max_retries.saturating_sub(self.used)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.config.delay_for_attempt(attempt.saturating_sub(1))
    }
}
