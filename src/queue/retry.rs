//! Bounded exponential backoff shared by both queue backends.

use std::time::Duration;

use crate::config::QueueConfig;

/// Retry bounds applied to every job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Handler invocations allowed per job, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base: Duration,
    /// Upper bound on any single delay
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_attempts,
            base,
            cap,
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.max_attempts, config.backoff_base(), config.backoff_cap())
    }

    /// No delay between attempts; used by tests and one-shot drains
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    /// Delay after the `retry`-th failure (zero-based): `min(cap, base * 2^retry)`.
    pub fn backoff(&self, retry: u32) -> Duration {
        // 2^16 seconds is far past any sane cap
        let factor = 2u32.pow(retry.min(16));
        self.base.saturating_mul(factor).min(self.cap)
    }
}
