//! Retry scheduling.

use std::time::Duration;

use crate::config::SyncConfig;

/// How often and how patiently failed operations are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before an operation is marked failed.
    pub max_retries: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl RetryPolicy {
    /// Build the policy from the `sync` configuration section.
    #[must_use]
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Delay before attempt `attempt + 1`, after `attempt` failures.
    ///
    /// `base * 2^(attempt - 1)`, capped at `max_delay`. Attempt 0 has no delay.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Whether an operation that has failed `retry_count` times is done for.
    #[must_use]
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }
}
