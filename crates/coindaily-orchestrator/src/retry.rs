use serde::{Deserialize, Serialize};

/// How the delay between retries grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    Exponential,
}

/// Retry behaviour for failed tasks of one type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first failed attempt.
    pub max_retries: u32,
    pub backoff_strategy: BackoffStrategy,
    pub base_delay_ms: u64,
    /// Cap for linear and exponential growth.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, 1_000, 10_000)
    }
}

impl RetryPolicy {
    /// Same delay before every retry.
    pub fn fixed(max_retries: u32, delay_ms: u64) -> Self {
        Self {
            max_retries,
            backoff_strategy: BackoffStrategy::Fixed,
            base_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
        }
    }

    /// Delay grows by `base_delay_ms` per retry, capped at `max_delay_ms`.
    pub fn linear(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            backoff_strategy: BackoffStrategy::Linear,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// Delay doubles per retry, capped at `max_delay_ms`.
    pub fn exponential(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            backoff_strategy: BackoffStrategy::Exponential,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// Delay before a task that has already been retried `retry_count` times
    /// becomes eligible again.
    ///
    /// - fixed: `base`
    /// - linear: `base * (retry_count + 1)`, capped at `max_delay_ms`
    /// - exponential: `base * 2^retry_count`, capped at `max_delay_ms`
    pub fn delay_ms(&self, retry_count: u32) -> u64 {
        match self.backoff_strategy {
            BackoffStrategy::Fixed => self.base_delay_ms,
            BackoffStrategy::Linear => self
                .base_delay_ms
                .saturating_mul(u64::from(retry_count) + 1)
                .min(self.max_delay_ms),
            BackoffStrategy::Exponential => self
                .base_delay_ms
                .saturating_mul(2u64.saturating_pow(retry_count))
                .min(self.max_delay_ms),
        }
    }
}
