//! Exponential backoff policy and a generic retry helper.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Retry budget and backoff curve.
///
/// Attempt `n` (1-based retry number) waits `base_delay_ms * 2^(n-1)`,
/// capped at `max_delay_ms`. With `jitter` the wait is drawn uniformly
/// from the upper half of that interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 200,
            max_delay_ms: 10_000,
            jitter: false,
        }
    }
}

impl RetryConfig {
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms.max(self.base_delay_ms));

        if self.jitter && ms > 1 {
            let low = ms / 2;
            Duration::from_millis(rand::rng().random_range(low..=ms))
        } else {
            Duration::from_millis(ms)
        }
    }
}

/// Errors that know whether another attempt could succeed.
pub trait RetryableError {
    fn is_retryable(&self) -> bool;
}

impl RetryableError for crate::error::A2aError {
    fn is_retryable(&self) -> bool {
        crate::error::A2aError::is_retryable(self)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// retry budget is spent.
pub async fn retry<T, E, F, Fut>(config: &RetryConfig, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + Display,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(attempt, "Operation recovered after retries");
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                attempt += 1;
                let delay = config.delay_for(attempt);
                tracing::warn!(
                    attempt,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying: {}",
                    e
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
