//! Retry with exponential backoff and jitter

use crate::error::BackendError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Retry policy for transient failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first call
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Upper bound for the un-jittered delay
    pub max_delay_ms: u64,
    /// Random jitter added on top of the delay, as a fraction of it
    pub jitter_ratio: f64,
}

impl RetryPolicy {
    /// Policy that never retries
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// With max attempts
    #[inline]
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// With base delay
    #[inline]
    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Backoff before retry number `retry` (0-based), without jitter:
    /// `base * 2^retry`, capped at `max_delay_ms`.
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry);
        let delay_ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }

    /// Backoff plus uniform jitter in `[0, jitter_ratio * backoff]`
    #[must_use]
    pub fn jittered_backoff(&self, retry: u32) -> Duration {
        let delay = self.backoff(retry);
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        if ratio == 0.0 || delay.is_zero() {
            return delay;
        }
        let jitter = rand::rng().random_range(0.0..=ratio);
        delay + delay.mul_f64(jitter)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter_ratio: 0.2,
        }
    }
}

/// Run `operation` until it succeeds, fails non-transiently, or the policy
/// runs out of attempts.
///
/// `operation` receives the 0-based attempt number. A server-provided
/// `retry_after` hint replaces the computed backoff (still capped at
/// `max_delay_ms`).
///
/// # Errors
/// The last failure once retries are exhausted, or the first non-transient one.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    dependency: &str,
    mut operation: F,
) -> Result<T, BackendError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let attempts = policy.attempts();
    let mut attempt = 0u32;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < attempts => {
                let delay = match err.retry_after {
                    Some(hint) => hint.min(Duration::from_millis(policy.max_delay_ms)),
                    None => policy.jittered_backoff(attempt),
                };
                tracing::warn!(
                    dependency,
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Transient failure, will retry"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
