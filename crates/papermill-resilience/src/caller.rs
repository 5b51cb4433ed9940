//! Breaker admission + retry for a single dependency

use crate::breaker::BreakerRegistry;
use crate::error::{BackendError, ResilienceError};
use crate::retry::{retry, RetryPolicy};
use std::future::Future;
use std::sync::Arc;

/// Wraps calls to named dependencies with a breaker and a retry policy.
///
/// One logical call records exactly one breaker outcome, however many
/// retries it took.
#[derive(Debug, Clone)]
pub struct ResilientCaller {
    retry: RetryPolicy,
    breakers: Arc<BreakerRegistry>,
}

impl ResilientCaller {
    /// Create a caller
    #[must_use]
    pub fn new(retry: RetryPolicy, breakers: Arc<BreakerRegistry>) -> Self {
        Self { retry, breakers }
    }

    /// Retry policy in use
    #[inline]
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Shared breaker registry
    #[inline]
    #[must_use]
    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Call `dependency`.
    ///
    /// # Errors
    /// `BreakerOpen` without calling, or `Backend` with the final failure.
    pub async fn call<T, F, Fut>(&self, dependency: &str, operation: F) -> Result<T, ResilienceError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let breaker = self.breakers.get(dependency);
        let permit = match breaker.try_acquire() {
            Ok(permit) => permit,
            Err(err) => {
                count(dependency, "breaker_open");
                return Err(err);
            }
        };

        match retry(&self.retry, dependency, operation).await {
            Ok(value) => {
                permit.success();
                count(dependency, "success");
                Ok(value)
            }
            Err(source) => {
                permit.failure(&source);
                count(dependency, source.kind.as_str());
                Err(ResilienceError::Backend {
                    dependency: dependency.to_string(),
                    source,
                })
            }
        }
    }
}

fn count(dependency: &str, outcome: &'static str) {
    metrics::counter!(
        "papermill_provider_calls_total",
        "provider" => dependency.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}
