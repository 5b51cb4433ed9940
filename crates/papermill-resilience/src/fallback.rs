//! Ordered provider fallback
//!
//! A [`FallbackCoordinator`] owns an ordered list of interchangeable backends
//! for one capability. [`FallbackCoordinator::execute`] walks the list in
//! order, skipping backends whose breaker is open or whose recent success
//! rate is too low, and returns the first success. Backends after the
//! successful one are never invoked.

use crate::breaker::{BreakerRegistry, CircuitBreaker, CircuitState};
use crate::budget::CostBudget;
use crate::error::{AttemptOutcome, BackendError, ProviderAttempt, ResilienceError};
use crate::health::{HealthPolicy, HealthWindow};
use crate::retry::{retry, RetryPolicy};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;

/// A backend with a stable dependency id
pub trait Named {
    /// Name used for breakers, logs and metrics
    fn name(&self) -> &str;
}

/// Usage carried by a successful call
pub trait Metered {
    /// Tokens consumed
    fn tokens_used(&self) -> u64 {
        0
    }

    /// Cost in USD
    fn cost_usd(&self) -> f64 {
        0.0
    }
}

impl Metered for () {}
impl Metered for String {}

/// Per-backend usage counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderUsage {
    /// Backend name
    pub provider: String,
    /// Calls made (a retried call counts once)
    pub calls: u64,
    /// Successful calls
    pub successes: u64,
    /// Failed calls
    pub failures: u64,
    /// Tokens reported by successful calls
    pub tokens: u64,
    /// Cost reported by successful calls
    pub cost_usd: f64,
    /// Time of the last failure
    pub last_failure: Option<DateTime<Utc>>,
    /// Breaker state at report time
    pub breaker: CircuitState,
    /// Success rate over the health window
    pub recent_success_rate: Option<f64>,
}

#[derive(Debug, Default)]
struct Counters {
    calls: u64,
    successes: u64,
    failures: u64,
    tokens: u64,
    cost_usd: f64,
    last_failure: Option<DateTime<Utc>>,
}

struct Slot<B: ?Sized> {
    backend: Arc<B>,
    breaker: Arc<CircuitBreaker>,
    health: Mutex<HealthWindow>,
    counters: Mutex<Counters>,
}

impl<B: ?Sized> Slot<B> {
    fn record_success(&self, tokens: u64, cost_usd: f64) {
        self.health.lock().record(true);
        let mut c = self.counters.lock();
        c.calls += 1;
        c.successes += 1;
        c.tokens += tokens;
        c.cost_usd += cost_usd;
    }

    fn record_failure(&self) {
        self.health.lock().record(false);
        let mut c = self.counters.lock();
        c.calls += 1;
        c.failures += 1;
        c.last_failure = Some(Utc::now());
    }
}

/// The winning call of [`FallbackCoordinator::execute`]
#[derive(Debug, Clone)]
pub struct FallbackOutcome<T> {
    /// Value returned by the backend
    pub value: T,
    /// Name of the backend that produced it
    pub provider: String,
    /// Failed or skipped attempts that preceded it
    pub attempts: Vec<ProviderAttempt>,
}

/// Ordered fallback over backends implementing one capability.
///
/// Generic over the capability trait object (`dyn Analyzer`, ...), not over
/// concrete backend types.
pub struct FallbackCoordinator<B: ?Sized> {
    capability: String,
    slots: Vec<Slot<B>>,
    retry: RetryPolicy,
    health: HealthPolicy,
    budget: Option<Arc<CostBudget>>,
}

impl<B: ?Sized + Named + Send + Sync> FallbackCoordinator<B> {
    /// Empty coordinator for `capability`
    #[must_use]
    pub fn new(capability: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            slots: Vec::new(),
            retry: RetryPolicy::none(),
            health: HealthPolicy::default(),
            budget: None,
        }
    }

    /// Append a backend, taking its breaker from `breakers`
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<B>, breakers: &BreakerRegistry) -> Self {
        let breaker = breakers.get(backend.name());
        self.slots.push(Slot {
            backend,
            breaker,
            health: Mutex::new(HealthWindow::new(self.health.window)),
            counters: Mutex::new(Counters::default()),
        });
        self
    }

    /// Retry policy applied to each backend before falling through
    #[inline]
    #[must_use]
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Health policy; resets the windows of backends already added
    #[must_use]
    pub fn with_health(mut self, policy: HealthPolicy) -> Self {
        for slot in &mut self.slots {
            slot.health = Mutex::new(HealthWindow::new(policy.window));
        }
        self.health = policy;
        self
    }

    /// Shared cost ceiling
    #[inline]
    #[must_use]
    pub fn with_budget(mut self, budget: Arc<CostBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Capability name
    #[inline]
    #[must_use]
    pub fn capability(&self) -> &str {
        &self.capability
    }

    /// Backend names in configured order
    #[must_use]
    pub fn providers(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.backend.name()).collect()
    }

    /// Run `call` against the first backend that succeeds.
    ///
    /// # Errors
    /// - `BudgetExhausted` when the budget is spent, before any backend is called
    /// - `AllProvidersFailed` when every backend failed or was skipped
    #[tracing::instrument(level = "debug", skip_all, fields(capability = %self.capability))]
    pub async fn execute<T, F, Fut>(&self, call: F) -> Result<FallbackOutcome<T>, ResilienceError>
    where
        T: Metered,
        F: Fn(Arc<B>) -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let healthy: Vec<bool> = self
            .slots
            .iter()
            .map(|s| s.health.lock().is_healthy(&self.health))
            .collect();
        let ignore_health = !healthy.iter().any(|h| *h);

        let mut attempts = Vec::new();
        for (slot, healthy) in self.slots.iter().zip(healthy) {
            if let Some(budget) = &self.budget {
                budget.check()?;
            }

            let provider = slot.backend.name();
            if !healthy && !ignore_health {
                tracing::debug!(provider, "Skipping unhealthy provider");
                record_call(provider, "skipped");
                attempts.push(ProviderAttempt {
                    provider: provider.to_string(),
                    outcome: AttemptOutcome::SkippedUnhealthy,
                });
                continue;
            }

            let Ok(permit) = slot.breaker.try_acquire() else {
                tracing::debug!(provider, "Breaker open, trying next provider");
                record_call(provider, "breaker_open");
                attempts.push(ProviderAttempt {
                    provider: provider.to_string(),
                    outcome: AttemptOutcome::BreakerOpen,
                });
                continue;
            };

            let backend = &slot.backend;
            match retry(&self.retry, provider, |_| call(Arc::clone(backend))).await {
                Ok(value) => {
                    permit.success();
                    let (tokens, cost) = (value.tokens_used(), value.cost_usd());
                    slot.record_success(tokens, cost);
                    if let Some(budget) = &self.budget {
                        budget.record(cost);
                    }
                    record_call(provider, "success");
                    if !attempts.is_empty() {
                        tracing::info!(provider, fell_through = attempts.len(), "Fallback provider succeeded");
                    }
                    return Ok(FallbackOutcome {
                        value,
                        provider: provider.to_string(),
                        attempts,
                    });
                }
                Err(err) => {
                    permit.failure(&err);
                    slot.record_failure();
                    record_call(provider, err.kind.as_str());
                    tracing::warn!(provider, error = %err, "Provider failed, trying next");
                    attempts.push(ProviderAttempt {
                        provider: provider.to_string(),
                        outcome: AttemptOutcome::Failed(err),
                    });
                }
            }
        }

        Err(ResilienceError::AllProvidersFailed { attempts })
    }

    /// Usage counters per backend, in configured order
    #[must_use]
    pub fn usage_report(&self) -> Vec<ProviderUsage> {
        self.slots
            .iter()
            .map(|slot| {
                let c = slot.counters.lock();
                ProviderUsage {
                    provider: slot.backend.name().to_string(),
                    calls: c.calls,
                    successes: c.successes,
                    failures: c.failures,
                    tokens: c.tokens,
                    cost_usd: c.cost_usd,
                    last_failure: c.last_failure,
                    breaker: slot.breaker.state(),
                    recent_success_rate: slot.health.lock().success_rate(),
                }
            })
            .collect()
    }
}

impl<B: ?Sized> std::fmt::Debug for FallbackCoordinator<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackCoordinator")
            .field("capability", &self.capability)
            .field("backends", &self.slots.len())
            .field("retry", &self.retry)
            .field("health", &self.health)
            .finish_non_exhaustive()
    }
}

fn record_call(provider: &str, outcome: &'static str) {
    metrics::counter!(
        "papermill_provider_calls_total",
        "provider" => provider.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}
