//! Per-dependency circuit breaker
//!
//! State machine:
//! - `Closed`: calls pass; consecutive transient failures are counted
//! - `Open`: calls are rejected until `reset_timeout` has elapsed
//! - `HalfOpen`: exactly one trial call is admitted; its outcome decides
//!   whether the breaker closes or re-opens
//!
//! Permanent failures leave the state untouched.

use crate::error::{BackendError, ResilienceError};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Breaker thresholds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// Seconds spent open before a trial call is admitted
    pub reset_timeout_secs: u64,
}

impl BreakerConfig {
    /// Reset timeout as a duration
    #[inline]
    #[must_use]
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_secs: 60,
        }
    }
}

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls are rejected
    Open,
    /// One trial call is admitted
    HalfOpen,
}

impl CircuitState {
    /// Stable lowercase label
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl Display for CircuitState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    /// Dependency id
    pub dependency: String,
    /// Current state
    pub state: CircuitState,
    /// Consecutive transient failures
    pub consecutive_failures: u32,
    /// Wall-clock time of the last counted failure
    pub last_failure: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    last_failure: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

impl Inner {
    fn refresh(&mut self, reset_timeout: Duration) {
        if self.state == CircuitState::Open {
            if let Some(opened_at) = self.opened_at {
                if opened_at.elapsed() >= reset_timeout {
                    self.state = CircuitState::HalfOpen;
                    self.trial_in_flight = false;
                }
            }
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.trial_in_flight = false;
    }
}

/// Circuit breaker guarding one dependency
#[derive(Debug)]
pub struct CircuitBreaker {
    dependency: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a closed breaker
    #[must_use]
    pub fn new(dependency: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            dependency: dependency.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                last_failure: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Dependency id
    #[inline]
    #[must_use]
    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    /// Current state, moving `Open` to `HalfOpen` once the timeout elapsed
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        inner.refresh(self.config.reset_timeout());
        inner.state
    }

    /// Snapshot for reporting
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.inner.lock();
        inner.refresh(self.config.reset_timeout());
        BreakerSnapshot {
            dependency: self.dependency.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure: inner.last_failure,
        }
    }

    /// Ask to make one call.
    ///
    /// # Errors
    /// `BreakerOpen` while open, or while a half-open trial is in flight.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>, ResilienceError> {
        let mut inner = self.inner.lock();
        inner.refresh(self.config.reset_timeout());
        match inner.state {
            CircuitState::Closed => Ok(BreakerPermit {
                breaker: self,
                trial: false,
                settled: false,
            }),
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                tracing::debug!(dependency = %self.dependency, "Admitting half-open trial call");
                Ok(BreakerPermit {
                    breaker: self,
                    trial: true,
                    settled: false,
                })
            }
            CircuitState::HalfOpen | CircuitState::Open => Err(ResilienceError::BreakerOpen {
                dependency: self.dependency.clone(),
            }),
        }
    }

    /// Admit, run `operation`, and record its outcome.
    ///
    /// # Errors
    /// `BreakerOpen` without calling, or the operation's failure.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let permit = self.try_acquire()?;
        match operation().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(source) => {
                permit.failure(&source);
                Err(ResilienceError::Backend {
                    dependency: self.dependency.clone(),
                    source,
                })
            }
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen if trial => {
                tracing::info!(dependency = %self.dependency, "Trial call succeeded, closing breaker");
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.trial_in_flight = false;
            }
            // Admitted before the breaker opened; only a trial may close it.
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn on_failure(&self, trial: bool, err: &BackendError) {
        let mut inner = self.inner.lock();
        if trial {
            inner.trial_in_flight = false;
        }
        if !err.counts_toward_breaker() {
            return;
        }

        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(Utc::now());

        let reopen = trial && inner.state == CircuitState::HalfOpen;
        let trip = inner.state == CircuitState::Closed
            && inner.consecutive_failures >= self.config.failure_threshold;
        if reopen || trip {
            inner.open();
            tracing::warn!(
                dependency = %self.dependency,
                failures = inner.consecutive_failures,
                reset_timeout_secs = self.config.reset_timeout_secs,
                "Circuit breaker opened"
            );
        }
    }

    fn release_trial(&self) {
        self.inner.lock().trial_in_flight = false;
    }
}

/// Admission ticket for one call.
///
/// Dropping a permit without recording an outcome (e.g. the call was
/// cancelled) frees the half-open trial slot without changing state.
#[derive(Debug)]
#[must_use = "record the call outcome with success() or failure()"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl BreakerPermit<'_> {
    /// True if this is the half-open trial call
    #[inline]
    #[must_use]
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Record a successful call
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    /// Record a failed call
    pub fn failure(mut self, err: &BackendError) {
        self.settled = true;
        self.breaker.on_failure(self.trial, err);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial();
        }
    }
}

/// Independent breakers keyed by dependency id
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    /// Create a registry handing out breakers with `config`
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Breaker for `dependency`, created on first use
    #[must_use]
    pub fn get(&self, dependency: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(dependency) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .breakers
            .entry(dependency.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(dependency, self.config.clone())));
        Arc::clone(entry.value())
    }

    /// Snapshots of every breaker created so far, sorted by dependency
    #[must_use]
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut all: Vec<BreakerSnapshot> =
            self.breakers.iter().map(|b| b.value().snapshot()).collect();
        all.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        all
    }
}
