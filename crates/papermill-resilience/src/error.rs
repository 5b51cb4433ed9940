//! Error taxonomy for calls to external collaborators
//!
//! Every backend failure is classified by [`FailureKind`]:
//! - `Transient`: retried, then counted toward the circuit breaker
//! - `Permanent`: surfaced immediately, breaker untouched
//! - `ResourceExhausted`: budget/quota signal, breaker untouched
//! - `StateCorruption`: a local record was unreadable; callers treat it as absent

use std::fmt::{self, Display, Formatter};
use std::time::Duration;

/// Failure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Timeouts, 5xx, rate limits
    Transient,
    /// Validation failures, malformed input, unsupported formats
    Permanent,
    /// Cost or quota limit reached
    ResourceExhausted,
    /// Malformed durable record
    StateCorruption,
}

impl FailureKind {
    /// Stable lowercase label, used in logs and metrics
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::ResourceExhausted => "resource_exhausted",
            Self::StateCorruption => "state_corruption",
        }
    }
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a backend
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind} failure: {message}")]
pub struct BackendError {
    /// Classification
    pub kind: FailureKind,
    /// Human-readable detail
    pub message: String,
    /// Server-provided wait hint (e.g. `Retry-After`)
    pub retry_after: Option<Duration>,
}

impl BackendError {
    /// Create an error of the given kind
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Transient failure
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    /// Rate limit with an optional wait hint
    #[must_use]
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::transient(message)
        }
    }

    /// Permanent failure
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Permanent, message)
    }

    /// Budget or quota exhausted
    #[must_use]
    pub fn exhausted(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ResourceExhausted, message)
    }

    /// Check if the failure should be retried
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind == FailureKind::Transient
    }

    /// Check if the failure moves a circuit breaker toward open
    #[inline]
    #[must_use]
    pub fn counts_toward_breaker(&self) -> bool {
        self.is_transient()
    }
}

/// What happened when the fallback coordinator tried one provider
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// The provider was called and failed
    Failed(BackendError),
    /// The provider's breaker rejected the call
    BreakerOpen,
    /// The provider was passed over for a low recent success rate
    SkippedUnhealthy,
}

/// One entry in the fallback attempt log
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderAttempt {
    /// Provider name
    pub provider: String,
    /// Outcome
    pub outcome: AttemptOutcome,
}

impl Display for ProviderAttempt {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            AttemptOutcome::Failed(err) => write!(f, "{}: {err}", self.provider),
            AttemptOutcome::BreakerOpen => write!(f, "{}: circuit open", self.provider),
            AttemptOutcome::SkippedUnhealthy => write!(f, "{}: skipped (unhealthy)", self.provider),
        }
    }
}

fn summarize(attempts: &[ProviderAttempt]) -> String {
    if attempts.is_empty() {
        return "no providers configured".to_string();
    }
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors surfaced by the resilience layer
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResilienceError {
    /// The dependency failed (after retries, if transient)
    #[error("{dependency}: {source}")]
    Backend {
        /// Dependency id
        dependency: String,
        /// Final backend failure
        #[source]
        source: BackendError,
    },

    /// Call rejected without reaching the dependency
    #[error("circuit open for {dependency}")]
    BreakerOpen {
        /// Dependency id
        dependency: String,
    },

    /// Every provider in a fallback chain failed or was unavailable
    #[error("all providers failed: {}", summarize(.attempts))]
    AllProvidersFailed {
        /// Per-provider attempt log, in the order tried
        attempts: Vec<ProviderAttempt>,
    },

    /// The configured cost budget is spent
    #[error("cost budget exhausted: spent {spent_usd:.4} of {limit_usd:.4} USD")]
    BudgetExhausted {
        /// Spent so far
        spent_usd: f64,
        /// Configured limit
        limit_usd: f64,
    },
}

impl ResilienceError {
    /// Classify this error
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Backend { source, .. } => source.kind,
            Self::BreakerOpen { .. } => FailureKind::Transient,
            Self::AllProvidersFailed { attempts } => {
                let all_permanent = !attempts.is_empty()
                    && attempts.iter().all(|a| {
                        matches!(&a.outcome, AttemptOutcome::Failed(e) if e.kind == FailureKind::Permanent)
                    });
                if all_permanent {
                    FailureKind::Permanent
                } else {
                    FailureKind::Transient
                }
            }
            Self::BudgetExhausted { .. } => FailureKind::ResourceExhausted,
        }
    }

    /// Check if a later attempt could succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind() == FailureKind::Transient
    }

    /// Check if this is the resource-exhaustion signal
    #[inline]
    #[must_use]
    pub fn is_budget_exhausted(&self) -> bool {
        matches!(self, Self::BudgetExhausted { .. })
    }
}
