//! Papermill Resilience
//!
//! Wrappers for calls to external collaborators:
//! - [`retry`]: exponential backoff with jitter for transient failures
//! - [`CircuitBreaker`] / [`BreakerRegistry`]: fail fast on a dependency
//!   that keeps failing
//! - [`ResilientCaller`]: both, for a single named dependency
//! - [`FallbackCoordinator`]: ordered fallback across interchangeable
//!   backends with health tracking and an optional [`CostBudget`]

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod breaker;
pub mod budget;
pub mod caller;
pub mod error;
pub mod fallback;
pub mod health;
pub mod retry;

pub use breaker::{BreakerConfig, BreakerPermit, BreakerRegistry, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use budget::CostBudget;
pub use caller::ResilientCaller;
pub use error::{AttemptOutcome, BackendError, FailureKind, ProviderAttempt, ResilienceError};
pub use fallback::{FallbackCoordinator, FallbackOutcome, Metered, Named, ProviderUsage};
pub use health::{HealthPolicy, HealthWindow};
pub use retry::{retry, RetryPolicy};
