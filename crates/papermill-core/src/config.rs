//! Pipeline configuration
//!
//! Every field has a default, so an empty TOML document is a valid config:
//!
//! ```toml
//! data_dir = "/var/lib/papermill"
//! budget_usd = 25.0
//!
//! [stages]
//! acquire = 5
//! convert = 3
//! analyze = 2
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 500
//! ```

use papermill_resilience::{BreakerConfig, HealthPolicy, RetryPolicy};
use papermill_store::{CacheConfig, RegistryConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("cannot read config {}: {source}", path.display())]
    Io {
        /// Config path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Not valid TOML for this schema
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Could not render as TOML
    #[error("cannot render config: {0}")]
    Render(#[from] toml::ser::Error),

    /// Parsed, but a value is out of range
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// What is wrong
        reason: String,
    },
}

/// Per-stage concurrency ceilings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageLimits {
    /// Concurrent acquire calls
    pub acquire: usize,
    /// Concurrent convert calls
    pub convert: usize,
    /// Concurrent analyze calls
    pub analyze: usize,
}

impl StageLimits {
    /// Sum of all ceilings
    #[inline]
    #[must_use]
    pub fn total(&self) -> usize {
        self.acquire + self.convert + self.analyze
    }
}

impl Default for StageLimits {
    fn default() -> Self {
        Self {
            acquire: 5,
            convert: 3,
            analyze: 2,
        }
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root of registry, checkpoints and cache
    pub data_dir: PathBuf,
    /// Stage ceilings
    pub stages: StageLimits,
    /// Bounded work queue capacity
    pub queue_capacity: usize,
    /// Worker tasks; defaults to the sum of the stage ceilings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
    /// Retry policy for external calls
    pub retry: RetryPolicy,
    /// Circuit breaker thresholds
    pub breaker: BreakerConfig,
    /// Provider health window
    pub health: HealthPolicy,
    /// Result cache
    pub cache: CacheConfig,
    /// Identity registry
    pub registry: RegistryConfig,
    /// Analysis spend ceiling in USD
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_usd: Option<f64>,
    /// Time in-flight work may take to finish after cancellation
    pub shutdown_grace_secs: u64,
}

impl PipelineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With data directory
    #[inline]
    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// With stage ceilings
    #[inline]
    #[must_use]
    pub fn with_stages(mut self, stages: StageLimits) -> Self {
        self.stages = stages;
        self
    }

    /// With worker count
    #[inline]
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// With retry policy
    #[inline]
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// With breaker thresholds
    #[inline]
    #[must_use]
    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// With cost budget
    #[inline]
    #[must_use]
    pub fn with_budget(mut self, usd: f64) -> Self {
        self.budget_usd = Some(usd);
        self
    }

    /// With shutdown grace period
    #[inline]
    #[must_use]
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_secs = grace.as_secs();
        self
    }

    /// Worker tasks to spawn
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        self.workers.unwrap_or_else(|| self.stages.total()).max(1)
    }

    /// Grace period as a duration
    #[inline]
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Parse from TOML.
    ///
    /// # Errors
    /// Syntax or schema error.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Read and parse a TOML file.
    ///
    /// # Errors
    /// Unreadable file, or syntax or schema error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Render as TOML.
    ///
    /// # Errors
    /// Serializer failure.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check value ranges.
    ///
    /// # Errors
    /// The first out-of-range field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.into(),
            }
        }

        for (field, limit) in [
            ("stages.acquire", self.stages.acquire),
            ("stages.convert", self.stages.convert),
            ("stages.analyze", self.stages.analyze),
        ] {
            if limit == 0 {
                return Err(invalid(field, "must be at least 1"));
            }
        }
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity", "must be at least 1"));
        }
        if self.workers == Some(0) {
            return Err(invalid("workers", "must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            return Err(invalid("retry.jitter_ratio", "must be within [0, 1]"));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(invalid("breaker.failure_threshold", "must be at least 1"));
        }
        let threshold = self.registry.title_similarity_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(invalid("registry.title_similarity_threshold", "must be within (0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.health.min_success_rate) {
            return Err(invalid("health.min_success_rate", "must be within [0, 1]"));
        }
        if self.health.window == 0 {
            return Err(invalid("health.window", "must be at least 1"));
        }
        if let Some(budget) = self.budget_usd {
            if !budget.is_finite() || budget < 0.0 {
                return Err(invalid("budget_usd", "must be a non-negative amount"));
            }
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("papermill-data"),
            stages: StageLimits::default(),
            queue_capacity: 100,
            workers: None,
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
            health: HealthPolicy::default(),
            cache: CacheConfig::default(),
            registry: RegistryConfig::default(),
            budget_usd: None,
            shutdown_grace_secs: 30,
        }
    }
}
