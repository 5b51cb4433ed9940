//! Error types for the pipeline
//!
//! - [`PipelineError`]: fatal, returned from `process` before any item runs
//! - [`StageError`]: per-item, carried inside a `Failed` result

use crate::config::ConfigError;
use crate::stage::Stage;
use papermill_resilience::{FailureKind, ResilienceError};
use papermill_store::StoreError;
use serde::Serialize;

/// Run-level failures
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A required durable store could not be opened or read
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration rejected
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Pipeline assembled without a required backend
    #[error("no {0} backend configured")]
    MissingBackend(&'static str),
}

/// Why one item failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{stage} failed ({kind}): {message}")]
pub struct StageError {
    /// Stage that failed
    pub stage: Stage,
    /// Failure classification
    #[serde(serialize_with = "serialize_kind")]
    pub kind: FailureKind,
    /// Detail
    pub message: String,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn serialize_kind<S: serde::Serializer>(kind: &FailureKind, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(kind.as_str())
}

impl StageError {
    /// Create a stage error
    #[must_use]
    pub fn new(stage: Stage, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
        }
    }

    /// Attribute a resilience-layer failure to `stage`
    #[must_use]
    pub fn from_resilience(stage: Stage, err: &ResilienceError) -> Self {
        Self::new(stage, err.kind(), err.to_string())
    }

    /// Attribute a store failure to the commit stage
    #[must_use]
    pub fn commit(err: &StoreError) -> Self {
        let kind = if err.is_corrupt() {
            FailureKind::StateCorruption
        } else {
            FailureKind::Transient
        };
        Self::new(Stage::Commit, kind, err.to_string())
    }

    /// Check if a later run could succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, FailureKind::Transient | FailureKind::ResourceExhausted)
    }
}
