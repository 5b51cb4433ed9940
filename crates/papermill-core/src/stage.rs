//! Capability traits implemented by pluggable backends
//!
//! Each backend reports a stable [`Named::name`], used as its dependency id
//! for circuit breakers, logs and metrics.

use async_trait::async_trait;
use papermill_resilience::{BackendError, Metered, Named};
use papermill_types::{DocumentRef, ExtractionTargetSet, Item, ItemKey, ItemMetadata};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;

/// Pipeline stage, used for permits, timings and error attribution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Identifier and classification checks
    Intake,
    /// Document download / resolution
    Acquire,
    /// Document to text
    Convert,
    /// Extraction
    Analyze,
    /// Checkpoint and registry writes
    Commit,
}

impl Stage {
    /// Stable lowercase label
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intake => "intake",
            Self::Acquire => "acquire",
            Self::Convert => "convert",
            Self::Analyze => "analyze",
            Self::Commit => "commit",
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A document resolved to local content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquiredDocument {
    /// Where it came from
    pub source: DocumentRef,
    /// Local copy
    pub local_path: PathBuf,
    /// MIME type, if known
    pub content_type: Option<String>,
    /// Size of the local copy
    pub size_bytes: u64,
}

/// Text extracted from a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvertedText {
    /// Plain or markdown text
    pub text: String,
    /// Converter's own confidence in `[0, 1]`
    pub quality_score: f64,
}

impl Metered for ConvertedText {}

/// Input to an analysis backend
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisRequest {
    /// Item key
    pub item: ItemKey,
    /// Item metadata
    pub metadata: ItemMetadata,
    /// Converted document text; `None` when only metadata is available
    pub text: Option<ConvertedText>,
    /// What to extract
    pub targets: ExtractionTargetSet,
}

/// Output of an analysis backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    /// One value per extraction target name
    pub results: BTreeMap<String, serde_json::Value>,
    /// Tokens consumed
    pub tokens_used: u64,
    /// Cost in USD
    pub cost_usd: f64,
}

impl Metered for Analysis {
    fn tokens_used(&self) -> u64 {
        self.tokens_used
    }

    fn cost_usd(&self) -> f64 {
        self.cost_usd
    }
}

/// Catalog search
#[async_trait]
pub trait Discovery: Named + Send + Sync {
    /// Candidate items for `query`
    async fn search(&self, query: &str) -> Result<Vec<Item>, BackendError>;
}

/// Acquire stage backend
#[async_trait]
pub trait DocumentSource: Named + Send + Sync {
    /// Download or resolve `document` for `item`
    async fn acquire(&self, item: &Item, document: &DocumentRef) -> Result<AcquiredDocument, BackendError>;
}

/// Convert stage backend
#[async_trait]
pub trait DocumentConverter: Named + Send + Sync {
    /// Extract text from an acquired document
    async fn convert(&self, document: &AcquiredDocument) -> Result<ConvertedText, BackendError>;
}

/// Analyze stage backend
#[async_trait]
pub trait Analyzer: Named + Send + Sync {
    /// Run the extraction targets over an item
    async fn analyze(&self, request: &AnalysisRequest) -> Result<Analysis, BackendError>;
}
