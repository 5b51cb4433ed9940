//! Testing utilities for the Papermill workspace
//!
//! Scripted backends that record every call, plus item and config fixtures.

#![allow(missing_docs)]

use async_trait::async_trait;
use papermill_core::{
    AcquiredDocument, Analysis, AnalysisRequest, Analyzer, ConvertedText, Discovery, DocumentConverter,
    DocumentSource, PipelineConfig, StageLimits,
};
use papermill_resilience::{BackendError, Named, RetryPolicy};
use papermill_types::{DocumentRef, ExtractionTarget, ExtractionTargetSet, Item, ItemMetadata};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Scripted reply of a fake backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Transient,
    Permanent,
    RateLimited,
}

impl Reply {
    fn into_result(self, backend: &str, key: &str) -> Result<(), BackendError> {
        match self {
            Self::Ok => Ok(()),
            Self::Transient => Err(BackendError::transient(format!("{backend}: timeout on {key}"))),
            Self::Permanent => Err(BackendError::permanent(format!("{backend}: rejected {key}"))),
            Self::RateLimited => Err(BackendError::rate_limited(format!("{backend}: 429 on {key}"), None)),
        }
    }
}

#[derive(Debug)]
struct ScriptState {
    default: Reply,
    per_key: HashMap<String, VecDeque<Reply>>,
    calls: Vec<String>,
    in_flight: usize,
    max_in_flight: usize,
}

/// Call log and reply script shared by the fake backends
#[derive(Debug)]
pub struct Script {
    state: Mutex<ScriptState>,
    delay: Option<Duration>,
}

struct InFlight<'a>(&'a Script);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.state.lock().in_flight -= 1;
    }
}

impl Script {
    fn new() -> Self {
        Self {
            state: Mutex::new(ScriptState {
                default: Reply::Ok,
                per_key: HashMap::new(),
                calls: Vec::new(),
                in_flight: 0,
                max_in_flight: 0,
            }),
            delay: None,
        }
    }

    async fn enter(&self, backend: &str, key: &str) -> Result<(), BackendError> {
        let reply = {
            let mut state = self.state.lock();
            state.calls.push(key.to_string());
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            let default = state.default;
            state
                .per_key
                .get_mut(key)
                .and_then(VecDeque::pop_front)
                .unwrap_or(default)
        };
        let _in_flight = InFlight(self);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        reply.into_result(backend, key)
    }

    /// Keys of every call, in call order
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    pub fn calls_for(&self, key: &str) -> usize {
        self.state.lock().calls.iter().filter(|k| *k == key).count()
    }

    /// Highest number of concurrent calls observed
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().max_in_flight
    }
}

macro_rules! scripted {
    ($ty:ident) => {
        impl $ty {
            /// Reply for every call without a per-key script
            #[must_use]
            pub fn replying(mut self, reply: Reply) -> Self {
                self.script.state.get_mut().default = reply;
                self
            }

            /// Queue replies for `key`; once used up the default applies
            #[must_use]
            pub fn script(mut self, key: &str, replies: impl IntoIterator<Item = Reply>) -> Self {
                self.script
                    .state
                    .get_mut()
                    .per_key
                    .entry(key.to_string())
                    .or_default()
                    .extend(replies);
                self
            }

            /// Sleep this long inside every call
            #[must_use]
            pub fn with_delay(mut self, delay: Duration) -> Self {
                self.script.delay = Some(delay);
                self
            }

            pub fn log(&self) -> &Script {
                &self.script
            }
        }

        impl Named for $ty {
            fn name(&self) -> &str {
                &self.name
            }
        }
    };
}

/// Analyzer answering every target with a string derived from the item key
#[derive(Debug)]
pub struct ScriptedAnalyzer {
    name: String,
    script: Script,
    cost_usd: f64,
    seen_text: Mutex<Vec<bool>>,
}

impl ScriptedAnalyzer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: Script::new(),
            cost_usd: 0.0,
            seen_text: Mutex::new(Vec::new()),
        }
    }

    /// Cost reported by each successful call
    #[must_use]
    pub fn costing(mut self, usd: f64) -> Self {
        self.cost_usd = usd;
        self
    }

    /// Whether each call received converted text, in call order
    pub fn saw_text(&self) -> Vec<bool> {
        self.seen_text.lock().clone()
    }
}

scripted!(ScriptedAnalyzer);

#[async_trait]
impl Analyzer for ScriptedAnalyzer {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<Analysis, BackendError> {
        self.seen_text.lock().push(request.text.is_some());
        let key = request.item.as_str();
        self.script.enter(&self.name, key).await?;
        let results = request
            .targets
            .iter()
            .map(|t| (t.name.clone(), serde_json::json!(format!("{} of {key}", t.name))))
            .collect();
        Ok(Analysis {
            results,
            tokens_used: 100,
            cost_usd: self.cost_usd,
        })
    }
}

/// Converter keyed by the document's canonical form
#[derive(Debug)]
pub struct ScriptedConverter {
    name: String,
    script: Script,
}

impl ScriptedConverter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: Script::new(),
        }
    }
}

scripted!(ScriptedConverter);

#[async_trait]
impl DocumentConverter for ScriptedConverter {
    async fn convert(&self, document: &AcquiredDocument) -> Result<ConvertedText, BackendError> {
        let key = document.source.canonical();
        self.script.enter(&self.name, &key).await?;
        Ok(ConvertedText {
            text: format!("converted {key} by {}", self.name),
            quality_score: 0.9,
        })
    }
}

/// Document source keyed by the item key
#[derive(Debug)]
pub struct RecordingSource {
    name: String,
    script: Script,
}

impl RecordingSource {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: Script::new(),
        }
    }
}

scripted!(RecordingSource);

#[async_trait]
impl DocumentSource for RecordingSource {
    async fn acquire(&self, item: &Item, document: &DocumentRef) -> Result<AcquiredDocument, BackendError> {
        let key = item
            .key()
            .map_err(|err| BackendError::permanent(err.to_string()))?;
        self.script.enter(&self.name, key.as_str()).await?;
        Ok(AcquiredDocument {
            source: document.clone(),
            local_path: PathBuf::from(format!("/tmp/{}.pdf", key.as_str().replace(['/', ':'], "_"))),
            content_type: Some("application/pdf".into()),
            size_bytes: 1024,
        })
    }
}

/// Discovery source returning a fixed list, keyed by query
#[derive(Debug)]
pub struct StaticDiscovery {
    name: String,
    script: Script,
    items: Vec<Item>,
}

impl StaticDiscovery {
    pub fn new(name: &str, items: Vec<Item>) -> Self {
        Self {
            name: name.to_string(),
            script: Script::new(),
            items,
        }
    }
}

scripted!(StaticDiscovery);

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn search(&self, query: &str) -> Result<Vec<Item>, BackendError> {
        self.script.enter(&self.name, query).await?;
        Ok(self.items.clone())
    }
}

/// Item identified by DOI
pub fn doi_item(doi: &str, title: &str) -> Item {
    Item::new(ItemMetadata::titled(title)).with_doi(doi)
}

/// Item identified by DOI with an open-access URL
pub fn doc_item(doi: &str, title: &str) -> Item {
    doi_item(doi, title).with_document(DocumentRef::Url(format!("https://papers.example/{doi}.pdf")))
}

/// Item with only a title
pub fn title_item(title: &str) -> Item {
    Item::new(ItemMetadata::titled(title))
}

/// Item key of a DOI item
pub fn doi_key(doi: &str) -> String {
    format!("doi:{doi}")
}

/// Target set from `(name, instruction)` pairs
pub fn targets(pairs: &[(&str, &str)]) -> ExtractionTargetSet {
    pairs
        .iter()
        .map(|(name, instruction)| ExtractionTarget::new(*name, *instruction))
        .collect()
}

/// Config rooted at `dir` with no retry delays
pub fn test_config(dir: &Path) -> PipelineConfig {
    PipelineConfig::new()
        .with_data_dir(dir)
        .with_retry(RetryPolicy::none())
        .with_stages(StageLimits {
            acquire: 2,
            convert: 2,
            analyze: 2,
        })
        .with_shutdown_grace(Duration::from_secs(1))
}
