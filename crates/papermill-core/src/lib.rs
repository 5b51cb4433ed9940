//! Papermill Core
//!
//! Bounded, resumable ingestion of research papers. A batch of [`Item`]s is
//! classified against the identity registry, and the items that need work
//! flow through acquire, convert and analyze with per-stage concurrency
//! limits, retry, circuit breaking and provider fallback. Completed items
//! are checkpointed per run so an interrupted run resumes where it stopped.
//!
//! ```no_run
//! # use papermill_core::{Pipeline, PipelineConfig, Analyzer};
//! # use papermill_types::{ExtractionTarget, ExtractionTargetSet, Grouping, Item};
//! # use std::sync::Arc;
//! # async fn run(analyzer: Arc<dyn Analyzer>, items: Vec<Item>) -> Result<(), Box<dyn std::error::Error>> {
//! let pipeline = Pipeline::builder(PipelineConfig::default())
//!     .with_analyzer(analyzer)
//!     .build()
//!     .await?;
//! let targets = ExtractionTargetSet::new().with_target(ExtractionTarget::new("method", "Main method"));
//! let run = pipeline.process(items, targets, "run-1", Grouping::new("nlp")).await?;
//! let (_results, report) = run.collect().await;
//! println!("{} completed, {} failed", report.completed, report.failed);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod config;
pub mod error;
pub mod pipeline;
pub mod result;
pub mod stage;

pub use config::{ConfigError, PipelineConfig, StageLimits};
pub use error::{PipelineError, StageError};
pub use pipeline::{CancelHandle, Discovered, Pipeline, PipelineBuilder, PipelineRun};
pub use result::{ItemResult, ItemStatus, RunReport, StageTimings};
pub use stage::{
    AcquiredDocument, Analysis, AnalysisRequest, Analyzer, ConvertedText, Discovery, DocumentConverter,
    DocumentSource, Stage,
};

pub use papermill_types::Item;
