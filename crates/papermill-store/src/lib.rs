//! Papermill Store
//!
//! Durable state of the ingestion pipeline, all under one data directory:
//!
//! ```text
//! <data_dir>/
//!   registry/entries/<entry_id>.json
//!   checkpoints/<run_id>.json
//!   cache/<namespace>/<key>.json
//! ```
//!
//! Every record is JSON written through a temp file and an atomic rename.

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod atomic;
pub mod cache;
pub mod checkpoint;
pub mod classify;
pub mod error;
pub mod registry;

pub use cache::{CacheConfig, CacheKey, CacheStats, CacheStore, CacheTtls, Namespace, NamespaceStats, SweepStats};
pub use checkpoint::{Checkpoint, CheckpointStore, RunSummary};
pub use classify::{decide, Action, Classification, MatchKind};
pub use error::{Result, StoreError};
pub use registry::{Registry, RegistryConfig, RegistryEntry, RegistryStats};

use std::path::{Path, PathBuf};

/// Standard locations below a data directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    /// Layout rooted at `root`
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Data directory
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Registry entry records
    #[must_use]
    pub fn registry_entries(&self) -> PathBuf {
        self.root.join("registry").join("entries")
    }

    /// Checkpoint records
    #[must_use]
    pub fn checkpoints(&self) -> PathBuf {
        self.root.join("checkpoints")
    }

    /// Cache namespaces
    #[must_use]
    pub fn cache(&self) -> PathBuf {
        self.root.join("cache")
    }
}
