//! TTL-scoped result cache
//!
//! Records live at `<dir>/<namespace>/<key>.json`. A moka hot tier sits in
//! front of the disk records and honours the same expiry. Expired records
//! are deleted lazily on read, or eagerly by [`CacheStore::sweep`].
//!
//! The cache never fails a caller: disk and decode errors are logged and
//! reported as misses.

use crate::atomic::{list_json, read_json, remove, stem, write_json};
use crate::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use moka::future::Cache;
use papermill_types::ContentHash;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Cache namespace, one per kind of expensive call
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    /// Search results
    Discovery,
    /// Acquired and converted documents
    Documents,
    /// Analysis outputs
    Analysis,
}

impl Namespace {
    /// Every namespace
    pub const ALL: [Self; 3] = [Self::Discovery, Self::Documents, Self::Analysis];

    /// Directory name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Documents => "documents",
            Self::Analysis => "analysis",
        }
    }
}

impl Display for Namespace {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Namespace {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|ns| ns.as_str() == s)
            .ok_or_else(|| StoreError::InvalidId(s.to_string()))
    }
}

/// Default time-to-live per namespace, in seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheTtls {
    /// `discovery` (24h)
    pub discovery_secs: u64,
    /// `documents` (7d)
    pub documents_secs: u64,
    /// `analysis` (30d)
    pub analysis_secs: u64,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            discovery_secs: 24 * 60 * 60,
            documents_secs: 7 * 24 * 60 * 60,
            analysis_secs: 30 * 24 * 60 * 60,
        }
    }
}

/// Cache settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// When false every lookup misses and nothing is written
    pub enabled: bool,
    /// Maximum records held in the hot tier
    pub memory_capacity: u64,
    /// Namespace TTLs
    pub ttl: CacheTtls,
}

impl CacheConfig {
    /// Default TTL of `namespace`
    #[must_use]
    pub fn ttl_for(&self, namespace: Namespace) -> Duration {
        Duration::from_secs(match namespace {
            Namespace::Discovery => self.ttl.discovery_secs,
            Namespace::Documents => self.ttl.documents_secs,
            Namespace::Analysis => self.ttl.analysis_secs,
        })
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            memory_capacity: 10_000,
            ttl: CacheTtls::default(),
        }
    }
}

/// Stable key over the semantic inputs of a call
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// blake3 over length-prefixed `parts`
    #[must_use]
    pub fn derive<I, P>(parts: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        Self(ContentHash::from_parts(parts).to_string())
    }

    /// Hex form, also the file stem
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheRecord {
    stored_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    value: serde_json::Value,
}

impl CacheRecord {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Result of [`CacheStore::sweep`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    /// Records examined
    pub scanned: usize,
    /// Expired records deleted
    pub expired: usize,
    /// Undecodable records deleted
    pub corrupt: usize,
}

/// Per-namespace record counts
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamespaceStats {
    /// Namespace
    pub namespace: Namespace,
    /// Live records
    pub live: usize,
    /// Expired records not yet swept
    pub expired: usize,
    /// Bytes on disk
    pub bytes: u64,
}

/// Result of [`CacheStore::stats`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// One entry per namespace
    pub namespaces: Vec<NamespaceStats>,
    /// Approximate records in the hot tier
    pub hot_entries: u64,
}

#[derive(Debug, Clone, Copy)]
enum Lookup {
    Hit,
    Miss,
    Expired,
    Error,
}

impl Lookup {
    fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Expired => "expired",
            Self::Error => "error",
        }
    }
}

/// Multi-namespace cache with disk persistence
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
    config: CacheConfig,
    hot: Cache<(Namespace, CacheKey), Arc<CacheRecord>>,
}

impl CacheStore {
    /// Cache rooted at `dir`; directories are created on first write
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, config: CacheConfig) -> Self {
        let hot = Cache::new(config.memory_capacity);
        Self {
            dir: dir.into(),
            config,
            hot,
        }
    }

    /// Root directory
    #[inline]
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Settings in use
    #[inline]
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn path(&self, namespace: Namespace, key: &CacheKey) -> PathBuf {
        self.dir
            .join(namespace.as_str())
            .join(format!("{}.json", key.as_str()))
    }

    /// Look up a live record
    pub async fn get<T: DeserializeOwned>(&self, namespace: Namespace, key: &CacheKey) -> Option<T> {
        if !self.config.enabled {
            return None;
        }
        let (outcome, value) = self.lookup(namespace, key).await;
        metrics::counter!(
            "papermill_cache_lookups_total",
            "namespace" => namespace.as_str(),
            "outcome" => outcome.as_str()
        )
        .increment(1);

        let value = value?;
        match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                tracing::warn!(%namespace, key = %key, error = %err, "Cached value has unexpected shape");
                None
            }
        }
    }

    async fn lookup(&self, namespace: Namespace, key: &CacheKey) -> (Lookup, Option<serde_json::Value>) {
        let now = Utc::now();
        let hot_key = (namespace, key.clone());
        if let Some(record) = self.hot.get(&hot_key).await {
            if !record.is_expired(now) {
                return (Lookup::Hit, Some(record.value.clone()));
            }
            self.hot.invalidate(&hot_key).await;
        }

        let path = self.path(namespace, key);
        match read_json::<CacheRecord>(&path).await {
            Ok(Some(record)) if !record.is_expired(now) => {
                let value = record.value.clone();
                self.hot.insert(hot_key, Arc::new(record)).await;
                (Lookup::Hit, Some(value))
            }
            Ok(Some(_)) => {
                if let Err(err) = remove(&path).await {
                    tracing::warn!(path = %path.display(), error = %err, "Failed to delete expired cache record");
                }
                (Lookup::Expired, None)
            }
            Ok(None) => (Lookup::Miss, None),
            Err(err) => {
                tracing::warn!(%namespace, key = %key, error = %err, "Cache read failed, treating as miss");
                if err.is_corrupt() {
                    let _ = remove(&path).await;
                }
                (Lookup::Error, None)
            }
        }
    }

    /// Store `value` for `ttl`, overwriting any existing record
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        namespace: Namespace,
        key: &CacheKey,
        value: &T,
        ttl: Duration,
    ) {
        if !self.config.enabled {
            return;
        }
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(%namespace, key = %key, error = %err, "Value not cacheable");
                return;
            }
        };

        let stored_at = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| stored_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let record = CacheRecord {
            stored_at,
            expires_at,
            value,
        };

        let path = self.path(namespace, key);
        if let Err(err) = write_json(&path, &record).await {
            tracing::warn!(%namespace, key = %key, error = %err, "Cache write failed");
            return;
        }
        self.hot.insert((namespace, key.clone()), Arc::new(record)).await;
    }

    /// Store `value` with the namespace's default TTL
    pub async fn set_default<T: Serialize + ?Sized>(&self, namespace: Namespace, key: &CacheKey, value: &T) {
        self.set(namespace, key, value, self.config.ttl_for(namespace)).await;
    }

    /// Delete every expired or undecodable record.
    ///
    /// # Errors
    /// A namespace directory could not be listed or a record not deleted.
    pub async fn sweep(&self) -> Result<SweepStats> {
        let now = Utc::now();
        let mut stats = SweepStats::default();
        for namespace in Namespace::ALL {
            for path in list_json(&self.dir.join(namespace.as_str())).await? {
                stats.scanned += 1;
                let stale = match read_json::<CacheRecord>(&path).await {
                    Ok(Some(record)) if record.is_expired(now) => {
                        stats.expired += 1;
                        true
                    }
                    Ok(_) => false,
                    Err(err) if err.is_corrupt() => {
                        stats.corrupt += 1;
                        true
                    }
                    Err(err) => return Err(err),
                };
                if stale {
                    remove(&path).await?;
                    self.invalidate_hot(namespace, &path).await;
                }
            }
        }
        tracing::info!(
            scanned = stats.scanned,
            expired = stats.expired,
            corrupt = stats.corrupt,
            "Cache swept"
        );
        Ok(stats)
    }

    /// Delete every record of `namespace`; returns how many were removed.
    ///
    /// # Errors
    /// The directory could not be listed or a record not deleted.
    pub async fn clear_namespace(&self, namespace: Namespace) -> Result<usize> {
        let mut removed = 0;
        for path in list_json(&self.dir.join(namespace.as_str())).await? {
            if remove(&path).await? {
                removed += 1;
            }
            self.invalidate_hot(namespace, &path).await;
        }
        Ok(removed)
    }

    /// Record counts per namespace.
    ///
    /// # Errors
    /// A namespace directory could not be listed.
    pub async fn stats(&self) -> Result<CacheStats> {
        let now = Utc::now();
        let mut namespaces = Vec::with_capacity(Namespace::ALL.len());
        for namespace in Namespace::ALL {
            let mut ns = NamespaceStats {
                namespace,
                live: 0,
                expired: 0,
                bytes: 0,
            };
            for path in list_json(&self.dir.join(namespace.as_str())).await? {
                if let Ok(meta) = tokio::fs::metadata(&path).await {
                    ns.bytes += meta.len();
                }
                match read_json::<CacheRecord>(&path).await {
                    Ok(Some(record)) if !record.is_expired(now) => ns.live += 1,
                    _ => ns.expired += 1,
                }
            }
            namespaces.push(ns);
        }
        self.hot.run_pending_tasks().await;
        Ok(CacheStats {
            namespaces,
            hot_entries: self.hot.entry_count(),
        })
    }

    async fn invalidate_hot(&self, namespace: Namespace, path: &Path) {
        if let Some(stem) = stem(path) {
            self.hot
                .invalidate(&(namespace, CacheKey(stem.to_string())))
                .await;
        }
    }
}
