//! Cross-run identity registry
//!
//! Every item ever processed has one [`RegistryEntry`], addressed by a ULID
//! and persisted as `<dir>/<id>.json`. DOI and provider-id indexes are kept
//! in memory and rebuilt from the records on open. Items without a matching
//! strong identifier fall back to fuzzy title matching.

use crate::atomic::{list_json, read_json, write_json};
use crate::classify::{decide, Classification, MatchKind};
use crate::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use papermill_types::{Grouping, Item, ItemIdentifiers, TargetHash};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use ulid::Ulid;

/// Registry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Minimum normalized-title similarity for a fuzzy match
    pub title_similarity_threshold: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            title_similarity_threshold: 0.95,
        }
    }
}

/// Durable record of one item identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// Stable local id
    pub id: Ulid,
    /// Normalized DOI
    #[serde(default)]
    pub doi: Option<String>,
    /// Provider ids seen for this item
    #[serde(default)]
    pub provider_ids: BTreeSet<String>,
    /// Normalized title
    #[serde(default)]
    pub title: Option<String>,
    /// Groupings the item belongs to
    #[serde(default)]
    pub groupings: BTreeSet<Grouping>,
    /// Targets the stored results were produced for
    pub target_hash: TargetHash,
    /// First commit
    pub first_seen: DateTime<Utc>,
    /// Latest commit
    pub last_updated: DateTime<Utc>,
}

impl RegistryEntry {
    fn create(ids: &ItemIdentifiers, grouping: &Grouping, target_hash: TargetHash) -> Self {
        let now = Utc::now();
        Self {
            id: Ulid::new(),
            doi: ids.doi.clone(),
            provider_ids: ids.provider_ids.clone(),
            title: ids.title.clone(),
            groupings: [grouping.clone()].into_iter().collect(),
            target_hash,
            first_seen: now,
            last_updated: now,
        }
    }

    /// Identifiers recorded for this entry
    #[must_use]
    pub fn identifiers(&self) -> ItemIdentifiers {
        ItemIdentifiers {
            doi: self.doi.clone(),
            provider_ids: self.provider_ids.clone(),
            title: self.title.clone(),
        }
    }

    fn absorb(&mut self, ids: &ItemIdentifiers) {
        let mut merged = self.identifiers();
        if merged.merge(ids) {
            self.doi = merged.doi;
            self.provider_ids = merged.provider_ids;
            self.title = merged.title;
        }
    }
}

/// Summary counts
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Entries
    pub entries: usize,
    /// DOI index size
    pub dois: usize,
    /// Provider-id index size
    pub provider_ids: usize,
    /// Entries with a title
    pub titled: usize,
    /// Entries per grouping
    pub groupings: BTreeMap<String, usize>,
}

#[derive(Debug, Default)]
struct Index {
    entries: BTreeMap<Ulid, RegistryEntry>,
    by_doi: HashMap<String, Ulid>,
    by_pid: HashMap<String, Ulid>,
}

impl Index {
    fn insert(&mut self, entry: RegistryEntry) {
        if let Some(doi) = &entry.doi {
            self.by_doi.entry(doi.clone()).or_insert(entry.id);
        }
        for pid in &entry.provider_ids {
            self.by_pid.entry(pid.clone()).or_insert(entry.id);
        }
        self.entries.insert(entry.id, entry);
    }

    fn find(&self, ids: &ItemIdentifiers, threshold: f64) -> Option<(Ulid, MatchKind)> {
        if let Some(id) = ids.doi.as_ref().and_then(|doi| self.by_doi.get(doi)) {
            return Some((*id, MatchKind::Doi));
        }
        if let Some(id) = ids.provider_ids.iter().find_map(|pid| self.by_pid.get(pid)) {
            return Some((*id, MatchKind::ProviderId));
        }

        let title = ids.title.as_deref()?;
        let mut best: Option<(f64, Ulid)> = None;
        // Ascending id order: on equal scores the oldest entry is kept.
        for entry in self.entries.values() {
            let Some(candidate) = entry.title.as_deref() else {
                continue;
            };
            if let (Some(a), Some(b)) = (&ids.doi, &entry.doi) {
                if a != b {
                    continue;
                }
            }
            let score = if candidate == title {
                1.0
            } else {
                strsim::normalized_levenshtein(title, candidate)
            };
            if score < threshold {
                continue;
            }
            if best.map_or(true, |(s, _)| score > s) {
                best = Some((score, entry.id));
            }
        }
        best.map(|(similarity, id)| (id, MatchKind::Title { similarity }))
    }
}

/// Identity registry backed by one JSON file per entry
#[derive(Debug)]
pub struct Registry {
    dir: PathBuf,
    config: RegistryConfig,
    index: RwLock<Index>,
    commit_lock: tokio::sync::Mutex<()>,
}

impl Registry {
    /// Open the registry at `dir`, creating it if needed, and rebuild the
    /// in-memory indexes. Unreadable entry records are skipped with a warning.
    ///
    /// # Errors
    /// The directory cannot be created or listed, or a record cannot be read.
    #[tracing::instrument(level = "debug", skip_all, fields(dir = %dir.as_ref().display()))]
    pub async fn open(dir: impl AsRef<Path>, config: RegistryConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(StoreError::io(&dir))?;

        let mut index = Index::default();
        for path in list_json(&dir).await? {
            match read_json::<RegistryEntry>(&path).await {
                Ok(Some(entry)) => index.insert(entry),
                Ok(None) => {}
                Err(err) if err.is_corrupt() => {
                    tracing::warn!(path = %path.display(), error = %err, "Skipping corrupt registry entry");
                }
                Err(err) => return Err(err),
            }
        }
        tracing::debug!(entries = index.entries.len(), "Registry loaded");

        Ok(Self {
            dir,
            config,
            index: RwLock::new(index),
            commit_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Entry directory
    #[inline]
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Decide what to do with `item`. Read-only.
    #[must_use]
    pub fn classify(&self, item: &Item, target_hash: &TargetHash, grouping: &Grouping) -> Classification {
        let index = self.index.read();
        let found = index.find(item.identifiers(), self.config.title_similarity_threshold);
        let existing = found.and_then(|(id, _)| index.entries.get(&id).cloned());
        let action = decide(existing.as_ref(), target_hash, grouping);
        Classification {
            action,
            existing,
            match_kind: found.map(|(_, kind)| kind),
        }
    }

    /// Record that `item` was processed for `target_hash` within `grouping`.
    ///
    /// With `existing = None` the index is re-checked first, so concurrent
    /// commits of the same identity merge into one entry.
    ///
    /// # Errors
    /// The entry record could not be written; the in-memory index is then
    /// left unchanged.
    #[tracing::instrument(level = "debug", skip_all, fields(grouping = %grouping))]
    pub async fn commit(
        &self,
        item: &Item,
        grouping: &Grouping,
        target_hash: &TargetHash,
        existing: Option<&RegistryEntry>,
    ) -> Result<RegistryEntry> {
        let _guard = self.commit_lock.lock().await;

        let current = {
            let index = self.index.read();
            let id = match existing {
                Some(entry) => Some(entry.id),
                None => index
                    .find(item.identifiers(), self.config.title_similarity_threshold)
                    .map(|(id, _)| id),
            };
            id.and_then(|id| index.entries.get(&id).cloned())
                .or_else(|| existing.cloned())
        };

        let entry = match current {
            Some(mut entry) => {
                entry.absorb(item.identifiers());
                entry.groupings.insert(grouping.clone());
                entry.target_hash = *target_hash;
                entry.last_updated = Utc::now();
                entry
            }
            None => RegistryEntry::create(item.identifiers(), grouping, *target_hash),
        };

        write_json(&self.dir.join(format!("{}.json", entry.id)), &entry).await?;
        self.index.write().insert(entry.clone());
        tracing::debug!(entry_id = %entry.id, "Registry entry committed");
        Ok(entry)
    }

    /// Entry by id
    #[must_use]
    pub fn get(&self, id: &Ulid) -> Option<RegistryEntry> {
        self.index.read().entries.get(id).cloned()
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.read().entries.len()
    }

    /// True when empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries belonging to `grouping`, oldest first
    #[must_use]
    pub fn entries_in_grouping(&self, grouping: &Grouping) -> Vec<RegistryEntry> {
        self.index
            .read()
            .entries
            .values()
            .filter(|e| e.groupings.contains(grouping))
            .cloned()
            .collect()
    }

    /// Summary counts
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let index = self.index.read();
        let mut groupings = BTreeMap::new();
        for entry in index.entries.values() {
            for g in &entry.groupings {
                *groupings.entry(g.as_str().to_string()).or_insert(0) += 1;
            }
        }
        RegistryStats {
            entries: index.entries.len(),
            dois: index.by_doi.len(),
            provider_ids: index.by_pid.len(),
            titled: index.entries.values().filter(|e| e.title.is_some()).count(),
            groupings,
        }
    }
}
