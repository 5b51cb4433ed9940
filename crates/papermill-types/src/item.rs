//! Items: the unit of ingestible work
//!
//! An [`Item`] is one candidate paper as produced by discovery. Its
//! identifiers are normalized on construction; the item is immutable once it
//! reaches the pipeline.

use crate::hash::ContentHash;
use crate::ident::{normalize_doi, normalize_provider_id, normalize_title};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;

/// Normalized identifier set of one item
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemIdentifiers {
    /// Global persistent identifier (normalized DOI)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    /// Provider-assigned ids, `namespace:value`
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub provider_ids: BTreeSet<String>,
    /// Normalized title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl ItemIdentifiers {
    /// True when no identifier of any kind is present
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.doi.is_none() && self.provider_ids.is_empty() && self.title.is_none()
    }

    /// True when a DOI or provider id is present
    #[inline]
    #[must_use]
    pub fn has_strong(&self) -> bool {
        self.doi.is_some() || !self.provider_ids.is_empty()
    }

    /// Stable key derived from the strongest identifier available
    #[must_use]
    pub fn key(&self) -> Option<ItemKey> {
        if let Some(doi) = &self.doi {
            return Some(ItemKey(format!("doi:{doi}")));
        }
        if let Some(pid) = self.provider_ids.iter().next() {
            return Some(ItemKey(format!("pid:{pid}")));
        }
        self.title
            .as_ref()
            .map(|title| ItemKey(format!("title:{}", ContentHash::compute(title.as_bytes()).short())))
    }

    /// Merge identifiers seen on another sighting of the same item.
    ///
    /// An existing DOI or title is never overwritten. Returns `true` when
    /// anything was added.
    pub fn merge(&mut self, other: &ItemIdentifiers) -> bool {
        let mut changed = false;
        if self.doi.is_none() && other.doi.is_some() {
            self.doi.clone_from(&other.doi);
            changed = true;
        }
        for pid in &other.provider_ids {
            changed |= self.provider_ids.insert(pid.clone());
        }
        if self.title.is_none() && other.title.is_some() {
            self.title.clone_from(&other.title);
            changed = true;
        }
        changed
    }
}

/// Stable per-item key used for checkpoints and log fields
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemKey(String);

impl ItemKey {
    /// Wrap an already-derived key (e.g. one read back from a checkpoint)
    #[inline]
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Borrow the key string
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ItemKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where the source document of an item can be obtained
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "location", rename_all = "snake_case")]
pub enum DocumentRef {
    /// Open-access URL
    Url(String),
    /// Local file
    Path(PathBuf),
}

impl DocumentRef {
    /// Stable string form, used when deriving cache keys
    #[must_use]
    pub fn canonical(&self) -> String {
        match self {
            Self::Url(url) => format!("url:{url}"),
            Self::Path(path) => format!("path:{}", path.display()),
        }
    }
}

/// Descriptive metadata carried with an item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemMetadata {
    /// Title as published
    pub title: String,
    /// Author names in byline order
    #[serde(default)]
    pub authors: Vec<String>,
    /// Publication year
    #[serde(default)]
    pub year: Option<i32>,
    /// Journal or conference
    #[serde(default)]
    pub venue: Option<String>,
    /// Abstract text
    #[serde(default, rename = "abstract")]
    pub abstract_text: Option<String>,
    /// Provider-specific extras, kept opaque
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ItemMetadata {
    /// Metadata with only a title
    #[must_use]
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }
}

/// One candidate paper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    identifiers: ItemIdentifiers,
    metadata: ItemMetadata,
    #[serde(default)]
    document: Option<DocumentRef>,
    #[serde(default)]
    source: Option<String>,
}

impl Item {
    /// Create an item from metadata; the title identifier is derived from it
    #[must_use]
    pub fn new(metadata: ItemMetadata) -> Self {
        let identifiers = ItemIdentifiers {
            title: normalize_title(&metadata.title),
            ..ItemIdentifiers::default()
        };
        Self {
            identifiers,
            metadata,
            document: None,
            source: None,
        }
    }

    /// With a DOI. Values that do not normalize to a DOI are ignored.
    #[must_use]
    pub fn with_doi(mut self, doi: &str) -> Self {
        if let Some(doi) = normalize_doi(doi) {
            self.identifiers.doi = Some(doi);
        }
        self
    }

    /// With a provider id (`namespace:value`). Malformed ids are ignored.
    #[must_use]
    pub fn with_provider_id(mut self, pid: &str) -> Self {
        if let Some(pid) = normalize_provider_id(pid) {
            self.identifiers.provider_ids.insert(pid);
        }
        self
    }

    /// With a source document reference
    #[inline]
    #[must_use]
    pub fn with_document(mut self, document: DocumentRef) -> Self {
        self.document = Some(document);
        self
    }

    /// With the name of the discovery source that produced it
    #[inline]
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Normalized identifiers
    #[inline]
    #[must_use]
    pub fn identifiers(&self) -> &ItemIdentifiers {
        &self.identifiers
    }

    /// Descriptive metadata
    #[inline]
    #[must_use]
    pub fn metadata(&self) -> &ItemMetadata {
        &self.metadata
    }

    /// Source document, if any
    #[inline]
    #[must_use]
    pub fn document(&self) -> Option<&DocumentRef> {
        self.document.as_ref()
    }

    /// Discovery source name
    #[inline]
    #[must_use]
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Stable key of this item
    ///
    /// # Errors
    /// `ItemError::NoIdentifiers` when the item carries no usable identifier
    pub fn key(&self) -> Result<ItemKey, ItemError> {
        self.identifiers.key().ok_or(ItemError::NoIdentifiers)
    }
}

/// A logical grouping ("topic") an item is associated with
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Grouping(String);

impl Grouping {
    /// Create a grouping; surrounding whitespace is trimmed
    #[must_use]
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_string())
    }

    /// Grouping name
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Grouping {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Grouping {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Item validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ItemError {
    /// No DOI, provider id or usable title
    #[error("item has no usable identifier")]
    NoIdentifiers,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_prefers_doi_then_provider_then_title() {
        let titled = Item::new(ItemMetadata::titled("Deep Residual Learning"));
        assert!(titled.key().unwrap().as_str().starts_with("title:"));

        let with_pid = titled.clone().with_provider_id("arxiv:1512.03385");
        assert_eq!(with_pid.key().unwrap().as_str(), "pid:arxiv:1512.03385");

        let with_doi = with_pid.with_doi("https://doi.org/10.1109/CVPR.2016.90");
        assert_eq!(with_doi.key().unwrap().as_str(), "doi:10.1109/cvpr.2016.90");
    }

    #[test]
    fn item_without_identifiers_has_no_key() {
        let item = Item::new(ItemMetadata::titled("  ...  "));
        assert_eq!(item.key(), Err(ItemError::NoIdentifiers));
    }

    #[test]
    fn malformed_identifiers_are_ignored() {
        let item = Item::new(ItemMetadata::titled("x"))
            .with_doi("not a doi")
            .with_provider_id("nonamespace");
        assert!(item.identifiers().doi.is_none());
        assert!(item.identifiers().provider_ids.is_empty());
    }

    #[test]
    fn merge_adds_but_never_overwrites() {
        let mut ids = Item::new(ItemMetadata::titled("A Title"))
            .with_doi("10.1/a")
            .identifiers()
            .clone();
        let other = Item::new(ItemMetadata::titled("Another Title"))
            .with_doi("10.1/b")
            .with_provider_id("s2:123")
            .identifiers()
            .clone();

        assert!(ids.merge(&other));
        assert_eq!(ids.doi.as_deref(), Some("10.1/a"));
        assert_eq!(ids.title.as_deref(), Some("a title"));
        assert!(ids.provider_ids.contains("s2:123"));
        assert!(!ids.merge(&other));
    }

    #[test]
    fn item_round_trips_through_json() {
        let item = Item::new(ItemMetadata::titled("Graph Attention Networks"))
            .with_provider_id("arxiv:1710.10903")
            .with_document(DocumentRef::Url("https://arxiv.org/pdf/1710.10903".into()))
            .with_source("arxiv");
        let json = serde_json::to_string(&item).unwrap();
        let back: Item = serde_json::from_str(&json).unwrap();
        assert_eq!(item, back);
    }

    #[test]
    fn grouping_is_trimmed() {
        assert_eq!(Grouping::new("  llm-agents "), Grouping::from("llm-agents"));
    }
}
