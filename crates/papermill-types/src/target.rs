//! Extraction targets
//!
//! An [`ExtractionTargetSet`] describes *what* the analysis stage should pull
//! out of a paper. Its [`TargetHash`] is order-insensitive: two sets holding
//! the same targets in a different order hash identically, and any change to
//! a target yields a new hash, which marks earlier results as stale.

use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// One "what to extract" descriptor
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExtractionTarget {
    /// Short unique-ish name, e.g. `datasets`
    pub name: String,
    /// Instruction handed to the analysis backend
    pub instruction: String,
    /// Optional output shape hint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<String>,
}

impl ExtractionTarget {
    /// Create a target
    #[must_use]
    pub fn new(name: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instruction: instruction.into(),
            output_schema: None,
        }
    }

    /// With an output schema hint
    #[inline]
    #[must_use]
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.output_schema = Some(schema.into());
        self
    }
}

/// Ordered list of extraction targets for one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtractionTargetSet {
    targets: Vec<ExtractionTarget>,
}

impl ExtractionTargetSet {
    /// Empty set
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With an additional target appended
    #[inline]
    #[must_use]
    pub fn with_target(mut self, target: ExtractionTarget) -> Self {
        self.targets.push(target);
        self
    }

    /// Targets in configured order
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &ExtractionTarget> {
        self.targets.iter()
    }

    /// Number of targets
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// True when no targets are configured
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Content hash, insensitive to target order
    #[must_use]
    pub fn hash(&self) -> TargetHash {
        let mut sorted: Vec<&ExtractionTarget> = self.targets.iter().collect();
        sorted.sort();

        let parts = sorted.iter().flat_map(|t| {
            let (has_schema, schema) = match &t.output_schema {
                Some(s) => ("1", s.as_str()),
                None => ("0", ""),
            };
            [t.name.as_str(), t.instruction.as_str(), has_schema, schema]
        });
        TargetHash(ContentHash::from_parts(parts))
    }
}

impl FromIterator<ExtractionTarget> for ExtractionTargetSet {
    fn from_iter<I: IntoIterator<Item = ExtractionTarget>>(iter: I) -> Self {
        Self {
            targets: iter.into_iter().collect(),
        }
    }
}

/// Hash of an [`ExtractionTargetSet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetHash(ContentHash);

impl TargetHash {
    /// Underlying content hash
    #[inline]
    #[must_use]
    pub fn as_content_hash(&self) -> &ContentHash {
        &self.0
    }

    /// Short display form
    #[inline]
    #[must_use]
    pub fn short(&self) -> String {
        self.0.short()
    }
}

impl From<ContentHash> for TargetHash {
    fn from(hash: ContentHash) -> Self {
        Self(hash)
    }
}

impl Display for TargetHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}
