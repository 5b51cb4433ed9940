//! Action classification

use crate::registry::RegistryEntry;
use papermill_types::{Grouping, TargetHash};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// What the pipeline must do with an incoming item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Never seen: process fully
    New,
    /// Seen with the same targets and grouping: nothing to do
    Skip,
    /// Seen with the same targets, new grouping: record the grouping only
    MapOnly,
    /// Seen, but the targets changed: re-run the stages
    Backfill,
}

impl Action {
    /// Stable lowercase label
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Skip => "skip",
            Self::MapOnly => "map_only",
            Self::Backfill => "backfill",
        }
    }

    /// True when the item must go through the stages
    #[inline]
    #[must_use]
    pub fn needs_processing(&self) -> bool {
        matches!(self, Self::New | Self::Backfill)
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an item was matched to an existing entry
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum MatchKind {
    /// Same DOI
    Doi,
    /// Same provider id
    ProviderId,
    /// Normalized titles at or above the similarity threshold
    Title {
        /// Similarity in `[0, 1]`
        similarity: f64,
    },
}

/// Outcome of [`crate::Registry::classify`]
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    /// Required action
    pub action: Action,
    /// Matched entry, if any
    pub existing: Option<RegistryEntry>,
    /// How it matched
    pub match_kind: Option<MatchKind>,
}

/// Decide the action for an item given its match.
///
/// Pure: depends only on the matched entry, the requested target hash and
/// the grouping.
#[must_use]
pub fn decide(existing: Option<&RegistryEntry>, target_hash: &TargetHash, grouping: &Grouping) -> Action {
    match existing {
        None => Action::New,
        Some(entry) if entry.target_hash != *target_hash => Action::Backfill,
        Some(entry) if entry.groupings.contains(grouping) => Action::Skip,
        Some(_) => Action::MapOnly,
    }
}
