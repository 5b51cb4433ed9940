//! Per-item results and the run report

use crate::error::StageError;
use crate::stage::{Analysis, Stage};
use papermill_store::Action;
use papermill_types::ItemKey;
use serde::Serialize;
use std::time::Duration;
use ulid::Ulid;

/// Final status of one item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// All stages succeeded and the result was committed
    Completed,
    /// A stage or the commit failed
    Failed,
    /// Nothing to do (already processed, or a duplicate within the batch)
    SkippedDuplicate,
}

impl ItemStatus {
    /// Stable lowercase label
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::SkippedDuplicate => "skipped_duplicate",
        }
    }
}

/// Wall time spent in each stage call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageTimings {
    /// Acquire call
    pub acquire: Option<Duration>,
    /// Convert call
    pub convert: Option<Duration>,
    /// Analyze call
    pub analyze: Option<Duration>,
}

impl StageTimings {
    pub(crate) fn record(&mut self, stage: Stage, elapsed: Duration) {
        metrics::histogram!("papermill_stage_seconds", "stage" => stage.as_str()).record(elapsed.as_secs_f64());
        match stage {
            Stage::Acquire => self.acquire = Some(elapsed),
            Stage::Convert => self.convert = Some(elapsed),
            Stage::Analyze => self.analyze = Some(elapsed),
            Stage::Intake | Stage::Commit => {}
        }
    }
}

/// Outcome of one item
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemResult {
    /// Item key; `None` for items rejected at intake for lack of identifiers
    pub key: Option<ItemKey>,
    /// Title as received
    pub title: String,
    /// Final status
    pub status: ItemStatus,
    /// Classification that drove the item
    pub action: Option<Action>,
    /// Registry entry written or matched
    pub entry_id: Option<Ulid>,
    /// Per-stage timings
    pub timings: StageTimings,
    /// Time from dequeue to result
    pub total: Duration,
    /// Analysis backend that produced the result
    pub provider: Option<String>,
    /// Extraction output
    pub analysis: Option<Analysis>,
    /// Failure detail
    pub error: Option<StageError>,
}

impl ItemResult {
    pub(crate) fn skipped(key: ItemKey, title: &str, action: Option<Action>, entry_id: Option<Ulid>) -> Self {
        Self {
            key: Some(key),
            title: title.to_string(),
            status: ItemStatus::SkippedDuplicate,
            action,
            entry_id,
            timings: StageTimings::default(),
            total: Duration::ZERO,
            provider: None,
            analysis: None,
            error: None,
        }
    }

    pub(crate) fn failed(key: Option<ItemKey>, title: &str, action: Option<Action>, error: StageError) -> Self {
        Self {
            key,
            title: title.to_string(),
            status: ItemStatus::Failed,
            action,
            entry_id: None,
            timings: StageTimings::default(),
            total: Duration::ZERO,
            provider: None,
            analysis: None,
            error: Some(error),
        }
    }

    /// True for `Completed`
    #[inline]
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == ItemStatus::Completed
    }
}

/// Tally of a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Run id
    pub run_id: String,
    /// Completed items
    pub completed: usize,
    /// Failed items
    pub failed: usize,
    /// Skipped as already processed, or duplicates within the batch
    pub skipped: usize,
    /// Grouping recorded without reprocessing
    pub mapped: usize,
    /// Already in the checkpoint, not looked at again
    pub resumed: usize,
}

impl RunReport {
    /// Empty report
    #[must_use]
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            ..Self::default()
        }
    }

    /// Count one result
    pub fn record(&mut self, result: &ItemResult) {
        match (result.status, result.action) {
            (ItemStatus::Completed, _) => self.completed += 1,
            (ItemStatus::Failed, _) => self.failed += 1,
            (ItemStatus::SkippedDuplicate, Some(Action::MapOnly)) => self.mapped += 1,
            (ItemStatus::SkippedDuplicate, _) => self.skipped += 1,
        }
    }

    /// Results counted, excluding resumed items
    #[must_use]
    pub fn emitted(&self) -> usize {
        self.completed + self.failed + self.skipped + self.mapped
    }

    /// True when some items failed
    #[inline]
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.failed > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use papermill_resilience::FailureKind;

    #[test]
    fn report_tallies_by_status_and_action() {
        let key = ItemKey::from_raw("doi:10.1/a");
        let mut report = RunReport::new("r");
        report.record(&ItemResult::skipped(key.clone(), "a", Some(Action::Skip), None));
        report.record(&ItemResult::skipped(key.clone(), "a", Some(Action::MapOnly), None));
        report.record(&ItemResult::skipped(key.clone(), "a", None, None));
        assert_eq!((report.skipped, report.mapped), (2, 1));
        assert!(!report.is_partial());

        report.record(&ItemResult::failed(
            Some(key),
            "a",
            Some(Action::New),
            StageError::new(Stage::Acquire, FailureKind::Transient, "timeout"),
        ));
        assert!(report.is_partial());
        assert_eq!(report.emitted(), 4);
    }
}
