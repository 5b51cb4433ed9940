//! End-to-end runs against scripted backends

use futures::StreamExt;
use papermill_core::{Discovery, ItemResult, ItemStatus, Pipeline, PipelineConfig, PipelineError, Stage, StageLimits};
use papermill_resilience::FailureKind;
use papermill_store::{Action, CheckpointStore, DataLayout, Registry, RegistryConfig};
use papermill_test_utils::{
    doc_item, doi_item, doi_key, targets, test_config, title_item, RecordingSource, Reply, ScriptedAnalyzer,
    ScriptedConverter, StaticDiscovery,
};
use papermill_types::{ExtractionTargetSet, Grouping, Item};
use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn v1() -> ExtractionTargetSet {
    targets(&[("datasets", "List datasets used")])
}

fn v2() -> ExtractionTargetSet {
    targets(&[("datasets", "List datasets used"), ("metrics", "List metrics reported")])
}

async fn pipeline(config: PipelineConfig, analyzer: &Arc<ScriptedAnalyzer>) -> Pipeline {
    Pipeline::builder(config)
        .with_analyzer(Arc::clone(analyzer) as _)
        .build()
        .await
        .unwrap()
}

async fn run(pipeline: &Pipeline, items: Vec<Item>, targets: ExtractionTargetSet, run_id: &str) -> Vec<ItemResult> {
    let (results, _) = pipeline
        .process(items, targets, run_id, Grouping::new("nlp"))
        .await
        .unwrap()
        .collect()
        .await;
    results
}

fn status_of(results: &[ItemResult], key: &str) -> ItemStatus {
    results
        .iter()
        .find(|r| r.key.as_ref().map(|k| k.as_str()) == Some(key))
        .map(|r| r.status)
        .unwrap()
}

async fn checkpoint_ids(dir: &Path, run_id: &str) -> Vec<String> {
    let store = CheckpointStore::open(DataLayout::new(dir).checkpoints()).await.unwrap();
    let mut ids = store.load(run_id).await.unwrap().completed_item_ids;
    ids.sort();
    ids
}

#[tokio::test]
async fn new_skip_and_backfill_in_one_batch() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    let nlp = Grouping::new("nlp");
    let (a, b, c) = (
        doi_item("10.1000/a", "Paper A"),
        doi_item("10.1000/b", "Paper B"),
        doi_item("10.1000/c", "Paper C"),
    );

    let (b_before, c_before) = {
        let seed = Registry::open(layout.registry_entries(), RegistryConfig::default())
            .await
            .unwrap();
        let old = targets(&[("datasets", "Old instruction")]).hash();
        let b_entry = seed.commit(&b, &nlp, &v1().hash(), None).await.unwrap();
        let c_entry = seed.commit(&c, &nlp, &old, None).await.unwrap();
        (b_entry, c_entry)
    };

    let analyzer = Arc::new(ScriptedAnalyzer::new("primary"));
    let pipeline = pipeline(test_config(dir.path()), &analyzer).await;
    let run = pipeline
        .process(vec![a, b, c], v1(), "run-abc", nlp.clone())
        .await
        .unwrap();
    let (results, report) = run.collect().await;

    assert_eq!(results.len(), 3);
    assert_eq!(status_of(&results, "doi:10.1000/a"), ItemStatus::Completed);
    assert_eq!(status_of(&results, "doi:10.1000/b"), ItemStatus::SkippedDuplicate);
    assert_eq!(status_of(&results, "doi:10.1000/c"), ItemStatus::Completed);
    assert_eq!((report.completed, report.skipped, report.failed), (2, 1, 0));

    assert_eq!(analyzer.log().calls_for("doi:10.1000/b"), 0);
    assert_eq!(analyzer.log().call_count(), 2);
    assert_eq!(
        checkpoint_ids(dir.path(), "run-abc").await,
        vec!["doi:10.1000/a".to_string(), "doi:10.1000/c".to_string()]
    );

    let registry = pipeline.registry();
    assert_eq!(registry.len(), 3);
    assert_eq!(registry.get(&b_before.id).unwrap(), b_before);
    let c_after = registry.get(&c_before.id).unwrap();
    assert_eq!(c_after.target_hash, v1().hash());
    let c_result = results
        .iter()
        .find(|r| r.action == Some(Action::Backfill))
        .unwrap();
    assert_eq!(c_result.entry_id, Some(c_before.id));
}

#[tokio::test]
async fn checkpointed_items_make_no_external_calls() {
    let dir = tempfile::tempdir().unwrap();
    CheckpointStore::open(DataLayout::new(dir.path()).checkpoints())
        .await
        .unwrap()
        .append("run-1", "doi:10.1000/x")
        .await
        .unwrap();

    let analyzer = Arc::new(ScriptedAnalyzer::new("primary"));
    let pipeline = pipeline(test_config(dir.path()), &analyzer).await;
    let run = pipeline
        .process(
            vec![doi_item("10.1000/x", "X"), doi_item("10.1000/y", "Y")],
            v1(),
            "run-1",
            Grouping::new("nlp"),
        )
        .await
        .unwrap();
    let (results, report) = run.collect().await;

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].key.as_ref().unwrap().as_str(), "doi:10.1000/y");
    assert_eq!(report.resumed, 1);
    assert_eq!(analyzer.log().calls(), vec!["doi:10.1000/y".to_string()]);

    let checkpoint = pipeline.checkpoints().load("run-1").await.unwrap();
    assert!(checkpoint.is_complete());
    assert_eq!(checkpoint.len(), 2);
}

#[tokio::test]
async fn analysis_cache_is_keyed_by_target_set() {
    let dir = tempfile::tempdir().unwrap();
    let analyzer = Arc::new(ScriptedAnalyzer::new("primary"));
    let pipeline = pipeline(test_config(dir.path()), &analyzer).await;
    let item = || vec![doi_item("10.1000/a", "A")];

    run(&pipeline, item(), v1(), "r1").await;
    assert_eq!(analyzer.log().call_count(), 1);

    // Different targets: backfill, and no false cache hit.
    let results = run(&pipeline, item(), v2(), "r2").await;
    assert_eq!(results[0].action, Some(Action::Backfill));
    assert_eq!(analyzer.log().call_count(), 2);
    assert!(results[0].analysis.as_ref().unwrap().results.contains_key("metrics"));

    // Back to the first set: backfill again, served from cache.
    let results = run(&pipeline, item(), v1(), "r3").await;
    assert_eq!(results[0].status, ItemStatus::Completed);
    assert_eq!(results[0].provider.as_deref(), Some("primary"));
    assert_eq!(analyzer.log().call_count(), 2);
}

#[tokio::test]
async fn empty_batch_writes_no_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let analyzer = Arc::new(ScriptedAnalyzer::new("primary"));
    let pipeline = pipeline(test_config(dir.path()), &analyzer).await;

    let results = run(&pipeline, Vec::new(), v1(), "empty").await;
    assert!(results.is_empty());
    assert!(pipeline.checkpoints().list_runs().await.unwrap().is_empty());
}

#[tokio::test]
async fn fully_known_batch_does_no_stage_work() {
    let dir = tempfile::tempdir().unwrap();
    let analyzer = Arc::new(ScriptedAnalyzer::new("primary"));
    let pipeline = pipeline(test_config(dir.path()), &analyzer).await;
    let items = || (0..4).map(|i| doi_item(&format!("10.1000/{i}"), "P")).collect::<Vec<_>>();

    run(&pipeline, items(), v1(), "first").await;
    assert_eq!(analyzer.log().call_count(), 4);

    let run = pipeline
        .process(items(), v1(), "second", Grouping::new("nlp"))
        .await
        .unwrap();
    let (results, report) = run.collect().await;
    assert!(results.iter().all(|r| r.action == Some(Action::Skip)));
    assert_eq!(report.skipped, 4);
    assert_eq!(analyzer.log().call_count(), 4);
    assert!(pipeline.checkpoints().list_runs().await.unwrap().iter().all(|r| r.run_id != "second"));
}

#[tokio::test]
async fn new_grouping_is_recorded_without_reprocessing() {
    let dir = tempfile::tempdir().unwrap();
    let analyzer = Arc::new(ScriptedAnalyzer::new("primary"));
    let pipeline = pipeline(test_config(dir.path()), &analyzer).await;
    let item = doi_item("10.1000/a", "A");

    run(&pipeline, vec![item.clone()], v1(), "r1").await;
    let run = pipeline
        .process(vec![item], v1(), "r2", Grouping::new("vision"))
        .await
        .unwrap();
    let (results, report) = run.collect().await;

    assert_eq!(report.mapped, 1);
    assert_eq!(results[0].action, Some(Action::MapOnly));
    assert_eq!(analyzer.log().call_count(), 1);
    assert_eq!(pipeline.registry().entries_in_grouping(&Grouping::new("vision")).len(), 1);
    assert_eq!(pipeline.registry().entries_in_grouping(&Grouping::new("nlp")).len(), 1);
}

#[tokio::test]
async fn duplicates_in_one_batch_are_processed_once() {
    let dir = tempfile::tempdir().unwrap();
    let analyzer = Arc::new(ScriptedAnalyzer::new("primary"));
    let pipeline = pipeline(test_config(dir.path()), &analyzer).await;

    let results = run(
        &pipeline,
        vec![doi_item("10.1000/a", "A"), doi_item("https://doi.org/10.1000/A", "A again")],
        v1(),
        "dups",
    )
    .await;

    assert_eq!(results.len(), 2);
    assert_eq!(results.iter().filter(|r| r.is_completed()).count(), 1);
    let dup = results.iter().find(|r| !r.is_completed()).unwrap();
    assert_eq!(dup.status, ItemStatus::SkippedDuplicate);
    assert_eq!(dup.action, None);
    assert_eq!(analyzer.log().call_count(), 1);
}

#[tokio::test]
async fn item_without_identifiers_fails_at_intake() {
    let dir = tempfile::tempdir().unwrap();
    let analyzer = Arc::new(ScriptedAnalyzer::new("primary"));
    let pipeline = pipeline(test_config(dir.path()), &analyzer).await;

    let results = run(&pipeline, vec![title_item("???"), doi_item("10.1000/a", "A")], v1(), "intake").await;
    let rejected = results.iter().find(|r| r.key.is_none()).unwrap();
    assert_eq!(rejected.status, ItemStatus::Failed);
    assert_eq!(rejected.error.as_ref().unwrap().stage, Stage::Intake);
    assert_eq!(analyzer.log().call_count(), 1);
}

#[tokio::test]
async fn failed_item_does_not_affect_siblings() {
    let dir = tempfile::tempdir().unwrap();
    let analyzer = Arc::new(ScriptedAnalyzer::new("primary").script(&doi_key("10.1000/b"), [Reply::Permanent]));
    let pipeline = pipeline(test_config(dir.path()), &analyzer).await;

    let run = pipeline
        .process(
            vec![
                doi_item("10.1000/a", "A"),
                doi_item("10.1000/b", "B"),
                doi_item("10.1000/c", "C"),
            ],
            v1(),
            "partial",
            Grouping::new("nlp"),
        )
        .await
        .unwrap();
    let (results, report) = run.collect().await;

    assert!(report.is_partial());
    assert_eq!((report.completed, report.failed), (2, 1));
    let error = results
        .iter()
        .find_map(|r| r.error.clone())
        .unwrap();
    assert_eq!((error.stage, error.kind), (Stage::Analyze, FailureKind::Permanent));
    assert_eq!(
        checkpoint_ids(dir.path(), "partial").await,
        vec!["doi:10.1000/a".to_string(), "doi:10.1000/c".to_string()]
    );
    assert_eq!(pipeline.registry().len(), 2);
}

#[tokio::test]
async fn results_surface_only_after_the_checkpoint_write() {
    let dir = tempfile::tempdir().unwrap();
    let analyzer = Arc::new(ScriptedAnalyzer::new("primary"));
    let pipeline = pipeline(test_config(dir.path()), &analyzer).await;
    let items = (0..5).map(|i| doi_item(&format!("10.1000/{i}"), "P")).collect();

    let mut run = pipeline
        .process(items, v1(), "ordered", Grouping::new("nlp"))
        .await
        .unwrap();
    while let Some(result) = run.next().await {
        let key = result.key.unwrap();
        let checkpoint = pipeline.checkpoints().load("ordered").await.unwrap();
        assert!(checkpoint.contains(key.as_str()), "{key} emitted before checkpoint");
        let item = doi_item(key.as_str().trim_start_matches("doi:"), "P");
        let classification = pipeline.registry().classify(&item, &v1().hash(), &Grouping::new("nlp"));
        assert_eq!(classification.action, Action::Skip);
    }
    assert_eq!(run.report().completed, 5);
}

#[tokio::test]
async fn falls_back_to_the_next_analyzer() {
    let dir = tempfile::tempdir().unwrap();
    let primary = Arc::new(ScriptedAnalyzer::new("primary").replying(Reply::Transient));
    let secondary = Arc::new(ScriptedAnalyzer::new("secondary"));
    let pipeline = Pipeline::builder(test_config(dir.path()))
        .with_analyzer(Arc::clone(&primary) as _)
        .with_analyzer(Arc::clone(&secondary) as _)
        .build()
        .await
        .unwrap();

    let results = run(&pipeline, vec![doi_item("10.1000/a", "A")], v1(), "fallback").await;
    assert_eq!(results[0].provider.as_deref(), Some("secondary"));
    assert_eq!(primary.log().call_count(), 1);
    assert_eq!(secondary.log().call_count(), 1);

    let usage = pipeline.analyzer_usage();
    assert_eq!(usage[0].failures, 1);
    assert_eq!(usage[1].successes, 1);
}

#[tokio::test]
async fn exhausted_budget_halts_further_analysis() {
    let dir = tempfile::tempdir().unwrap();
    let analyzer = Arc::new(ScriptedAnalyzer::new("primary").costing(0.10));
    let config = test_config(dir.path()).with_budget(0.15).with_workers(1);
    let pipeline = pipeline(config, &analyzer).await;
    let items = (0..5).map(|i| doi_item(&format!("10.1000/{i}"), "P")).collect();

    let run = pipeline
        .process(items, v1(), "budget", Grouping::new("nlp"))
        .await
        .unwrap();
    let (results, report) = run.collect().await;

    assert_eq!(analyzer.log().call_count(), 2);
    assert_eq!((report.completed, report.failed), (2, 3));
    assert!(results
        .iter()
        .filter_map(|r| r.error.as_ref())
        .all(|e| e.kind == FailureKind::ResourceExhausted));
}

#[tokio::test]
async fn documents_are_acquired_converted_and_cached() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(RecordingSource::new("oa"));
    let converter = Arc::new(ScriptedConverter::new("pdf"));
    let analyzer = Arc::new(ScriptedAnalyzer::new("primary"));
    let pipeline = Pipeline::builder(test_config(dir.path()))
        .with_source(Arc::clone(&source) as _)
        .with_converter(Arc::clone(&converter) as _)
        .with_analyzer(Arc::clone(&analyzer) as _)
        .build()
        .await
        .unwrap();

    let results = run(
        &pipeline,
        vec![doc_item("10.1000/a", "A"), doi_item("10.1000/b", "B")],
        v1(),
        "docs",
    )
    .await;
    assert!(results.iter().all(ItemResult::is_completed));
    assert_eq!(source.log().calls(), vec!["doi:10.1000/a".to_string()]);
    assert_eq!(converter.log().call_count(), 1);
    let mut saw_text = analyzer.saw_text();
    saw_text.sort_unstable();
    assert_eq!(saw_text, vec![false, true]);

    let with_doc = results.iter().find(|r| r.timings.acquire.is_some()).unwrap();
    assert!(with_doc.timings.convert.is_some());

    // New targets re-analyze but reuse the converted text.
    run(&pipeline, vec![doc_item("10.1000/a", "A")], v2(), "docs-2").await;
    assert_eq!(source.log().call_count(), 1);
    assert_eq!(converter.log().call_count(), 1);
    assert_eq!(analyzer.log().call_count(), 3);
}

#[tokio::test]
async fn acquire_failure_fails_the_item() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(RecordingSource::new("oa").replying(Reply::Permanent));
    let analyzer = Arc::new(ScriptedAnalyzer::new("primary"));
    let pipeline = Pipeline::builder(test_config(dir.path()))
        .with_source(source as _)
        .with_converter(Arc::new(ScriptedConverter::new("pdf")) as _)
        .with_analyzer(Arc::clone(&analyzer) as _)
        .build()
        .await
        .unwrap();

    let results = run(&pipeline, vec![doc_item("10.1000/a", "A")], v1(), "acq").await;
    assert_eq!(results[0].status, ItemStatus::Failed);
    assert_eq!(results[0].error.as_ref().unwrap().stage, Stage::Acquire);
    assert_eq!(analyzer.log().call_count(), 0);
    assert!(checkpoint_ids(dir.path(), "acq").await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn analyze_stage_respects_its_ceiling() {
    let dir = tempfile::tempdir().unwrap();
    let analyzer = Arc::new(ScriptedAnalyzer::new("primary").with_delay(Duration::from_millis(30)));
    let config = test_config(dir.path())
        .with_stages(StageLimits {
            acquire: 4,
            convert: 4,
            analyze: 2,
        })
        .with_workers(8);
    let pipeline = pipeline(config, &analyzer).await;
    let items = (0..8).map(|i| doi_item(&format!("10.1000/{i}"), "P")).collect();

    let results = run(&pipeline, items, v1(), "bounded").await;
    assert_eq!(results.len(), 8);
    assert!(analyzer.log().max_in_flight() <= 2);
    assert!(analyzer.log().max_in_flight() >= 1);
}

#[tokio::test]
async fn cancellation_stops_the_run_without_checkpointing_in_flight_items() {
    let dir = tempfile::tempdir().unwrap();
    let analyzer = Arc::new(ScriptedAnalyzer::new("primary").with_delay(Duration::from_secs(30)));
    let pipeline = pipeline(test_config(dir.path()), &analyzer).await;
    let items = (0..3).map(|i| doi_item(&format!("10.1000/{i}"), "P")).collect();

    let run = pipeline
        .process(items, v1(), "cancelled", Grouping::new("nlp"))
        .await
        .unwrap();
    let handle = run.cancel_handle();
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.cancel();
    assert!(handle.is_cancelled());

    let (results, report) = tokio::time::timeout(Duration::from_secs(10), run.collect())
        .await
        .unwrap();
    assert_eq!(report.completed, 0);
    assert!(results.iter().all(|r| !r.is_completed()));
    let checkpoint = pipeline.checkpoints().load("cancelled").await.unwrap();
    assert!(checkpoint.is_empty());
    assert!(!checkpoint.is_complete());
}

#[tokio::test]
async fn build_requires_an_analyzer() {
    let dir = tempfile::tempdir().unwrap();
    let err = Pipeline::builder(test_config(dir.path())).build().await.unwrap_err();
    assert!(matches!(err, PipelineError::MissingBackend("analyzer")));
}

#[tokio::test]
async fn unreadable_data_dir_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("not-a-dir");
    std::fs::write(&file, b"x").unwrap();
    let analyzer = Arc::new(ScriptedAnalyzer::new("primary"));

    let err = Pipeline::builder(test_config(&file))
        .with_analyzer(analyzer as _)
        .build()
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Store(_)));
}

#[tokio::test]
async fn discovery_merges_sources_and_caches_results() {
    let dir = tempfile::tempdir().unwrap();
    let analyzer = Arc::new(ScriptedAnalyzer::new("primary"));
    let pipeline = pipeline(test_config(dir.path()), &analyzer).await;

    let arxiv = Arc::new(StaticDiscovery::new(
        "arxiv",
        vec![doi_item("10.1000/a", "A"), doi_item("10.1000/b", "B"), title_item("...")],
    ));
    let crossref = Arc::new(StaticDiscovery::new(
        "crossref",
        vec![doi_item("https://doi.org/10.1000/B", "B"), doi_item("10.1000/c", "C")],
    ));
    let broken = Arc::new(StaticDiscovery::new("broken", Vec::new()).replying(Reply::Transient));
    let sources: Vec<Arc<dyn Discovery>> = vec![
        Arc::clone(&arxiv) as _,
        Arc::clone(&broken) as _,
        Arc::clone(&crossref) as _,
    ];

    let found = pipeline.discover(&sources, "transformers").await;
    let keys: Vec<_> = found
        .items
        .iter()
        .map(|i| i.key().unwrap().as_str().to_string())
        .collect();
    assert_eq!(keys, vec!["doi:10.1000/a", "doi:10.1000/b", "doi:10.1000/c"]);
    assert_eq!(found.rejected, 1);
    assert_eq!(found.failures.len(), 1);
    assert_eq!(found.failures[0].provider, "broken");

    let again = pipeline.discover(&sources, "transformers").await;
    assert_eq!(again.items.len(), 3);
    assert_eq!(arxiv.log().call_count(), 1);
    assert_eq!(crossref.log().call_count(), 1);
    assert_eq!(broken.log().call_count(), 2);
}

#[tokio::test]
async fn registry_failure_rolls_back_the_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let analyzer = Arc::new(ScriptedAnalyzer::new("primary"));
    let pipeline = pipeline(test_config(dir.path()), &analyzer).await;

    let entries = DataLayout::new(dir.path()).registry_entries();
    std::fs::remove_dir_all(&entries).unwrap();
    std::fs::write(&entries, b"not a directory").unwrap();

    let results = run(&pipeline, vec![doi_item("10.1000/a", "A")], v1(), "broken-registry").await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, ItemStatus::Failed);
    assert_eq!(results[0].error.as_ref().unwrap().stage, Stage::Commit);
    assert_eq!(analyzer.log().call_count(), 1);
    assert!(checkpoint_ids(dir.path(), "broken-registry").await.is_empty());
}

#[tokio::test]
async fn cancellation_lets_in_flight_items_finish_within_grace() {
    let dir = tempfile::tempdir().unwrap();
    let analyzer = Arc::new(ScriptedAnalyzer::new("primary").with_delay(Duration::from_millis(200)));
    let config = test_config(dir.path())
        .with_workers(1)
        .with_shutdown_grace(Duration::from_secs(5));
    let pipeline = pipeline(config, &analyzer).await;
    let items = (0..3).map(|i| doi_item(&format!("10.1000/{i}"), "P")).collect();

    let run = pipeline
        .process(items, v1(), "graceful", Grouping::new("nlp"))
        .await
        .unwrap();
    while analyzer.log().call_count() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    run.cancel_handle().cancel();

    let (results, report) = tokio::time::timeout(Duration::from_secs(10), run.collect())
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(status_of(&results, "doi:10.1000/0"), ItemStatus::Completed);
    assert_eq!(report.completed, 1);
    assert_eq!(analyzer.log().calls(), vec![doi_key("10.1000/0")]);

    assert_eq!(checkpoint_ids(dir.path(), "graceful").await, vec![doi_key("10.1000/0")]);
    assert!(!pipeline.checkpoints().load("graceful").await.unwrap().is_complete());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn aborted_run_never_checkpoints_an_uncommitted_item() {
    let dir = tempfile::tempdir().unwrap();
    let analyzer = Arc::new(ScriptedAnalyzer::new("primary"));
    let config = test_config(dir.path())
        .with_stages(StageLimits {
            acquire: 8,
            convert: 8,
            analyze: 8,
        })
        .with_workers(8)
        .with_shutdown_grace(Duration::ZERO);
    let pipeline = pipeline(config, &analyzer).await;
    let items = || (0..40).map(|i| doi_item(&format!("10.1000/{i}"), "P")).collect::<Vec<_>>();
    let nlp = Grouping::new("nlp");
    let hash = v1().hash();

    let mut run = pipeline
        .process(items(), v1(), "aborted", nlp.clone())
        .await
        .unwrap();
    let first = run.next().await;
    assert!(first.is_some());
    run.cancel_handle().cancel();
    let _ = tokio::time::timeout(Duration::from_secs(10), run.collect())
        .await
        .unwrap();

    let registry = pipeline.registry();
    let checkpointed = checkpoint_ids(dir.path(), "aborted").await;
    for item in items() {
        let key = item.key().unwrap();
        if checkpointed.iter().any(|id| id == key.as_str()) {
            assert!(registry.classify(&item, &hash, &nlp).existing.is_some(), "{key} checkpointed but not registered");
        }
    }

    let (_, report) = pipeline
        .process(items(), v1(), "aborted", nlp.clone())
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(report.resumed + report.completed + report.skipped, 40);
    assert!(items()
        .iter()
        .all(|item| registry.classify(item, &hash, &nlp).action == Action::Skip));
}
