//! Concurrent pipeline
//!
//! One driver task per run classifies items and feeds a bounded queue; a
//! fixed pool of workers drives each accepted item through
//! acquire -> convert -> analyze. Each stage has its own semaphore, and a
//! permit is held only around that stage's external call.
//!
//! Per item the order is strict: stages, then checkpoint append, then
//! registry commit, then the result is emitted.

use crate::config::PipelineConfig;
use crate::error::{PipelineError, StageError};
use crate::result::{ItemResult, ItemStatus, RunReport, StageTimings};
use crate::stage::{
    AcquiredDocument, Analysis, AnalysisRequest, Analyzer, ConvertedText, Discovery, DocumentConverter,
    DocumentSource, Stage,
};
use futures::Stream;
use papermill_resilience::{
    AttemptOutcome, BreakerRegistry, BreakerSnapshot, CostBudget, FailureKind, FallbackCoordinator, Named,
    ProviderAttempt, ProviderUsage, ResilientCaller,
};
use papermill_store::{
    Action, CacheKey, CacheStore, CheckpointStore, Classification, DataLayout, Namespace, Registry, RegistryEntry,
};
use papermill_types::{DocumentRef, ExtractionTargetSet, Grouping, Item, ItemKey, TargetHash};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch, Mutex, RwLock, Semaphore, SemaphorePermit};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::Instrument;
use ulid::Ulid;

/// Stops a running pipeline.
///
/// The driver stops enqueueing, workers stop taking new items, in-flight
/// items get the configured grace period and are then aborted. Items aborted
/// before their commit began never reach the checkpoint; a commit already
/// under way always finishes both writes.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// True once cancellation was requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    // A dropped handle also ends the run.
    let _ = rx.wait_for(|c| *c).await;
}

/// Merged output of [`Pipeline::discover`]
#[derive(Debug, Default)]
pub struct Discovered {
    /// Items, de-duplicated by key, in source order
    pub items: Vec<Item>,
    /// Items dropped for lack of any identifier
    pub rejected: usize,
    /// Sources whose search failed
    pub failures: Vec<ProviderAttempt>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedAnalysis {
    provider: String,
    analysis: Analysis,
}

struct StageGates {
    acquire: Semaphore,
    convert: Semaphore,
    analyze: Semaphore,
}

struct Shared {
    config: PipelineConfig,
    registry: Registry,
    checkpoints: CheckpointStore,
    cache: CacheStore,
    breakers: Arc<BreakerRegistry>,
    caller: ResilientCaller,
    source: Option<Arc<dyn DocumentSource>>,
    converters: FallbackCoordinator<dyn DocumentConverter>,
    analyzers: FallbackCoordinator<dyn Analyzer>,
    gates: StageGates,
}

struct RunContext {
    run_id: String,
    grouping: Grouping,
    targets: ExtractionTargetSet,
    target_hash: TargetHash,
    halted: AtomicBool,
    completed: AtomicUsize,
    /// Read-held by every commit in flight
    commits: Arc<RwLock<()>>,
}

struct WorkItem {
    item: Item,
    key: ItemKey,
    classification: Classification,
}

/// Assembles a [`Pipeline`]
pub struct PipelineBuilder {
    config: PipelineConfig,
    source: Option<Arc<dyn DocumentSource>>,
    converters: Vec<Arc<dyn DocumentConverter>>,
    analyzers: Vec<Arc<dyn Analyzer>>,
}

impl PipelineBuilder {
    /// Start from a configuration
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            source: None,
            converters: Vec::new(),
            analyzers: Vec::new(),
        }
    }

    /// Acquire-stage backend
    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn DocumentSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Append a converter to the convert fallback chain
    #[must_use]
    pub fn with_converter(mut self, converter: Arc<dyn DocumentConverter>) -> Self {
        self.converters.push(converter);
        self
    }

    /// Append an analyzer to the analyze fallback chain
    #[must_use]
    pub fn with_analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzers.push(analyzer);
        self
    }

    /// Validate the config and open the durable stores.
    ///
    /// # Errors
    /// Invalid config, no analyzer, or a store that cannot be opened.
    pub async fn build(self) -> Result<Pipeline, PipelineError> {
        let config = self.config;
        config.validate()?;
        if self.analyzers.is_empty() {
            return Err(PipelineError::MissingBackend("analyzer"));
        }

        let layout = DataLayout::new(&config.data_dir);
        let registry = Registry::open(layout.registry_entries(), config.registry.clone()).await?;
        let checkpoints = CheckpointStore::open(layout.checkpoints()).await?;
        let cache = CacheStore::new(layout.cache(), config.cache.clone());

        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        let budget = config.budget_usd.map(|usd| Arc::new(CostBudget::new(usd)));

        let converters = self.converters.into_iter().fold(
            FallbackCoordinator::<dyn DocumentConverter>::new("convert")
                .with_retry(config.retry.clone())
                .with_health(config.health.clone()),
            |chain, c| chain.with_backend(c, &breakers),
        );
        let mut analyzers = FallbackCoordinator::<dyn Analyzer>::new("analyze")
            .with_retry(config.retry.clone())
            .with_health(config.health.clone());
        if let Some(budget) = budget {
            analyzers = analyzers.with_budget(budget);
        }
        let analyzers = self
            .analyzers
            .into_iter()
            .fold(analyzers, |chain, a| chain.with_backend(a, &breakers));

        let gates = StageGates {
            acquire: Semaphore::new(config.stages.acquire),
            convert: Semaphore::new(config.stages.convert),
            analyze: Semaphore::new(config.stages.analyze),
        };

        tracing::info!(
            data_dir = %config.data_dir.display(),
            registry_entries = registry.len(),
            converters = converters.providers().len(),
            analyzers = analyzers.providers().len(),
            "Pipeline ready"
        );

        Ok(Pipeline {
            shared: Arc::new(Shared {
                caller: ResilientCaller::new(config.retry.clone(), Arc::clone(&breakers)),
                config,
                registry,
                checkpoints,
                cache,
                breakers,
                source: self.source,
                converters,
                analyzers,
                gates,
            }),
        })
    }
}

/// Bounded, resumable ingestion pipeline
#[derive(Clone)]
pub struct Pipeline {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("data_dir", &self.shared.config.data_dir)
            .field("analyzers", &self.shared.analyzers.providers())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Start assembling a pipeline
    #[must_use]
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    /// Identity registry
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    /// Checkpoint store
    #[must_use]
    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.shared.checkpoints
    }

    /// Result cache
    #[must_use]
    pub fn cache(&self) -> &CacheStore {
        &self.shared.cache
    }

    /// Per-analyzer usage
    #[must_use]
    pub fn analyzer_usage(&self) -> Vec<ProviderUsage> {
        self.shared.analyzers.usage_report()
    }

    /// Per-converter usage
    #[must_use]
    pub fn converter_usage(&self) -> Vec<ProviderUsage> {
        self.shared.converters.usage_report()
    }

    /// State of every breaker used so far
    #[must_use]
    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.shared.breakers.snapshots()
    }

    /// Search `sources` in order and merge their results, de-duplicated by
    /// item key. Results are cached per source and query; failing sources
    /// are reported, not retried.
    pub async fn discover(&self, sources: &[Arc<dyn Discovery>], query: &str) -> Discovered {
        let mut out = Discovered::default();
        let mut seen = HashSet::new();

        for source in sources {
            let cache_key = CacheKey::derive(["discovery", source.name(), query]);
            let items = match self.shared.cache.get::<Vec<Item>>(Namespace::Discovery, &cache_key).await {
                Some(items) => items,
                None => match source.search(query).await {
                    Ok(items) => {
                        self.shared
                            .cache
                            .set_default(Namespace::Discovery, &cache_key, &items)
                            .await;
                        items
                    }
                    Err(err) => {
                        tracing::warn!(source = source.name(), error = %err, "Discovery source failed");
                        out.failures.push(ProviderAttempt {
                            provider: source.name().to_string(),
                            outcome: AttemptOutcome::Failed(err),
                        });
                        continue;
                    }
                },
            };

            for item in items {
                match item.key() {
                    Ok(key) => {
                        if seen.insert(key) {
                            out.items.push(item);
                        }
                    }
                    Err(_) => out.rejected += 1,
                }
            }
        }

        tracing::info!(query, items = out.items.len(), rejected = out.rejected, "Discovery complete");
        out
    }

    /// Process `items` for `targets` under `run_id`, recording completions
    /// in `grouping`.
    ///
    /// Items already in the run's checkpoint are skipped without being
    /// classified or emitted. Results stream back in completion order.
    ///
    /// # Errors
    /// Only when the run's checkpoint cannot be read.
    #[tracing::instrument(skip_all, fields(run_id = %run_id, grouping = %grouping))]
    pub async fn process(
        &self,
        items: Vec<Item>,
        targets: ExtractionTargetSet,
        run_id: &str,
        grouping: Grouping,
    ) -> Result<PipelineRun, PipelineError> {
        let checkpoint = self.shared.checkpoints.load(run_id).await?;
        let target_hash = targets.hash();
        tracing::info!(
            items = items.len(),
            already_done = checkpoint.len(),
            target_hash = %target_hash.short(),
            "Starting run"
        );

        let (results_tx, results_rx) = mpsc::channel(self.shared.config.queue_capacity);
        let (cancel, cancel_rx) = CancelHandle::new();
        let resumed = Arc::new(AtomicUsize::new(0));
        let run = Arc::new(RunContext {
            run_id: run_id.to_string(),
            grouping,
            targets,
            target_hash,
            halted: AtomicBool::new(false),
            completed: AtomicUsize::new(0),
            commits: Arc::new(RwLock::new(())),
        });

        let driver = tokio::spawn(
            drive(
                Arc::clone(&self.shared),
                run,
                items,
                checkpoint.completed_item_ids.into_iter().collect(),
                results_tx,
                cancel_rx,
                Arc::clone(&resumed),
            )
            .in_current_span(),
        );

        Ok(PipelineRun {
            results: results_rx,
            report: RunReport::new(run_id),
            resumed,
            cancel,
            driver,
        })
    }
}

/// Results of one run, as a stream in completion order
pub struct PipelineRun {
    results: mpsc::Receiver<ItemResult>,
    report: RunReport,
    resumed: Arc<AtomicUsize>,
    cancel: CancelHandle,
    driver: JoinHandle<()>,
}

impl PipelineRun {
    /// Handle that stops this run
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Tally of the results yielded so far
    #[must_use]
    pub fn report(&self) -> RunReport {
        let mut report = self.report.clone();
        report.resumed = self.resumed.load(Ordering::Acquire);
        report
    }

    /// True once the driver task has exited
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.driver.is_finished()
    }

    /// Drain the stream
    pub async fn collect(mut self) -> (Vec<ItemResult>, RunReport) {
        let mut results = Vec::new();
        while let Some(result) = futures::StreamExt::next(&mut self).await {
            results.push(result);
        }
        let report = self.report();
        (results, report)
    }
}

impl Stream for PipelineRun {
    type Item = ItemResult;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<ItemResult>> {
        let this = self.get_mut();
        match this.results.poll_recv(cx) {
            Poll::Ready(Some(result)) => {
                this.report.record(&result);
                Poll::Ready(Some(result))
            }
            other => other,
        }
    }
}

impl Drop for PipelineRun {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for PipelineRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRun")
            .field("report", &self.report())
            .finish_non_exhaustive()
    }
}

async fn emit(results: &mpsc::Sender<ItemResult>, result: ItemResult) -> bool {
    metrics::counter!("papermill_items_total", "status" => result.status.as_str()).increment(1);
    results.send(result).await.is_ok()
}

#[allow(clippy::too_many_lines, clippy::too_many_arguments)]
async fn drive(
    shared: Arc<Shared>,
    run: Arc<RunContext>,
    items: Vec<Item>,
    done: HashSet<String>,
    results: mpsc::Sender<ItemResult>,
    mut cancel: watch::Receiver<bool>,
    resumed: Arc<AtomicUsize>,
) {
    let (work_tx, work_rx) = mpsc::channel::<WorkItem>(shared.config.queue_capacity);
    let work_rx = Arc::new(Mutex::new(work_rx));
    let mut workers = JoinSet::new();
    let mut seen = HashSet::new();
    let mut stopped = false;

    for item in items {
        if *cancel.borrow() {
            stopped = true;
            break;
        }

        let title = item.metadata().title.clone();
        let key = match item.key() {
            Ok(key) => key,
            Err(err) => {
                let error = StageError::new(Stage::Intake, FailureKind::Permanent, err.to_string());
                if !emit(&results, ItemResult::failed(None, &title, None, error)).await {
                    stopped = true;
                    break;
                }
                continue;
            }
        };

        if done.contains(key.as_str()) {
            resumed.fetch_add(1, Ordering::AcqRel);
            tracing::debug!(item = %key, "Already checkpointed, skipping");
            continue;
        }
        if !seen.insert(key.clone()) {
            tracing::debug!(item = %key, "Duplicate within batch");
            if !emit(&results, ItemResult::skipped(key, &title, None, None)).await {
                stopped = true;
                break;
            }
            continue;
        }

        let classification = shared.registry.classify(&item, &run.target_hash, &run.grouping);
        let entry_id = classification.existing.as_ref().map(|e| e.id);
        tracing::debug!(item = %key, action = %classification.action, "Classified");

        let delivered = match classification.action {
            Action::Skip => emit(&results, ItemResult::skipped(key, &title, Some(Action::Skip), entry_id)).await,
            Action::MapOnly => {
                let result = match shared
                    .registry
                    .commit(&item, &run.grouping, &run.target_hash, classification.existing.as_ref())
                    .await
                {
                    Ok(entry) => ItemResult::skipped(key, &title, Some(Action::MapOnly), Some(entry.id)),
                    Err(err) => {
                        tracing::warn!(item = %key, error = %err, "Failed to record grouping");
                        ItemResult::failed(Some(key), &title, Some(Action::MapOnly), StageError::commit(&err))
                    }
                };
                emit(&results, result).await
            }
            Action::New | Action::Backfill => {
                if workers.is_empty() {
                    for _ in 0..shared.config.effective_workers() {
                        workers.spawn(
                            work_loop(
                                Arc::clone(&shared),
                                Arc::clone(&run),
                                Arc::clone(&work_rx),
                                results.clone(),
                                cancel.clone(),
                            )
                            .in_current_span(),
                        );
                    }
                }
                let work = WorkItem {
                    item,
                    key,
                    classification,
                };
                tokio::select! {
                    biased;
                    () = cancelled(&mut cancel) => false,
                    sent = work_tx.send(work) => sent.is_ok(),
                }
            }
        };
        if !delivered {
            stopped = true;
            break;
        }
    }
    drop(work_tx);

    // A cancel can also arrive after the last item was enqueued.
    if !stopped {
        stopped = tokio::select! {
            biased;
            () = join_workers(&mut workers) => false,
            () = cancelled(&mut cancel) => true,
        };
    }

    if stopped {
        let grace = shared.config.shutdown_grace();
        tracing::warn!(grace_secs = grace.as_secs(), "Run stopped, waiting for in-flight items");
        if tokio::time::timeout(grace, join_workers(&mut workers)).await.is_err() {
            tracing::warn!(remaining = workers.len(), "Grace period elapsed, aborting workers");
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }
        // Commits outlive their aborted workers; wait for them to land.
        drop(run.commits.write().await);
    } else {
        let touched = run.completed.load(Ordering::Acquire) > 0 || resumed.load(Ordering::Acquire) > 0;
        if touched {
            if let Err(err) = shared.checkpoints.mark_complete(&run.run_id).await {
                tracing::warn!(error = %err, "Failed to mark checkpoint complete");
            }
        }
    }

    tracing::info!(
        completed = run.completed.load(Ordering::Acquire),
        resumed = resumed.load(Ordering::Acquire),
        cancelled = stopped,
        "Run finished"
    );
}

async fn join_workers(workers: &mut JoinSet<()>) {
    while let Some(joined) = workers.join_next().await {
        if let Err(err) = joined {
            if !err.is_cancelled() {
                tracing::error!(error = %err, "Worker task failed");
            }
        }
    }
}

async fn work_loop(
    shared: Arc<Shared>,
    run: Arc<RunContext>,
    queue: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    results: mpsc::Sender<ItemResult>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        let next = {
            let mut rx = queue.lock().await;
            tokio::select! {
                biased;
                () = cancelled(&mut cancel) => None,
                work = rx.recv() => work,
            }
        };
        let Some(work) = next else { break };

        let result = shared.process_item(&run, work).await;
        if !emit(&results, result).await {
            break;
        }
    }
}

impl Shared {
    async fn gate(&self, stage: Stage) -> Result<SemaphorePermit<'_>, StageError> {
        let semaphore = match stage {
            Stage::Acquire => &self.gates.acquire,
            Stage::Convert => &self.gates.convert,
            _ => &self.gates.analyze,
        };
        semaphore
            .acquire()
            .await
            .map_err(|_| StageError::new(stage, FailureKind::Transient, "stage closed"))
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(item = %work.key, action = %work.classification.action)
    )]
    async fn process_item(self: &Arc<Self>, run: &Arc<RunContext>, work: WorkItem) -> ItemResult {
        let started = Instant::now();
        let WorkItem {
            item,
            key,
            classification,
        } = work;
        let action = classification.action;
        let title = item.metadata().title.clone();
        let mut timings = StageTimings::default();

        let outcome = match self.run_stages(run, &item, &key, &mut timings).await {
            Ok((analysis, provider)) => self
                .commit(run, &item, &key, classification.existing.as_ref())
                .await
                .map(|entry_id| (analysis, provider, entry_id)),
            Err(err) => Err(err),
        };

        let mut result = match outcome {
            Ok((analysis, provider, entry_id)) => {
                run.completed.fetch_add(1, Ordering::AcqRel);
                ItemResult {
                    key: Some(key),
                    title,
                    status: ItemStatus::Completed,
                    action: Some(action),
                    entry_id: Some(entry_id),
                    timings,
                    total: started.elapsed(),
                    provider: Some(provider),
                    analysis: Some(analysis),
                    error: None,
                }
            }
            Err(err) => {
                tracing::warn!(stage = %err.stage, kind = %err.kind, error = %err.message, "Item failed");
                ItemResult::failed(Some(key), &title, Some(action), err)
            }
        };
        result.timings = timings;
        result.total = started.elapsed();
        result
    }

    async fn run_stages(
        &self,
        run: &RunContext,
        item: &Item,
        key: &ItemKey,
        timings: &mut StageTimings,
    ) -> Result<(Analysis, String), StageError> {
        let text = match item.document() {
            Some(document) => self.document_text(item, document, timings).await?,
            None => None,
        };
        self.analyze(run, item, key, text, timings).await
    }

    async fn document_text(
        &self,
        item: &Item,
        document: &DocumentRef,
        timings: &mut StageTimings,
    ) -> Result<Option<ConvertedText>, StageError> {
        let Some(source) = &self.source else {
            tracing::debug!("No document source configured, analyzing metadata only");
            return Ok(None);
        };
        if self.converters.providers().is_empty() {
            tracing::debug!("No converter configured, analyzing metadata only");
            return Ok(None);
        }

        let cache_key = CacheKey::derive(["converted", document.canonical().as_str()]);
        if let Some(text) = self.cache.get::<ConvertedText>(Namespace::Documents, &cache_key).await {
            return Ok(Some(text));
        }

        let acquired: AcquiredDocument = {
            let _permit = self.gate(Stage::Acquire).await?;
            let started = Instant::now();
            let outcome = self
                .caller
                .call(source.name(), move |_| source.acquire(item, document))
                .await;
            timings.record(Stage::Acquire, started.elapsed());
            outcome.map_err(|err| StageError::from_resilience(Stage::Acquire, &err))?
        };

        let text = {
            let _permit = self.gate(Stage::Convert).await?;
            let started = Instant::now();
            let acquired = &acquired;
            let outcome = self
                .converters
                .execute(move |converter| async move { converter.convert(acquired).await })
                .await;
            timings.record(Stage::Convert, started.elapsed());
            outcome
                .map_err(|err| StageError::from_resilience(Stage::Convert, &err))?
                .value
        };

        self.cache
            .set_default(Namespace::Documents, &cache_key, &text)
            .await;
        Ok(Some(text))
    }

    fn halted_error() -> StageError {
        StageError::new(
            Stage::Analyze,
            FailureKind::ResourceExhausted,
            "analysis halted: cost budget exhausted",
        )
    }

    async fn analyze(
        &self,
        run: &RunContext,
        item: &Item,
        key: &ItemKey,
        text: Option<ConvertedText>,
        timings: &mut StageTimings,
    ) -> Result<(Analysis, String), StageError> {
        let target_hash = run.target_hash.to_string();
        let cache_key = CacheKey::derive(["analysis", key.as_str(), target_hash.as_str()]);
        if let Some(hit) = self.cache.get::<CachedAnalysis>(Namespace::Analysis, &cache_key).await {
            return Ok((hit.analysis, hit.provider));
        }
        if run.halted.load(Ordering::Acquire) {
            return Err(Self::halted_error());
        }

        let request = AnalysisRequest {
            item: key.clone(),
            metadata: item.metadata().clone(),
            text,
            targets: run.targets.clone(),
        };

        let outcome = {
            let _permit = self.gate(Stage::Analyze).await?;
            if run.halted.load(Ordering::Acquire) {
                return Err(Self::halted_error());
            }
            let started = Instant::now();
            let request = &request;
            let outcome = self
                .analyzers
                .execute(move |analyzer| async move { analyzer.analyze(request).await })
                .await;
            timings.record(Stage::Analyze, started.elapsed());
            outcome
        };

        match outcome {
            Ok(won) => {
                let cached = CachedAnalysis {
                    provider: won.provider,
                    analysis: won.value,
                };
                self.cache
                    .set_default(Namespace::Analysis, &cache_key, &cached)
                    .await;
                Ok((cached.analysis, cached.provider))
            }
            Err(err) => {
                if err.is_budget_exhausted() && !run.halted.swap(true, Ordering::AcqRel) {
                    tracing::warn!(error = %err, "Cost budget exhausted, halting analysis for this run");
                }
                Err(StageError::from_resilience(Stage::Analyze, &err))
            }
        }
    }

    /// Checkpoint append plus registry commit, run as its own task so that
    /// aborting the worker cannot leave one write without the other.
    async fn commit(
        self: &Arc<Self>,
        run: &Arc<RunContext>,
        item: &Item,
        key: &ItemKey,
        existing: Option<&RegistryEntry>,
    ) -> Result<Ulid, StageError> {
        let in_flight = Arc::clone(&run.commits).read_owned().await;
        let shared = Arc::clone(self);
        let run = Arc::clone(run);
        let (item, key, existing) = (item.clone(), key.clone(), existing.cloned());
        let task = tokio::spawn(
            async move {
                let _in_flight = in_flight;
                shared.commit_pair(&run, &item, &key, existing.as_ref()).await
            }
            .in_current_span(),
        );
        task.await.map_err(|err| {
            StageError::new(Stage::Commit, FailureKind::StateCorruption, format!("commit task failed: {err}"))
        })?
    }

    async fn commit_pair(
        &self,
        run: &RunContext,
        item: &Item,
        key: &ItemKey,
        existing: Option<&RegistryEntry>,
    ) -> Result<Ulid, StageError> {
        self.checkpoints
            .append(&run.run_id, key.as_str())
            .await
            .map_err(|err| StageError::commit(&err))?;

        match self
            .registry
            .commit(item, &run.grouping, &run.target_hash, existing)
            .await
        {
            Ok(entry) => Ok(entry.id),
            Err(err) => {
                tracing::warn!(error = %err, "Registry commit failed, rolling back checkpoint");
                if let Err(undo) = self.checkpoints.remove(&run.run_id, key.as_str()).await {
                    tracing::error!(error = %undo, "Checkpoint rollback failed");
                }
                Err(StageError::commit(&err))
            }
        }
    }
}
