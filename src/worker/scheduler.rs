//! Batch scheduler: bounded-concurrency analysis of a collection of emails.
//!
//! Per batch:
//! - every conversation is scored once and its chain analysis upserted
//! - items run on a `JoinSet`, at most `max_concurrency` at a time
//! - each item goes Phase 1 → route → Phase 2/3 through the cache → one upsert
//!
//! Shutdown: cancelling the token stops intake, queued items are cancelled,
//! in-flight items stop at their next phase boundary, and anything still
//! running after `shutdown_grace` is aborted without being persisted. The
//! abort reaches the cached computations too, so no backend call outlives
//! its batch.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast};
use tokio::task::JoinSet;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{AnalysisCache, CacheSource, Fingerprint};
use crate::config::{BatchConfig, CacheConfig, PipelineConfig};
use crate::error::{self, PipelineError};
use crate::llm::{InferenceBackend, RetryPolicy, create_backend};
use crate::metrics::PipelineMetrics;
use crate::pipeline::chain::{ChainAnalyzer, group_by_conversation};
use crate::pipeline::entities::EntityExtractor;
use crate::pipeline::processor::{InferenceAnalyzer, PhaseInput};
use crate::pipeline::record::{AnalysisRecord, RecordEvent, reduce};
use crate::pipeline::router::PhaseRouter;
use crate::pipeline::rules::RuleBasedAnalyzer;
use crate::pipeline::types::{
    ChainAnalysis, Email, InferenceOutcome, Phase, Phase2Result, ResultSource, millis,
};
use crate::store::{AnalysisStore, LibSqlBackend, MemoryStore};
use crate::worker::events::{BatchEvent, ProgressCounters, ProgressTracker};
use crate::worker::state::{BatchJob, BatchSummary, ItemOutcome, ItemReport, sample_errors};

/// Cache of inference phase results.
pub type PhaseCache = AnalysisCache<InferenceOutcome, PipelineError>;

/// Phase cache that keeps model answers only; fallbacks are recomputed.
pub fn phase_cache(config: &CacheConfig) -> PhaseCache {
    PhaseCache::new(config).retain_if(InferenceOutcome::from_model)
}

const EVENT_CAPACITY: usize = 1024;

/// State shared by every item task.
struct Shared {
    config: BatchConfig,
    prompt_version: String,
    rules: RuleBasedAnalyzer,
    router: PhaseRouter,
    inference: Option<Arc<InferenceAnalyzer>>,
    store: Arc<dyn AnalysisStore>,
    cache: Arc<PhaseCache>,
    metrics: Arc<PipelineMetrics>,
    retry: RetryPolicy,
    events: broadcast::Sender<BatchEvent>,
}

/// Per-batch bookkeeping.
struct BatchRun {
    batch_id: Uuid,
    progress: ProgressTracker,
    active: AtomicUsize,
    peak: AtomicUsize,
    /// Fired when the grace period runs out; stops inference computations.
    abort: CancellationToken,
}

/// Holds a concurrency permit and the active-item count for one task.
struct ActiveSlot<'a> {
    run: &'a BatchRun,
    _permit: OwnedSemaphorePermit,
}

impl BatchRun {
    fn new(total: usize) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            progress: ProgressTracker::new(total),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            abort: CancellationToken::new(),
        }
    }

    fn occupy(&self, permit: OwnedSemaphorePermit) -> ActiveSlot<'_> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        ActiveSlot {
            run: self,
            _permit: permit,
        }
    }
}

impl Drop for ActiveSlot<'_> {
    fn drop(&mut self) {
        self.run.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Result of one inference phase.
struct PhaseRun {
    outcome: InferenceOutcome,
    source: CacheSource,
    retries: u32,
}

/// Runs batches of emails through the analysis pipeline.
pub struct BatchScheduler {
    shared: Arc<Shared>,
    chain_analyzer: ChainAnalyzer,
}

impl BatchScheduler {
    /// Validate `config`, build its inference backend and open the store:
    /// a local libSQL database at `db_path`, or memory when `None`.
    pub async fn open(config: &PipelineConfig, db_path: Option<&Path>) -> error::Result<Self> {
        config.validate()?;

        let backend = create_backend(&config.inference)?;
        if let Some(backend) = &backend {
            info!(
                provider = backend.provider(),
                model = %config.inference.model,
                deep_model = config.inference.deep_model(),
                "Inference backend ready"
            );
        }

        let store: Arc<dyn AnalysisStore> = match db_path {
            Some(path) => Arc::new(LibSqlBackend::new_local(path).await?),
            None => {
                info!("No database path, using in-memory store");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::new(config, backend, store))
    }

    /// Without a backend every item is routed to Phase 1 only.
    pub fn new(
        config: &PipelineConfig,
        backend: Option<Arc<dyn InferenceBackend>>,
        store: Arc<dyn AnalysisStore>,
    ) -> Self {
        Self::with_cache(config, backend, store, Arc::new(phase_cache(&config.cache)))
    }

    /// Use an existing cache (shared across schedulers, or with a test clock).
    /// Build it with [`phase_cache`] so fallback answers are not memoized.
    pub fn with_cache(
        config: &PipelineConfig,
        backend: Option<Arc<dyn InferenceBackend>>,
        store: Arc<dyn AnalysisStore>,
        cache: Arc<PhaseCache>,
    ) -> Self {
        let extractor = EntityExtractor::new(config.max_part_numbers);

        let mut policy = config.routing.clone();
        if backend.is_none() && !policy.phase1_only {
            info!("No inference backend configured, running Phase 1 only");
            policy.phase1_only = true;
        }

        let mut rules = RuleBasedAnalyzer::default_rules(extractor.clone());
        for pattern in &config.priority_senders {
            if let Err(err) = rules.add_priority_sender(pattern) {
                warn!(pattern = %pattern, error = %err, "Ignoring invalid priority sender pattern");
            }
        }

        let inference = backend
            .map(|backend| Arc::new(InferenceAnalyzer::new(backend, config.inference.clone())));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            shared: Arc::new(Shared {
                config: config.batch.clone(),
                prompt_version: config.cache.prompt_version.clone(),
                rules,
                router: PhaseRouter::new(policy),
                inference,
                store,
                cache,
                metrics: Arc::new(PipelineMetrics::new()),
                retry: RetryPolicy::from_config(&config.batch),
                events,
            }),
            chain_analyzer: ChainAnalyzer::new(config.chain.clone(), extractor),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.shared.config
    }

    pub fn cache(&self) -> &Arc<PhaseCache> {
        &self.shared.cache
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.shared.metrics
    }

    /// Receive every batch event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.shared.events.subscribe()
    }

    /// Events as a stream. Events missed by a lagging consumer are skipped.
    pub fn progress_stream(&self) -> impl Stream<Item = BatchEvent> + Send + Unpin + 'static {
        BroadcastStream::new(self.subscribe()).filter_map(|event| event.ok())
    }

    /// Analyse `emails`. Returns once every item is terminal.
    pub async fn run_batch(&self, emails: Vec<Email>, cancel: CancellationToken) -> BatchSummary {
        let started = Instant::now();
        let shared = &self.shared;
        let run = Arc::new(BatchRun::new(emails.len()));
        let batch_id = run.batch_id;

        info!(
            %batch_id,
            total = emails.len(),
            max_concurrency = shared.config.max_concurrency,
            "Batch started"
        );
        shared.emit(BatchEvent::BatchStarted {
            batch_id,
            progress: run.progress.snapshot(),
        });

        let chains = self.analyze_chains(&emails).await;

        let semaphore = Arc::new(Semaphore::new(shared.config.max_concurrency));
        let mut join_set: JoinSet<ItemReport> = JoinSet::new();
        let mut task_emails: HashMap<tokio::task::Id, String> = HashMap::new();
        let mut reports: Vec<ItemReport> = Vec::with_capacity(emails.len());

        let mut queue = emails.into_iter();
        let mut unstarted: Vec<Email> = Vec::new();
        while let Some(email) = queue.next() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                unstarted.push(email);
                break;
            };

            let chain = chains
                .get(&email.conversation_id)
                .cloned()
                .unwrap_or_else(|| Arc::new(ChainAnalysis::unknown(email.conversation_id.clone())));
            let email_id = email.id.clone();
            let handle = join_set.spawn(run_item(
                Arc::clone(shared),
                Arc::clone(&run),
                BatchJob::new(email, chain),
                permit,
                cancel.clone(),
            ));
            task_emails.insert(handle.id(), email_id);
        }

        unstarted.extend(queue);
        if !unstarted.is_empty() {
            info!(%batch_id, cancelled = unstarted.len(), "Intake stopped, cancelling queued items");
        }
        for email in unstarted {
            let report = ItemReport::cancelled(email.id, None);
            shared.complete(&run, &report);
            reports.push(report);
        }

        self.drain(&run, &mut join_set, &mut task_emails, &cancel, &mut reports)
            .await;

        let counters = run.progress.snapshot();
        shared.emit(BatchEvent::BatchCompleted {
            batch_id,
            progress: counters,
        });

        let summary = BatchSummary {
            batch_id,
            counters,
            sample_errors: sample_errors(&reports),
            items: reports,
            elapsed: started.elapsed(),
            peak_concurrency: run.peak.load(Ordering::SeqCst),
            cache: shared.cache.stats(),
        };
        info!(
            %batch_id,
            total = counters.total,
            succeeded = counters.succeeded,
            failed = counters.failed,
            cancelled = counters.cancelled,
            from_cache = counters.from_cache,
            peak_concurrency = summary.peak_concurrency,
            elapsed_ms = millis(summary.elapsed),
            "Batch completed"
        );
        summary
    }

    /// Score each conversation once and upsert the result. Persistence
    /// failures here are logged; items still run.
    async fn analyze_chains(&self, emails: &[Email]) -> HashMap<String, Arc<ChainAnalysis>> {
        let mut analyses = HashMap::new();
        for chain in group_by_conversation(emails) {
            let analysis = self.chain_analyzer.analyze(&chain.emails);
            debug!(
                chain_id = %analysis.chain_id,
                chain_type = %analysis.chain_type,
                score = analysis.completeness_score,
                complete = analysis.is_complete,
                "Chain analysed"
            );
            if !chain.conversation_id.trim().is_empty()
                && let Err(err) = self.shared.store.upsert_chain(&analysis).await
            {
                warn!(chain_id = %analysis.chain_id, error = %err, "Failed to persist chain analysis");
            }
            analyses.insert(chain.conversation_id, Arc::new(analysis));
        }
        analyses
    }

    /// Wait for every spawned item. Once cancelled, stragglers get
    /// `shutdown_grace` before being aborted.
    async fn drain(
        &self,
        run: &BatchRun,
        join_set: &mut JoinSet<ItemReport>,
        task_emails: &mut HashMap<tokio::task::Id, String>,
        cancel: &CancellationToken,
        reports: &mut Vec<ItemReport>,
    ) {
        let grace = self.shared.config.shutdown_grace;
        let mut deadline: Option<tokio::time::Instant> = None;
        let mut aborted = false;

        loop {
            let grace_elapsed = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                joined = join_set.join_next_with_id() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok((id, report)) => {
                            task_emails.remove(&id);
                            reports.push(report);
                        }
                        Err(err) => {
                            let email_id = task_emails.remove(&err.id()).unwrap_or_default();
                            let report = if err.is_panic() {
                                warn!(batch_id = %run.batch_id, email_id = %email_id, "Item task panicked");
                                ItemReport {
                                    outcome: ItemOutcome::Failed,
                                    ..ItemReport::cancelled(email_id, Some("analysis task panicked".into()))
                                }
                            } else {
                                ItemReport::cancelled(email_id, Some("aborted after shutdown grace period".into()))
                            };
                            self.shared.complete(run, &report);
                            reports.push(report);
                        }
                    }
                }
                _ = cancel.cancelled(), if deadline.is_none() => {
                    info!(
                        batch_id = %run.batch_id,
                        in_flight = join_set.len(),
                        grace_ms = millis(grace),
                        "Shutdown requested, draining in-flight items"
                    );
                    deadline = Some(tokio::time::Instant::now() + grace);
                }
                _ = grace_elapsed, if !aborted => {
                    warn!(
                        batch_id = %run.batch_id,
                        remaining = join_set.len(),
                        "Shutdown grace elapsed, aborting remaining items"
                    );
                    join_set.abort_all();
                    run.abort.cancel();
                    aborted = true;
                }
            }
        }
    }
}

/// Analyse one item and persist its final snapshot.
async fn run_item(
    shared: Arc<Shared>,
    run: Arc<BatchRun>,
    mut job: BatchJob,
    permit: OwnedSemaphorePermit,
    cancel: CancellationToken,
) -> ItemReport {
    let _slot = run.occupy(permit);
    let started = Instant::now();
    let mut cache_hits = 0;

    let mut record = shared.analyze(&run, &mut job, &cancel, &mut cache_hits).await;

    let mut persisted = false;
    if !record.email_id.trim().is_empty() {
        match shared.persist(&record).await {
            Ok(()) => persisted = true,
            Err(err) => {
                warn!(email_id = %record.email_id, error = %err, "Giving up on persisting record");
                record = reduce(&record, RecordEvent::Failed { phase: None, error: err }, Utc::now());
            }
        }
    }

    let report = ItemReport::from_record(&record, persisted, job.retries, cache_hits, started.elapsed());
    shared.complete(&run, &report);
    report
}

impl Shared {
    fn emit(&self, event: BatchEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Drive one email through its planned phases. Never fails: every
    /// problem ends up in the returned record.
    async fn analyze(
        &self,
        run: &BatchRun,
        job: &mut BatchJob,
        cancel: &CancellationToken,
        cache_hits: &mut u32,
    ) -> AnalysisRecord {
        let BatchJob { email, chain, retries } = job;

        let mut record = AnalysisRecord::new(email, chain.chain_type, chain.completeness_score, Utc::now());
        if let Err(err) = email.validate() {
            warn!(email_id = %email.id, error = %err, "Rejecting invalid email");
            return reduce(&record, RecordEvent::Failed { phase: None, error: err }, Utc::now());
        }

        // Phase 1
        self.phase_started(run, &email.id, Phase::Phase1);
        let phase_started = Instant::now();
        let phase1 = self.rules.analyze(email, Utc::now());
        let elapsed = phase_started.elapsed();
        record = reduce(&record, RecordEvent::Phase1(phase1.clone()), Utc::now());
        self.phase_completed(run, &email.id, Phase::Phase1, false, None, elapsed);

        let mut decision = self.router.route(email, chain, phase1.priority);
        record = reduce(&record, RecordEvent::Routed(decision.clone()), Utc::now());
        debug!(
            email_id = %email.id,
            plan = ?decision.plan,
            reason = %decision.reason(),
            "Routed"
        );

        let mut phase2: Option<Phase2Result> = None;
        for phase in [Phase::Phase2, Phase::Phase3] {
            if !decision.plan.includes(phase) {
                break;
            }
            if cancel.is_cancelled() {
                info!(email_id = %email.id, next_phase = %phase, "Stopping at phase boundary");
                record = reduce(&record, RecordEvent::Interrupted, Utc::now());
                break;
            }
            let Some(analyzer) = self.inference.as_ref() else {
                break;
            };

            let input = PhaseInput {
                email: email.clone(),
                chain: (**chain).clone(),
                phase1: phase1.clone(),
                phase2: phase2.clone(),
            };
            self.phase_started(run, &email.id, phase);
            let phase_started = Instant::now();

            match self.run_inference(analyzer, phase, input, &run.abort).await {
                Ok(done) => {
                    *retries += done.retries;
                    let from_cache = done.source.is_hit();
                    if from_cache {
                        *cache_hits += 1;
                    }
                    let source = done.outcome.source();
                    match done.outcome {
                        InferenceOutcome::Phase2(result) => {
                            record = reduce(&record, RecordEvent::Phase2(result.clone()), Utc::now());
                            let next = self.router.route_after_phase2(decision.clone(), chain, &result);
                            if next.plan != decision.plan {
                                record = reduce(&record, RecordEvent::Routed(next.clone()), Utc::now());
                            }
                            decision = next;
                            phase2 = Some(result);
                        }
                        InferenceOutcome::Phase3(result) => {
                            record = reduce(&record, RecordEvent::Phase3(result), Utc::now());
                        }
                    }
                    self.phase_completed(run, &email.id, phase, from_cache, Some(source), phase_started.elapsed());
                }
                Err(err) => {
                    self.metrics.record_phase_failure(phase);
                    warn!(
                        email_id = %email.id,
                        phase = %phase,
                        kind = err.kind(),
                        error = %err,
                        "Phase failed"
                    );
                    record = reduce(
                        &record,
                        RecordEvent::Failed {
                            phase: Some(phase),
                            error: err,
                        },
                        Utc::now(),
                    );
                    break;
                }
            }
        }

        record
    }

    /// One inference phase: cache lookup or compute. The computation owns
    /// the retry loop and the phase timeout, and stops when `abort` fires.
    async fn run_inference(
        &self,
        analyzer: &Arc<InferenceAnalyzer>,
        phase: Phase,
        input: PhaseInput,
        abort: &CancellationToken,
    ) -> Result<PhaseRun, PipelineError> {
        let key = Fingerprint::new(
            &input.email.content_hash(),
            phase,
            analyzer.model_for(phase),
            &self.prompt_version,
        );
        let retries = Arc::new(AtomicU32::new(0));
        let timeout = self.config.phase_timeout;
        let compute = {
            let analyzer = Arc::clone(analyzer);
            let retry = self.retry.clone();
            let retries = Arc::clone(&retries);
            let abort = abort.clone();
            move || async move {
                let attempts = async {
                    let (result, used) = retry
                        .run(phase.as_str(), |_| analyzer.analyze(phase, &input))
                        .await;
                    retries.store(used, Ordering::Relaxed);
                    result
                };
                tokio::select! {
                    biased;
                    _ = abort.cancelled() => {
                        Err(PipelineError::Aborted("aborted after shutdown grace period".into()))
                    }
                    finished = tokio::time::timeout(timeout, attempts) => {
                        finished.unwrap_or_else(|_| {
                            Err(PipelineError::Timeout {
                                phase: phase.to_string(),
                                timeout,
                            })
                        })
                    }
                }
            }
        };

        let result = self.cache.get_or_compute(key, compute).await;
        let used = retries.load(Ordering::Relaxed);
        self.metrics.record_retries(used);

        result.map(|(outcome, source)| PhaseRun {
            outcome,
            source,
            retries: used,
        })
    }

    /// One upsert, retried once.
    async fn persist(&self, record: &AnalysisRecord) -> Result<(), PipelineError> {
        if let Err(first) = self.store.upsert_record(record).await {
            warn!(email_id = %record.email_id, error = %first, "Persisting record failed, retrying once");
            self.metrics.record_persistence_retry();
            tokio::time::sleep(self.retry.delay(0)).await;
            self.store.upsert_record(record).await?;
        }
        Ok(())
    }

    fn phase_started(&self, run: &BatchRun, email_id: &str, phase: Phase) {
        self.emit(BatchEvent::PhaseStarted {
            batch_id: run.batch_id,
            email_id: email_id.to_string(),
            phase,
            progress: run.progress.snapshot(),
        });
    }

    fn phase_completed(
        &self,
        run: &BatchRun,
        email_id: &str,
        phase: Phase,
        from_cache: bool,
        source: Option<ResultSource>,
        elapsed: Duration,
    ) {
        self.metrics.record_phase(phase, elapsed, from_cache, source);
        let progress = if from_cache {
            run.progress.record_cache_hit()
        } else {
            run.progress.snapshot()
        };
        self.emit(BatchEvent::PhaseCompleted {
            batch_id: run.batch_id,
            email_id: email_id.to_string(),
            phase,
            from_cache,
            elapsed,
            progress,
        });
    }

    /// Count a terminal item and announce it. Synchronous so an abort can
    /// never count an item twice.
    fn complete(&self, run: &BatchRun, report: &ItemReport) {
        match report.outcome {
            ItemOutcome::Succeeded => self.metrics.record_succeeded(),
            ItemOutcome::Failed => self.metrics.record_failed(),
            ItemOutcome::Cancelled => self.metrics.record_cancelled(),
        }

        if report.outcome == ItemOutcome::Failed
            && let Some(error) = &report.error
        {
            self.emit(BatchEvent::ItemError {
                batch_id: run.batch_id,
                email_id: report.email_id.clone(),
                phase: report.failed_phase,
                error: error.clone(),
                progress: run.progress.snapshot(),
            });
        }

        let progress: ProgressCounters = run.progress.record(report.outcome);
        info!(
            batch_id = %run.batch_id,
            email_id = %report.email_id,
            outcome = %report.outcome,
            priority = ?report.priority,
            processed = progress.processed,
            total = progress.total,
            "Item finished"
        );
        self.emit(BatchEvent::ItemCompleted {
            batch_id: run.batch_id,
            email_id: report.email_id.clone(),
            outcome: report.outcome,
            status: report.status,
            progress,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;
    use crate::error::LlmError;
    use crate::llm::{InferenceRequest, InferenceResponse};
    use crate::pipeline::record::AnalysisStatus;
    use crate::pipeline::types::Priority;
    use crate::store::MemoryStore;

    const ANSWER: &str = r#"{
        "workflow_state": "in_progress",
        "priority": "high",
        "intent": "request_quote",
        "summary": "Buyer requests pricing for 200 valves under quote Q-55120",
        "workflow_validation": "Consistent with an open quote request awaiting pricing",
        "missed_entities": {},
        "confidence": 0.8,
        "suggested_response": "Thank you, pricing follows within one business day.",
        "action_items": ["Prepare quote"],
        "risk_level": "low",
        "business_impact": "Potential order"
    }"#;

    /// Replies with [`ANSWER`] after `delay`; the first `fail_first` calls
    /// fail with a connection error and the next `garble_first` get prose.
    struct ScriptedBackend {
        delay: Duration,
        fail_first: usize,
        garble_first: usize,
        calls: AtomicUsize,
    }

    impl ScriptedBackend {
        fn new(delay: Duration, fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                delay,
                fail_first,
                garble_first: 0,
                calls: AtomicUsize::new(0),
            })
        }

        fn garbling(garble_first: usize) -> Arc<Self> {
            Arc::new(Self {
                delay: Duration::from_millis(1),
                fail_first: 0,
                garble_first,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl InferenceBackend for ScriptedBackend {
        fn provider(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: InferenceRequest) -> Result<InferenceResponse, LlmError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if call < self.fail_first {
                return Err(LlmError::Connection {
                    provider: "scripted".into(),
                    reason: "connection reset".into(),
                });
            }
            let content = if call < self.fail_first.saturating_add(self.garble_first) {
                "Sorry, I can't classify this one."
            } else {
                ANSWER
            };
            Ok(InferenceResponse {
                content: content.to_string(),
                model: request.model,
                elapsed: self.delay,
            })
        }
    }

    fn config(max_concurrency: usize) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.batch.max_concurrency = max_concurrency;
        config.batch.backoff_base = Duration::from_millis(1);
        config.batch.backoff_max = Duration::from_millis(5);
        config.batch.phase_timeout = Duration::from_secs(5);
        config.batch.shutdown_grace = Duration::from_secs(5);
        config
    }

    fn email(id: &str, conversation: &str, important: bool) -> Email {
        Email {
            id: id.into(),
            conversation_id: conversation.into(),
            subject: format!("RFQ {id}: pricing for valves"),
            body: "Please quote 200 units of part VX-2200.".into(),
            sender: "buyer@acme.com".into(),
            recipients: vec!["sales@vendor.com".into()],
            received_at: Utc::now(),
            is_important: important,
            has_attachments: false,
        }
    }

    fn scheduler(
        config: &PipelineConfig,
        backend: Option<Arc<ScriptedBackend>>,
    ) -> (BatchScheduler, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let backend = backend.map(|b| b as Arc<dyn InferenceBackend>);
        (BatchScheduler::new(config, backend, store.clone()), store)
    }

    #[tokio::test]
    async fn open_with_memory_store_and_no_backend() {
        let scheduler = BatchScheduler::open(&config(2), None).await.unwrap();
        let summary = scheduler
            .run_batch(vec![email("e1", "c1", true)], CancellationToken::new())
            .await;
        assert_eq!(summary.counters.succeeded, 1);
        assert_eq!(summary.report("e1").unwrap().phases_completed, vec![Phase::Phase1]);
    }

    #[tokio::test]
    async fn open_rejects_invalid_config() {
        let mut config = config(2);
        config.batch.max_concurrency = 0;
        let err = BatchScheduler::open(&config, None).await.err().unwrap();
        assert!(matches!(err, error::Error::Config(_)));
    }

    #[tokio::test]
    async fn no_backend_runs_phase1_only() {
        let (scheduler, store) = scheduler(&config(2), None);
        let emails = vec![email("e1", "c1", true), email("e2", "c2", false)];

        let summary = scheduler.run_batch(emails, CancellationToken::new()).await;

        assert_eq!(summary.counters.succeeded, 2);
        assert!(summary.all_terminal());
        for record in store.all_records().await {
            assert_eq!(record.status, AnalysisStatus::Complete);
            assert_eq!(record.phases_completed, vec![Phase::Phase1]);
            assert!(record.deep.is_none());
        }
        assert!(store.get_chain("c1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn elevated_item_gets_inference_phases() {
        let backend = ScriptedBackend::new(Duration::from_millis(5), 0);
        let (scheduler, store) = scheduler(&config(2), Some(backend.clone()));

        let summary = scheduler
            .run_batch(vec![email("e1", "c1", true), email("e2", "c2", false)], CancellationToken::new())
            .await;

        assert_eq!(summary.counters.succeeded, 2);
        // Phase 2 keeps the item elevated, so Phase 3 follows
        let elevated = store.get_record("e1").await.unwrap().unwrap();
        assert_eq!(elevated.phases_completed, vec![Phase::Phase1, Phase::Phase2, Phase::Phase3]);
        assert!(elevated.deep.is_some());
        assert!(elevated.routing_reason.as_deref().unwrap().contains("phase2 priority"));
        let routine = store.get_record("e2").await.unwrap().unwrap();
        assert_eq!(routine.phases_completed, vec![Phase::Phase1]);
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn forced_deep_analysis_runs_all_phases() {
        let mut config = config(1);
        config.routing.force_deep_analysis = true;
        let backend = ScriptedBackend::new(Duration::from_millis(1), 0);
        let (scheduler, store) = scheduler(&config, Some(backend));

        let summary = scheduler
            .run_batch(vec![email("e1", "c1", false)], CancellationToken::new())
            .await;

        assert_eq!(summary.counters.succeeded, 1);
        let record = store.get_record("e1").await.unwrap().unwrap();
        assert_eq!(record.phases_completed, vec![Phase::Phase1, Phase::Phase2, Phase::Phase3]);
        assert!(record.final_analysis.is_some());
    }

    #[tokio::test]
    async fn identical_content_is_served_from_cache() {
        let backend = ScriptedBackend::new(Duration::from_millis(1), 0);
        let (scheduler, _store) = scheduler(&config(1), Some(backend.clone()));
        let first = email("e1", "c1", true);
        let second = Email {
            id: "e2".into(),
            conversation_id: "c2".into(),
            ..first.clone()
        };

        let summary = scheduler
            .run_batch(vec![first, second], CancellationToken::new())
            .await;

        // Phase 2 and Phase 3 of the second email are both hits
        assert_eq!(backend.calls(), 2);
        assert_eq!(summary.counters.from_cache, 2);
        assert_eq!(summary.report("e1").unwrap().cache_hits, 0);
        assert_eq!(summary.report("e2").unwrap().cache_hits, 2);
        assert_eq!(summary.cache.hits, 2);
    }

    #[tokio::test]
    async fn fallback_answer_is_recomputed_for_identical_content() {
        let backend = ScriptedBackend::garbling(1);
        let (scheduler, store) = scheduler(&config(1), Some(backend.clone()));
        let first = email("e1", "c1", true);
        let second = Email {
            id: "e2".into(),
            conversation_id: "c2".into(),
            ..first.clone()
        };

        let summary = scheduler
            .run_batch(vec![first, second], CancellationToken::new())
            .await;

        assert_eq!(summary.counters.succeeded, 2);
        let fallback = store.get_record("e1").await.unwrap().unwrap().deep.unwrap();
        assert_eq!(fallback.source, ResultSource::Fallback);
        let recomputed = store.get_record("e2").await.unwrap().unwrap().deep.unwrap();
        assert_eq!(recomputed.source, ResultSource::Model);
        // The second email asked the backend for Phase 2 again
        assert!(backend.calls() >= 3);
        assert_eq!(summary.report("e2").unwrap().priority, Some(Priority::High));
    }

    #[tokio::test]
    async fn priority_sender_pattern_raises_priority() {
        let mut config = config(1);
        config.priority_senders = vec![r"(?i)@acme\.com$".into()];
        let (scheduler, _store) = scheduler(&config, None);
        let mut routine = email("e1", "c1", false);
        routine.subject = "Catch-up".into();
        routine.body = "See you next week.".into();

        let summary = scheduler.run_batch(vec![routine], CancellationToken::new()).await;

        let report = summary.report("e1").unwrap();
        assert!(report.priority >= Some(Priority::High));
        assert!(report.workflow_state.is_some());
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let backend = ScriptedBackend::new(Duration::from_millis(1), 2);
        let (scheduler, store) = scheduler(&config(1), Some(backend.clone()));

        let summary = scheduler
            .run_batch(vec![email("e1", "c1", true)], CancellationToken::new())
            .await;

        assert_eq!(summary.counters.succeeded, 1);
        assert_eq!(summary.report("e1").unwrap().retries, 2);
        // Three Phase 2 attempts, one Phase 3 call
        assert_eq!(backend.calls(), 4);
        assert!(store.get_record("e1").await.unwrap().unwrap().deep.is_some());
    }

    #[tokio::test]
    async fn phase_timeout_keeps_phase1_result() {
        let mut config = config(1);
        config.batch.phase_timeout = Duration::from_millis(30);
        config.batch.max_retries = 0;
        let backend = ScriptedBackend::new(Duration::from_millis(500), 0);
        let (scheduler, store) = scheduler(&config, Some(backend));

        let summary = scheduler
            .run_batch(vec![email("e1", "c1", true)], CancellationToken::new())
            .await;

        assert_eq!(summary.counters.failed, 1);
        assert_eq!(summary.sample_errors.len(), 1);
        let record = store.get_record("e1").await.unwrap().unwrap();
        assert_eq!(record.status, AnalysisStatus::Error);
        assert_eq!(record.failed_phase, Some(Phase::Phase2));
        assert!(record.quick.is_some());
        assert!(record.deep.is_none());
    }

    #[tokio::test]
    async fn timed_out_phase_stops_calling_backend() {
        let mut config = config(1);
        config.batch.phase_timeout = Duration::from_millis(60);
        config.batch.max_retries = 50;
        let backend = ScriptedBackend::new(Duration::from_millis(10), usize::MAX);
        let (scheduler, _store) = scheduler(&config, Some(backend.clone()));

        let summary = scheduler
            .run_batch(vec![email("e1", "c1", true)], CancellationToken::new())
            .await;

        let report = summary.report("e1").unwrap();
        assert_eq!(report.outcome, ItemOutcome::Failed);
        assert!(report.error.as_deref().unwrap().contains("timed out"));
        assert_eq!(scheduler.cache().in_flight(), 0);
        let calls = backend.calls();
        assert!(calls > 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(backend.calls(), calls);
    }

    #[tokio::test]
    async fn invalid_item_does_not_block_others() {
        let (scheduler, store) = scheduler(&config(2), None);
        let mut invalid = email("bad", "c1", false);
        invalid.sender = String::new();

        let summary = scheduler
            .run_batch(vec![invalid, email("good", "c2", false)], CancellationToken::new())
            .await;

        assert_eq!(summary.counters.failed, 1);
        assert_eq!(summary.counters.succeeded, 1);
        let bad = store.get_record("bad").await.unwrap().unwrap();
        assert_eq!(bad.status, AnalysisStatus::Error);
        assert!(bad.failed_phase.is_none());
        assert!(bad.quick.is_none());
    }

    #[tokio::test]
    async fn cancelled_before_start_runs_nothing() {
        let (scheduler, store) = scheduler(&config(2), None);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = scheduler
            .run_batch(vec![email("e1", "c1", false), email("e2", "c1", false)], cancel)
            .await;

        assert_eq!(summary.counters.cancelled, 2);
        assert!(summary.all_terminal());
        assert_eq!(store.count_records().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn shutdown_stops_at_phase_boundary() {
        let mut config = config(1);
        config.routing.force_deep_analysis = true;
        let backend = ScriptedBackend::new(Duration::from_millis(100), 0);
        let (scheduler, store) = scheduler(&config, Some(backend));
        let cancel = CancellationToken::new();

        let (summary, ()) = tokio::join!(
            scheduler.run_batch(vec![email("e1", "c1", false), email("e2", "c2", false)], cancel.clone()),
            async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                cancel.cancel();
            }
        );

        assert!(summary.all_terminal());
        let first = summary.report("e1").unwrap();
        assert_eq!(first.outcome, ItemOutcome::Cancelled);
        assert_eq!(first.status, Some(AnalysisStatus::Partial));
        let record = store.get_record("e1").await.unwrap().unwrap();
        assert_eq!(record.status, AnalysisStatus::Partial);
        assert!(record.deep.is_some());
        assert!(record.final_analysis.is_none());

        let second = summary.report("e2").unwrap();
        assert_eq!(second.outcome, ItemOutcome::Cancelled);
        assert!(second.status.is_none());
    }

    #[tokio::test]
    async fn stragglers_are_aborted_after_grace() {
        let mut config = config(1);
        config.batch.shutdown_grace = Duration::from_millis(50);
        config.batch.phase_timeout = Duration::from_secs(60);
        let backend = ScriptedBackend::new(Duration::from_secs(30), 0);
        let (scheduler, store) = scheduler(&config, Some(backend));
        let cancel = CancellationToken::new();

        let (summary, ()) = tokio::join!(
            scheduler.run_batch(vec![email("e1", "c1", true)], cancel.clone()),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            }
        );

        let report = summary.report("e1").unwrap();
        assert_eq!(report.outcome, ItemOutcome::Cancelled);
        assert!(report.status.is_none());
        assert!(report.error.as_deref().unwrap().contains("aborted"));
        assert_eq!(store.count_records().await.unwrap(), 0);
        assert!(summary.elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn aborted_items_stop_calling_backend() {
        let mut config = config(2);
        config.batch.shutdown_grace = Duration::from_millis(50);
        config.batch.phase_timeout = Duration::from_secs(60);
        config.batch.max_retries = 1000;
        let backend = ScriptedBackend::new(Duration::from_millis(10), usize::MAX);
        let (scheduler, _store) = scheduler(&config, Some(backend.clone()));
        let cancel = CancellationToken::new();

        let (summary, ()) = tokio::join!(
            scheduler.run_batch(vec![email("e1", "c1", true), email("e2", "c2", true)], cancel.clone()),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            }
        );

        assert_eq!(summary.counters.cancelled, 2);
        // Let the aborted computations observe the abort
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.cache().in_flight(), 0);
        let calls = backend.calls();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(backend.calls(), calls);
    }

    #[tokio::test]
    async fn events_bracket_the_batch() {
        let backend = ScriptedBackend::new(Duration::from_millis(1), 0);
        let (scheduler, _store) = scheduler(&config(3), Some(backend));
        let mut rx = scheduler.subscribe();
        let emails: Vec<_> = (0..6).map(|n| email(&format!("e{n}"), "c1", n % 2 == 0)).collect();

        let summary = scheduler.run_batch(emails, CancellationToken::new()).await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(BatchEvent::BatchStarted { .. })));
        let last = events.last().unwrap();
        assert!(last.is_batch_completed());
        assert_eq!(last.progress().processed, 6);
        assert!(events.iter().all(|e| e.batch_id() == summary.batch_id));
        let completed = events
            .iter()
            .filter(|e| matches!(e, BatchEvent::ItemCompleted { .. }))
            .count();
        assert_eq!(completed, 6);
        assert!(summary.peak_concurrency <= 3);
    }

    #[tokio::test]
    async fn progress_stream_yields_events() {
        let (scheduler, _store) = scheduler(&config(2), None);
        let mut stream = scheduler.progress_stream();

        scheduler
            .run_batch(vec![email("e1", "c1", false)], CancellationToken::new())
            .await;

        let mut seen = 0;
        while let Some(event) = stream.next().await {
            seen += 1;
            if event.is_batch_completed() {
                assert_eq!(event.progress().succeeded, 1);
                break;
            }
        }
        assert!(seen >= 4);
    }
}
