pub mod stage1;
pub mod stage2;

use crate::cache::ResponseCache;
use crate::config::PipelineConfig;
use crate::jobs::{Job, JobItemError, JobStatus, JobTracker, RunOutcome};
use crate::models::{
    AnalysisRecord, CandidateInput, CandidateProduct, EnrichmentResult, KeyType, Marketplace,
};
use crate::providers::{ProviderAdapter, ProviderClient};
use crate::ratelimit::RateLimiter;
use crate::writer::{ResultWriter, idempotency_key};
use chrono::Utc;
use futures::{StreamExt, stream};
use std::collections::HashSet;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    NotFound,
    Internal,
}

impl PipelineError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::InvalidInput,
        }
    }

    pub fn not_found(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::NotFound,
        }
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Internal,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub min_roi_percent: f64,
    pub stage1_guard_band_pct: f64,
    pub default_referral_pct: f64,
}

impl Thresholds {
    /// Rough ROI below this is rejected in Stage 1.
    pub fn stage1_floor(&self) -> f64 {
        self.min_roi_percent - self.stage1_guard_band_pct
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub min_roi_percent: f64,
    pub marketplace: Marketplace,
    /// Keep written records in memory and return them with the outcome.
    pub collect_results: bool,
}

impl RunOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            min_roi_percent: config.min_roi_percent,
            marketplace: config.marketplace,
            collect_results: false,
        }
    }
}

/// Validates one submission and turns it into pipeline candidates. Repeated
/// lookup keys collapse to their first occurrence.
pub fn prepare_candidates(
    owner_id: &str,
    inputs: Vec<CandidateInput>,
) -> Result<Vec<CandidateProduct>, PipelineError> {
    if inputs.is_empty() {
        return Err(PipelineError::invalid_input("intake", "no items submitted"));
    }

    let mut problems = Vec::new();
    let mut seen = HashSet::new();
    let mut products = Vec::with_capacity(inputs.len());
    for (idx, input) in inputs.into_iter().enumerate() {
        let key = input.lookup_key.trim().to_uppercase();
        let Some(detected) = KeyType::detect(&key) else {
            problems.push(format!("items[{idx}]: `{}` is not an ASIN or UPC/EAN", input.lookup_key));
            continue;
        };
        if let Some(declared) = input.key_type
            && declared != detected
        {
            problems.push(format!(
                "items[{idx}]: key_type {} does not match `{key}`",
                declared.as_str()
            ));
            continue;
        }
        if !(input.wholesale_cost.is_finite() && input.wholesale_cost >= 0.0) {
            problems.push(format!("items[{idx}]: wholesale_cost must be a non-negative number"));
            continue;
        }
        let moq = input.moq.unwrap_or(1);
        if moq == 0 {
            problems.push(format!("items[{idx}]: moq must be at least 1"));
            continue;
        }
        if !seen.insert(key.clone()) {
            debug!(target = "sourcing.pipeline", lookup_key = %key, "duplicate_key_collapsed");
            continue;
        }
        products.push(CandidateProduct {
            owner_id: owner_id.to_string(),
            lookup_key: key,
            key_type: detected,
            wholesale_cost: input.wholesale_cost,
            supplier_id: input
                .supplier_id
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty()),
            moq,
        });
    }

    if !problems.is_empty() {
        let shown: Vec<String> = problems.iter().take(10).cloned().collect();
        let mut detail = shown.join("; ");
        if problems.len() > shown.len() {
            detail.push_str(&format!("; and {} more", problems.len() - shown.len()));
        }
        return Err(PipelineError::invalid_input("intake", detail));
    }
    Ok(products)
}

/// Drives Stage 1, Stage 2, scoring and persistence for one job across a
/// bounded pool of chunk workers.
#[derive(Clone)]
pub struct Orchestrator {
    stage1: ProviderAdapter,
    stage2: ProviderAdapter,
    writer: Arc<dyn ResultWriter>,
    tracker: JobTracker,
    config: Arc<PipelineConfig>,
}

struct RunContext {
    job_id: Uuid,
    owner_id: String,
    options: RunOptions,
    thresholds: Thresholds,
    cancel: Arc<AtomicBool>,
    halted: AtomicBool,
    halt_reason: Mutex<Option<String>>,
    stage2_down: AtomicBool,
    results: Mutex<Vec<AnalysisRecord>>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<PipelineConfig>,
        limiter: Arc<RateLimiter>,
        cache: Arc<ResponseCache>,
        cheap: Arc<dyn ProviderClient>,
        expensive: Arc<dyn ProviderClient>,
        writer: Arc<dyn ResultWriter>,
        tracker: JobTracker,
    ) -> Self {
        let stage1 = ProviderAdapter::new(
            cheap,
            limiter.clone(),
            cache.clone(),
            config.keepa.clone(),
            &config.cache,
        );
        let stage2 = ProviderAdapter::new(
            expensive,
            limiter,
            cache,
            config.spapi.clone(),
            &config.cache,
        );
        Self {
            stage1,
            stage2,
            writer,
            tracker,
            config,
        }
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Creates the job and runs it to a terminal state on the caller's task.
    pub async fn run_now(
        &self,
        owner_id: &str,
        products: Vec<CandidateProduct>,
        options: RunOptions,
    ) -> Result<RunOutcome, PipelineError> {
        let job = self.tracker.create(owner_id, products.len()).await;
        self.run(job.id, products, options).await
    }

    pub async fn run(
        &self,
        job_id: Uuid,
        products: Vec<CandidateProduct>,
        options: RunOptions,
    ) -> Result<RunOutcome, PipelineError> {
        let job = self
            .tracker
            .get(job_id)
            .await
            .ok_or_else(|| PipelineError::not_found("jobs", "unknown job"))?;
        if !self.tracker.start(job_id).await {
            info!(target = "sourcing.pipeline", job_id = %job_id, status = ?job.status, "run_skipped");
            return Ok(RunOutcome {
                job,
                results: Vec::new(),
            });
        }
        let cancel = self
            .tracker
            .cancel_flag(job_id)
            .await
            .ok_or_else(|| PipelineError::not_found("jobs", "unknown job"))?;

        let ctx = RunContext {
            job_id,
            owner_id: job.owner_id.clone(),
            thresholds: Thresholds {
                min_roi_percent: options.min_roi_percent,
                stage1_guard_band_pct: self.config.stage1_guard_band_pct,
                default_referral_pct: self.config.default_referral_pct,
            },
            options,
            cancel,
            halted: AtomicBool::new(false),
            halt_reason: Mutex::new(None),
            stage2_down: AtomicBool::new(false),
            results: Mutex::new(Vec::new()),
        };

        let chunks: Vec<Vec<CandidateProduct>> = products
            .chunks(self.stage1.batch_ceiling())
            .map(<[CandidateProduct]>::to_vec)
            .collect();
        let started = Instant::now();
        info!(
            target = "sourcing.pipeline",
            job_id = %job_id,
            owner_id = %ctx.owner_id,
            items = products.len(),
            chunks = chunks.len(),
            workers = self.config.worker_pool_size,
            "run_started"
        );
        if let Some(job) = self.tracker.get(job_id).await {
            self.mirror(&job).await;
        }

        stream::iter(chunks.into_iter().enumerate())
            .map(|(index, chunk)| self.process_chunk(&ctx, index, chunk))
            .buffer_unordered(self.config.worker_pool_size.max(1))
            .collect::<Vec<()>>()
            .await;

        let snapshot = self
            .tracker
            .get(job_id)
            .await
            .ok_or_else(|| PipelineError::internal("jobs", "job vanished mid-run"))?;
        let (status, failure) = if ctx.halted.load(Ordering::SeqCst) {
            let reason = ctx.halt_reason.lock().await.clone();
            if snapshot.processed_items == 0 {
                (JobStatus::Failed, reason)
            } else {
                (JobStatus::Paused, reason)
            }
        } else if ctx.cancel.load(Ordering::SeqCst) && snapshot.processed_items < snapshot.total_items
        {
            (JobStatus::Cancelled, None)
        } else {
            (JobStatus::Completed, None)
        };
        let job = self
            .tracker
            .finish(job_id, status, failure)
            .await
            .ok_or_else(|| PipelineError::internal("jobs", "job vanished mid-run"))?;
        self.mirror(&job).await;

        info!(
            target = "sourcing.pipeline",
            job_id = %job_id,
            status = ?job.status,
            processed = job.processed_items,
            success = job.success_count,
            errors = job.error_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "run_finished"
        );
        let results = std::mem::take(&mut *ctx.results.lock().await);
        Ok(RunOutcome { job, results })
    }

    async fn process_chunk(&self, ctx: &RunContext, index: usize, chunk: Vec<CandidateProduct>) {
        if ctx.cancel.load(Ordering::SeqCst) || ctx.halted.load(Ordering::SeqCst) {
            debug!(target = "sourcing.pipeline", job_id = %ctx.job_id, chunk = index, "chunk_not_dispatched");
            return;
        }
        let started = Instant::now();
        let marketplace = ctx.options.marketplace;

        let outcome =
            match stage1::filter_chunk(&self.stage1, &chunk, marketplace, &ctx.thresholds).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(
                        target = "sourcing.pipeline",
                        job_id = %ctx.job_id,
                        chunk = index,
                        error = %err,
                        "stage1_hard_error_halting"
                    );
                    if !ctx.halted.swap(true, Ordering::SeqCst) {
                        *ctx.halt_reason.lock().await = Some(err.to_string());
                        self.tracker
                            .note(ctx.job_id, JobItemError::run("stage1", err.to_string()))
                            .await;
                    }
                    return;
                }
            };
        crate::metrics::chunk_elapsed("stage1", chunk.len(), started.elapsed().as_millis());
        debug!(
            target = "sourcing.pipeline",
            job_id = %ctx.job_id,
            chunk = index,
            survivors = outcome.survivors.len(),
            rejects = outcome.rejects.len(),
            "stage1_chunk_done"
        );
        self.persist(ctx, "stage1", outcome.rejects).await;

        for batch in outcome.survivors.chunks(self.stage2.batch_ceiling()) {
            let batch_started = Instant::now();
            let skip_pricing = ctx.stage2_down.load(Ordering::SeqCst);
            let enriched =
                stage2::enrich_chunk(&self.stage2, batch.to_vec(), marketplace, skip_pricing).await;
            if let Some(err) = enriched.pricing_error.as_ref().filter(|err| err.is_hard())
                && !ctx.stage2_down.swap(true, Ordering::SeqCst)
            {
                warn!(
                    target = "sourcing.pipeline",
                    job_id = %ctx.job_id,
                    error = %err,
                    "stage2_hard_error_falling_back_for_run"
                );
                self.tracker
                    .note(ctx.job_id, JobItemError::run("stage2", err.to_string()))
                    .await;
            }
            crate::metrics::chunk_elapsed(
                "stage2",
                enriched.items.len(),
                batch_started.elapsed().as_millis(),
            );
            self.persist(ctx, "stage2", enriched.items).await;
        }
        crate::metrics::chunk_elapsed("chunk", chunk.len(), started.elapsed().as_millis());
    }

    /// Scores, writes and counts one batch of finished items.
    async fn persist(
        &self,
        ctx: &RunContext,
        stage: &'static str,
        items: Vec<(CandidateProduct, EnrichmentResult)>,
    ) {
        if items.is_empty() {
            return;
        }
        let analyzed_at = Utc::now();
        let records: Vec<AnalysisRecord> = items
            .into_iter()
            .map(|(product, result)| {
                let score =
                    crate::profit::score(&result, product.wholesale_cost, ctx.options.min_roi_percent);
                let supplier_id = product.supplier_id.unwrap_or_default();
                AnalysisRecord {
                    idempotency_key: idempotency_key(&ctx.owner_id, &product.lookup_key, &supplier_id),
                    owner_id: ctx.owner_id.clone(),
                    supplier_id,
                    key_type: product.key_type,
                    wholesale_cost: product.wholesale_cost,
                    moq: product.moq,
                    job_id: ctx.job_id,
                    analyzed_at,
                    result,
                    score,
                }
            })
            .collect();

        let outcomes = self.writer.upsert(&records).await;
        let mut successes = 0;
        let mut errors = Vec::new();
        for (idx, record) in records.iter().enumerate() {
            let key = &record.result.lookup_key;
            match outcomes.get(idx) {
                Some(Ok(())) => match &record.result.error {
                    None => successes += 1,
                    Some(message) => errors.push(JobItemError::item(key, stage, message.clone())),
                },
                Some(Err(err)) => {
                    warn!(target = "sourcing.writer", job_id = %ctx.job_id, lookup_key = %key, error = %err, "record_write_failed");
                    errors.push(JobItemError::item(key, "writer", err.to_string()));
                }
                None => errors.push(JobItemError::item(key, "writer", "no write outcome reported")),
            }
        }

        if let Some(job) = self.tracker.record_batch(ctx.job_id, successes, errors).await {
            self.mirror(&job).await;
        }
        if ctx.options.collect_results {
            ctx.results.lock().await.extend(records);
        }
    }

    async fn mirror(&self, job: &Job) {
        if let Err(err) = self.writer.mirror_job(job).await {
            warn!(target = "sourcing.writer", job_id = %job.id, error = %err, "job_mirror_failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PriceSource;
    use crate::providers::Provider;
    use crate::providers::fake::{Failure, ScriptedClient};
    use crate::writer::MemoryWriter;
    use std::collections::HashSet;
    use std::time::Duration;

    fn test_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        for settings in [&mut config.keepa, &mut config.spapi] {
            settings.rate_per_sec = 10_000.0;
            settings.burst = 10_000.0;
            settings.max_retries = 0;
        }
        config
    }

    struct Harness {
        orchestrator: Orchestrator,
        keepa: Arc<ScriptedClient>,
        spapi: Arc<ScriptedClient>,
        writer: Arc<MemoryWriter>,
    }

    fn harness(
        config: PipelineConfig,
        keepa: ScriptedClient,
        spapi: ScriptedClient,
        writer: MemoryWriter,
    ) -> Harness {
        let config = Arc::new(config);
        let keepa = Arc::new(keepa);
        let spapi = Arc::new(spapi);
        let writer = Arc::new(writer);
        let orchestrator = Orchestrator::new(
            config.clone(),
            Arc::new(RateLimiter::from_config(&config)),
            Arc::new(ResponseCache::new(&config.cache)),
            keepa.clone(),
            spapi.clone(),
            writer.clone(),
            JobTracker::new(config.max_job_errors),
        );
        Harness {
            orchestrator,
            keepa,
            spapi,
            writer,
        }
    }

    fn products(count: usize, cost: f64) -> Vec<CandidateProduct> {
        (0..count)
            .map(|idx| CandidateProduct {
                owner_id: "owner".into(),
                lookup_key: format!("B{idx:09}"),
                key_type: KeyType::Asin,
                wholesale_cost: cost,
                supplier_id: None,
                moq: 1,
            })
            .collect()
    }

    fn priced(mut client: ScriptedClient, items: &[CandidateProduct], price: f64) -> ScriptedClient {
        for item in items {
            client = client.with_price(&item.lookup_key, price);
        }
        client
    }

    fn options() -> RunOptions {
        RunOptions {
            min_roi_percent: 30.0,
            marketplace: Marketplace::Us,
            collect_results: true,
        }
    }

    fn input(key: &str, cost: f64) -> CandidateInput {
        CandidateInput {
            lookup_key: key.into(),
            key_type: None,
            wholesale_cost: cost,
            supplier_id: None,
            moq: None,
        }
    }

    #[tokio::test]
    async fn chunks_250_items_into_three_stage1_batches() {
        let items = products(250, 5.0);
        let h = harness(
            test_config(),
            priced(ScriptedClient::new(Provider::Keepa), &items[..200], 20.0),
            ScriptedClient::new(Provider::SpApi),
            MemoryWriter::new(),
        );

        let outcome = h
            .orchestrator
            .run_now("owner", items.clone(), options())
            .await
            .unwrap();

        let mut sizes: Vec<usize> = h.keepa.catalog_calls().iter().map(Vec::len).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![50, 100, 100]);

        let requested: HashSet<String> = h.keepa.catalog_calls().into_iter().flatten().collect();
        let expected: HashSet<String> = items.iter().map(|item| item.lookup_key.clone()).collect();
        assert_eq!(requested, expected);

        let job = outcome.job;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.total_items, 250);
        assert_eq!(job.processed_items, 250);
        assert_eq!(job.success_count + job.error_count, job.processed_items);
        assert_eq!(h.writer.len().await, 250);

        let keys: HashSet<&str> = outcome
            .results
            .iter()
            .map(|record| record.result.lookup_key.as_str())
            .collect();
        assert_eq!(outcome.results.len(), 250);
        assert_eq!(keys.len(), 250);

        assert!(h.spapi.catalog_calls().iter().all(|call| call.len() <= 20));
        let mirrored = h.writer.job(job.id).await.unwrap();
        assert_eq!(mirrored.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn stage1_rejects_never_reach_stage2() {
        let items = products(3, 18.0);
        let h = harness(
            test_config(),
            priced(ScriptedClient::new(Provider::Keepa), &items, 20.0),
            ScriptedClient::new(Provider::SpApi),
            MemoryWriter::new(),
        );
        let outcome = h.orchestrator.run_now("owner", items, options()).await.unwrap();

        assert!(h.spapi.catalog_calls().is_empty());
        assert_eq!(outcome.job.processed_items, 3);
        for record in &outcome.results {
            assert_eq!(record.result.stage_reached.as_u8(), 1);
            assert_eq!(record.result.price_source, PriceSource::Stage1Estimate);
            assert!(!record.score.meets_threshold);
        }
    }

    #[tokio::test]
    async fn stage2_outage_falls_back_and_records_the_error() {
        let items = products(45, 5.0);
        let mut config = test_config();
        config.worker_pool_size = 1;
        let h = harness(
            config,
            priced(ScriptedClient::new(Provider::Keepa), &items, 15.0),
            ScriptedClient::new(Provider::SpApi).with_catalog_failure(Failure::Hard),
            MemoryWriter::new(),
        );
        let outcome = h.orchestrator.run_now("owner", items, options()).await.unwrap();

        let job = &outcome.job;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.processed_items, 45);
        assert_eq!(job.success_count, 45);
        assert!(job.errors.iter().any(|err| err.stage == "stage2" && err.lookup_key.is_none()));
        // the first hard failure switches the rest of the run to fallback
        assert_eq!(h.spapi.catalog_calls().len(), 1);

        let record = outcome
            .results
            .iter()
            .find(|record| record.result.lookup_key == "B000000000")
            .unwrap();
        assert_eq!(record.result.price_source, PriceSource::Stage1Fallback);
        assert_eq!(record.result.sell_price, Some(15.0));
        assert_eq!(record.result.fees_total, Some(5.25));
        assert_eq!(record.score.net_profit, Some(4.75));
    }

    #[tokio::test]
    async fn stage1_outage_before_progress_fails_the_job() {
        let h = harness(
            test_config(),
            ScriptedClient::new(Provider::Keepa).with_catalog_failure(Failure::Hard),
            ScriptedClient::new(Provider::SpApi),
            MemoryWriter::new(),
        );
        let outcome = h
            .orchestrator
            .run_now("owner", products(150, 5.0), options())
            .await
            .unwrap();
        assert_eq!(outcome.job.status, JobStatus::Failed);
        assert_eq!(outcome.job.processed_items, 0);
        assert!(outcome.job.failure.is_some());
        assert!(outcome.job.completed_at.is_some());
        assert_eq!(h.writer.len().await, 0);
    }

    #[tokio::test]
    async fn item_failures_are_counted_not_fatal() {
        let items = products(5, 5.0);
        let h = harness(
            test_config(),
            priced(ScriptedClient::new(Provider::Keepa), &items[..4], 20.0)
                .with_key_error("B000000004", "invalid asin"),
            ScriptedClient::new(Provider::SpApi),
            MemoryWriter::new().failing_on(["B000000001"]),
        );
        let outcome = h.orchestrator.run_now("owner", items, options()).await.unwrap();

        let job = outcome.job;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.processed_items, 5);
        assert_eq!(job.error_count, 2);
        assert_eq!(job.success_count, 3);
        let failed: HashSet<&str> = job
            .errors
            .iter()
            .filter_map(|err| err.lookup_key.as_deref())
            .collect();
        assert_eq!(failed, HashSet::from(["B000000001", "B000000004"]));
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_chunks_never_exceed_the_worker_pool() {
        let items = products(50, 5.0);
        let mut config = test_config();
        config.worker_pool_size = 2;
        config.keepa.batch_ceiling = 10;
        let h = harness(
            config,
            priced(ScriptedClient::new(Provider::Keepa), &items, 20.0)
                .with_catalog_failure(Failure::Stall(Duration::from_millis(50))),
            ScriptedClient::new(Provider::SpApi),
            MemoryWriter::new(),
        );

        let outcome = h.orchestrator.run_now("owner", items, options()).await.unwrap();

        assert_eq!(h.keepa.catalog_calls().len(), 5);
        assert_eq!(h.keepa.peak_catalog_in_flight(), 2);
        assert_eq!(outcome.job.status, JobStatus::Completed);
        assert_eq!(outcome.job.processed_items, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_is_visible_while_the_run_is_in_flight() {
        let items = products(30, 5.0);
        let mut config = test_config();
        config.worker_pool_size = 1;
        config.keepa.batch_ceiling = 10;
        let gate = Arc::new(tokio::sync::Semaphore::new(1));
        let h = harness(
            config,
            priced(ScriptedClient::new(Provider::Keepa), &items, 20.0).with_catalog_gate(gate.clone()),
            ScriptedClient::new(Provider::SpApi),
            MemoryWriter::new(),
        );
        let tracker = h.orchestrator.tracker().clone();
        let job = tracker.create("owner", items.len()).await;

        let orchestrator = h.orchestrator.clone();
        let keys: HashSet<String> = items.iter().map(|item| item.lookup_key.clone()).collect();
        let handle = tokio::spawn(async move { orchestrator.run(job.id, items, options()).await });

        let mut partial = None;
        for _ in 0..200 {
            let current = tracker.get(job.id).await.unwrap();
            if current.processed_items > 0 {
                partial = Some(current);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let partial = partial.unwrap();
        assert_eq!(partial.status, JobStatus::Processing);
        assert_eq!(partial.processed_items, 10);
        assert!(partial.processed_items < partial.total_items);
        assert!(partial.completed_at.is_none());
        assert_eq!(h.writer.records().await.len(), 10);

        gate.add_permits(2);
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.job.status, JobStatus::Completed);
        assert_eq!(outcome.job.processed_items, 30);

        let written: HashSet<String> = h
            .writer
            .records()
            .await
            .into_iter()
            .map(|record| record.result.lookup_key)
            .collect();
        assert_eq!(written, keys);
    }

    struct CancelOnFirstWrite {
        inner: MemoryWriter,
        flag: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl ResultWriter for CancelOnFirstWrite {
        async fn upsert(
            &self,
            records: &[AnalysisRecord],
        ) -> Vec<Result<(), crate::writer::WriteError>> {
            self.flag.store(true, Ordering::SeqCst);
            self.inner.upsert(records).await
        }
    }

    #[tokio::test]
    async fn cancellation_stops_dispatch_between_chunks() {
        let items = products(250, 5.0);
        let mut config = test_config();
        config.worker_pool_size = 1;
        let config = Arc::new(config);
        let tracker = JobTracker::new(config.max_job_errors);
        let job = tracker.create("owner", items.len()).await;
        let flag = tracker.cancel_flag(job.id).await.unwrap();

        let orchestrator = Orchestrator::new(
            config.clone(),
            Arc::new(RateLimiter::from_config(&config)),
            Arc::new(ResponseCache::new(&config.cache)),
            Arc::new(priced(ScriptedClient::new(Provider::Keepa), &items, 20.0)),
            Arc::new(ScriptedClient::new(Provider::SpApi)),
            Arc::new(CancelOnFirstWrite {
                inner: MemoryWriter::new(),
                flag,
            }),
            tracker,
        );
        let outcome = orchestrator.run(job.id, items, options()).await.unwrap();

        assert_eq!(outcome.job.status, JobStatus::Cancelled);
        assert_eq!(outcome.job.processed_items, 100);
        assert_eq!(
            outcome.job.success_count + outcome.job.error_count,
            outcome.job.processed_items
        );
    }

    #[test]
    fn intake_collapses_duplicates_and_defaults_moq() {
        let products = prepare_candidates(
            "owner",
            vec![
                input("b00example", 5.0),
                input("012345678905", 2.5),
                input("B00EXAMPLE", 9.0),
            ],
        )
        .unwrap();
        assert_eq!(products.len(), 2);
        assert_eq!(products[0].lookup_key, "B00EXAMPLE");
        assert_eq!(products[0].wholesale_cost, 5.0);
        assert_eq!(products[0].moq, 1);
        assert_eq!(products[1].key_type, KeyType::Upc);
    }

    #[test]
    fn intake_rejects_invalid_rows() {
        let err = prepare_candidates(
            "owner",
            vec![input("nope", 5.0), input("B00EXAMPLE", -1.0), input("B00EXAMPLF", f64::NAN)],
        )
        .unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);
        assert!(err.detail().contains("items[0]"));
        assert!(err.detail().contains("items[1]"));
        assert!(err.detail().contains("items[2]"));

        let mut mismatched = input("B00EXAMPLE", 5.0);
        mismatched.key_type = Some(KeyType::Upc);
        assert!(prepare_candidates("owner", vec![mismatched]).is_err());

        let mut zero_moq = input("B00EXAMPLE", 5.0);
        zero_moq.moq = Some(0);
        assert!(prepare_candidates("owner", vec![zero_moq]).is_err());
        assert!(prepare_candidates("owner", Vec::new()).is_err());
    }

    #[test]
    fn guard_band_lowers_the_stage1_floor() {
        let thresholds = Thresholds {
            min_roi_percent: 30.0,
            stage1_guard_band_pct: 10.0,
            default_referral_pct: 15.0,
        };
        assert_eq!(thresholds.stage1_floor(), 20.0);
    }
}
