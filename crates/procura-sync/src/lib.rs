//! Ingestion orchestration: configuration, cache-aware refresh, bounded analysis batches and scheduling.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use procura_core::{
    is_placeholder_id, AnalysisCapability, AnalysisReport, AnalysisResult, CachePolicy,
};
use procura_provider::{
    HttpAnalysisCapability, OpportunitySource, ProviderClient, ProviderConfig, SearchFilter,
};
use procura_storage::{
    BackoffExecutor, BackoffPolicy, HttpClientConfig, MemoryOpportunityStore, OpportunityStore,
    PgOpportunityStore, PooledTransport, StoreError, TokenBucket, TokenBucketConfig,
};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "procura-sync";

pub const DEFAULT_API_BASE_URL: &str = "https://api.sam.gov/opportunities/v2/search";

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub database_url: Option<String>,
    pub api_base_url: String,
    pub api_key: Option<String>,
    pub analysis_url: Option<String>,
    pub rate_per_second: f64,
    pub cache_ttl_hours: i64,
    pub max_attempts: u32,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub pool_per_route: usize,
    pub pool_max_total: usize,
    pub max_concurrent: usize,
    pub fetch_concurrency: usize,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub analysis_cache_ttl_secs: u64,
    pub scheduler_enabled: bool,
    pub backfill_cron: String,
    pub backfill_days: i64,
    pub classification_code: Option<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            api_key: None,
            analysis_url: None,
            rate_per_second: 0.33,
            cache_ttl_hours: 24,
            max_attempts: 5,
            initial_backoff_secs: 2,
            max_backoff_secs: 60,
            pool_per_route: 10,
            pool_max_total: 20,
            max_concurrent: 5,
            fetch_concurrency: 4,
            user_agent: "procura/0.1".to_string(),
            http_timeout_secs: 30,
            analysis_cache_ttl_secs: 3600,
            scheduler_enabled: false,
            backfill_cron: "0 0 6 * * *".to_string(),
            backfill_days: 7,
            classification_code: None,
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            database_url: text("DATABASE_URL"),
            api_base_url: text("PROCURA_API_BASE_URL").unwrap_or(defaults.api_base_url),
            api_key: text("PROCURA_API_KEY"),
            analysis_url: text("PROCURA_ANALYSIS_URL"),
            rate_per_second: parse_or(&lookup, "PROCURA_RATE_PER_SECOND", defaults.rate_per_second),
            cache_ttl_hours: parse_or(&lookup, "PROCURA_CACHE_TTL_HOURS", defaults.cache_ttl_hours),
            max_attempts: parse_or(&lookup, "PROCURA_MAX_ATTEMPTS", defaults.max_attempts),
            initial_backoff_secs: parse_or(
                &lookup,
                "PROCURA_INITIAL_BACKOFF_SECS",
                defaults.initial_backoff_secs,
            ),
            max_backoff_secs: parse_or(&lookup, "PROCURA_MAX_BACKOFF_SECS", defaults.max_backoff_secs),
            pool_per_route: parse_or(&lookup, "PROCURA_POOL_PER_ROUTE", defaults.pool_per_route),
            pool_max_total: parse_or(&lookup, "PROCURA_POOL_MAX_TOTAL", defaults.pool_max_total),
            max_concurrent: parse_or(&lookup, "PROCURA_MAX_CONCURRENT", defaults.max_concurrent),
            fetch_concurrency: parse_or(
                &lookup,
                "PROCURA_FETCH_CONCURRENCY",
                defaults.fetch_concurrency,
            ),
            user_agent: text("PROCURA_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: parse_or(&lookup, "PROCURA_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            analysis_cache_ttl_secs: parse_or(
                &lookup,
                "PROCURA_ANALYSIS_CACHE_TTL_SECS",
                defaults.analysis_cache_ttl_secs,
            ),
            scheduler_enabled: lookup("PROCURA_SCHEDULER_ENABLED")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            backfill_cron: text("PROCURA_BACKFILL_CRON").unwrap_or(defaults.backfill_cron),
            backfill_days: parse_or(&lookup, "PROCURA_BACKFILL_DAYS", defaults.backfill_days),
            classification_code: text("PROCURA_CLASSIFICATION_CODE"),
        }
    }

    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy::from_hours(self.cache_ttl_hours)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_secs(self.initial_backoff_secs),
            max_delay: Duration::from_secs(self.max_backoff_secs),
        }
    }

    pub fn token_bucket_config(&self) -> TokenBucketConfig {
        TokenBucketConfig::per_second(self.rate_per_second)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone(),
            max_idle_per_route: self.pool_per_route,
            max_total_connections: self.pool_max_total,
            ..Default::default()
        }
    }

    pub fn provider_config(&self) -> Result<ProviderConfig> {
        let api_key = self
            .api_key
            .clone()
            .context("PROCURA_API_KEY must be set to query the provider")?;
        Ok(ProviderConfig::new(self.api_base_url.clone(), api_key))
    }

    pub fn default_filter(&self) -> SearchFilter {
        SearchFilter {
            keywords: None,
            classification_code: self.classification_code.clone(),
        }
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, "ignoring unparseable setting, using default");
                default
            }
        },
        None => default,
    }
}

/// Trim, drop blanks and collapse repeats, keeping first-seen order.
pub fn distinct_ids(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty() && seen.insert(id.to_string()))
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Clone)]
struct CachedReport {
    report: AnalysisReport,
    stored_at: Instant,
}

/// Bounded in-memory cache of analysis reports keyed by external id.
#[derive(Debug)]
pub struct AnalysisCache {
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<String, CachedReport>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl AnalysisCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self::new(ttl, 100)
    }

    pub async fn get(&self, external_id: &str) -> Option<AnalysisReport> {
        let mut entries = self.entries.lock().await;
        let expired = match entries.get(external_id) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.report.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.remove(external_id);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub async fn insert(&self, external_id: &str, report: AnalysisReport) {
        let mut entries = self.entries.lock().await;
        if !entries.contains_key(external_id) && entries.len() >= self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.stored_at)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                debug!(evicted = %oldest, "analysis cache full, evicted oldest entry");
            }
        }
        entries.insert(
            external_id.to_string(),
            CachedReport {
                report,
                stored_at: Instant::now(),
            },
        );
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub external_id: String,
    pub status: OutcomeStatus,
    pub result: Option<AnalysisResult>,
    pub error: Option<String>,
    pub cached: bool,
}

impl BatchOutcome {
    fn completed(result: AnalysisResult, cached: bool) -> Self {
        Self {
            external_id: result.external_id.clone(),
            status: OutcomeStatus::Completed,
            result: Some(result),
            error: None,
            cached,
        }
    }

    fn failed(external_id: &str, reason: String, cached: bool) -> Self {
        Self {
            external_id: external_id.to_string(),
            status: OutcomeStatus::Failed,
            result: None,
            error: Some(reason),
            cached,
        }
    }

    fn cancelled(external_id: &str) -> Self {
        Self {
            external_id: external_id.to_string(),
            status: OutcomeStatus::Cancelled,
            result: None,
            error: None,
            cached: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub total_requested: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub cache_hits: usize,
    /// In the order outcomes were produced, not the order requested.
    pub outcomes: Vec<BatchOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BatchSummary {
    fn from_outcomes(
        batch_id: Uuid,
        total_requested: usize,
        outcomes: Vec<BatchOutcome>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let count = |status: OutcomeStatus| outcomes.iter().filter(|o| o.status == status).count();
        Self {
            batch_id,
            total_requested,
            completed: count(OutcomeStatus::Completed),
            failed: count(OutcomeStatus::Failed),
            cancelled: count(OutcomeStatus::Cancelled),
            cache_hits: outcomes.iter().filter(|o| o.cached).count(),
            outcomes,
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn outcome(&self, external_id: &str) -> Option<&BatchOutcome> {
        self.outcomes.iter().find(|o| o.external_id == external_id)
    }
}

/// Runs the analysis capability over many identifiers with a fixed worker count.
#[derive(Clone)]
pub struct BatchOrchestrator {
    capability: Arc<dyn AnalysisCapability>,
    store: Option<Arc<dyn OpportunityStore>>,
    cache: Option<Arc<AnalysisCache>>,
}

impl BatchOrchestrator {
    pub fn new(capability: Arc<dyn AnalysisCapability>) -> Self {
        Self {
            capability,
            store: None,
            cache: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn OpportunityStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_cache(mut self, cache: Arc<AnalysisCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub async fn run_batch(&self, ids: &[String], max_concurrent: usize) -> BatchSummary {
        self.run_batch_with_cancel(ids, max_concurrent, CancellationToken::new())
            .await
    }

    pub async fn run_batch_with_deadline(
        &self,
        ids: &[String],
        max_concurrent: usize,
        deadline: Instant,
    ) -> BatchSummary {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            trigger.cancel();
        });
        let summary = self.run_batch_with_cancel(ids, max_concurrent, cancel).await;
        timer.abort();
        summary
    }

    /// Cancellation is cooperative: calls already in flight finish, identifiers not yet
    /// started are reported as cancelled.
    pub async fn run_batch_with_cancel(
        &self,
        ids: &[String],
        max_concurrent: usize,
        cancel: CancellationToken,
    ) -> BatchSummary {
        let batch_id = Uuid::new_v4();
        let started_at = Utc::now();
        let work = Arc::new(distinct_ids(ids));
        let workers = max_concurrent.max(1).min(work.len());
        info!(%batch_id, requested = ids.len(), distinct = work.len(), workers, "analysis batch started");

        let cursor = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut join_set = JoinSet::new();
        for worker_id in 0..workers {
            let worker = Worker {
                batch_id,
                capability: self.capability.clone(),
                store: self.store.clone(),
                cache: self.cache.clone(),
                work: work.clone(),
                cursor: cursor.clone(),
                cancel: cancel.clone(),
                outcomes: tx.clone(),
            };
            join_set.spawn(
                worker
                    .run()
                    .instrument(info_span!("batch_worker", %batch_id, worker_id)),
            );
        }
        drop(tx);

        let mut outcomes = Vec::with_capacity(work.len());
        while let Some(outcome) = rx.recv().await {
            outcomes.push(outcome);
        }
        while let Some(joined) = join_set.join_next().await {
            if let Err(err) = joined {
                warn!(%batch_id, error = %err, "batch worker ended abnormally");
            }
        }

        if outcomes.len() < work.len() {
            let reported: HashSet<_> = outcomes.iter().map(|o| o.external_id.clone()).collect();
            for id in work.iter().filter(|id| !reported.contains(*id)) {
                outcomes.push(BatchOutcome::failed(id, "worker terminated".to_string(), false));
            }
        }

        let summary = BatchSummary::from_outcomes(batch_id, work.len(), outcomes, started_at);
        info!(
            %batch_id,
            completed = summary.completed,
            failed = summary.failed,
            cancelled = summary.cancelled,
            cache_hits = summary.cache_hits,
            "analysis batch finished"
        );
        summary
    }
}

struct Worker {
    batch_id: Uuid,
    capability: Arc<dyn AnalysisCapability>,
    store: Option<Arc<dyn OpportunityStore>>,
    cache: Option<Arc<AnalysisCache>>,
    work: Arc<Vec<String>>,
    cursor: Arc<AtomicUsize>,
    cancel: CancellationToken,
    outcomes: mpsc::UnboundedSender<BatchOutcome>,
}

impl Worker {
    async fn run(self) {
        loop {
            let index = self.cursor.fetch_add(1, Ordering::SeqCst);
            let Some(external_id) = self.work.get(index) else {
                break;
            };
            let outcome = if self.cancel.is_cancelled() {
                BatchOutcome::cancelled(external_id)
            } else {
                self.process(external_id).await
            };
            if self.outcomes.send(outcome).is_err() {
                break;
            }
        }
    }

    async fn process(&self, external_id: &str) -> BatchOutcome {
        if let Some(cache) = &self.cache {
            if let Some(report) = cache.get(external_id).await {
                debug!(external_id, "analysis served from cache");
                let result = AnalysisResult::completed(self.batch_id, external_id, report, Utc::now());
                return self.persist(result, true).await;
            }
        }

        let capability = self.capability.clone();
        let id = external_id.to_string();
        let call = tokio::spawn(async move { capability.analyze(&id).await });

        match call.await {
            Ok(Ok(report)) => {
                if let Some(cache) = &self.cache {
                    cache.insert(external_id, report.clone()).await;
                }
                let result = AnalysisResult::completed(self.batch_id, external_id, report, Utc::now());
                self.persist(result, false).await
            }
            Ok(Err(err)) => {
                warn!(external_id, error = %err, "analysis failed");
                self.record_failure(external_id, err.to_string()).await
            }
            Err(join_err) => {
                let reason = if join_err.is_panic() {
                    "analysis task panicked".to_string()
                } else {
                    "analysis task was aborted".to_string()
                };
                warn!(external_id, %reason, "analysis did not complete");
                self.record_failure(external_id, reason).await
            }
        }
    }

    async fn persist(&self, result: AnalysisResult, cached: bool) -> BatchOutcome {
        if let Some(store) = &self.store {
            if let Err(err) = store.record_analysis(&result).await {
                warn!(external_id = %result.external_id, error = %err, "could not persist analysis result");
                return BatchOutcome::failed(
                    &result.external_id,
                    format!("persisting analysis result: {err}"),
                    cached,
                );
            }
        }
        BatchOutcome::completed(result, cached)
    }

    async fn record_failure(&self, external_id: &str, reason: String) -> BatchOutcome {
        if let Some(store) = &self.store {
            let failed = AnalysisResult::failed(self.batch_id, external_id, reason.clone(), Utc::now());
            if let Err(err) = store.record_analysis(&failed).await {
                debug!(external_id, error = %err, "failed analysis not recorded");
            }
        }
        BatchOutcome::failed(external_id, reason, false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RefreshStatus {
    /// Stored copy is within the TTL; nothing was fetched.
    Fresh,
    Fetched { inserted: bool },
    /// Locally minted entry that exists in storage; never sent to the provider.
    Placeholder,
    NotFound,
    Failed { reason: String },
}

impl RefreshStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Fresh | Self::Fetched { .. } | Self::Placeholder)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshItem {
    pub external_id: String,
    pub status: RefreshStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub run_id: Uuid,
    pub items: Vec<RefreshItem>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RefreshSummary {
    pub fn status_of(&self, external_id: &str) -> Option<&RefreshStatus> {
        self.items
            .iter()
            .find(|item| item.external_id == external_id)
            .map(|item| &item.status)
    }

    pub fn available_ids(&self) -> Vec<String> {
        self.items
            .iter()
            .filter(|item| item.status.is_available())
            .map(|item| item.external_id.clone())
            .collect()
    }

    pub fn fresh(&self) -> usize {
        self.count(|s| matches!(s, RefreshStatus::Fresh))
    }

    pub fn fetched(&self) -> usize {
        self.count(|s| matches!(s, RefreshStatus::Fetched { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, RefreshStatus::Failed { .. }))
    }

    fn count(&self, pred: impl Fn(&RefreshStatus) -> bool) -> usize {
        self.items.iter().filter(|item| pred(&item.status)).count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub posted_from: NaiveDate,
    pub posted_to: NaiveDate,
    pub received: usize,
    pub inserted: usize,
    pub updated: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshAndAnalyzeSummary {
    pub refresh: RefreshSummary,
    pub batch: BatchSummary,
}

/// Cache-aware ingestion of provider records into the store.
pub struct RefreshPipeline {
    source: Arc<dyn OpportunitySource>,
    store: Arc<dyn OpportunityStore>,
    cache_policy: CachePolicy,
    fetch_concurrency: usize,
}

impl RefreshPipeline {
    pub fn new(
        source: Arc<dyn OpportunitySource>,
        store: Arc<dyn OpportunityStore>,
        cache_policy: CachePolicy,
    ) -> Self {
        Self {
            source,
            store,
            cache_policy,
            fetch_concurrency: 4,
        }
    }

    pub fn with_fetch_concurrency(mut self, fetch_concurrency: usize) -> Self {
        self.fetch_concurrency = fetch_concurrency.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn OpportunityStore> {
        &self.store
    }

    pub async fn refresh(&self, ids: &[String]) -> Result<RefreshSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("refresh", %run_id, requested = ids.len());

        let results: Vec<(String, Result<RefreshStatus, StoreError>)> =
            stream::iter(distinct_ids(ids))
                .map(|external_id| async move {
                    let status = self.refresh_one(&external_id).await;
                    (external_id, status)
                })
                .buffer_unordered(self.fetch_concurrency.max(1))
                .collect()
                .instrument(span)
                .await;

        let mut items = Vec::with_capacity(results.len());
        for (external_id, status) in results {
            let status =
                status.with_context(|| format!("refreshing opportunity {external_id}"))?;
            items.push(RefreshItem {
                external_id,
                status,
            });
        }

        let summary = RefreshSummary {
            run_id,
            items,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            %run_id,
            fresh = summary.fresh(),
            fetched = summary.fetched(),
            failed = summary.failed(),
            "refresh finished"
        );
        Ok(summary)
    }

    async fn refresh_one(&self, external_id: &str) -> Result<RefreshStatus, StoreError> {
        let existing = self.store.find_by_external_id(external_id).await?;

        if is_placeholder_id(external_id) {
            return Ok(match existing {
                Some(_) => RefreshStatus::Placeholder,
                None => RefreshStatus::NotFound,
            });
        }
        if let Some(record) = &existing {
            if self.cache_policy.is_fresh(record) {
                debug!(external_id, "stored copy is fresh");
                return Ok(RefreshStatus::Fresh);
            }
        }

        match self.source.fetch_by_id(external_id).await {
            Ok(Some(draft)) if draft.external_id != external_id => {
                warn!(
                    external_id,
                    returned = %draft.external_id,
                    "provider returned a different notice id; not storing it"
                );
                Ok(RefreshStatus::NotFound)
            }
            Ok(Some(draft)) => {
                let outcome = self.store.upsert(&draft, Utc::now()).await?;
                debug!(external_id, inserted = outcome.inserted, "opportunity refreshed");
                Ok(RefreshStatus::Fetched {
                    inserted: outcome.inserted,
                })
            }
            Ok(None) => Ok(RefreshStatus::NotFound),
            Err(err) => {
                warn!(external_id, error = %err, "provider fetch failed");
                Ok(RefreshStatus::Failed {
                    reason: err.to_string(),
                })
            }
        }
    }

    pub async fn ingest_range(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        filter: &SearchFilter,
    ) -> Result<IngestSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let drafts = self
            .source
            .backfill(from, to, filter)
            .instrument(info_span!("ingest_range", %run_id, %from, %to))
            .await
            .with_context(|| format!("backfilling {from} .. {to}"))?;

        let mut inserted = 0usize;
        let mut updated = 0usize;
        for draft in &drafts {
            let outcome = self
                .store
                .upsert(draft, Utc::now())
                .await
                .with_context(|| format!("storing opportunity {}", draft.external_id))?;
            if outcome.inserted {
                inserted += 1;
            } else {
                updated += 1;
            }
        }

        info!(%run_id, received = drafts.len(), inserted, updated, "range ingested");
        Ok(IngestSummary {
            run_id,
            posted_from: from,
            posted_to: to,
            received: drafts.len(),
            inserted,
            updated,
            started_at,
            finished_at: Utc::now(),
        })
    }

    pub async fn refresh_and_analyze(
        &self,
        ids: &[String],
        orchestrator: &BatchOrchestrator,
        max_concurrent: usize,
    ) -> Result<RefreshAndAnalyzeSummary> {
        let refresh = self.refresh(ids).await?;
        let available = refresh.available_ids();
        let batch = orchestrator.run_batch(&available, max_concurrent).await;
        Ok(RefreshAndAnalyzeSummary { refresh, batch })
    }
}

/// Everything a command needs, wired from one [`IngestConfig`].
///
/// The provider pipeline needs an API key and the orchestrator needs an analysis
/// URL; each is only built when its setting is present.
pub struct IngestServices {
    pub config: IngestConfig,
    pub transport: Arc<PooledTransport>,
    pub store: Arc<dyn OpportunityStore>,
    pub pipeline: Option<Arc<RefreshPipeline>>,
    pub orchestrator: Option<BatchOrchestrator>,
    cancel: CancellationToken,
}

impl IngestServices {
    pub async fn from_config(config: IngestConfig) -> Result<Self> {
        let transport = Arc::new(PooledTransport::new(config.http_client_config()));
        let cancel = CancellationToken::new();

        let store: Arc<dyn OpportunityStore> = match &config.database_url {
            Some(url) => {
                let max_connections = u32::try_from(config.pool_max_total).unwrap_or(u32::MAX);
                Arc::new(
                    PgOpportunityStore::connect(url, max_connections)
                        .await
                        .context("connecting to postgres")?,
                )
            }
            None => {
                warn!("DATABASE_URL not set; using an in-memory store for this run");
                Arc::new(MemoryOpportunityStore::new())
            }
        };

        let pipeline = match config.provider_config() {
            Ok(provider_config) => {
                let limiter = Arc::new(
                    TokenBucket::new(config.token_bucket_config())
                        .context("configuring rate limiter")?,
                );
                let executor = Arc::new(BackoffExecutor::new(
                    transport.clone(),
                    limiter,
                    config.backoff_policy(),
                ));
                let provider = Arc::new(
                    ProviderClient::new(executor, provider_config).with_cancel(cancel.clone()),
                );
                Some(Arc::new(
                    RefreshPipeline::new(provider, store.clone(), config.cache_policy())
                        .with_fetch_concurrency(config.fetch_concurrency),
                ))
            }
            Err(err) => {
                debug!(error = %err, "provider pipeline not configured");
                None
            }
        };

        let orchestrator = config.analysis_url.as_deref().map(|url| {
            let capability = Arc::new(HttpAnalysisCapability::new(transport.clone(), url));
            BatchOrchestrator::new(capability)
                .with_store(store.clone())
                .with_cache(Arc::new(AnalysisCache::with_ttl(Duration::from_secs(
                    config.analysis_cache_ttl_secs,
                ))))
        });

        Ok(Self {
            config,
            transport,
            store,
            pipeline,
            orchestrator,
            cancel,
        })
    }

    pub fn pipeline(&self) -> Result<&Arc<RefreshPipeline>> {
        self.pipeline
            .as_ref()
            .context("PROCURA_API_KEY must be set to query the provider")
    }

    pub fn orchestrator(&self) -> Result<&BatchOrchestrator> {
        self.orchestrator
            .as_ref()
            .context("PROCURA_ANALYSIS_URL must be set to run analysis batches")
    }

    /// Abandons provider requests still waiting on the limiter or a backoff, then
    /// closes the transport.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.transport.close();
    }
}

pub async fn maybe_build_scheduler(
    config: &IngestConfig,
    pipeline: Arc<RefreshPipeline>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let days = config.backfill_days.max(1);
    let filter = config.default_filter();
    let cron = config.backfill_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _lock| {
        let pipeline = pipeline.clone();
        let filter = filter.clone();
        Box::pin(async move {
            let to = Utc::now().date_naive();
            let from = to - ChronoDuration::days(days);
            match pipeline.ingest_range(from, to, &filter).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    inserted = summary.inserted,
                    updated = summary.updated,
                    "scheduled backfill finished"
                ),
                Err(err) => warn!(error = %err, "scheduled backfill failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use procura_core::{mint_placeholder_id, OpportunityDraft, RiskLevel};
    use procura_provider::{ProviderError, SearchPage, SearchQuery};
    use procura_storage::FetchError;
    use serde_json::json;

    #[test]
    fn config_reads_overrides_and_falls_back_on_garbage() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("PROCURA_API_KEY", "abc123"),
            ("PROCURA_RATE_PER_SECOND", "2.5"),
            ("PROCURA_MAX_ATTEMPTS", "not-a-number"),
            ("PROCURA_SCHEDULER_ENABLED", "true"),
            ("PROCURA_CLASSIFICATION_CODE", " 721110 "),
            ("PROCURA_USER_AGENT", "   "),
        ]);
        let config = IngestConfig::from_lookup(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.api_key.as_deref(), Some("abc123"));
        assert_eq!(config.rate_per_second, 2.5);
        assert_eq!(config.max_attempts, 5);
        assert!(config.scheduler_enabled);
        assert_eq!(config.classification_code.as_deref(), Some("721110"));
        assert_eq!(config.user_agent, "procura/0.1");
        assert_eq!(config.database_url, None);
        assert_eq!(config.backoff_policy().initial_delay, Duration::from_secs(2));
        assert_eq!(config.cache_policy(), CachePolicy::from_hours(24));
        assert_eq!(config.http_client_config().max_total_connections, 20);
    }

    #[test]
    fn provider_config_requires_an_api_key() {
        let err = IngestConfig::default().provider_config().unwrap_err();
        assert!(err.to_string().contains("PROCURA_API_KEY"));
    }

    #[tokio::test]
    async fn analysis_only_wiring_needs_no_api_key() {
        let config = IngestConfig {
            analysis_url: Some("http://127.0.0.1:9".into()),
            ..Default::default()
        };
        let services = IngestServices::from_config(config).await.unwrap();

        assert!(services.orchestrator().is_ok());
        let err = services.pipeline().err().unwrap();
        assert!(err.to_string().contains("PROCURA_API_KEY"));
        assert!(!services.transport.is_initialized());

        services.shutdown();
        assert!(services.transport.is_closed());
    }

    #[tokio::test]
    async fn api_key_wires_the_provider_pipeline() {
        let config = IngestConfig {
            api_key: Some("abc123".into()),
            ..Default::default()
        };
        let services = IngestServices::from_config(config).await.unwrap();

        assert!(services.pipeline().is_ok());
        assert!(services.orchestrator().is_err());
    }

    #[test]
    fn distinct_ids_keep_first_seen_order() {
        let ids: Vec<String> = ["b", " a", "b", "", "c", "a "].iter().map(|s| s.to_string()).collect();
        assert_eq!(distinct_ids(&ids), vec!["b", "a", "c"]);
    }

    fn report(priority: f64) -> AnalysisReport {
        AnalysisReport {
            confidence_score: 0.5,
            risk_level: RiskLevel::Medium,
            priority_score: priority,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn analysis_cache_expires_entries_after_ttl() {
        let cache = AnalysisCache::new(Duration::from_secs(3600), 100);
        cache.insert("N-1", report(3.0)).await;

        tokio::time::advance(Duration::from_secs(3599)).await;
        assert_eq!(cache.get("N-1").await.map(|r| r.priority_score), Some(3.0));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("N-1").await.is_none());
        assert!(cache.is_empty().await);
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn analysis_cache_evicts_oldest_when_full() {
        let cache = AnalysisCache::new(Duration::from_secs(3600), 2);
        cache.insert("first", report(1.0)).await;
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.insert("second", report(2.0)).await;
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.insert("second", report(2.5)).await;
        assert_eq!(cache.len().await, 2);

        cache.insert("third", report(3.0)).await;
        assert_eq!(cache.len().await, 2);
        assert!(cache.get("first").await.is_none());
        assert_eq!(cache.get("second").await.map(|r| r.priority_score), Some(2.5));
        assert!(cache.get("third").await.is_some());
    }

    struct FakeSource {
        records: HashMap<String, OpportunityDraft>,
        failing: HashSet<String>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeSource {
        fn new(known: &[&str], failing: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                records: known.iter().map(|id| (id.to_string(), draft(id))).collect(),
                failing: failing.iter().map(|id| id.to_string()).collect(),
                calls: Mutex::new(Vec::new()),
            })
        }

        async fn calls(&self) -> Vec<String> {
            self.calls.lock().await.clone()
        }
    }

    #[async_trait]
    impl OpportunitySource for FakeSource {
        async fn search(&self, query: &SearchQuery) -> Result<SearchPage, ProviderError> {
            let mut drafts: Vec<_> = self.records.values().cloned().collect();
            drafts.sort_by(|a, b| a.external_id.cmp(&b.external_id));
            let drafts: Vec<_> = drafts
                .into_iter()
                .skip(query.offset as usize)
                .take(query.limit as usize)
                .collect();
            Ok(SearchPage {
                total_records: self.records.len() as u64,
                drafts,
                skipped: 0,
            })
        }

        async fn fetch_by_id(&self, external_id: &str) -> Result<Option<OpportunityDraft>, ProviderError> {
            self.calls.lock().await.push(external_id.to_string());
            if self.failing.contains(external_id) {
                return Err(ProviderError::Fetch(FetchError::RetriesExhausted {
                    attempts: 5,
                    url: "https://provider.test".into(),
                    last_error: "http status 503".into(),
                }));
            }
            Ok(self.records.get(external_id).cloned())
        }

        fn window_days(&self) -> i64 {
            400
        }
    }

    fn draft(id: &str) -> OpportunityDraft {
        OpportunityDraft {
            external_id: id.to_string(),
            title: format!("Opportunity {id}"),
            description: String::new(),
            posted_at: None,
            classification_code: Some("721110".into()),
            category: None,
            organization: None,
            payload: json!({"noticeId": id}),
        }
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn refresh_serves_fresh_records_without_fetching() {
        let source = FakeSource::new(&["FRESH", "STALE", "NEW"], &["BROKEN"]);
        let store = Arc::new(MemoryOpportunityStore::new());
        store
            .upsert(&draft("FRESH"), Utc::now() - ChronoDuration::hours(1))
            .await
            .unwrap();
        store
            .upsert(&draft("STALE"), Utc::now() - ChronoDuration::hours(30))
            .await
            .unwrap();
        let placeholder = mint_placeholder_id(Utc::now());
        store.upsert(&draft(&placeholder), Utc::now()).await.unwrap();

        let pipeline = RefreshPipeline::new(source.clone(), store.clone(), CachePolicy::default());
        let summary = pipeline
            .refresh(&ids(&["FRESH", "STALE", "NEW", "MISSING", "BROKEN", placeholder.as_str(), "DEMO-unknown"]))
            .await
            .unwrap();

        assert_eq!(summary.status_of("FRESH"), Some(&RefreshStatus::Fresh));
        assert_eq!(
            summary.status_of("STALE"),
            Some(&RefreshStatus::Fetched { inserted: false })
        );
        assert_eq!(
            summary.status_of("NEW"),
            Some(&RefreshStatus::Fetched { inserted: true })
        );
        assert_eq!(summary.status_of("MISSING"), Some(&RefreshStatus::NotFound));
        assert!(matches!(summary.status_of("BROKEN"), Some(RefreshStatus::Failed { .. })));
        assert_eq!(summary.status_of(&placeholder), Some(&RefreshStatus::Placeholder));
        assert_eq!(summary.status_of("DEMO-unknown"), Some(&RefreshStatus::NotFound));

        let mut fetched = source.calls().await;
        fetched.sort();
        assert_eq!(fetched, vec!["BROKEN", "MISSING", "NEW", "STALE"]);

        let mut available = summary.available_ids();
        available.sort();
        let mut expected = ids(&["FRESH", "NEW", "STALE"]);
        expected.push(placeholder);
        expected.sort();
        assert_eq!(available, expected);
        assert_eq!(store.count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn ingest_range_upserts_every_backfilled_record() {
        let source = FakeSource::new(&["A", "B", "C"], &[]);
        let store = Arc::new(MemoryOpportunityStore::new());
        store.upsert(&draft("B"), Utc::now()).await.unwrap();
        let pipeline = RefreshPipeline::new(source, store.clone(), CachePolicy::default());

        let from = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let to = NaiveDate::from_ymd_opt(2026, 1, 31).unwrap();
        let summary = pipeline
            .ingest_range(from, to, &SearchFilter::default())
            .await
            .unwrap();

        assert_eq!(summary.received, 3);
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.updated, 1);
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn scheduler_is_not_built_when_disabled() {
        let source = FakeSource::new(&[], &[]);
        let pipeline = Arc::new(RefreshPipeline::new(
            source,
            Arc::new(MemoryOpportunityStore::new()),
            CachePolicy::default(),
        ));
        let sched = maybe_build_scheduler(&IngestConfig::default(), pipeline)
            .await
            .unwrap();
        assert!(sched.is_none());
    }
}
