//! Rate limiting, retrying HTTP transport and idempotent opportunity persistence for procura.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use procura_core::{AnalysisResult, Opportunity, OpportunityDraft};
use reqwest::header::{self, HeaderMap, HeaderValue};
pub use reqwest::{Method, StatusCode};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "procura-storage";

// Absorbs float drift from many small refills.
const TOKEN_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub rate_per_second: f64,
    pub capacity: f64,
    pub poll_interval: Duration,
}

impl TokenBucketConfig {
    pub fn per_second(rate_per_second: f64) -> Self {
        Self {
            rate_per_second,
            capacity: 1.0,
            poll_interval: Duration::from_millis(25),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LimiterError {
    #[error("rate must be a positive finite number, got {0}")]
    InvalidRate(f64),
    #[error("capacity must hold at least one token, got {0}")]
    InvalidCapacity(f64),
    #[error("deadline elapsed before a token became available")]
    DeadlineElapsed,
    #[error("cancelled while waiting for a token")]
    Cancelled,
}

/// Polling token bucket shared by every outbound caller.
#[derive(Debug)]
pub struct TokenBucket {
    rate_per_second: f64,
    capacity: f64,
    poll_interval: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(config: TokenBucketConfig) -> Result<Self, LimiterError> {
        if !config.rate_per_second.is_finite() || config.rate_per_second <= 0.0 {
            return Err(LimiterError::InvalidRate(config.rate_per_second));
        }
        if !config.capacity.is_finite() || config.capacity < 1.0 {
            return Err(LimiterError::InvalidCapacity(config.capacity));
        }
        Ok(Self {
            rate_per_second: config.rate_per_second,
            capacity: config.capacity,
            poll_interval: config.poll_interval.max(Duration::from_millis(1)),
            state: Mutex::new(TokenBucketState {
                tokens: config.capacity,
                last_refill: Instant::now(),
            }),
        })
    }

    pub fn rate_per_second(&self) -> f64 {
        self.rate_per_second
    }

    /// Refill, then take one token if available. Never waits.
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill);
        state.tokens =
            (state.tokens + elapsed.as_secs_f64() * self.rate_per_second).min(self.capacity);
        state.last_refill = now;

        if state.tokens + TOKEN_EPSILON >= 1.0 {
            state.tokens = (state.tokens - 1.0).max(0.0);
            true
        } else {
            false
        }
    }

    pub async fn acquire(&self) {
        while !self.try_acquire().await {
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub async fn acquire_until(&self, deadline: Instant) -> Result<(), LimiterError> {
        loop {
            if self.try_acquire().await {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(LimiterError::DeadlineElapsed);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    pub async fn acquire_cancellable(&self, cancel: &CancellationToken) -> Result<(), LimiterError> {
        loop {
            if cancel.is_cancelled() {
                return Err(LimiterError::Cancelled);
            }
            if self.try_acquire().await {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(LimiterError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Parse a `Retry-After` value given either as delta-seconds or as an HTTP-date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(seconds) = value.parse::<f64>() {
        return (seconds.is_finite() && seconds >= 0.0).then(|| Duration::from_secs_f64(seconds));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some(at.signed_duration_since(now).to_std().unwrap_or(Duration::ZERO))
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        let delay = self.initial_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// A provider hint replaces the computed delay for that attempt.
    pub fn delay_before_retry(&self, attempt_index: u32, retry_after: Option<Duration>) -> Duration {
        retry_after.unwrap_or_else(|| self.delay_for_attempt(attempt_index))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub json: Option<JsonValue>,
}

impl OutboundRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            query: Vec::new(),
            json: None,
        }
    }

    pub fn post_json(url: impl Into<String>, body: JsonValue) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            query: Vec::new(),
            json: Some(body),
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_idempotent(&self) -> bool {
        matches!(self.method, Method::GET | Method::HEAD)
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub retry_after: Option<Duration>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("{0}")]
    Unrecoverable(String),
}

impl TransportError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Timeout(_) | Self::Connect(_) | Self::Request(_) => RetryDisposition::Retryable,
            Self::Closed | Self::Unrecoverable(_) => RetryDisposition::NonRetryable,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_connect() {
            Self::Connect(err.to_string())
        } else if err.is_request() {
            Self::Request(err.to_string())
        } else {
            Self::Unrecoverable(err.to_string())
        }
    }
}

/// One round trip to a remote endpoint. No business retries happen at this layer.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &OutboundRequest) -> Result<FetchedResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub max_idle_per_route: usize,
    pub max_total_connections: usize,
    pub transport_retries: u32,
    pub transport_retry_backoff: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: "procura/0.1".to_string(),
            max_idle_per_route: 10,
            max_total_connections: 20,
            transport_retries: 2,
            transport_retry_backoff: Duration::from_millis(500),
        }
    }
}

const TRANSPORT_RETRY_STATUSES: [StatusCode; 4] = [
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub transport_retries: u64,
}

/// Shared reqwest client with a hard cap on in-flight requests.
///
/// The client itself is built on first use; `close` tears the pool down and is
/// safe to call more than once.
#[derive(Debug)]
pub struct PooledTransport {
    config: HttpClientConfig,
    client: OnceCell<reqwest::Client>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
    requests_sent: AtomicU64,
    transport_retries: AtomicU64,
}

impl PooledTransport {
    pub fn new(config: HttpClientConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_total_connections.max(1)));
        Self {
            config,
            client: OnceCell::new(),
            permits,
            closed: AtomicBool::new(false),
            requests_sent: AtomicU64::new(0),
            transport_retries: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.client.initialized()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            transport_retries: self.transport_retries.load(Ordering::Relaxed),
        }
    }

    /// Returns `true` only for the call that actually closed the transport.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.permits.close();
        let stats = self.stats();
        info!(
            requests_sent = stats.requests_sent,
            transport_retries = stats.transport_retries,
            "pooled transport closed"
        );
        true
    }

    async fn client(&self) -> Result<&reqwest::Client, TransportError> {
        self.client
            .get_or_try_init(|| async { build_client(&self.config) })
            .await
    }

    async fn send_once(
        &self,
        client: &reqwest::Client,
        request: &OutboundRequest,
    ) -> Result<FetchedResponse, TransportError> {
        let mut builder = client.request(request.method.clone(), &request.url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.json {
            builder = builder.json(body);
        }

        self.requests_sent.fetch_add(1, Ordering::Relaxed);
        let resp = builder.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        let retry_after = resp
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, Utc::now()));
        let body = resp.bytes().await?.to_vec();

        Ok(FetchedResponse {
            status,
            final_url,
            retry_after,
            body,
        })
    }
}

fn build_client(config: &HttpClientConfig) -> Result<reqwest::Client, TransportError> {
    let mut headers = HeaderMap::new();
    headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));

    let client = reqwest::Client::builder()
        .user_agent(config.user_agent.clone())
        .default_headers(headers)
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout)
        .pool_max_idle_per_host(config.max_idle_per_route)
        .build()
        .map_err(|err| TransportError::Unrecoverable(format!("building reqwest client: {err}")))?;
    debug!(
        max_idle_per_route = config.max_idle_per_route,
        max_total_connections = config.max_total_connections,
        "pooled http client initialised"
    );
    Ok(client)
}

#[async_trait]
impl Transport for PooledTransport {
    async fn send(&self, request: &OutboundRequest) -> Result<FetchedResponse, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| TransportError::Closed)?;
        let client = self.client().await?;

        let mut retries = 0u32;
        loop {
            let response = self.send_once(client, request).await?;
            let retry = request.is_idempotent()
                && TRANSPORT_RETRY_STATUSES.contains(&response.status)
                && retries < self.config.transport_retries;
            if !retry {
                return Ok(response);
            }

            let delay = self
                .config
                .transport_retry_backoff
                .saturating_mul(1u32 << retries.min(16));
            retries += 1;
            self.transport_retries.fetch_add(1, Ordering::Relaxed);
            debug!(
                status = response.status.as_u16(),
                url = %request.url,
                retry = retries,
                "transport-level retry"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("retries exhausted after {attempts} attempts for {url}: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        url: String,
        last_error: String,
    },
    #[error("permanent fetch error for {url}: {reason}")]
    Permanent {
        status: Option<u16>,
        url: String,
        reason: String,
    },
    #[error("gave up on {url} after {attempts} attempts: {reason}")]
    Interrupted {
        attempts: u32,
        url: String,
        reason: LimiterError,
    },
}

impl FetchError {
    pub fn malformed(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Permanent {
            status: None,
            url: url.into(),
            reason: format!("malformed response: {}", reason.into()),
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Permanent { status, .. } => *status,
            Self::RetriesExhausted { .. } | Self::Interrupted { .. } => None,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }
}

/// How long a fetch may keep waiting on the limiter and between retries.
#[derive(Debug, Clone, Copy)]
enum Gate<'a> {
    Unbounded,
    Deadline(Instant),
    Cancel(&'a CancellationToken),
}

impl Gate<'_> {
    fn check(&self) -> Result<(), LimiterError> {
        match self {
            Self::Unbounded => Ok(()),
            Self::Deadline(deadline) if Instant::now() >= *deadline => {
                Err(LimiterError::DeadlineElapsed)
            }
            Self::Deadline(_) => Ok(()),
            Self::Cancel(cancel) if cancel.is_cancelled() => Err(LimiterError::Cancelled),
            Self::Cancel(_) => Ok(()),
        }
    }

    async fn acquire(&self, limiter: &TokenBucket) -> Result<(), LimiterError> {
        self.check()?;
        match self {
            Self::Unbounded => {
                limiter.acquire().await;
                Ok(())
            }
            Self::Deadline(deadline) => limiter.acquire_until(*deadline).await,
            Self::Cancel(cancel) => limiter.acquire_cancellable(cancel).await,
        }
    }

    async fn sleep(&self, delay: Duration) -> Result<(), LimiterError> {
        match self {
            Self::Unbounded => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            Self::Deadline(deadline) => {
                if Instant::now() + delay > *deadline {
                    tokio::time::sleep_until(*deadline).await;
                    return Err(LimiterError::DeadlineElapsed);
                }
                tokio::time::sleep(delay).await;
                Ok(())
            }
            Self::Cancel(cancel) => tokio::select! {
                _ = cancel.cancelled() => Err(LimiterError::Cancelled),
                _ = tokio::time::sleep(delay) => Ok(()),
            },
        }
    }
}

/// Rate-gated, retrying wrapper around a single outbound call.
pub struct BackoffExecutor {
    transport: Arc<dyn Transport>,
    limiter: Arc<TokenBucket>,
    policy: BackoffPolicy,
}

impl BackoffExecutor {
    pub fn new(transport: Arc<dyn Transport>, limiter: Arc<TokenBucket>, policy: BackoffPolicy) -> Self {
        Self {
            transport,
            limiter,
            policy,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub async fn execute(&self, request: &OutboundRequest) -> Result<FetchedResponse, FetchError> {
        self.execute_gated(request, Gate::Unbounded).await
    }

    /// Like [`execute`](Self::execute), but gives up once `deadline` passes, whether
    /// waiting for a token or backing off.
    pub async fn execute_until(
        &self,
        request: &OutboundRequest,
        deadline: Instant,
    ) -> Result<FetchedResponse, FetchError> {
        self.execute_gated(request, Gate::Deadline(deadline)).await
    }

    pub async fn execute_cancellable(
        &self,
        request: &OutboundRequest,
        cancel: &CancellationToken,
    ) -> Result<FetchedResponse, FetchError> {
        self.execute_gated(request, Gate::Cancel(cancel)).await
    }

    async fn execute_gated(
        &self,
        request: &OutboundRequest,
        gate: Gate<'_>,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("outbound_request", method = %request.method, url = %request.url);
        self.execute_with_retries(request, gate).instrument(span).await
    }

    async fn execute_with_retries(
        &self,
        request: &OutboundRequest,
        gate: Gate<'_>,
    ) -> Result<FetchedResponse, FetchError> {
        let attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();
        let interrupted = |sent: u32, reason: LimiterError| {
            debug!(attempts = sent, %reason, "fetch interrupted");
            FetchError::Interrupted {
                attempts: sent,
                url: request.url.clone(),
                reason,
            }
        };

        for attempt in 0..attempts {
            if let Err(reason) = gate.acquire(&self.limiter).await {
                return Err(interrupted(attempt, reason));
            }

            let retry_after = match self.transport.send(request).await {
                Ok(resp) if resp.status.is_success() => {
                    debug!(attempt = attempt + 1, status = resp.status.as_u16(), "request succeeded");
                    return Ok(resp);
                }
                Ok(resp) => match classify_status(resp.status) {
                    RetryDisposition::Retryable => {
                        last_error = format!("http status {}", resp.status.as_u16());
                        if resp.status == StatusCode::TOO_MANY_REQUESTS {
                            resp.retry_after
                        } else {
                            None
                        }
                    }
                    RetryDisposition::NonRetryable => {
                        return Err(FetchError::Permanent {
                            status: Some(resp.status.as_u16()),
                            url: request.url.clone(),
                            reason: format!("http status {}", resp.status.as_u16()),
                        });
                    }
                },
                Err(err) => match err.disposition() {
                    RetryDisposition::Retryable => {
                        last_error = err.to_string();
                        None
                    }
                    RetryDisposition::NonRetryable => {
                        return Err(FetchError::Permanent {
                            status: None,
                            url: request.url.clone(),
                            reason: err.to_string(),
                        });
                    }
                },
            };

            if attempt + 1 < attempts {
                let delay = self.policy.delay_before_retry(attempt, retry_after);
                warn!(
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    honoured_retry_after = retry_after.is_some(),
                    error = %last_error,
                    "transient failure, backing off"
                );
                if let Err(reason) = gate.sleep(delay).await {
                    return Err(interrupted(attempt + 1, reason));
                }
            }
        }

        Err(FetchError::RetriesExhausted {
            attempts,
            url: request.url.clone(),
            last_error,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub id: Uuid,
    pub inserted: bool,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("no stored opportunity with external id {0}")]
    UnknownOpportunity(String),
    #[error("inconsistent stored state: {0}")]
    Corrupt(String),
}

/// Persistence contract: at most one row per `external_id`, ever.
#[async_trait]
pub trait OpportunityStore: Send + Sync {
    async fn upsert(
        &self,
        draft: &OpportunityDraft,
        refreshed_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError>;

    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<Opportunity>, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;

    /// Returns `false` when this batch already holds a result for the opportunity.
    async fn record_analysis(&self, result: &AnalysisResult) -> Result<bool, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryOpportunityStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    opportunities: HashMap<String, Opportunity>,
    analyses: Vec<AnalysisResult>,
}

impl MemoryOpportunityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn analyses(&self) -> Vec<AnalysisResult> {
        self.state.lock().await.analyses.clone()
    }
}

#[async_trait]
impl OpportunityStore for MemoryOpportunityStore {
    async fn upsert(
        &self,
        draft: &OpportunityDraft,
        refreshed_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.opportunities.get_mut(&draft.external_id) {
            existing.apply_refresh(draft, refreshed_at);
            return Ok(UpsertOutcome {
                id: existing.id,
                inserted: false,
            });
        }

        let row = Opportunity::from_draft(draft, Uuid::new_v4(), Utc::now(), refreshed_at);
        let id = row.id;
        state.opportunities.insert(draft.external_id.clone(), row);
        Ok(UpsertOutcome { id, inserted: true })
    }

    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<Opportunity>, StoreError> {
        Ok(self.state.lock().await.opportunities.get(external_id).cloned())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.opportunities.len() as u64)
    }

    async fn record_analysis(&self, result: &AnalysisResult) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if !state.opportunities.contains_key(&result.external_id) {
            return Err(StoreError::UnknownOpportunity(result.external_id.clone()));
        }
        let duplicate = state
            .analyses
            .iter()
            .any(|a| a.batch_id == result.batch_id && a.external_id == result.external_id);
        if duplicate {
            return Ok(false);
        }
        state.analyses.push(result.clone());
        Ok(true)
    }
}

const UPSERT_OPPORTUNITY_SQL: &str = r#"
INSERT INTO opportunities (
    id, external_id, title, description, posted_at, classification_code,
    category, organization, cached_payload, cache_refreshed_at, created_at
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
ON CONFLICT (external_id) DO UPDATE
   SET title = EXCLUDED.title,
       description = EXCLUDED.description,
       posted_at = EXCLUDED.posted_at,
       classification_code = EXCLUDED.classification_code,
       category = EXCLUDED.category,
       organization = EXCLUDED.organization,
       cached_payload = EXCLUDED.cached_payload,
       cache_refreshed_at = EXCLUDED.cache_refreshed_at
RETURNING id, (xmax = 0) AS inserted
"#;

const UPDATE_OPPORTUNITY_SQL: &str = r#"
UPDATE opportunities
   SET title = $2,
       description = $3,
       posted_at = $4,
       classification_code = $5,
       category = $6,
       organization = $7,
       cached_payload = $8,
       cache_refreshed_at = $9
 WHERE external_id = $1
RETURNING id
"#;

const INSERT_ANALYSIS_SQL: &str = r#"
INSERT INTO analysis_results (
    id, batch_id, opportunity_id, status, confidence_score, risk_level,
    priority_score, recommendations, coordination_notes, error, created_at
)
SELECT $1, $2, o.id, $4, $5, $6, $7, $8, $9, $10, $11
  FROM opportunities o
 WHERE o.external_id = $3
ON CONFLICT (batch_id, opportunity_id) DO NOTHING
RETURNING id
"#;

/// Postgres-backed store. Upserts are a single `INSERT ... ON CONFLICT` statement.
#[derive(Debug, Clone)]
pub struct PgOpportunityStore {
    pool: PgPool,
}

impl PgOpportunityStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    async fn update_existing(
        &self,
        draft: &OpportunityDraft,
        refreshed_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let row = sqlx::query(UPDATE_OPPORTUNITY_SQL)
            .bind(&draft.external_id)
            .bind(&draft.title)
            .bind(&draft.description)
            .bind(draft.posted_at)
            .bind(&draft.classification_code)
            .bind(&draft.category)
            .bind(&draft.organization)
            .bind(&draft.payload)
            .bind(refreshed_at)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(UpsertOutcome {
                id: row.try_get("id")?,
                inserted: false,
            }),
            None => Err(StoreError::Corrupt(format!(
                "row for {} vanished between conflict and update",
                draft.external_id
            ))),
        }
    }
}

fn opportunity_from_row(row: &PgRow) -> Result<Opportunity, sqlx::Error> {
    Ok(Opportunity {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        posted_at: row.try_get("posted_at")?,
        classification_code: row.try_get("classification_code")?,
        category: row.try_get("category")?,
        organization: row.try_get("organization")?,
        cached_payload: row.try_get("cached_payload")?,
        cache_refreshed_at: row.try_get("cache_refreshed_at")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl OpportunityStore for PgOpportunityStore {
    async fn upsert(
        &self,
        draft: &OpportunityDraft,
        refreshed_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let result = sqlx::query(UPSERT_OPPORTUNITY_SQL)
            .bind(Uuid::new_v4())
            .bind(&draft.external_id)
            .bind(&draft.title)
            .bind(&draft.description)
            .bind(draft.posted_at)
            .bind(&draft.classification_code)
            .bind(&draft.category)
            .bind(&draft.organization)
            .bind(&draft.payload)
            .bind(refreshed_at)
            .fetch_one(&self.pool)
            .await;

        match result {
            Ok(row) => Ok(UpsertOutcome {
                id: row.try_get("id")?,
                inserted: row.try_get("inserted")?,
            }),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                warn!(
                    external_id = %draft.external_id,
                    constraint = db_err.constraint().unwrap_or("unknown"),
                    "unique violation during upsert, updating existing row"
                );
                self.update_existing(draft, refreshed_at).await
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<Opportunity>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, external_id, title, description, posted_at, classification_code,
                   category, organization, cached_payload, cache_refreshed_at, created_at
              FROM opportunities
             WHERE external_id = $1
            "#,
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref()
            .map(opportunity_from_row)
            .transpose()
            .map_err(StoreError::from)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM opportunities")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn record_analysis(&self, result: &AnalysisResult) -> Result<bool, StoreError> {
        let recommendations = serde_json::to_value(&result.recommendations)
            .map_err(|err| StoreError::Corrupt(format!("encoding recommendations: {err}")))?;
        let coordination_notes = serde_json::to_value(&result.coordination_notes)
            .map_err(|err| StoreError::Corrupt(format!("encoding coordination notes: {err}")))?;

        let inserted = sqlx::query(INSERT_ANALYSIS_SQL)
            .bind(result.id)
            .bind(result.batch_id)
            .bind(&result.external_id)
            .bind(result.status.as_str())
            .bind(result.confidence_score)
            .bind(result.risk_level.to_string())
            .bind(result.priority_score)
            .bind(recommendations)
            .bind(coordination_notes)
            .bind(&result.error)
            .bind(result.created_at)
            .fetch_optional(&self.pool)
            .await?;
        if inserted.is_some() {
            return Ok(true);
        }

        let known: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM opportunities WHERE external_id = $1)")
                .bind(&result.external_id)
                .fetch_one(&self.pool)
                .await?;
        if known {
            Ok(false)
        } else {
            Err(StoreError::UnknownOpportunity(result.external_id.clone()))
        }
    }
}
