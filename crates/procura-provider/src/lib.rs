//! Client for the public opportunity search API and an HTTP-backed analysis capability.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use procura_core::{AnalysisCapability, AnalysisError, AnalysisReport, OpportunityDraft};
use procura_storage::{BackoffExecutor, FetchError, OutboundRequest, Transport};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "procura-provider";

/// Date format the provider expects in `postedFrom` / `postedTo`.
pub const PROVIDER_DATE_FORMAT: &str = "%m/%d/%Y";

/// Longest posted-date span the provider accepts in one query.
pub const MAX_LOOKBACK_DAYS: i64 = 364;

/// Pages fetched per backfill window before giving up on it.
pub const DEFAULT_MAX_PAGES_PER_WINDOW: usize = 100;

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub lookback_days: i64,
    pub page_limit: u32,
    pub window_days: i64,
    pub max_pages_per_window: usize,
}

impl ProviderConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            lookback_days: MAX_LOOKBACK_DAYS,
            page_limit: 100,
            window_days: 7,
            max_pages_per_window: DEFAULT_MAX_PAGES_PER_WINDOW,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilter {
    pub keywords: Option<String>,
    pub classification_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub posted_from: NaiveDate,
    pub posted_to: NaiveDate,
    pub filter: SearchFilter,
    pub notice_id: Option<String>,
    pub limit: u32,
    pub offset: u32,
}

impl SearchQuery {
    pub fn window(posted_from: NaiveDate, posted_to: NaiveDate) -> Self {
        Self {
            posted_from,
            posted_to,
            filter: SearchFilter::default(),
            notice_id: None,
            limit: 100,
            offset: 0,
        }
    }

    pub fn with_filter(mut self, filter: &SearchFilter) -> Self {
        self.filter = filter.clone();
        self
    }

    pub fn with_notice_id(mut self, notice_id: impl Into<String>) -> Self {
        self.notice_id = Some(notice_id.into());
        self
    }

    pub fn page(mut self, limit: u32, offset: u32) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchPage {
    pub drafts: Vec<OpportunityDraft>,
    pub total_records: u64,
    /// Records dropped because they carried no notice id.
    pub skipped: usize,
}

impl SearchPage {
    pub fn received(&self) -> usize {
        self.drafts.len() + self.skipped
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid posted date range {from} .. {to}")]
    InvalidRange { from: NaiveDate, to: NaiveDate },
}

impl ProviderError {
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Fetch(err) => err.is_permanent(),
            Self::InvalidRange { .. } => true,
        }
    }
}

#[async_trait]
pub trait OpportunitySource: Send + Sync {
    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, ProviderError>;

    async fn fetch_by_id(&self, external_id: &str) -> Result<Option<OpportunityDraft>, ProviderError>;

    fn window_days(&self) -> i64 {
        7
    }

    fn page_limit(&self) -> u32 {
        100
    }

    fn max_pages_per_window(&self) -> usize {
        DEFAULT_MAX_PAGES_PER_WINDOW
    }

    /// Walk `[from, to]` in fixed windows, paging each window until a short page,
    /// the reported total, or the per-window page cap.
    async fn backfill(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        filter: &SearchFilter,
    ) -> Result<Vec<OpportunityDraft>, ProviderError> {
        if from > to {
            return Err(ProviderError::InvalidRange { from, to });
        }
        let window_days = self.window_days().max(1);
        let limit = self.page_limit().max(1);
        let max_pages = self.max_pages_per_window().max(1);

        let mut drafts = Vec::new();
        let mut seen = HashSet::new();
        let mut window_start = from;
        while window_start <= to {
            let window_end = (window_start + Duration::days(window_days - 1)).min(to);
            let mut offset = 0u32;
            let mut pages = 0usize;
            loop {
                let query = SearchQuery::window(window_start, window_end)
                    .with_filter(filter)
                    .page(limit, offset);
                let page = self.search(&query).await?;
                pages += 1;
                let received = page.received();
                let total = page.total_records;
                for draft in page.drafts {
                    if seen.insert(draft.external_id.clone()) {
                        drafts.push(draft);
                    }
                }

                let Some(next_offset) = offset.checked_add(limit) else {
                    break;
                };
                if received < limit as usize || (total > 0 && u64::from(next_offset) >= total) {
                    break;
                }
                if pages >= max_pages {
                    warn!(
                        %window_start,
                        %window_end,
                        pages,
                        total_records = total,
                        "page cap reached, moving to the next window"
                    );
                    break;
                }
                offset = next_offset;
            }
            debug!(%window_start, %window_end, pages, collected = drafts.len(), "backfill window done");
            window_start = window_end + Duration::days(1);
        }

        info!(%from, %to, collected = drafts.len(), "backfill finished");
        Ok(drafts)
    }
}

pub struct ProviderClient {
    executor: Arc<BackoffExecutor>,
    config: ProviderConfig,
    cancel: Option<CancellationToken>,
}

impl ProviderClient {
    pub fn new(executor: Arc<BackoffExecutor>, config: ProviderConfig) -> Self {
        Self {
            executor,
            config,
            cancel: None,
        }
    }

    /// Abandon pending and backing-off requests once `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn build_request(&self, query: &SearchQuery) -> OutboundRequest {
        let mut request = OutboundRequest::get(&self.config.base_url)
            .query("api_key", &self.config.api_key)
            .query(
                "postedFrom",
                query.posted_from.format(PROVIDER_DATE_FORMAT).to_string(),
            )
            .query("postedTo", query.posted_to.format(PROVIDER_DATE_FORMAT).to_string())
            .query("limit", query.limit.to_string())
            .query("offset", query.offset.to_string());
        if let Some(keywords) = &query.filter.keywords {
            request = request.query("q", keywords);
        }
        if let Some(code) = &query.filter.classification_code {
            request = request.query("ncode", code);
        }
        if let Some(notice_id) = &query.notice_id {
            request = request.query("noticeid", notice_id);
        }
        request
    }
}

#[async_trait]
impl OpportunitySource for ProviderClient {
    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, ProviderError> {
        let request = self.build_request(query);
        let response = match &self.cancel {
            Some(cancel) => self.executor.execute_cancellable(&request, cancel).await?,
            None => self.executor.execute(&request).await?,
        };
        let page = decode_search_page(&response.body, &request.url)?;
        debug!(
            posted_from = %query.posted_from,
            posted_to = %query.posted_to,
            offset = query.offset,
            received = page.drafts.len(),
            skipped = page.skipped,
            total_records = page.total_records,
            "search page decoded"
        );
        Ok(page)
    }

    async fn fetch_by_id(&self, external_id: &str) -> Result<Option<OpportunityDraft>, ProviderError> {
        let today = Utc::now().date_naive();
        let lookback = self.config.lookback_days.clamp(1, MAX_LOOKBACK_DAYS);
        let query = SearchQuery::window(today - Duration::days(lookback), today)
            .with_notice_id(external_id)
            .page(1, 0);
        let page = self.search(&query).await?;
        let mut drafts = page.drafts.into_iter();
        let found = drafts.find(|draft| draft.external_id == external_id);
        if found.is_none() && page.total_records > 0 {
            debug!(external_id, "provider answered with a different notice id");
        }
        Ok(found)
    }

    fn window_days(&self) -> i64 {
        self.config.window_days
    }

    fn page_limit(&self) -> u32 {
        self.config.page_limit
    }

    fn max_pages_per_window(&self) -> usize {
        self.config.max_pages_per_window
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchEnvelope {
    #[serde(default)]
    total_records: u64,
    #[serde(default)]
    opportunities_data: Vec<JsonValue>,
}

pub fn decode_search_page(body: &[u8], url: &str) -> Result<SearchPage, FetchError> {
    let envelope: SearchEnvelope = serde_json::from_slice(body)
        .map_err(|err| FetchError::malformed(url, err.to_string()))?;

    let mut drafts = Vec::with_capacity(envelope.opportunities_data.len());
    let mut skipped = 0usize;
    for record in envelope.opportunities_data {
        match decode_draft(record) {
            Some(draft) => drafts.push(draft),
            None => {
                skipped += 1;
                warn!(url, "skipping provider record without a notice id");
            }
        }
    }

    Ok(SearchPage {
        drafts,
        total_records: envelope.total_records,
        skipped,
    })
}

/// Map one provider record onto a draft. Returns `None` when the record has no identifier.
pub fn decode_draft(record: JsonValue) -> Option<OpportunityDraft> {
    let external_id = string_field(&record, &["noticeId", "opportunityId", "noticeid"])?;
    Some(OpportunityDraft {
        external_id,
        title: string_field(&record, &["title"]).unwrap_or_default(),
        description: string_field(&record, &["description"]).unwrap_or_default(),
        posted_at: string_field(&record, &["postedDate"])
            .as_deref()
            .and_then(parse_provider_datetime),
        classification_code: string_field(&record, &["naicsCode", "classificationCode"]),
        category: string_field(&record, &["type", "baseType"]),
        organization: string_field(
            &record,
            &["fullParentPathName", "organizationName", "department", "agency"],
        ),
        payload: record,
    })
}

fn string_field(record: &JsonValue, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match record.get(*key)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

pub fn parse_provider_datetime(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%#z") {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d", PROVIDER_DATE_FORMAT]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Adapts a remote analysis service to [`AnalysisCapability`]. Single attempt per call.
pub struct HttpAnalysisCapability {
    transport: Arc<dyn Transport>,
    endpoint: String,
}

impl HttpAnalysisCapability {
    pub fn new(transport: Arc<dyn Transport>, base_url: &str) -> Self {
        Self {
            transport,
            endpoint: format!("{}/analyze", base_url.trim_end_matches('/')),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl AnalysisCapability for HttpAnalysisCapability {
    async fn analyze(&self, external_id: &str) -> Result<AnalysisReport, AnalysisError> {
        let request =
            OutboundRequest::post_json(&self.endpoint, json!({ "opportunity_id": external_id }));
        let response = self
            .transport
            .send(&request)
            .await
            .map_err(|err| AnalysisError::Message(format!("analysis request failed: {err}")))?;

        match response.status.as_u16() {
            404 => Err(AnalysisError::NotFound(external_id.to_string())),
            200..=299 => {
                let report: AnalysisReport = serde_json::from_slice(&response.body)
                    .with_context(|| format!("decoding analysis report for {external_id}"))?;
                Ok(report)
            }
            status => Err(AnalysisError::Message(format!(
                "analysis service returned status {status}"
            ))),
        }
    }
}
