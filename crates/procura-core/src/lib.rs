//! Core domain model, cache freshness rules and the analysis capability contract.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "procura-core";

/// Prefix reserved for locally minted identifiers of synthetic entries.
pub const PLACEHOLDER_PREFIX: &str = "DEMO-";

pub fn is_placeholder_id(external_id: &str) -> bool {
    external_id.starts_with(PLACEHOLDER_PREFIX)
}

/// Mint a placeholder `external_id` that can never collide with a provider-issued one.
pub fn mint_placeholder_id(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{PLACEHOLDER_PREFIX}{}-{}",
        now.format("%Y%m%d%H%M%S"),
        &suffix[..8]
    )
}

/// Decoded provider record, before it has a row of its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityDraft {
    pub external_id: String,
    pub title: String,
    pub description: String,
    pub posted_at: Option<DateTime<Utc>>,
    pub classification_code: Option<String>,
    pub category: Option<String>,
    pub organization: Option<String>,
    /// Raw provider record, kept verbatim for downstream consumers.
    pub payload: JsonValue,
}

/// Persisted opportunity row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: Uuid,
    pub external_id: String,
    pub title: String,
    pub description: String,
    pub posted_at: Option<DateTime<Utc>>,
    pub classification_code: Option<String>,
    pub category: Option<String>,
    pub organization: Option<String>,
    pub cached_payload: Option<JsonValue>,
    pub cache_refreshed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Opportunity {
    pub fn from_draft(
        draft: &OpportunityDraft,
        id: Uuid,
        created_at: DateTime<Utc>,
        refreshed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            external_id: draft.external_id.clone(),
            title: draft.title.clone(),
            description: draft.description.clone(),
            posted_at: draft.posted_at,
            classification_code: draft.classification_code.clone(),
            category: draft.category.clone(),
            organization: draft.organization.clone(),
            cached_payload: Some(draft.payload.clone()),
            cache_refreshed_at: Some(refreshed_at),
            created_at,
        }
    }

    /// Overwrite the mutable fields from a fresh fetch. `id` and `created_at` never change.
    pub fn apply_refresh(&mut self, draft: &OpportunityDraft, refreshed_at: DateTime<Utc>) {
        self.title = draft.title.clone();
        self.description = draft.description.clone();
        self.posted_at = draft.posted_at;
        self.classification_code = draft.classification_code.clone();
        self.category = draft.category.clone();
        self.organization = draft.organization.clone();
        self.cached_payload = Some(draft.payload.clone());
        self.cache_refreshed_at = Some(refreshed_at);
    }
}

/// Decides whether a stored record may be served without a new fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub ttl: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::from_hours(24)
    }
}

impl CachePolicy {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }

    pub fn from_hours(hours: i64) -> Self {
        Self {
            ttl: Duration::hours(hours),
        }
    }

    pub fn is_fresh_at(&self, record: &Opportunity, now: DateTime<Utc>) -> bool {
        match record.cache_refreshed_at {
            Some(refreshed_at) => now.signed_duration_since(refreshed_at) < self.ttl,
            None => false,
        }
    }

    pub fn is_fresh(&self, record: &Opportunity) -> bool {
        self.is_fresh_at(record, Utc::now())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Completed,
    Failed,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Risk category reported by the analysis capability. Unrecognised labels are kept as-is.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
    #[default]
    Unknown,
    Other(String),
}

impl From<String> for RiskLevel {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Self::Low,
            "medium" => Self::Medium,
            "high" => Self::High,
            "critical" => Self::Critical,
            "" | "unknown" => Self::Unknown,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for RiskLevel {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<RiskLevel> for String {
    fn from(value: RiskLevel) -> Self {
        value.to_string()
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => f.write_str("low"),
            Self::Medium => f.write_str("medium"),
            Self::High => f.write_str("high"),
            Self::Critical => f.write_str("critical"),
            Self::Unknown => f.write_str("unknown"),
            Self::Other(label) => f.write_str(label),
        }
    }
}

/// One collaborator's note. Notes carrying a `status` string are recognised;
/// anything else is kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CoordinationNote {
    Status {
        status: String,
        #[serde(flatten)]
        details: serde_json::Map<String, JsonValue>,
    },
    Raw(JsonValue),
}

impl CoordinationNote {
    pub fn status(&self) -> Option<&str> {
        match self {
            Self::Status { status, .. } => Some(status),
            Self::Raw(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CoordinationNotes(BTreeMap<String, CoordinationNote>);

impl CoordinationNotes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, collaborator: impl Into<String>, note: CoordinationNote) {
        self.0.insert(collaborator.into(), note);
    }

    pub fn get(&self, collaborator: &str) -> Option<&CoordinationNote> {
        self.0.get(collaborator)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CoordinationNote)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// What the analysis capability hands back for one identifier.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AnalysisReport {
    #[serde(default)]
    pub confidence_score: f64,
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub priority_score: f64,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub coordination_notes: CoordinationNotes,
    #[serde(default)]
    pub details: JsonValue,
}

/// One accepted run of the analysis capability against one opportunity.
///
/// `external_id` is the relation to the analysed [`Opportunity`]; storage
/// resolves it to the row id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub external_id: String,
    pub status: AnalysisStatus,
    pub confidence_score: f64,
    pub risk_level: RiskLevel,
    pub priority_score: f64,
    pub recommendations: Vec<String>,
    pub coordination_notes: CoordinationNotes,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AnalysisResult {
    pub fn completed(
        batch_id: Uuid,
        external_id: impl Into<String>,
        report: AnalysisReport,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            batch_id,
            external_id: external_id.into(),
            status: AnalysisStatus::Completed,
            confidence_score: clamp_confidence(report.confidence_score),
            risk_level: report.risk_level,
            priority_score: clamp_priority(report.priority_score),
            recommendations: report.recommendations,
            coordination_notes: report.coordination_notes,
            error: None,
            created_at: now,
        }
    }

    pub fn failed(
        batch_id: Uuid,
        external_id: impl Into<String>,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            batch_id,
            external_id: external_id.into(),
            status: AnalysisStatus::Failed,
            confidence_score: 0.0,
            risk_level: RiskLevel::Unknown,
            priority_score: 0.0,
            recommendations: Vec::new(),
            coordination_notes: CoordinationNotes::new(),
            error: Some(reason.into()),
            created_at: now,
        }
    }
}

fn clamp_confidence(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

fn clamp_priority(score: f64) -> f64 {
    if score.is_nan() || score < 0.0 {
        0.0
    } else {
        score
    }
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("opportunity {0} not found")]
    NotFound(String),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Opaque per-record analysis. Implementations may be slow; callers bound concurrency.
#[async_trait]
pub trait AnalysisCapability: Send + Sync {
    async fn analyze(&self, external_id: &str) -> Result<AnalysisReport, AnalysisError>;
}
