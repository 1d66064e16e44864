//! Core domain model for the lexdock ingestion engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "lexdock-core";

/// Kind of ingested legal record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Opinion,
    Docket,
    Filing,
    Rule,
    Audio,
    Order,
    Motion,
    Brief,
}

impl DocumentKind {
    pub const ALL: [DocumentKind; 8] = [
        DocumentKind::Opinion,
        DocumentKind::Docket,
        DocumentKind::Filing,
        DocumentKind::Rule,
        DocumentKind::Audio,
        DocumentKind::Order,
        DocumentKind::Motion,
        DocumentKind::Brief,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Opinion => "opinion",
            DocumentKind::Docket => "docket",
            DocumentKind::Filing => "filing",
            DocumentKind::Rule => "rule",
            DocumentKind::Audio => "audio",
            DocumentKind::Order => "order",
            DocumentKind::Motion => "motion",
            DocumentKind::Brief => "brief",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == value)
    }
}

impl std::fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed handoff contract from fetchers into the content store.
///
/// Citation/party/judge/attorney arrays and the metadata mapping are opaque to
/// the core: order-preserving JSON persisted and returned verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentDraft {
    pub source_id: String,
    pub external_id: String,
    pub kind: DocumentKind,
    pub court: Option<String>,
    pub jurisdiction: Option<String>,
    pub docket_number: Option<String>,
    pub case_name: Option<String>,
    pub filed_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    pub citations: Vec<JsonValue>,
    pub parties: Vec<JsonValue>,
    pub judges: Vec<JsonValue>,
    pub attorneys: Vec<JsonValue>,
    pub metadata: JsonValue,
    pub summary: Option<String>,
    pub plain_text: Option<String>,
    pub source_url: Option<String>,
    pub page_count: Option<i64>,
    /// Canonical body bytes; the content digest is computed over these.
    pub body: Vec<u8>,
}

impl DocumentDraft {
    pub fn new(
        source_id: impl Into<String>,
        external_id: impl Into<String>,
        kind: DocumentKind,
        body: Vec<u8>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            external_id: external_id.into(),
            kind,
            court: None,
            jurisdiction: None,
            docket_number: None,
            case_name: None,
            filed_at: None,
            modified_at: None,
            citations: Vec::new(),
            parties: Vec::new(),
            judges: Vec::new(),
            attorneys: Vec::new(),
            metadata: JsonValue::Object(serde_json::Map::new()),
            summary: None,
            plain_text: None,
            source_url: None,
            page_count: None,
            body,
        }
    }
}

/// Canonical persisted legal record. `(source_id, external_id)` is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub source_id: String,
    pub external_id: String,
    pub kind: DocumentKind,
    pub court: Option<String>,
    pub jurisdiction: Option<String>,
    pub docket_number: Option<String>,
    pub case_name: Option<String>,
    pub filed_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    pub citations: Vec<JsonValue>,
    pub parties: Vec<JsonValue>,
    pub judges: Vec<JsonValue>,
    pub attorneys: Vec<JsonValue>,
    pub metadata: JsonValue,
    pub summary: Option<String>,
    pub plain_text: Option<String>,
    pub content_digest: String,
    pub source_url: Option<String>,
    pub artifact_path: Option<String>,
    pub byte_size: i64,
    pub page_count: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Emitted by the content store whenever a `put` lands new content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentChange {
    pub document_id: String,
    pub source_id: String,
    pub external_id: String,
    pub content_digest: String,
}

/// Status of an incremental sync run for one (source, collection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "success" => Some(RunStatus::Success),
            "error" => Some(RunStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incremental sync state for one (source, collection).
///
/// The cursor token is an opaque, source-defined resume marker. It only
/// advances on full-run success so an interrupted run retries from the last
/// known-good point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub source_id: String,
    pub collection: String,
    pub status: RunStatus,
    pub cursor_token: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub records_processed: i64,
    pub records_failed: i64,
}

/// Type tag for asynchronous units of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    IngestBatch,
    Export,
    Draft,
    EfilingSubmit,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::IngestBatch => "ingest_batch",
            JobKind::Export => "export",
            JobKind::Draft => "draft",
            JobKind::EfilingSubmit => "efiling_submit",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ingest_batch" => Some(JobKind::IngestBatch),
            "export" => Some(JobKind::Export),
            "draft" => Some(JobKind::Draft),
            "efiling_submit" => Some(JobKind::EfilingSubmit),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal jobs are never re-claimed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of asynchronous work. Claimed by exactly one worker at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub payload: JsonValue,
    pub status: JobStatus,
    pub priority: i64,
    pub attempts: i64,
    pub max_attempts: i64,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Search parameters as submitted by the serving path. Canonicalized and
/// hashed into a cache fingerprint by the search cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: Option<String>,
    pub sources: Vec<String>,
    pub kinds: Vec<DocumentKind>,
    pub court: Option<String>,
    pub jurisdiction: Option<String>,
    pub docket_number: Option<String>,
    pub filed_after: Option<DateTime<Utc>>,
    pub filed_before: Option<DateTime<Utc>>,
    pub page: u32,
    pub per_page: u32,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            text: None,
            sources: Vec::new(),
            kinds: Vec::new(),
            court: None,
            jurisdiction: None,
            docket_number: None,
            filed_after: None,
            filed_before: None,
            page: 1,
            per_page: 20,
        }
    }
}

impl SearchQuery {
    /// A query with no source filter spans every source.
    pub fn references_source(&self, source_id: &str) -> bool {
        self.sources.is_empty() || self.sources.iter().any(|s| s == source_id)
    }
}

/// A cached result page for one normalized query fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedPage {
    pub fingerprint: String,
    pub query: SearchQuery,
    pub results: JsonValue,
    pub result_count: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub hit_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_round_trip() {
        for kind in DocumentKind::ALL {
            assert_eq!(DocumentKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(DocumentKind::parse("memo"), None);
    }

    #[test]
    fn terminal_job_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn empty_source_filter_references_every_source() {
        let query = SearchQuery::default();
        assert!(query.references_source("courtlistener"));

        let query = SearchQuery {
            sources: vec!["govinfo".to_string()],
            ..SearchQuery::default()
        };
        assert!(query.references_source("govinfo"));
        assert!(!query.references_source("courtlistener"));
    }
}
