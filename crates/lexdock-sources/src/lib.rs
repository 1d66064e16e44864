//! Source registry, fetcher contracts, and HTTP fetch utilities.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lexdock_core::{DocumentDraft, DocumentKind};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info_span;

pub const CRATE_NAME: &str = "lexdock-sources";

/// Advisory rate limit for one source: `max_requests` per `window_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RateLimit {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl RateLimit {
    /// Interval between token refills that spreads the window evenly.
    pub fn refill_every(&self) -> Duration {
        let per_token = self.window_secs.max(1) as f64 / self.max_requests.max(1) as f64;
        Duration::from_secs_f64(per_token)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub base_url: String,
    pub api_version: String,
    pub rate_limit: RateLimit,
    #[serde(default)]
    pub collections: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RegistryFile {
    sources: Vec<SourceConfig>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown source: {0}")]
    UnknownSource(String),
}

/// Static per-source metadata, immutable at runtime. Rate limits are
/// surfaced as shared token buckets for fetchers to honor; the registry
/// itself never throttles anything.
pub struct SourceRegistry {
    sources: Vec<SourceConfig>,
    buckets: Mutex<HashMap<String, Arc<TokenBucket>>>,
}

impl SourceRegistry {
    pub fn new(sources: Vec<SourceConfig>) -> Self {
        Self {
            sources,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let file: RegistryFile = serde_yaml::from_str(yaml).context("parsing source registry yaml")?;
        Ok(Self::new(file.sources))
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn get(&self, name: &str) -> Result<&SourceConfig, RegistryError> {
        self.sources
            .iter()
            .find(|s| s.source_id == name)
            .ok_or_else(|| RegistryError::UnknownSource(name.to_string()))
    }

    pub fn list(&self) -> &[SourceConfig] {
        &self.sources
    }

    pub fn list_enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    /// Shared token bucket sized from the source's configured rate limit.
    pub async fn token_bucket(&self, name: &str) -> Result<Arc<TokenBucket>, RegistryError> {
        let config = self.get(name)?;
        let mut buckets = self.buckets.lock().await;
        Ok(buckets
            .entry(config.source_id.clone())
            .or_insert_with(|| {
                Arc::new(TokenBucket::new(
                    config.rate_limit.max_requests,
                    config.rate_limit.refill_every(),
                ))
            })
            .clone())
    }
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

/// Simple refilling token bucket; `take` waits until a token is available.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            refill_every,
            state: Mutex::new(BucketState {
                tokens: capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// Non-blocking variant; true if a token was consumed.
    pub async fn try_take(&self) -> bool {
        let mut state = self.state.lock().await;
        let elapsed = state.last_refill.elapsed();
        if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
            let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
            state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
            state.last_refill = Instant::now();
        }
        if state.tokens > 0 {
            state.tokens -= 1;
            true
        } else {
            false
        }
    }
}

/// Fetch failures split by retry eligibility: transient failures are worth
/// another attempt, permanent ones are not.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transient fetch failure: {0}")]
    Transient(String),
    #[error("permanent fetch failure: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            FetchError::Transient(err.to_string())
        } else {
            FetchError::Permanent(err.to_string())
        }
    }
}

/// Classify a non-success HTTP status. Server-side trouble and throttling
/// are transient; everything else (auth failures, 404s) is permanent.
pub fn error_for_status(status: StatusCode, url: &str) -> Option<FetchError> {
    if status.is_success() {
        return None;
    }
    let message = format!("http status {} for {url}", status.as_u16());
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Some(FetchError::Transient(message))
    } else {
        Some(FetchError::Permanent(message))
    }
}

/// One page of fetch results with the source-defined resume marker.
#[derive(Debug, Clone)]
pub struct FetchPage {
    pub records: Vec<DocumentDraft>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

impl FetchPage {
    pub fn empty() -> Self {
        Self {
            records: Vec::new(),
            next_cursor: None,
            has_more: false,
        }
    }
}

/// Per-source incremental fetch contract. Implementations own the wire
/// format of their source; the cursor is opaque to everything else.
#[async_trait]
pub trait Fetcher: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch(
        &self,
        collection: &str,
        resume_cursor: Option<&str>,
    ) -> Result<FetchPage, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_retries: usize,
    pub retry_base: Duration,
    pub retry_cap: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_retries: 3,
            retry_base: Duration::from_millis(250),
            retry_cap: Duration::from_secs(5),
        }
    }
}

fn retry_delay(base: Duration, cap: Duration, attempt_index: usize) -> Duration {
    let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(cap)
}

/// Shared HTTP plumbing for fetcher implementations: rate-limit tokens,
/// bounded retries on transient failures, transient/permanent
/// classification.
pub struct HttpClient {
    client: reqwest::Client,
    bucket: Option<Arc<TokenBucket>>,
    max_retries: usize,
    retry_base: Duration,
    retry_cap: Duration,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            bucket: None,
            max_retries: config.max_retries,
            retry_base: config.retry_base,
            retry_cap: config.retry_cap,
        })
    }

    pub fn with_rate_limit(mut self, bucket: Arc<TokenBucket>) -> Self {
        self.bucket = Some(bucket);
        self
    }

    pub async fn get_bytes(&self, source_id: &str, url: &str) -> Result<Vec<u8>, FetchError> {
        let span = info_span!("source_fetch", source_id, url);
        let _guard = span.enter();

        let mut last_error: Option<FetchError> = None;
        for attempt in 0..=self.max_retries {
            if let Some(bucket) = &self.bucket {
                bucket.take().await;
            }

            let error = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    match error_for_status(status, &final_url) {
                        None => {
                            let body = resp.bytes().await.map_err(FetchError::from)?;
                            return Ok(body.to_vec());
                        }
                        Some(error) => error,
                    }
                }
                Err(err) => FetchError::from(err),
            };

            if error.is_transient() && attempt < self.max_retries {
                tokio::time::sleep(retry_delay(self.retry_base, self.retry_cap, attempt)).await;
                last_error = Some(error);
                continue;
            }
            return Err(error);
        }

        Err(last_error.expect("retry loop captures an error before exhausting"))
    }
}

/// Wire envelope of the generic JSON page API: `{records, next_cursor,
/// has_more}` with the record fields the content store persists.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope {
    #[serde(default)]
    pub records: Vec<ApiRecord>,
    #[serde(default)]
    pub next_cursor: Option<String>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiRecord {
    pub external_id: String,
    pub kind: String,
    #[serde(default)]
    pub court: Option<String>,
    #[serde(default)]
    pub jurisdiction: Option<String>,
    #[serde(default)]
    pub docket_number: Option<String>,
    #[serde(default)]
    pub case_name: Option<String>,
    #[serde(default)]
    pub filed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub citations: Vec<JsonValue>,
    #[serde(default)]
    pub parties: Vec<JsonValue>,
    #[serde(default)]
    pub judges: Vec<JsonValue>,
    #[serde(default)]
    pub attorneys: Vec<JsonValue>,
    #[serde(default)]
    pub metadata: Option<JsonValue>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub plain_text: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub page_count: Option<i64>,
    #[serde(default)]
    pub body: Option<String>,
}

impl ApiRecord {
    fn into_draft(self, source_id: &str) -> Result<DocumentDraft, FetchError> {
        let kind = DocumentKind::parse(&self.kind).ok_or_else(|| {
            FetchError::Permanent(format!(
                "unknown document kind {} for {}/{}",
                self.kind, source_id, self.external_id
            ))
        })?;
        let body = self
            .body
            .map(String::into_bytes)
            .or_else(|| self.plain_text.clone().map(String::into_bytes))
            .unwrap_or_default();

        let mut draft = DocumentDraft::new(source_id, self.external_id, kind, body);
        draft.court = self.court;
        draft.jurisdiction = self.jurisdiction;
        draft.docket_number = self.docket_number;
        draft.case_name = self.case_name;
        draft.filed_at = self.filed_at;
        draft.modified_at = self.modified_at;
        draft.citations = self.citations;
        draft.parties = self.parties;
        draft.judges = self.judges;
        draft.attorneys = self.attorneys;
        if let Some(metadata) = self.metadata {
            draft.metadata = metadata;
        }
        draft.summary = self.summary;
        draft.plain_text = self.plain_text;
        draft.source_url = self.source_url;
        draft.page_count = self.page_count;
        Ok(draft)
    }
}

/// Decode one JSON page into fetch records. A payload that does not parse is
/// permanent: retrying the same bytes cannot fix it.
pub fn parse_api_page(source_id: &str, bytes: &[u8]) -> Result<FetchPage, FetchError> {
    let envelope: ApiEnvelope = serde_json::from_slice(bytes)
        .map_err(|err| FetchError::Permanent(format!("malformed page payload: {err}")))?;
    let records = envelope
        .records
        .into_iter()
        .map(|record| record.into_draft(source_id))
        .collect::<Result<Vec<_>, FetchError>>()?;
    Ok(FetchPage {
        records,
        next_cursor: envelope.next_cursor,
        has_more: envelope.has_more,
    })
}

/// Fetcher for sources that speak the generic JSON page API:
/// `GET {base_url}/{collection}?cursor={resume}`.
pub struct ApiFetcher {
    source_id: String,
    base_url: String,
    client: HttpClient,
}

impl ApiFetcher {
    pub fn new(config: &SourceConfig, client: HttpClient) -> Self {
        Self {
            source_id: config.source_id.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    fn page_url(&self, collection: &str, resume_cursor: Option<&str>) -> String {
        match resume_cursor {
            Some(cursor) => format!("{}/{}?cursor={}", self.base_url, collection, cursor),
            None => format!("{}/{}", self.base_url, collection),
        }
    }
}

#[async_trait]
impl Fetcher for ApiFetcher {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(
        &self,
        collection: &str,
        resume_cursor: Option<&str>,
    ) -> Result<FetchPage, FetchError> {
        let url = self.page_url(collection, resume_cursor);
        let bytes = self.client.get_bytes(&self.source_id, &url).await?;
        parse_api_page(&self.source_id, &bytes)
    }
}

/// Canned fetch responses for tests and replayed captures: pages and errors
/// are served in order, and every requested cursor is recorded.
pub struct ScriptedFetcher {
    source_id: String,
    script: Mutex<VecDeque<Result<FetchPage, FetchError>>>,
    requested_cursors: Mutex<Vec<Option<String>>>,
}

impl ScriptedFetcher {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            script: Mutex::new(VecDeque::new()),
            requested_cursors: Mutex::new(Vec::new()),
        }
    }

    pub async fn push_page(&self, page: FetchPage) {
        self.script.lock().await.push_back(Ok(page));
    }

    pub async fn push_error(&self, error: FetchError) {
        self.script.lock().await.push_back(Err(error));
    }

    /// Cursors seen by `fetch`, in call order.
    pub async fn requested_cursors(&self) -> Vec<Option<String>> {
        self.requested_cursors.lock().await.clone()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(
        &self,
        _collection: &str,
        resume_cursor: Option<&str>,
    ) -> Result<FetchPage, FetchError> {
        self.requested_cursors
            .lock()
            .await
            .push(resume_cursor.map(ToString::to_string));
        match self.script.lock().await.pop_front() {
            Some(result) => result,
            None => Ok(FetchPage::empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexdock_core::DocumentKind;

    const REGISTRY_YAML: &str = r#"
sources:
  - source_id: courtlistener
    display_name: CourtListener
    enabled: true
    base_url: https://www.courtlistener.com/api/rest/v4
    api_version: v4
    rate_limit: { max_requests: 60, window_secs: 60 }
    collections: [opinions, dockets, audio]
  - source_id: efiling
    display_name: E-Filing Gateway
    enabled: false
    base_url: https://efile.example.gov
    api_version: "2.1"
    rate_limit: { max_requests: 10, window_secs: 60 }
    collections: [filings]
"#;

    #[test]
    fn registry_parses_and_resolves_sources() {
        let registry = SourceRegistry::from_yaml_str(REGISTRY_YAML).expect("parse");
        assert_eq!(registry.list().len(), 2);
        assert_eq!(registry.list_enabled().count(), 1);

        let source = registry.get("courtlistener").expect("get");
        assert_eq!(source.api_version, "v4");
        assert_eq!(source.rate_limit.max_requests, 60);
        assert_eq!(source.collections, vec!["opinions", "dockets", "audio"]);

        let err = registry.get("pacer").expect_err("unknown");
        assert!(matches!(err, RegistryError::UnknownSource(_)));
    }

    #[tokio::test]
    async fn token_bucket_enforces_configured_capacity() {
        let registry = SourceRegistry::from_yaml_str(REGISTRY_YAML).expect("parse");
        let bucket = registry.token_bucket("efiling").await.expect("bucket");

        for _ in 0..10 {
            assert!(bucket.try_take().await);
        }
        assert!(!bucket.try_take().await);

        // Same source resolves to the same shared bucket.
        let again = registry.token_bucket("efiling").await.expect("bucket");
        assert!(!again.try_take().await);
    }

    #[test]
    fn rate_limit_refill_spreads_the_window() {
        let limit = RateLimit {
            max_requests: 60,
            window_secs: 60,
        };
        assert_eq!(limit.refill_every(), Duration::from_secs(1));
    }

    #[test]
    fn status_classification_splits_transient_and_permanent() {
        assert!(error_for_status(StatusCode::OK, "u").is_none());
        assert!(error_for_status(StatusCode::SERVICE_UNAVAILABLE, "u")
            .expect("err")
            .is_transient());
        assert!(error_for_status(StatusCode::TOO_MANY_REQUESTS, "u")
            .expect("err")
            .is_transient());
        assert!(!error_for_status(StatusCode::NOT_FOUND, "u")
            .expect("err")
            .is_transient());
        assert!(!error_for_status(StatusCode::UNAUTHORIZED, "u")
            .expect("err")
            .is_transient());
    }

    #[test]
    fn retry_delays_grow_and_cap() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_millis(350);
        assert_eq!(retry_delay(base, cap, 0), Duration::from_millis(100));
        assert_eq!(retry_delay(base, cap, 1), Duration::from_millis(200));
        assert_eq!(retry_delay(base, cap, 5), Duration::from_millis(350));
    }

    #[test]
    fn api_pages_decode_into_drafts() {
        let payload = serde_json::json!({
            "records": [{
                "external_id": "op-42",
                "kind": "opinion",
                "court": "ca9",
                "case_name": "Coyote v. Acme Corp.",
                "citations": [{"cite": "574 U.S. 1"}],
                "parties": [{"name": "Coyote", "role": "appellant"}],
                "metadata": {"precedential": true},
                "plain_text": "It is so ordered.",
                "body": "<opinion>It is so ordered.</opinion>"
            }],
            "next_cursor": "page-2",
            "has_more": true
        });
        let page = parse_api_page("courtlistener", payload.to_string().as_bytes()).expect("page");

        assert_eq!(page.records.len(), 1);
        assert_eq!(page.next_cursor.as_deref(), Some("page-2"));
        assert!(page.has_more);

        let draft = &page.records[0];
        assert_eq!(draft.source_id, "courtlistener");
        assert_eq!(draft.external_id, "op-42");
        assert_eq!(draft.kind, DocumentKind::Opinion);
        assert_eq!(draft.body, b"<opinion>It is so ordered.</opinion>");
        assert_eq!(draft.metadata, serde_json::json!({"precedential": true}));
    }

    #[test]
    fn malformed_api_pages_are_permanent_failures() {
        let err = parse_api_page("courtlistener", b"not json").expect_err("malformed");
        assert!(!err.is_transient());

        let unknown_kind = serde_json::json!({
            "records": [{"external_id": "x-1", "kind": "memo"}],
            "has_more": false
        });
        let err = parse_api_page("courtlistener", unknown_kind.to_string().as_bytes())
            .expect_err("unknown kind");
        assert!(!err.is_transient());
    }

    #[test]
    fn api_fetcher_builds_cursor_urls() {
        let registry = SourceRegistry::from_yaml_str(REGISTRY_YAML).expect("parse");
        let config = registry.get("courtlistener").expect("get");
        let fetcher = ApiFetcher::new(
            config,
            HttpClient::new(HttpClientConfig::default()).expect("client"),
        );

        assert_eq!(
            fetcher.page_url("opinions", None),
            "https://www.courtlistener.com/api/rest/v4/opinions"
        );
        assert_eq!(
            fetcher.page_url("opinions", Some("page-2")),
            "https://www.courtlistener.com/api/rest/v4/opinions?cursor=page-2"
        );
    }

    #[tokio::test]
    async fn scripted_fetcher_replays_pages_and_records_cursors() {
        let fetcher = ScriptedFetcher::new("courtlistener");
        fetcher
            .push_page(FetchPage {
                records: vec![DocumentDraft::new(
                    "courtlistener",
                    "op-1",
                    DocumentKind::Opinion,
                    b"body".to_vec(),
                )],
                next_cursor: Some("page-2".to_string()),
                has_more: true,
            })
            .await;
        fetcher.push_error(FetchError::Transient("503".into())).await;

        let page = fetcher.fetch("opinions", None).await.expect("page");
        assert_eq!(page.records.len(), 1);
        assert!(page.has_more);

        let err = fetcher
            .fetch("opinions", Some("page-2"))
            .await
            .expect_err("scripted error");
        assert!(err.is_transient());

        // Script exhausted: an empty terminal page.
        let done = fetcher.fetch("opinions", Some("page-2")).await.expect("page");
        assert!(done.records.is_empty());
        assert!(!done.has_more);

        assert_eq!(
            fetcher.requested_cursors().await,
            vec![None, Some("page-2".to_string()), Some("page-2".to_string())]
        );
    }
}
