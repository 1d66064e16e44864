//! Durable storage for lexdock: content-addressed documents, sync cursors,
//! the priority job queue, and the search-result cache, all on sqlx/SQLite.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lexdock_core::{
    CachedPage, ContentChange, Document, DocumentDraft, DocumentKind, Job, JobKind, JobStatus,
    RunStatus, SearchQuery, SyncCursor,
};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "lexdock-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },
    #[error("concurrent write conflict on {key}")]
    Conflict { key: String },
    #[error("ingestion already running for {source_id}/{collection}")]
    AlreadyRunning {
        source_id: String,
        collection: String,
    },
    #[error("invalid {entity} state for {key}: {detail}")]
    InvalidState {
        entity: &'static str,
        key: String,
        detail: String,
    },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("artifact io: {0}")]
    Io(#[from] std::io::Error),
}

/// Write collisions on the same storage key surface as `Conflict` so callers
/// can retry; everything else stays a database error.
fn write_error(err: sqlx::Error, key: &str) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        let message = db.message();
        if message.contains("locked")
            || message.contains("busy")
            || message.contains("UNIQUE constraint failed")
        {
            return StoreError::Conflict {
                key: key.to_string(),
            };
        }
    }
    StoreError::Database(err)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn to_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn opt_ms(ts: Option<DateTime<Utc>>) -> Option<i64> {
    ts.map(to_ms)
}

fn opt_from_ms(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_ms)
}

/// Open (and create if missing) a WAL-mode database at `path`.
pub async fn connect(path: impl AsRef<Path>) -> anyhow::Result<SqlitePool> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// In-memory database for tests. Capped to one connection so every handle
/// sees the same database.
pub async fn connect_in_memory() -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    let pool = SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(1)
        .connect_with(options)
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            external_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            court TEXT,
            jurisdiction TEXT,
            docket_number TEXT,
            case_name TEXT,
            filed_at INTEGER,
            modified_at INTEGER,
            citations_json TEXT NOT NULL DEFAULT '[]',
            parties_json TEXT NOT NULL DEFAULT '[]',
            judges_json TEXT NOT NULL DEFAULT '[]',
            attorneys_json TEXT NOT NULL DEFAULT '[]',
            metadata_json TEXT NOT NULL DEFAULT '{}',
            summary TEXT,
            plain_text TEXT,
            content_digest TEXT NOT NULL,
            source_url TEXT,
            artifact_path TEXT,
            byte_size INTEGER NOT NULL,
            page_count INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(source_id, external_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_source ON documents(source_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_digest ON documents(content_digest)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_cursors (
            source_id TEXT NOT NULL,
            collection TEXT NOT NULL,
            status TEXT NOT NULL,
            cursor_token TEXT,
            last_success_at INTEGER,
            last_attempt_at INTEGER,
            last_error TEXT,
            records_processed INTEGER NOT NULL DEFAULT 0,
            records_failed INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (source_id, collection)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            payload_json TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 3,
            scheduled_at INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            completed_at INTEGER,
            claimed_by TEXT,
            lease_expires_at INTEGER,
            last_error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(status, scheduled_at)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cache_entries (
            fingerprint TEXT PRIMARY KEY,
            query_json TEXT NOT NULL,
            results_json TEXT NOT NULL,
            result_count INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            hit_count INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_cache_expires ON cache_entries(expires_at)")
        .execute(pool)
        .await?;

    Ok(())
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable body storage addressed by content digest, with atomic temp-file
/// rename. Identical bytes land on the same path; a second write is a no-op.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn relative_path(source_id: &str, content_digest: &str) -> PathBuf {
        let shard = content_digest.get(..2).unwrap_or("00");
        PathBuf::from(source_id)
            .join(shard)
            .join(format!("{content_digest}.bin"))
    }

    pub async fn store_bytes(
        &self,
        source_id: &str,
        content_digest: &str,
        bytes: &[u8],
    ) -> Result<StoredArtifact, StoreError> {
        let relative_path = Self::relative_path(source_id, content_digest);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        if fs::try_exists(&absolute_path).await? {
            return Ok(StoredArtifact {
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_name = format!(".{}.tmp", Uuid::new_v4());
        let temp_path = absolute_path
            .parent()
            .expect("artifact path always has parent")
            .join(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredArtifact {
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredArtifact {
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err.into())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct PutOutcome {
    pub document_id: String,
    pub new_content: bool,
}

/// Content-addressed document persistence. Sole writer of `documents` rows;
/// at most one row per (source, external id) and one stored body per digest.
#[derive(Clone)]
pub struct ContentStore {
    pool: SqlitePool,
    artifacts: ArtifactStore,
    notifier: Option<UnboundedSender<ContentChange>>,
}

impl ContentStore {
    pub fn new(pool: SqlitePool, artifacts: ArtifactStore) -> Self {
        Self {
            pool,
            artifacts,
            notifier: None,
        }
    }

    /// Every `put` that lands new content emits a `ContentChange` on `tx`.
    pub fn with_change_notifier(mut self, tx: UnboundedSender<ContentChange>) -> Self {
        self.notifier = Some(tx);
        self
    }

    fn notify(&self, change: ContentChange) {
        if let Some(tx) = &self.notifier {
            if tx.send(change).is_err() {
                warn!("content change listener dropped, notification lost");
            }
        }
    }

    pub async fn put(&self, draft: DocumentDraft) -> Result<PutOutcome, StoreError> {
        let content_digest = sha256_hex(&draft.body);
        let key = format!("{}/{}", draft.source_id, draft.external_id);
        let now = to_ms(Utc::now());

        let existing =
            sqlx::query("SELECT id, content_digest FROM documents WHERE source_id = ? AND external_id = ?")
                .bind(&draft.source_id)
                .bind(&draft.external_id)
                .fetch_optional(&self.pool)
                .await?;

        if let Some(row) = existing {
            let id: String = row.try_get("id")?;
            let stored_digest: String = row.try_get("content_digest")?;

            if stored_digest == content_digest {
                sqlx::query("UPDATE documents SET modified_at = ?, updated_at = ? WHERE id = ?")
                    .bind(opt_ms(draft.modified_at))
                    .bind(now)
                    .bind(&id)
                    .execute(&self.pool)
                    .await
                    .map_err(|err| write_error(err, &key))?;
                return Ok(PutOutcome {
                    document_id: id,
                    new_content: false,
                });
            }

            let artifact = self
                .artifacts
                .store_bytes(&draft.source_id, &content_digest, &draft.body)
                .await?;
            sqlx::query(
                r#"
                UPDATE documents SET
                    kind = ?, court = ?, jurisdiction = ?, docket_number = ?, case_name = ?,
                    filed_at = ?, modified_at = ?,
                    citations_json = ?, parties_json = ?, judges_json = ?, attorneys_json = ?,
                    metadata_json = ?, summary = ?, plain_text = ?,
                    content_digest = ?, source_url = ?, artifact_path = ?,
                    byte_size = ?, page_count = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(draft.kind.as_str())
            .bind(&draft.court)
            .bind(&draft.jurisdiction)
            .bind(&draft.docket_number)
            .bind(&draft.case_name)
            .bind(opt_ms(draft.filed_at))
            .bind(opt_ms(draft.modified_at))
            .bind(serde_json::to_string(&draft.citations)?)
            .bind(serde_json::to_string(&draft.parties)?)
            .bind(serde_json::to_string(&draft.judges)?)
            .bind(serde_json::to_string(&draft.attorneys)?)
            .bind(serde_json::to_string(&draft.metadata)?)
            .bind(&draft.summary)
            .bind(&draft.plain_text)
            .bind(&content_digest)
            .bind(&draft.source_url)
            .bind(artifact.relative_path.display().to_string())
            .bind(draft.body.len() as i64)
            .bind(draft.page_count)
            .bind(now)
            .bind(&id)
            .execute(&self.pool)
            .await
            .map_err(|err| write_error(err, &key))?;

            self.notify(ContentChange {
                document_id: id.clone(),
                source_id: draft.source_id,
                external_id: draft.external_id,
                content_digest,
            });
            return Ok(PutOutcome {
                document_id: id,
                new_content: true,
            });
        }

        let id = Uuid::new_v4().to_string();
        let artifact = self
            .artifacts
            .store_bytes(&draft.source_id, &content_digest, &draft.body)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO documents (
                id, source_id, external_id, kind, court, jurisdiction, docket_number,
                case_name, filed_at, modified_at,
                citations_json, parties_json, judges_json, attorneys_json, metadata_json,
                summary, plain_text, content_digest, source_url, artifact_path,
                byte_size, page_count, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&draft.source_id)
        .bind(&draft.external_id)
        .bind(draft.kind.as_str())
        .bind(&draft.court)
        .bind(&draft.jurisdiction)
        .bind(&draft.docket_number)
        .bind(&draft.case_name)
        .bind(opt_ms(draft.filed_at))
        .bind(opt_ms(draft.modified_at))
        .bind(serde_json::to_string(&draft.citations)?)
        .bind(serde_json::to_string(&draft.parties)?)
        .bind(serde_json::to_string(&draft.judges)?)
        .bind(serde_json::to_string(&draft.attorneys)?)
        .bind(serde_json::to_string(&draft.metadata)?)
        .bind(&draft.summary)
        .bind(&draft.plain_text)
        .bind(&content_digest)
        .bind(&draft.source_url)
        .bind(artifact.relative_path.display().to_string())
        .bind(draft.body.len() as i64)
        .bind(draft.page_count)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|err| write_error(err, &key))?;

        self.notify(ContentChange {
            document_id: id.clone(),
            source_id: draft.source_id,
            external_id: draft.external_id,
            content_digest,
        });
        Ok(PutOutcome {
            document_id: id,
            new_content: true,
        })
    }

    pub async fn get(&self, document_id: &str) -> Result<Document, StoreError> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => row_to_document(&row),
            None => Err(StoreError::NotFound {
                entity: "document",
                key: document_id.to_string(),
            }),
        }
    }

    pub async fn find_by_source_external(
        &self,
        source_id: &str,
        external_id: &str,
    ) -> Result<Document, StoreError> {
        let row = sqlx::query("SELECT * FROM documents WHERE source_id = ? AND external_id = ?")
            .bind(source_id)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => row_to_document(&row),
            None => Err(StoreError::NotFound {
                entity: "document",
                key: format!("{source_id}/{external_id}"),
            }),
        }
    }
}

fn row_to_document(row: &SqliteRow) -> Result<Document, StoreError> {
    let id: String = row.try_get("id")?;
    let kind_raw: String = row.try_get("kind")?;
    let kind = DocumentKind::parse(&kind_raw).ok_or_else(|| StoreError::InvalidState {
        entity: "document",
        key: id.clone(),
        detail: format!("unknown kind {kind_raw}"),
    })?;

    let citations_json: String = row.try_get("citations_json")?;
    let parties_json: String = row.try_get("parties_json")?;
    let judges_json: String = row.try_get("judges_json")?;
    let attorneys_json: String = row.try_get("attorneys_json")?;
    let metadata_json: String = row.try_get("metadata_json")?;

    Ok(Document {
        id,
        source_id: row.try_get("source_id")?,
        external_id: row.try_get("external_id")?,
        kind,
        court: row.try_get("court")?,
        jurisdiction: row.try_get("jurisdiction")?,
        docket_number: row.try_get("docket_number")?,
        case_name: row.try_get("case_name")?,
        filed_at: opt_from_ms(row.try_get("filed_at")?),
        modified_at: opt_from_ms(row.try_get("modified_at")?),
        citations: serde_json::from_str(&citations_json)?,
        parties: serde_json::from_str(&parties_json)?,
        judges: serde_json::from_str(&judges_json)?,
        attorneys: serde_json::from_str(&attorneys_json)?,
        metadata: serde_json::from_str(&metadata_json)?,
        summary: row.try_get("summary")?,
        plain_text: row.try_get("plain_text")?,
        content_digest: row.try_get("content_digest")?,
        source_url: row.try_get("source_url")?,
        artifact_path: row.try_get("artifact_path")?,
        byte_size: row.try_get("byte_size")?,
        page_count: row.try_get("page_count")?,
        created_at: from_ms(row.try_get("created_at")?),
        updated_at: from_ms(row.try_get("updated_at")?),
    })
}

/// Per-(source, collection) incremental sync state. The `running` guard is a
/// single conditional upsert, so duplicate concurrent runs lose at the
/// storage layer rather than in process memory.
#[derive(Clone)]
pub struct CursorTracker {
    pool: SqlitePool,
}

impl CursorTracker {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Transition to `running` and return the resume token from the last
    /// successful run (`None` means full resync).
    pub async fn begin_run(
        &self,
        source_id: &str,
        collection: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO sync_cursors (
                source_id, collection, status, cursor_token, last_attempt_at,
                records_processed, records_failed
            ) VALUES (?, ?, 'running', NULL, ?, 0, 0)
            ON CONFLICT(source_id, collection) DO UPDATE SET
                status = 'running',
                last_attempt_at = excluded.last_attempt_at
              WHERE sync_cursors.status != 'running'
            RETURNING cursor_token
            "#,
        )
        .bind(source_id)
        .bind(collection)
        .bind(to_ms(now))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.try_get("cursor_token")?),
            None => Err(StoreError::AlreadyRunning {
                source_id: source_id.to_string(),
                collection: collection.to_string(),
            }),
        }
    }

    pub async fn complete_run(
        &self,
        source_id: &str,
        collection: &str,
        new_cursor: Option<&str>,
        processed: i64,
        failed: i64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_cursors SET
                status = 'success', cursor_token = ?, last_success_at = ?, last_error = NULL,
                records_processed = ?, records_failed = ?
            WHERE source_id = ? AND collection = ? AND status = 'running'
            "#,
        )
        .bind(new_cursor)
        .bind(to_ms(now))
        .bind(processed)
        .bind(failed)
        .bind(source_id)
        .bind(collection)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::InvalidState {
                entity: "sync_cursor",
                key: format!("{source_id}/{collection}"),
                detail: "complete_run outside an active run".to_string(),
            });
        }
        Ok(())
    }

    /// The resume token is left untouched so the next run retries from the
    /// last known-good point, not from the failed attempt.
    pub async fn fail_run(
        &self,
        source_id: &str,
        collection: &str,
        error: &str,
        processed: i64,
        failed: i64,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_cursors SET
                status = 'error', last_error = ?, records_processed = ?, records_failed = ?
            WHERE source_id = ? AND collection = ? AND status = 'running'
            "#,
        )
        .bind(error)
        .bind(processed)
        .bind(failed)
        .bind(source_id)
        .bind(collection)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::InvalidState {
                entity: "sync_cursor",
                key: format!("{source_id}/{collection}"),
                detail: "fail_run outside an active run".to_string(),
            });
        }
        Ok(())
    }

    pub async fn resume_point(
        &self,
        source_id: &str,
        collection: &str,
    ) -> Result<Option<String>, StoreError> {
        let token: Option<Option<String>> = sqlx::query_scalar(
            "SELECT cursor_token FROM sync_cursors WHERE source_id = ? AND collection = ?",
        )
        .bind(source_id)
        .bind(collection)
        .fetch_optional(&self.pool)
        .await?;
        Ok(token.flatten())
    }

    pub async fn status(
        &self,
        source_id: &str,
        collection: &str,
    ) -> Result<Option<SyncCursor>, StoreError> {
        let row = sqlx::query("SELECT * FROM sync_cursors WHERE source_id = ? AND collection = ?")
            .bind(source_id)
            .bind(collection)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| row_to_cursor(&row)).transpose()
    }

    /// Dashboard read: every tracked (source, collection).
    pub async fn list(&self) -> Result<Vec<SyncCursor>, StoreError> {
        let rows = sqlx::query("SELECT * FROM sync_cursors ORDER BY source_id, collection")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_cursor).collect()
    }
}

fn row_to_cursor(row: &SqliteRow) -> Result<SyncCursor, StoreError> {
    let source_id: String = row.try_get("source_id")?;
    let collection: String = row.try_get("collection")?;
    let status_raw: String = row.try_get("status")?;
    let status = RunStatus::parse(&status_raw).ok_or_else(|| StoreError::InvalidState {
        entity: "sync_cursor",
        key: format!("{source_id}/{collection}"),
        detail: format!("unknown status {status_raw}"),
    })?;

    Ok(SyncCursor {
        source_id,
        collection,
        status,
        cursor_token: row.try_get("cursor_token")?,
        last_success_at: opt_from_ms(row.try_get("last_success_at")?),
        last_attempt_at: opt_from_ms(row.try_get("last_attempt_at")?),
        last_error: row.try_get("last_error")?,
        records_processed: row.try_get("records_processed")?,
        records_failed: row.try_get("records_failed")?,
    })
}

/// Exponential retry delay, capped. Base and cap are deployment knobs, not
/// constants.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(15 * 60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnqueueOptions {
    pub priority: i64,
    pub max_attempts: i64,
    pub run_at: Option<DateTime<Utc>>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            max_attempts: 3,
            run_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { next_attempt_at: DateTime<Utc> },
    Exhausted,
}

/// Durable priority queue with claim-based mutual exclusion. A claim is a
/// lease: a worker that dies keeps the job `running` only until the lease
/// expires, after which another worker may reclaim it without an attempt
/// increment.
#[derive(Clone)]
pub struct JobQueue {
    pool: SqlitePool,
    backoff: BackoffPolicy,
    lease: Duration,
}

impl JobQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            backoff: BackoffPolicy::default(),
            lease: Duration::from_secs(300),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub async fn enqueue(
        &self,
        kind: JobKind,
        payload: &JsonValue,
        options: EnqueueOptions,
        now: DateTime<Utc>,
    ) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        let scheduled_at = options.run_at.unwrap_or(now);
        sqlx::query(
            r#"
            INSERT INTO jobs (id, kind, payload_json, status, priority, attempts, max_attempts,
                              scheduled_at, created_at)
            VALUES (?, ?, ?, 'pending', ?, 0, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(kind.as_str())
        .bind(serde_json::to_string(payload)?)
        .bind(options.priority)
        .bind(options.max_attempts.max(1))
        .bind(to_ms(scheduled_at))
        .bind(to_ms(now))
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Claim the highest-priority due job (FIFO within a priority band), or a
    /// running job whose lease expired. Single atomic update; no two
    /// claimants can receive the same job.
    pub async fn claim(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let lease_expires = now
            + chrono::Duration::milliseconds(self.lease.as_millis().min(i64::MAX as u128) as i64);
        let row = sqlx::query(
            r#"
            UPDATE jobs SET status = 'running', claimed_by = ?, started_at = ?, lease_expires_at = ?
            WHERE id = (
                SELECT id FROM jobs
                 WHERE (status = 'pending' AND scheduled_at <= ?)
                    OR (status = 'running' AND lease_expires_at IS NOT NULL AND lease_expires_at <= ?)
                 ORDER BY priority DESC, created_at ASC, rowid ASC
                 LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(to_ms(now))
        .bind(to_ms(lease_expires))
        .bind(to_ms(now))
        .bind(to_ms(now))
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| row_to_job(&row)).transpose()
    }

    pub async fn complete(&self, job_id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'completed', completed_at = ?, lease_expires_at = NULL
             WHERE id = ? AND status = 'running'",
        )
        .bind(to_ms(now))
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::InvalidState {
                entity: "job",
                key: job_id.to_string(),
                detail: "complete on a job that is not running".to_string(),
            });
        }
        Ok(())
    }

    /// Record a task failure. Below `max_attempts` the job is re-queued with
    /// an exponential backoff delay; at the limit it goes terminal `failed`
    /// with the message preserved for the originator.
    pub async fn fail(
        &self,
        job_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, StoreError> {
        let row = sqlx::query(
            "SELECT attempts, max_attempts FROM jobs WHERE id = ? AND status = 'running'",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Err(StoreError::InvalidState {
                entity: "job",
                key: job_id.to_string(),
                detail: "fail on a job that is not running".to_string(),
            });
        };
        let attempts: i64 = row.try_get("attempts")?;
        let max_attempts: i64 = row.try_get("max_attempts")?;
        let next_attempts = attempts + 1;

        if next_attempts < max_attempts {
            let delay = self
                .backoff
                .delay_for_attempt(attempts.clamp(0, 31) as u32);
            let next_attempt_at =
                now + chrono::Duration::milliseconds(delay.as_millis().min(i64::MAX as u128) as i64);
            sqlx::query(
                r#"
                UPDATE jobs SET status = 'pending', attempts = ?, scheduled_at = ?, last_error = ?,
                                claimed_by = NULL, started_at = NULL, lease_expires_at = NULL
                WHERE id = ?
                "#,
            )
            .bind(next_attempts)
            .bind(to_ms(next_attempt_at))
            .bind(error)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
            Ok(FailOutcome::Retrying { next_attempt_at })
        } else {
            sqlx::query(
                "UPDATE jobs SET status = 'failed', attempts = ?, completed_at = ?, last_error = ?,
                                 lease_expires_at = NULL
                 WHERE id = ?",
            )
            .bind(next_attempts)
            .bind(to_ms(now))
            .bind(error)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
            Ok(FailOutcome::Exhausted)
        }
    }

    /// Terminal failure regardless of remaining attempts, for errors that
    /// retrying cannot fix.
    pub async fn fail_permanently(
        &self,
        job_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'failed', attempts = attempts + 1, completed_at = ?,
                             last_error = ?, lease_expires_at = NULL
             WHERE id = ? AND status = 'running'",
        )
        .bind(to_ms(now))
        .bind(error)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::InvalidState {
                entity: "job",
                key: job_id.to_string(),
                detail: "fail on a job that is not running".to_string(),
            });
        }
        Ok(())
    }

    pub async fn cancel(&self, job_id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'cancelled', completed_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(to_ms(now))
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            let status: Option<String> = sqlx::query_scalar("SELECT status FROM jobs WHERE id = ?")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;
            return match status {
                None => Err(StoreError::NotFound {
                    entity: "job",
                    key: job_id.to_string(),
                }),
                Some(status) => Err(StoreError::InvalidState {
                    entity: "job",
                    key: job_id.to_string(),
                    detail: format!("cancel while {status}"),
                }),
            };
        }
        Ok(())
    }

    pub async fn get(&self, job_id: &str) -> Result<Job, StoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => row_to_job(&row),
            None => Err(StoreError::NotFound {
                entity: "job",
                key: job_id.to_string(),
            }),
        }
    }

    /// True if a pending or running job already carries this kind + payload.
    /// Used by the scheduler to avoid piling up duplicate sync jobs.
    pub async fn has_active(
        &self,
        kind: JobKind,
        payload: &JsonValue,
    ) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs
              WHERE kind = ? AND payload_json = ? AND status IN ('pending', 'running')",
        )
        .bind(kind.as_str())
        .bind(serde_json::to_string(payload)?)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    pub async fn counts_by_status(&self) -> Result<Vec<(JobStatus, i64)>, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status ORDER BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let status_raw: String = row.try_get("status")?;
            if let Some(status) = JobStatus::parse(&status_raw) {
                out.push((status, row.try_get("n")?));
            }
        }
        Ok(out)
    }
}

fn row_to_job(row: &SqliteRow) -> Result<Job, StoreError> {
    let id: String = row.try_get("id")?;
    let kind_raw: String = row.try_get("kind")?;
    let kind = JobKind::parse(&kind_raw).ok_or_else(|| StoreError::InvalidState {
        entity: "job",
        key: id.clone(),
        detail: format!("unknown kind {kind_raw}"),
    })?;
    let status_raw: String = row.try_get("status")?;
    let status = JobStatus::parse(&status_raw).ok_or_else(|| StoreError::InvalidState {
        entity: "job",
        key: id.clone(),
        detail: format!("unknown status {status_raw}"),
    })?;
    let payload_json: String = row.try_get("payload_json")?;

    Ok(Job {
        id,
        kind,
        payload: serde_json::from_str(&payload_json)?,
        status,
        priority: row.try_get("priority")?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        scheduled_at: from_ms(row.try_get("scheduled_at")?),
        created_at: from_ms(row.try_get("created_at")?),
        started_at: opt_from_ms(row.try_get("started_at")?),
        completed_at: opt_from_ms(row.try_get("completed_at")?),
        claimed_by: row.try_get("claimed_by")?,
        lease_expires_at: opt_from_ms(row.try_get("lease_expires_at")?),
        last_error: row.try_get("last_error")?,
    })
}

fn normalize_text(value: &str) -> String {
    value
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn canonical_query(query: &SearchQuery) -> BTreeMap<&'static str, JsonValue> {
    let mut canonical = BTreeMap::new();

    if let Some(text) = &query.text {
        let text = normalize_text(text);
        if !text.is_empty() {
            canonical.insert("text", JsonValue::from(text));
        }
    }

    let mut sources: Vec<String> = query
        .sources
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    sources.sort();
    sources.dedup();
    if !sources.is_empty() {
        canonical.insert("sources", JsonValue::from(sources));
    }

    let mut kinds: Vec<&'static str> = query.kinds.iter().map(|k| k.as_str()).collect();
    kinds.sort_unstable();
    kinds.dedup();
    if !kinds.is_empty() {
        canonical.insert("kinds", JsonValue::from(kinds));
    }

    for (key, value) in [
        ("court", &query.court),
        ("jurisdiction", &query.jurisdiction),
        ("docket_number", &query.docket_number),
    ] {
        if let Some(value) = value {
            let value = normalize_text(value);
            if !value.is_empty() {
                canonical.insert(key, JsonValue::from(value));
            }
        }
    }

    if let Some(after) = query.filed_after {
        canonical.insert("filed_after", JsonValue::from(to_ms(after)));
    }
    if let Some(before) = query.filed_before {
        canonical.insert("filed_before", JsonValue::from(to_ms(before)));
    }

    canonical.insert("page", JsonValue::from(query.page.max(1)));
    canonical.insert("per_page", JsonValue::from(query.per_page.clamp(1, 100)));
    canonical
}

/// Stable fingerprint over the canonicalized query: sorted keys, sorted and
/// deduplicated list filters, normalized text, absent fields omitted.
pub fn query_fingerprint(query: &SearchQuery) -> String {
    let canonical = canonical_query(query);
    let encoded = serde_json::to_string(&canonical).expect("canonical query serializes to json");
    sha256_hex(encoded.as_bytes())
}

/// Time-bounded search-result cache keyed by query fingerprint. Entries past
/// their expiry are logically absent; eviction happens lazily on lookup and
/// in bulk via `sweep`.
#[derive(Clone)]
pub struct SearchCache {
    pool: SqlitePool,
}

impl SearchCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn lookup(
        &self,
        query: &SearchQuery,
        now: DateTime<Utc>,
    ) -> Result<Option<CachedPage>, StoreError> {
        let fingerprint = query_fingerprint(query);
        let row = sqlx::query("SELECT * FROM cache_entries WHERE fingerprint = ?")
            .bind(&fingerprint)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let expires_at: i64 = row.try_get("expires_at")?;
        if expires_at <= to_ms(now) {
            sqlx::query("DELETE FROM cache_entries WHERE fingerprint = ?")
                .bind(&fingerprint)
                .execute(&self.pool)
                .await?;
            return Ok(None);
        }
        Ok(Some(row_to_page(&row)?))
    }

    pub async fn store(
        &self,
        query: &SearchQuery,
        results: &JsonValue,
        result_count: i64,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<String, StoreError> {
        let fingerprint = query_fingerprint(query);
        let expires_at =
            now + chrono::Duration::milliseconds(ttl.as_millis().min(i64::MAX as u128) as i64);
        sqlx::query(
            r#"
            INSERT INTO cache_entries (fingerprint, query_json, results_json, result_count,
                                       created_at, expires_at, hit_count)
            VALUES (?, ?, ?, ?, ?, ?, 1)
            ON CONFLICT(fingerprint) DO UPDATE SET
                query_json = excluded.query_json,
                results_json = excluded.results_json,
                result_count = excluded.result_count,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at,
                hit_count = 1
            "#,
        )
        .bind(&fingerprint)
        .bind(serde_json::to_string(query)?)
        .bind(serde_json::to_string(results)?)
        .bind(result_count)
        .bind(to_ms(now))
        .bind(to_ms(expires_at))
        .execute(&self.pool)
        .await?;
        Ok(fingerprint)
    }

    /// Observability only; does not touch expiry. A missing entry (already
    /// evicted) is not an error.
    pub async fn record_hit(&self, fingerprint: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE cache_entries SET hit_count = hit_count + 1 WHERE fingerprint = ?")
            .bind(fingerprint)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Coarse invalidation on content change: removes every entry whose query
    /// names the source, including queries with no source filter at all.
    pub async fn invalidate_by_source(&self, source_id: &str) -> Result<usize, StoreError> {
        let rows = sqlx::query("SELECT fingerprint, query_json FROM cache_entries")
            .fetch_all(&self.pool)
            .await?;

        let mut removed = 0usize;
        for row in rows {
            let fingerprint: String = row.try_get("fingerprint")?;
            let query_json: String = row.try_get("query_json")?;
            let references = match serde_json::from_str::<SearchQuery>(&query_json) {
                Ok(query) => query.references_source(source_id),
                // An undecodable entry cannot be proven unaffected; drop it.
                Err(_) => true,
            };
            if references {
                sqlx::query("DELETE FROM cache_entries WHERE fingerprint = ?")
                    .bind(&fingerprint)
                    .execute(&self.pool)
                    .await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= ?")
            .bind(to_ms(now))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }
}

fn row_to_page(row: &SqliteRow) -> Result<CachedPage, StoreError> {
    let query_json: String = row.try_get("query_json")?;
    let results_json: String = row.try_get("results_json")?;
    Ok(CachedPage {
        fingerprint: row.try_get("fingerprint")?,
        query: serde_json::from_str(&query_json)?,
        results: serde_json::from_str(&results_json)?,
        result_count: row.try_get("result_count")?,
        created_at: from_ms(row.try_get("created_at")?),
        expires_at: from_ms(row.try_get("expires_at")?),
        hit_count: row.try_get("hit_count")?,
    })
}
