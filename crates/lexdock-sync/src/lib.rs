//! Ingestion engine, job worker, and sync scheduling for lexdock.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lexdock_core::{ContentChange, Job, JobKind, RunStatus};
use lexdock_sources::{FetchError, Fetcher, SourceRegistry};
use lexdock_store::{
    ArtifactStore, BackoffPolicy, ContentStore, CursorTracker, EnqueueOptions, JobQueue,
    SearchCache, StoreError,
};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "lexdock-sync";

/// Environment-derived runtime configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_path: PathBuf,
    pub artifacts_dir: PathBuf,
    pub sources_file: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron_morning: String,
    pub sync_cron_evening: String,
    pub sweep_cron: String,
    pub sync_min_interval_secs: u64,
    pub worker_poll_secs: u64,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub retry_base_secs: u64,
    pub retry_max_secs: u64,
    pub visibility_timeout_secs: u64,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_path: PathBuf::from(env_or("LEXDOCK_DB", "./lexdock.db")),
            artifacts_dir: PathBuf::from(env_or("LEXDOCK_ARTIFACTS_DIR", "./artifacts")),
            sources_file: PathBuf::from(env_or("LEXDOCK_SOURCES", "./sources.yaml")),
            scheduler_enabled: std::env::var("LEXDOCK_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron_morning: env_or("LEXDOCK_SYNC_CRON_1", "0 0 6 * * *"),
            sync_cron_evening: env_or("LEXDOCK_SYNC_CRON_2", "0 0 18 * * *"),
            sweep_cron: env_or("LEXDOCK_SWEEP_CRON", "0 */10 * * * *"),
            sync_min_interval_secs: env_u64("LEXDOCK_SYNC_MIN_INTERVAL_SECS", 4 * 60 * 60),
            worker_poll_secs: env_u64("LEXDOCK_WORKER_POLL_SECS", 5),
            user_agent: env_or("LEXDOCK_USER_AGENT", "lexdock-bot/0.1"),
            http_timeout_secs: env_u64("LEXDOCK_HTTP_TIMEOUT_SECS", 20),
            retry_base_secs: env_u64("LEXDOCK_RETRY_BASE_SECS", 30),
            retry_max_secs: env_u64("LEXDOCK_RETRY_MAX_SECS", 15 * 60),
            visibility_timeout_secs: env_u64("LEXDOCK_VISIBILITY_TIMEOUT_SECS", 300),
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_secs(self.retry_base_secs),
            max_delay: Duration::from_secs(self.retry_max_secs),
        }
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }
}

/// Payload of an `ingest_batch` job: one (source, collection) to sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestBatchPayload {
    pub source_id: String,
    pub collection: String,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("no fetcher registered for source {0}")]
    NoFetcher(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IngestError {
    /// Transient fetch trouble, write conflicts, and a run already in flight
    /// all resolve themselves with time; everything else does not.
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::NoFetcher(_) => false,
            IngestError::Fetch(err) => err.is_transient(),
            IngestError::Store(StoreError::Conflict { .. }) => true,
            IngestError::Store(StoreError::AlreadyRunning { .. }) => true,
            IngestError::Store(_) => false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub processed: i64,
    pub failed: i64,
    pub stored_new: i64,
    pub deduplicated: i64,
    pub pages: u32,
    pub final_cursor: Option<String>,
}

/// Runs incremental syncs: resumes from the tracked cursor, streams fetch
/// pages into the content store, and advances the cursor only when the whole
/// run succeeds. Content-change notifications from the store drive coarse
/// cache invalidation after each run.
pub struct IngestEngine {
    content: ContentStore,
    cursors: CursorTracker,
    cache: SearchCache,
    fetchers: HashMap<String, Arc<dyn Fetcher>>,
    changes: Mutex<UnboundedReceiver<ContentChange>>,
}

impl IngestEngine {
    pub fn new(pool: SqlitePool, artifacts: ArtifactStore) -> Self {
        let (tx, rx) = unbounded_channel();
        Self {
            content: ContentStore::new(pool.clone(), artifacts).with_change_notifier(tx),
            cursors: CursorTracker::new(pool.clone()),
            cache: SearchCache::new(pool),
            fetchers: HashMap::new(),
            changes: Mutex::new(rx),
        }
    }

    pub fn register_fetcher(&mut self, fetcher: Arc<dyn Fetcher>) {
        self.fetchers
            .insert(fetcher.source_id().to_string(), fetcher);
    }

    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    pub fn cursors(&self) -> &CursorTracker {
        &self.cursors
    }

    pub fn cache(&self) -> &SearchCache {
        &self.cache
    }

    pub async fn sync_collection(
        &self,
        source_id: &str,
        collection: &str,
    ) -> Result<IngestOutcome, IngestError> {
        let fetcher = self
            .fetchers
            .get(source_id)
            .cloned()
            .ok_or_else(|| IngestError::NoFetcher(source_id.to_string()))?;

        let resume = self
            .cursors
            .begin_run(source_id, collection, Utc::now())
            .await?;
        debug!(source_id, collection, resume = resume.as_deref(), "ingest run started");

        let mut cursor = resume;
        let mut processed = 0i64;
        let mut failed = 0i64;
        let mut stored_new = 0i64;
        let mut deduplicated = 0i64;
        let mut pages = 0u32;

        loop {
            let page = match fetcher.fetch(collection, cursor.as_deref()).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(source_id, collection, error = %err, "fetch failed, aborting run");
                    if let Err(store_err) = self
                        .cursors
                        .fail_run(source_id, collection, &err.to_string(), processed, failed)
                        .await
                    {
                        warn!(source_id, collection, error = %store_err, "recording run failure failed");
                    }
                    return Err(err.into());
                }
            };

            pages += 1;
            for draft in page.records {
                let external_id = draft.external_id.clone();
                processed += 1;
                match self.content.put(draft).await {
                    Ok(outcome) if outcome.new_content => stored_new += 1,
                    Ok(_) => deduplicated += 1,
                    Err(err) => {
                        failed += 1;
                        warn!(source_id, collection, %external_id, error = %err, "storing record failed");
                    }
                }
            }

            if let Some(next) = page.next_cursor {
                cursor = Some(next);
            }
            if !page.has_more {
                break;
            }
        }

        self.cursors
            .complete_run(source_id, collection, cursor.as_deref(), processed, failed, Utc::now())
            .await?;
        self.invalidate_changed_sources().await;
        info!(
            source_id,
            collection, processed, stored_new, deduplicated, pages, "ingest run complete"
        );

        Ok(IngestOutcome {
            processed,
            failed,
            stored_new,
            deduplicated,
            pages,
            final_cursor: cursor,
        })
    }

    /// Drain content-change notifications and coarsely invalidate cached
    /// searches for every affected source. Best-effort: a failed
    /// invalidation is logged, never fatal to ingestion.
    async fn invalidate_changed_sources(&self) {
        let mut affected = BTreeSet::new();
        {
            let mut changes = self.changes.lock().await;
            while let Ok(change) = changes.try_recv() {
                affected.insert(change.source_id);
            }
        }
        for source_id in affected {
            match self.cache.invalidate_by_source(&source_id).await {
                Ok(removed) if removed > 0 => {
                    debug!(%source_id, removed, "invalidated cached searches");
                }
                Ok(_) => {}
                Err(err) => warn!(%source_id, error = %err, "cache invalidation failed"),
            }
        }
    }
}

/// Handler failures, split by retry eligibility like fetch errors.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

/// Contract for the out-of-scope collaborators behind `export`, `draft`, and
/// `efiling_submit` jobs. They receive the claimed job with its opaque
/// payload and report transient-vs-permanent failure.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, job: &Job) -> Result<(), HandlerError>;
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Handler(#[from] HandlerError),
    #[error("malformed {kind} payload: {source}")]
    Payload {
        kind: JobKind,
        #[source]
        source: serde_json::Error,
    },
    #[error("no handler registered for {0} jobs")]
    NoHandler(JobKind),
}

impl WorkerError {
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Ingest(err) => err.is_retryable(),
            WorkerError::Handler(err) => err.is_transient(),
            WorkerError::Payload { .. } | WorkerError::NoHandler(_) => false,
        }
    }
}

/// Claims jobs and dispatches them: `ingest_batch` runs the engine, other
/// kinds go to their registered handler. Retryable failures re-queue with
/// backoff; permanent ones go terminal immediately.
pub struct JobWorker {
    worker_id: String,
    queue: JobQueue,
    engine: Arc<IngestEngine>,
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl JobWorker {
    pub fn new(worker_id: impl Into<String>, queue: JobQueue, engine: Arc<IngestEngine>) -> Self {
        Self {
            worker_id: worker_id.into(),
            queue,
            engine,
            handlers: HashMap::new(),
        }
    }

    pub fn register_handler(&mut self, kind: JobKind, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(kind, handler);
    }

    /// Claim and process at most one job. `Ok(None)` means no work was due.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<Option<String>, StoreError> {
        let Some(job) = self.queue.claim(&self.worker_id, now).await? else {
            return Ok(None);
        };
        info!(job_id = %job.id, kind = %job.kind, attempts = job.attempts, "claimed job");

        match self.execute(&job).await {
            Ok(()) => {
                self.queue.complete(&job.id, Utc::now()).await?;
                info!(job_id = %job.id, "job completed");
            }
            Err(err) if err.is_retryable() => {
                let outcome = self.queue.fail(&job.id, &err.to_string(), Utc::now()).await?;
                warn!(job_id = %job.id, error = %err, ?outcome, "job failed");
            }
            Err(err) => {
                self.queue
                    .fail_permanently(&job.id, &err.to_string(), Utc::now())
                    .await?;
                warn!(job_id = %job.id, error = %err, "job failed permanently");
            }
        }
        Ok(Some(job.id))
    }

    async fn execute(&self, job: &Job) -> Result<(), WorkerError> {
        match job.kind {
            JobKind::IngestBatch => {
                let payload: IngestBatchPayload = serde_json::from_value(job.payload.clone())
                    .map_err(|source| WorkerError::Payload {
                        kind: job.kind,
                        source,
                    })?;
                self.engine
                    .sync_collection(&payload.source_id, &payload.collection)
                    .await?;
                Ok(())
            }
            kind => match self.handlers.get(&kind) {
                Some(handler) => Ok(handler.execute(job).await?),
                None => Err(WorkerError::NoHandler(kind)),
            },
        }
    }

    /// Process until no job is claimable right now. Used by tests and the
    /// one-shot CLI path; re-queued jobs waiting out a backoff are left be.
    pub async fn drain(&self) -> Result<usize, StoreError> {
        let mut handled = 0usize;
        while self.poll_once(Utc::now()).await?.is_some() {
            handled += 1;
        }
        Ok(handled)
    }

    /// Long-lived polling loop. Claim failures are logged and retried after
    /// the poll interval rather than killing the worker.
    pub async fn run(&self, poll_interval: Duration) {
        loop {
            match self.poll_once(Utc::now()).await {
                Ok(Some(_)) => {}
                Ok(None) => tokio::time::sleep(poll_interval).await,
                Err(err) => {
                    warn!(error = %err, "worker poll failed");
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
    }
}

/// Enqueue one `ingest_batch` job per enabled (source, collection) that is
/// due: not currently running, no active job for the same payload, and no
/// success within `min_interval`.
pub async fn enqueue_due_syncs(
    queue: &JobQueue,
    cursors: &CursorTracker,
    registry: &SourceRegistry,
    min_interval: Duration,
    now: DateTime<Utc>,
) -> anyhow::Result<usize> {
    let min_interval = chrono::Duration::milliseconds(min_interval.as_millis().min(i64::MAX as u128) as i64);
    let mut enqueued = 0usize;

    for source in registry.list_enabled() {
        for collection in &source.collections {
            if let Some(cursor) = cursors.status(&source.source_id, collection).await? {
                if cursor.status == RunStatus::Running {
                    continue;
                }
                if let Some(last_success) = cursor.last_success_at {
                    if now - last_success < min_interval {
                        continue;
                    }
                }
            }

            let payload = serde_json::to_value(IngestBatchPayload {
                source_id: source.source_id.clone(),
                collection: collection.clone(),
            })?;
            if queue.has_active(JobKind::IngestBatch, &payload).await? {
                continue;
            }
            queue
                .enqueue(JobKind::IngestBatch, &payload, EnqueueOptions::default(), now)
                .await?;
            enqueued += 1;
        }
    }
    Ok(enqueued)
}

pub struct SchedulerDeps {
    pub queue: JobQueue,
    pub cursors: CursorTracker,
    pub cache: SearchCache,
    pub registry: Arc<SourceRegistry>,
}

/// Wire periodic sync enqueueing and cache sweeping onto the configured cron
/// expressions. Returns `None` when scheduling is disabled.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    deps: Arc<SchedulerDeps>,
) -> anyhow::Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let min_interval = Duration::from_secs(config.sync_min_interval_secs);

    for cron in [&config.sync_cron_morning, &config.sync_cron_evening] {
        let deps = deps.clone();
        let job = CronJob::new_async(cron.as_str(), move |_uuid, _l| {
            let deps = deps.clone();
            Box::pin(async move {
                match enqueue_due_syncs(
                    &deps.queue,
                    &deps.cursors,
                    &deps.registry,
                    min_interval,
                    Utc::now(),
                )
                .await
                {
                    Ok(count) if count > 0 => info!(count, "enqueued due sync jobs"),
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "sync scheduling failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }

    let sweep_deps = deps.clone();
    let sweep = CronJob::new_async(config.sweep_cron.as_str(), move |_uuid, _l| {
        let deps = sweep_deps.clone();
        Box::pin(async move {
            match deps.cache.sweep(Utc::now()).await {
                Ok(removed) if removed > 0 => info!(removed, "swept expired cache entries"),
                Ok(_) => {}
                Err(err) => warn!(error = %err, "cache sweep failed"),
            }
        })
    })
    .context("creating cache sweep job")?;
    sched.add(sweep).await.context("adding cache sweep job")?;

    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexdock_core::JobStatus;
    use lexdock_store::{connect_in_memory, run_migrations};
    use serde_json::json;
    use tempfile::tempdir;

    async fn test_pool() -> SqlitePool {
        let pool = connect_in_memory().await.expect("pool");
        run_migrations(&pool).await.expect("migrations");
        pool
    }

    struct FlakyHandler {
        transient: bool,
    }

    #[async_trait]
    impl JobHandler for FlakyHandler {
        async fn execute(&self, _job: &Job) -> Result<(), HandlerError> {
            if self.transient {
                Err(HandlerError::Transient("export backend unavailable".into()))
            } else {
                Err(HandlerError::Permanent("unsupported export format".into()))
            }
        }
    }

    struct OkHandler;

    #[async_trait]
    impl JobHandler for OkHandler {
        async fn execute(&self, _job: &Job) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn worker_with_pool(pool: &SqlitePool, artifacts: &tempfile::TempDir) -> JobWorker {
        let engine = Arc::new(IngestEngine::new(
            pool.clone(),
            ArtifactStore::new(artifacts.path()),
        ));
        JobWorker::new("w-test", JobQueue::new(pool.clone()), engine)
    }

    #[tokio::test]
    async fn job_without_handler_fails_terminally() {
        let pool = test_pool().await;
        let dir = tempdir().expect("tempdir");
        let worker = worker_with_pool(&pool, &dir);
        let queue = JobQueue::new(pool);

        let id = queue
            .enqueue(JobKind::Export, &json!({"format": "csv"}), EnqueueOptions::default(), Utc::now())
            .await
            .expect("enqueue");
        worker.drain().await.expect("drain");

        let job = queue.get(&id).await.expect("get");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.last_error.as_deref(),
            Some("no handler registered for export jobs")
        );
    }

    #[tokio::test]
    async fn registered_handler_completes_its_kind() {
        let pool = test_pool().await;
        let dir = tempdir().expect("tempdir");
        let mut worker = worker_with_pool(&pool, &dir);
        worker.register_handler(JobKind::Export, Arc::new(OkHandler));
        let queue = JobQueue::new(pool);

        let id = queue
            .enqueue(JobKind::Export, &json!({"format": "csv"}), EnqueueOptions::default(), Utc::now())
            .await
            .expect("enqueue");
        worker.drain().await.expect("drain");
        assert_eq!(queue.get(&id).await.expect("get").status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn transient_handler_failure_requeues_with_backoff() {
        let pool = test_pool().await;
        let dir = tempdir().expect("tempdir");
        let mut worker = worker_with_pool(&pool, &dir);
        worker.register_handler(JobKind::Export, Arc::new(FlakyHandler { transient: true }));
        let queue = JobQueue::new(pool);

        let id = queue
            .enqueue(JobKind::Export, &json!({}), EnqueueOptions::default(), Utc::now())
            .await
            .expect("enqueue");
        worker.drain().await.expect("drain");

        let job = queue.get(&id).await.expect("get");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert!(job.scheduled_at > Utc::now());
    }

    #[tokio::test]
    async fn permanent_handler_failure_skips_remaining_attempts() {
        let pool = test_pool().await;
        let dir = tempdir().expect("tempdir");
        let mut worker = worker_with_pool(&pool, &dir);
        worker.register_handler(JobKind::Draft, Arc::new(FlakyHandler { transient: false }));
        let queue = JobQueue::new(pool);

        let id = queue
            .enqueue(
                JobKind::Draft,
                &json!({}),
                EnqueueOptions {
                    max_attempts: 5,
                    ..EnqueueOptions::default()
                },
                Utc::now(),
            )
            .await
            .expect("enqueue");
        worker.drain().await.expect("drain");

        let job = queue.get(&id).await.expect("get");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.as_deref(), Some("unsupported export format"));
    }

    #[tokio::test]
    async fn malformed_ingest_payload_is_a_permanent_failure() {
        let pool = test_pool().await;
        let dir = tempdir().expect("tempdir");
        let worker = worker_with_pool(&pool, &dir);
        let queue = JobQueue::new(pool);

        let id = queue
            .enqueue(
                JobKind::IngestBatch,
                &json!({"collection_only": "opinions"}),
                EnqueueOptions::default(),
                Utc::now(),
            )
            .await
            .expect("enqueue");
        worker.drain().await.expect("drain");
        assert_eq!(queue.get(&id).await.expect("get").status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn due_sync_enqueueing_skips_running_and_active() {
        let pool = test_pool().await;
        let queue = JobQueue::new(pool.clone());
        let cursors = CursorTracker::new(pool);
        let registry = SourceRegistry::from_yaml_str(
            r#"
sources:
  - source_id: courtlistener
    display_name: CourtListener
    enabled: true
    base_url: https://www.courtlistener.com/api/rest/v4
    api_version: v4
    rate_limit: { max_requests: 60, window_secs: 60 }
    collections: [opinions, dockets]
  - source_id: efiling
    display_name: E-Filing Gateway
    enabled: false
    base_url: https://efile.example.gov
    api_version: "2.1"
    rate_limit: { max_requests: 10, window_secs: 60 }
    collections: [filings]
"#,
        )
        .expect("registry");
        let now = Utc::now();
        let interval = Duration::from_secs(3600);

        // Disabled sources are ignored; both collections of the enabled one
        // are due on a cold start.
        let count = enqueue_due_syncs(&queue, &cursors, &registry, interval, now)
            .await
            .expect("enqueue");
        assert_eq!(count, 2);

        // Jobs are still pending, so a second pass enqueues nothing.
        let count = enqueue_due_syncs(&queue, &cursors, &registry, interval, now)
            .await
            .expect("enqueue");
        assert_eq!(count, 0);

        // A collection mid-run stays skipped even with no active job.
        let drained = queue.claim("w", now).await.expect("claim").expect("job");
        queue.complete(&drained.id, now).await.expect("complete");
        let drained = queue.claim("w", now).await.expect("claim").expect("job");
        queue.complete(&drained.id, now).await.expect("complete");
        cursors
            .begin_run("courtlistener", "opinions", now)
            .await
            .expect("begin");
        let count = enqueue_due_syncs(&queue, &cursors, &registry, interval, now)
            .await
            .expect("enqueue");
        assert_eq!(count, 1);

        // A recent success is not yet due again.
        cursors
            .complete_run("courtlistener", "opinions", Some("c1"), 10, 0, now)
            .await
            .expect("complete");
        let drained = queue.claim("w", now).await.expect("claim").expect("job");
        queue.complete(&drained.id, now).await.expect("complete");
        let count = enqueue_due_syncs(&queue, &cursors, &registry, interval, now)
            .await
            .expect("enqueue");
        assert_eq!(count, 1);
    }
}
