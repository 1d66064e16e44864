//! End-to-end ingest runs against scripted fetchers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lexdock_core::{DocumentDraft, DocumentKind, JobKind, JobStatus, RunStatus, SearchQuery};
use lexdock_sources::{FetchError, FetchPage, ScriptedFetcher};
use lexdock_store::{ArtifactStore, EnqueueOptions, JobQueue, SearchCache};
use lexdock_sync::{IngestBatchPayload, IngestEngine, IngestError, JobWorker};
use serde_json::json;
use sqlx::sqlite::SqlitePool;
use tempfile::TempDir;

async fn test_pool() -> SqlitePool {
    let pool = lexdock_store::connect_in_memory().await.expect("pool");
    lexdock_store::run_migrations(&pool).await.expect("migrations");
    pool
}

fn opinion(external_id: &str, body: &str) -> DocumentDraft {
    let mut draft = DocumentDraft::new(
        "courtlistener",
        external_id,
        DocumentKind::Opinion,
        body.as_bytes().to_vec(),
    );
    draft.court = Some("ca9".to_string());
    draft.case_name = Some(format!("In re {external_id}"));
    draft
}

async fn engine_with_scripted_fetcher(
    pool: &SqlitePool,
    artifacts: &TempDir,
    fetcher: Arc<ScriptedFetcher>,
) -> Arc<IngestEngine> {
    let mut engine = IngestEngine::new(pool.clone(), ArtifactStore::new(artifacts.path()));
    engine.register_fetcher(fetcher);
    Arc::new(engine)
}

#[tokio::test]
async fn two_page_run_dedupes_across_pages_and_advances_cursor() {
    let pool = test_pool().await;
    let artifacts = TempDir::new().expect("tempdir");

    let fetcher = Arc::new(ScriptedFetcher::new("courtlistener"));
    let page_one: Vec<DocumentDraft> = (0..50)
        .map(|n| opinion(&format!("op-{n}"), &format!("opinion body {n}")))
        .collect();
    // One record repeats from page one with an identical body.
    let mut page_two: Vec<DocumentDraft> = (50..79)
        .map(|n| opinion(&format!("op-{n}"), &format!("opinion body {n}")))
        .collect();
    page_two.push(opinion("op-7", "opinion body 7"));

    fetcher
        .push_page(FetchPage {
            records: page_one,
            next_cursor: Some("page-2".to_string()),
            has_more: true,
        })
        .await;
    fetcher
        .push_page(FetchPage {
            records: page_two,
            next_cursor: Some("page-3".to_string()),
            has_more: false,
        })
        .await;

    let engine = engine_with_scripted_fetcher(&pool, &artifacts, fetcher.clone()).await;
    let outcome = engine
        .sync_collection("courtlistener", "opinions")
        .await
        .expect("sync");

    assert_eq!(outcome.processed, 80);
    assert_eq!(outcome.stored_new, 79);
    assert_eq!(outcome.deduplicated, 1);
    assert_eq!(outcome.failed, 0);
    assert_eq!(outcome.pages, 2);
    assert_eq!(outcome.final_cursor.as_deref(), Some("page-3"));

    let stored: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(&pool)
        .await
        .expect("count");
    assert_eq!(stored, 79);

    let cursor = engine
        .cursors()
        .status("courtlistener", "opinions")
        .await
        .expect("status")
        .expect("row");
    assert_eq!(cursor.status, RunStatus::Success);
    assert_eq!(cursor.cursor_token.as_deref(), Some("page-3"));
    assert_eq!(cursor.records_processed, 80);
    assert_eq!(cursor.records_failed, 0);

    // The second fetch resumed from the first page's cursor.
    assert_eq!(
        fetcher.requested_cursors().await,
        vec![None, Some("page-2".to_string())]
    );
}

#[tokio::test]
async fn failed_fetch_leaves_resume_point_at_last_success() {
    let pool = test_pool().await;
    let artifacts = TempDir::new().expect("tempdir");
    let fetcher = Arc::new(ScriptedFetcher::new("courtlistener"));

    fetcher
        .push_page(FetchPage {
            records: vec![opinion("op-1", "body 1")],
            next_cursor: Some("page-2".to_string()),
            has_more: false,
        })
        .await;
    fetcher
        .push_error(FetchError::Transient("upstream 503".to_string()))
        .await;

    let engine = engine_with_scripted_fetcher(&pool, &artifacts, fetcher.clone()).await;
    engine
        .sync_collection("courtlistener", "opinions")
        .await
        .expect("first sync");

    let err = engine
        .sync_collection("courtlistener", "opinions")
        .await
        .expect_err("second sync fails");
    assert!(matches!(err, IngestError::Fetch(FetchError::Transient(_))));

    let cursor = engine
        .cursors()
        .status("courtlistener", "opinions")
        .await
        .expect("status")
        .expect("row");
    assert_eq!(cursor.status, RunStatus::Error);
    assert_eq!(cursor.last_error.as_deref(), Some("transient fetch failure: upstream 503"));
    // No forward progress on failure.
    assert_eq!(cursor.cursor_token.as_deref(), Some("page-2"));

    // The failed run still asked for the last good cursor.
    assert_eq!(
        fetcher.requested_cursors().await,
        vec![None, Some("page-2".to_string())]
    );
}

#[tokio::test]
async fn worker_runs_ingest_jobs_and_invalidates_affected_cache() {
    let pool = test_pool().await;
    let artifacts = TempDir::new().expect("tempdir");
    let now = Utc::now();

    let fetcher = Arc::new(ScriptedFetcher::new("courtlistener"));
    fetcher
        .push_page(FetchPage {
            records: vec![opinion("op-100", "fresh opinion")],
            next_cursor: Some("page-2".to_string()),
            has_more: false,
        })
        .await;
    let engine = engine_with_scripted_fetcher(&pool, &artifacts, fetcher).await;

    // Warm the cache for the affected source and an unrelated one.
    let cache = SearchCache::new(pool.clone());
    let affected = SearchQuery {
        sources: vec!["courtlistener".to_string()],
        ..SearchQuery::default()
    };
    let unrelated = SearchQuery {
        sources: vec!["govinfo".to_string()],
        ..SearchQuery::default()
    };
    cache
        .store(&affected, &json!([]), 0, Duration::from_secs(600), now)
        .await
        .expect("store");
    cache
        .store(&unrelated, &json!([]), 0, Duration::from_secs(600), now)
        .await
        .expect("store");

    let queue = JobQueue::new(pool.clone());
    let job_id = queue
        .enqueue(
            JobKind::IngestBatch,
            &serde_json::to_value(IngestBatchPayload {
                source_id: "courtlistener".to_string(),
                collection: "opinions".to_string(),
            })
            .expect("payload"),
            EnqueueOptions::default(),
            now,
        )
        .await
        .expect("enqueue");

    let worker = JobWorker::new("w-1", JobQueue::new(pool.clone()), engine.clone());
    let handled = worker.drain().await.expect("drain");
    assert_eq!(handled, 1);

    assert_eq!(
        queue.get(&job_id).await.expect("get").status,
        JobStatus::Completed
    );
    engine
        .content()
        .find_by_source_external("courtlistener", "op-100")
        .await
        .expect("document stored");

    assert!(cache.lookup(&affected, now).await.expect("lookup").is_none());
    assert!(cache.lookup(&unrelated, now).await.expect("lookup").is_some());
}

#[tokio::test]
async fn duplicate_run_guard_requeues_the_job() {
    let pool = test_pool().await;
    let artifacts = TempDir::new().expect("tempdir");
    let now = Utc::now();

    let fetcher = Arc::new(ScriptedFetcher::new("courtlistener"));
    let engine = engine_with_scripted_fetcher(&pool, &artifacts, fetcher).await;

    // Simulate another worker mid-run on the same collection.
    engine
        .cursors()
        .begin_run("courtlistener", "opinions", now)
        .await
        .expect("begin");

    let queue = JobQueue::new(pool.clone());
    let job_id = queue
        .enqueue(
            JobKind::IngestBatch,
            &serde_json::to_value(IngestBatchPayload {
                source_id: "courtlistener".to_string(),
                collection: "opinions".to_string(),
            })
            .expect("payload"),
            EnqueueOptions::default(),
            now,
        )
        .await
        .expect("enqueue");

    let worker = JobWorker::new("w-2", JobQueue::new(pool.clone()), engine);
    worker.drain().await.expect("drain");

    let job = queue.get(&job_id).await.expect("get");
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
    assert!(job.scheduled_at > now);
}
