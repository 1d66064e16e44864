use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use lexdock_core::JobKind;
use lexdock_sources::{ApiFetcher, HttpClient, HttpClientConfig, SourceRegistry};
use lexdock_store::{ArtifactStore, EnqueueOptions, JobQueue, SearchCache};
use lexdock_sync::{
    enqueue_due_syncs, maybe_build_scheduler, IngestEngine, JobWorker, SchedulerDeps, SyncConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "lexdock")]
#[command(about = "Legal docket ingestion and sync engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create or update the database schema.
    Migrate,
    /// Run one ingest for a single (source, collection).
    Sync {
        source: String,
        collection: String,
    },
    /// Enqueue ingest jobs for every collection that is due.
    Schedule,
    /// Claim and process jobs until interrupted.
    Worker,
    /// Show cursor state and job counts.
    Status,
    /// Remove expired search-cache entries.
    Sweep,
    /// Enqueue one job with a raw JSON payload.
    Enqueue {
        kind: String,
        payload: String,
        #[arg(long, default_value_t = 0)]
        priority: i64,
        #[arg(long, default_value_t = 3)]
        max_attempts: i64,
    },
    /// Cancel a pending job.
    Cancel { job_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Status) {
        Commands::Migrate => {
            let pool = lexdock_store::connect(&config.database_path).await?;
            lexdock_store::run_migrations(&pool).await?;
            println!("migrations applied: {}", config.database_path.display());
        }
        Commands::Sync { source, collection } => {
            let pool = open(&config).await?;
            let registry = SourceRegistry::from_path(&config.sources_file)?;
            let engine = build_engine(&config, &pool, &registry).await?;
            let outcome = engine.sync_collection(&source, &collection).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Schedule => {
            let pool = open(&config).await?;
            let registry = SourceRegistry::from_path(&config.sources_file)?;
            let queue = queue_from(&config, &pool);
            let cursors = lexdock_store::CursorTracker::new(pool.clone());
            let enqueued = enqueue_due_syncs(
                &queue,
                &cursors,
                &registry,
                Duration::from_secs(config.sync_min_interval_secs),
                Utc::now(),
            )
            .await?;
            println!("enqueued {enqueued} sync jobs");
        }
        Commands::Worker => {
            let pool = open(&config).await?;
            let registry = Arc::new(SourceRegistry::from_path(&config.sources_file)?);
            let engine = build_engine(&config, &pool, registry.as_ref()).await?;
            let queue = queue_from(&config, &pool);

            let scheduler = maybe_build_scheduler(
                &config,
                Arc::new(SchedulerDeps {
                    queue: queue.clone(),
                    cursors: lexdock_store::CursorTracker::new(pool.clone()),
                    cache: SearchCache::new(pool.clone()),
                    registry: registry.clone(),
                }),
            )
            .await?;
            if let Some(scheduler) = &scheduler {
                scheduler.start().await.context("starting scheduler")?;
                info!("cron scheduler started");
            }

            let worker_id = format!("worker-{}", std::process::id());
            let worker = JobWorker::new(&worker_id, queue, engine);
            info!(%worker_id, "worker started");
            tokio::select! {
                _ = worker.run(Duration::from_secs(config.worker_poll_secs)) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down");
                }
            }
        }
        Commands::Status => {
            let pool = open(&config).await?;
            let cursors = lexdock_store::CursorTracker::new(pool.clone());
            for cursor in cursors.list().await? {
                println!(
                    "{}/{}: {} processed={} failed={} cursor={}",
                    cursor.source_id,
                    cursor.collection,
                    cursor.status,
                    cursor.records_processed,
                    cursor.records_failed,
                    cursor.cursor_token.as_deref().unwrap_or("-"),
                );
            }
            let queue = JobQueue::new(pool);
            for (status, count) in queue.counts_by_status().await? {
                println!("jobs {status}: {count}");
            }
        }
        Commands::Sweep => {
            let pool = open(&config).await?;
            let removed = SearchCache::new(pool).sweep(Utc::now()).await?;
            println!("swept {removed} expired cache entries");
        }
        Commands::Enqueue {
            kind,
            payload,
            priority,
            max_attempts,
        } => {
            let kind = JobKind::parse(&kind)
                .with_context(|| format!("unknown job kind {kind}"))?;
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("parsing payload json")?;
            let pool = open(&config).await?;
            let queue = queue_from(&config, &pool);
            let job_id = queue
                .enqueue(
                    kind,
                    &payload,
                    EnqueueOptions {
                        priority,
                        max_attempts,
                        run_at: None,
                    },
                    Utc::now(),
                )
                .await?;
            println!("enqueued {job_id}");
        }
        Commands::Cancel { job_id } => {
            let pool = open(&config).await?;
            let queue = queue_from(&config, &pool);
            queue.cancel(&job_id, Utc::now()).await?;
            println!("cancelled {job_id}");
        }
    }

    Ok(())
}

async fn open(config: &SyncConfig) -> Result<sqlx::sqlite::SqlitePool> {
    let pool = lexdock_store::connect(&config.database_path).await?;
    lexdock_store::run_migrations(&pool).await?;
    Ok(pool)
}

fn queue_from(config: &SyncConfig, pool: &sqlx::sqlite::SqlitePool) -> JobQueue {
    JobQueue::new(pool.clone())
        .with_backoff(config.backoff())
        .with_lease(config.visibility_timeout())
}

/// Build the engine with a JSON-page fetcher per enabled source, each behind
/// its configured rate-limit bucket.
async fn build_engine(
    config: &SyncConfig,
    pool: &sqlx::sqlite::SqlitePool,
    registry: &SourceRegistry,
) -> Result<Arc<IngestEngine>> {
    let mut engine = IngestEngine::new(pool.clone(), ArtifactStore::new(&config.artifacts_dir));
    for source in registry.list_enabled() {
        let bucket = registry.token_bucket(&source.source_id).await?;
        let client = HttpClient::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..HttpClientConfig::default()
        })?
        .with_rate_limit(bucket);
        engine.register_fetcher(Arc::new(ApiFetcher::new(source, client)));
    }
    Ok(Arc::new(engine))
}
