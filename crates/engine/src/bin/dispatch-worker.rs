//! dispatch-worker: consumes schedule and monitor jobs and runs them.
//!
//! Jobs come from the in-process queue (timers seeded from the stored
//! definitions) or from SQS. Definitions, run history and counters live in
//! PostgreSQL, or in memory with `--memory-store`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono_tz::Tz;
use clap::Parser;
use tokio::sync::Notify;
use tracing::{info, warn};

use beacon_core::config::{self, Config, QueueBackend};
use beacon_engine::{
    register_all, shutdown_signal, Catalog, DispatchWorker, MemoryStore, PgStore, PoolConfig, RunStore,
    WorkerPool,
};
use beacon_notify::Dispatcher;
use beacon_probe::NetworkProber;
use beacon_queue::{LocalQueue, QueueConsumer, SqsConsumer};

// ── CLI ─────────────────────────────────────────────────────────────

/// Beacon dispatch worker. Runs scheduled API calls and health probes.
#[derive(Parser, Debug)]
#[command(name = "dispatch-worker", version, about)]
struct Cli {
    /// Env profile (e.g. PROD reads PROD_<KEY> before <KEY>).
    #[arg(long, env = "BEACON_PROFILE")]
    profile: Option<String>,

    /// Jobs handled concurrently (overrides WORKER_CONCURRENCY).
    #[arg(long)]
    concurrency: Option<usize>,

    /// Keep definitions and history in memory instead of PostgreSQL.
    #[arg(long, env = "BEACON_MEMORY_STORE")]
    memory_store: bool,

    /// JSON catalog of schedules, monitors and channels for the memory store.
    #[arg(long, env = "BEACON_CATALOG", requires = "memory_store")]
    catalog: Option<PathBuf>,
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.profile {
        Some(profile) => Config::for_profile(profile),
        None => Config::from_env(),
    };
    if let Some(concurrency) = cli.concurrency {
        config.worker.concurrency = concurrency.max(1);
    }
    config.log_summary();

    let default_tz: Tz = config
        .worker
        .default_timezone
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid DEFAULT_TIMEZONE '{}': {e}", config.worker.default_timezone))?;

    // Definitions the local queue registers at startup.
    let (store, schedules, monitors) = if cli.memory_store {
        let catalog = match &cli.catalog {
            Some(path) => Catalog::from_file(path)?,
            None => {
                warn!("Memory store without a catalog, no jobs will be registered");
                Catalog::default()
            }
        };
        let memory = MemoryStore::new();
        catalog.seed(&memory);
        let store: Arc<dyn RunStore> = Arc::new(memory);
        (store, catalog.schedules, catalog.monitors)
    } else {
        let store = PgStore::connect(&config.postgres)
            .await
            .context("PostgreSQL store unavailable (use --memory-store to run without it)")?;
        let schedules = store.schedules().await?;
        let monitors = store.monitors().await?;
        let store: Arc<dyn RunStore> = Arc::new(store);
        (store, schedules, monitors)
    };

    let consumer: Arc<dyn QueueConsumer> = match config.worker.queue_backend {
        QueueBackend::Local => {
            let queue = Arc::new(LocalQueue::new(Duration::from_millis(config.queue.poll_interval_ms)));
            register_all(queue.as_ref(), store.as_ref(), &schedules, &monitors).await?;
            queue as Arc<dyn QueueConsumer>
        }
        QueueBackend::Sqs => {
            info!("Jobs are registered by the scheduler, consuming from SQS");
            Arc::new(SqsConsumer::new(&config.aws, &config.queue).await?)
        }
    };

    match consumer.health_check().await {
        Ok(health) => info!(%health, "Queue ready"),
        Err(e) => warn!(error = %e, "Queue health check failed"),
    }

    let worker = DispatchWorker::new(
        store,
        Arc::new(NetworkProber::new()?),
        Dispatcher::from_config(&config.smtp, &config.notify)?,
        config.probe.clone(),
        default_tz,
    );
    let pool = WorkerPool::new(
        Arc::new(worker),
        consumer,
        PoolConfig::from_worker_config(&config.worker),
    );

    let shutdown = Arc::new(Notify::new());
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.notify_one();
        }
    });

    pool.run(shutdown).await;
    info!("dispatch-worker stopped");
    Ok(())
}
