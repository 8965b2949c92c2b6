//! Consume view events from `PgQueue`, and flush the views they count into durable storage.
use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use futures::FutureExt;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use health::HealthRegistry;
use view_common::counts::{CountStore, CountTables, PgCountStore};
use view_common::metrics::{serve, setup_metrics_recorder};
use view_common::pgqueue::PgQueue;
use view_common::store::{DedupStore, RedisDedupStore};
use view_worker::config::Config;
use view_worker::error::WorkerError;
use view_worker::handlers::app;
use view_worker::ingest::Ingestor;
use view_worker::scheduler::SyncScheduler;
use view_worker::sync::SyncJob;
use view_worker::worker::IngestionWorker;

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("shutting down gracefully...");
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::init_from_env().expect("Invalid configuration:");
    let dedup_window = config.dedup_window();
    info!(
        dedup_window_secs = dedup_window.as_duration().as_secs(),
        sync_interval_secs = config.sync_interval().as_secs(),
        queue = config.queue_name.as_str(),
        "starting view worker"
    );

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register("worker", Duration::from_secs(60))
        .await;
    let sync_liveness = liveness
        .register(
            "sync",
            config.sync_interval() + config.sync_timeout.0 + Duration::from_secs(60),
        )
        .await;

    let queue = PgQueue::new(
        config.queue_name.as_str(),
        &config.database_url,
        config.max_pg_connections,
        "view-worker",
    )?;
    let store: Arc<dyn DedupStore> =
        Arc::new(RedisDedupStore::new(&config.redis_url, config.store_timeout.0).await?);
    let counts: Arc<dyn CountStore> = Arc::new(PgCountStore::new_from_pool(
        queue.pool().clone(),
        CountTables::from(&config.count_tables),
    )?);

    let worker = IngestionWorker::new(
        &config.worker_name,
        &queue,
        config.dequeue_batch_size,
        config.poll_interval.0,
        config.max_concurrent_jobs,
        config.retry_policy.policy(),
        Ingestor::new(store.clone(), dedup_window),
        worker_liveness,
    );
    let scheduler = SyncScheduler::new(
        SyncJob::new(store.clone(), counts),
        config.sync_interval(),
        config.sync_timeout.0,
        config.shutdown_timeout.0,
        sync_liveness,
    );

    let recorder_handle = setup_metrics_recorder();
    let router = app(liveness, queue.pool().clone(), store, Some(recorder_handle));
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let shutdown = shutdown().boxed().shared();
    tokio::join!(
        worker.run_until(shutdown.clone()),
        scheduler.run_until(shutdown.clone()),
    );

    let summary = scheduler.final_sync().await;
    if summary.timed_out {
        error!("final sync timed out, remaining pending views stay in the dedup store");
    } else {
        info!(
            series_synced = summary.series_synced,
            chapters_synced = summary.chapters_synced,
            entity_errors = summary.entity_errors,
            "final sync finished"
        );
    }

    Ok(())
}
