//! Transcoding worker binary.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tflow_queue::{EventBus, EventBusConfig, JobQueue, QueueConfig, SubscriptionFilter, TracingSink};
use tflow_storage::{MemoryObjectStore, MemoryStore};
use tflow_upload::{UploadConfig, UploadSessionManager};
use tflow_worker::{
    metrics::init_metrics, spawn_asset_intake, IntakeRule, SimulatedEngine, WorkerConfig,
    WorkerPool,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env().add_directive("tflow=info".parse()?);

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }

    info!("Starting tflow-worker");

    if let Ok(addr) = std::env::var("METRICS_ADDR") {
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid METRICS_ADDR '{}'", addr))?;
        init_metrics(addr)?;
        info!(%addr, "Prometheus exporter listening");
    }

    let worker_config = WorkerConfig::from_env();
    info!("Worker config: {:?}", worker_config);

    let store = Arc::new(MemoryStore::new());
    let objects = Arc::new(MemoryObjectStore::new());
    let bus = Arc::new(EventBus::new(EventBusConfig::from_env()));
    let queue = Arc::new(JobQueue::new(QueueConfig::from_env(), store.clone(), bus.clone()));
    let uploads = Arc::new(UploadSessionManager::new(
        UploadConfig::from_env(),
        store,
        objects.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let background = vec![
        Arc::clone(&uploads).spawn_gc(shutdown_rx.clone()),
        bus.attach_sink(
            Arc::new(TracingSink),
            SubscriptionFilter::all(),
            shutdown_rx.clone(),
        ),
        spawn_asset_intake(
            Arc::clone(&queue),
            uploads.subscribe_assets(),
            IntakeRule::defaults(),
            shutdown_rx,
        ),
    ];

    let engine = Arc::new(SimulatedEngine::new(objects));
    let pool = Arc::new(WorkerPool::new(worker_config, Arc::clone(&queue), engine));

    match pool.recover_on_startup().await {
        Ok(report) => info!(
            restored = report.restored,
            requeued = report.requeued.len(),
            failed = report.failed.len(),
            "Startup recovery complete"
        ),
        Err(e) => error!("Startup recovery failed: {}", e),
    }
    pool.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    pool.shutdown().await;
    let _ = shutdown_tx.send(true);
    for handle in background {
        handle.await.ok();
    }

    info!("Worker shutdown complete");
    Ok(())
}
