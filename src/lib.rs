//! Anomaly detection for request-serving metrics.
//!
//! Tracks a rolling baseline per metric, scores each new sample against it,
//! classifies the deviation with per-metric thresholds and emits anomaly
//! records with suggested remediation to downstream sinks.

pub mod api;
pub mod config;
pub mod detect;
pub mod scheduler;
pub mod sink;
pub mod source;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::DetectorConfig;
use crate::detect::AnomalyEngine;
use crate::scheduler::CycleRunner;
use crate::sink::{JsonLinesSink, RetryPolicy};
use crate::source::{HttpSource, ResourceSampler};
use crate::storage::AnomalyStore;

/// Time allowed for queued anomalies to drain after shutdown is requested.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Run the detector daemon: cycle loop, delivery workers and API server.
pub async fn serve(config: DetectorConfig) -> Result<()> {
    tracing::info!(db_path = %config.storage.db_path.display(), "Initializing database");
    let pool = storage::open_pool(&config.storage.db_path)?;
    let store = AnomalyStore::new(pool);
    let engine = AnomalyEngine::from_config(&config);

    let policy = RetryPolicy::from(&config.sink);
    let (mut emitter, store_worker) =
        sink::attach(Arc::new(store.clone()), config.sink.queue_capacity, policy);
    let mut workers = vec![store_worker];

    if let Some(path) = &config.sink.jsonl_path {
        let jsonl = JsonLinesSink::open(path).await?;
        let (jsonl_emitter, jsonl_worker) =
            sink::attach(Arc::new(jsonl), config.sink.queue_capacity, policy);
        emitter = emitter.join(jsonl_emitter);
        workers.push(jsonl_worker);
    }

    let source = HttpSource::new(
        config.source.url.clone(),
        Duration::from_secs(config.source.request_timeout_secs),
    )?;
    let sampler = ResourceSampler::new(config.resources.enabled);
    let runner = CycleRunner::new(engine.clone(), Arc::new(source), emitter, Arc::new(sampler));
    let cycle_loop = tokio::spawn(runner.run_loop(Duration::from_secs(config.source.interval_secs)));

    let app = api::router(api::state::AppState { store, engine });
    let addr: std::net::SocketAddr = config
        .api
        .bind
        .parse()
        .with_context(|| format!("invalid bind address: {}", config.api.bind))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    tracing::info!(%addr, source = %config.source.url, "anomaly detector listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stopping the loop drops the last emitter, which lets the workers
    // finish whatever is still queued.
    cycle_loop.abort();
    let _ = cycle_loop.await;
    for worker in workers {
        let sink = worker.sink_name().to_string();
        let undelivered = worker.shutdown(DRAIN_TIMEOUT).await;
        if !undelivered.is_empty() {
            tracing::warn!(
                sink = %sink,
                undelivered = undelivered.len(),
                "delivery worker did not drain before shutdown"
            );
        }
    }
    tracing::info!("anomaly detector stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
