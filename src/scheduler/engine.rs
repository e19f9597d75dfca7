use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::detect::{AnomalyEngine, CycleReport, MetricBatch};
use crate::sink::Emitter;
use crate::source::{MetricSource, ResourceSampler};

/// Cycles allowed in flight before the loop starts skipping ticks.
pub const MAX_PENDING_CYCLES: usize = 4;

/// Fetches a batch, evaluates it and hands anomalies to the sinks.
#[derive(Clone)]
pub struct CycleRunner {
    engine: AnomalyEngine,
    source: Arc<dyn MetricSource>,
    emitter: Emitter,
    sampler: Arc<ResourceSampler>,
}

impl CycleRunner {
    pub fn new(
        engine: AnomalyEngine,
        source: Arc<dyn MetricSource>,
        emitter: Emitter,
        sampler: Arc<ResourceSampler>,
    ) -> Self {
        Self {
            engine,
            source,
            emitter,
            sampler,
        }
    }

    pub fn engine(&self) -> &AnomalyEngine {
        &self.engine
    }

    /// Run one full cycle against the next batch from the source.
    pub async fn run_once(&self) -> Result<CycleReport> {
        let batch = self.source.fetch().await?;
        Ok(self.run_batch(batch).await)
    }

    /// Evaluate `batch` and queue its anomalies. Records that cannot be
    /// queued are logged in full.
    pub async fn run_batch(&self, mut batch: MetricBatch) -> CycleReport {
        if batch.resource_usage.is_none() {
            batch.resource_usage = Some(self.sampler.sample());
        }

        let report = self.engine.run_cycle(batch).await;
        for record in &report.records {
            if let Err(e) = self.emitter.emit(record.clone()).await {
                let payload = serde_json::to_string(record).unwrap_or_default();
                error!(error = %e, record = %payload, "anomaly could not be queued for delivery");
            }
        }
        report
    }

    /// Tick forever, each cycle in its own task so a slow cycle never
    /// delays the next tick. At most [`MAX_PENDING_CYCLES`] cycles run at
    /// once; further ticks are skipped until one finishes. Aborting the
    /// loop aborts its pending cycles.
    pub async fn run_loop(self, interval: Duration) {
        info!(interval_secs = interval.as_secs_f64(), "cycle loop started");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cycles = JoinSet::new();

        loop {
            ticker.tick().await;
            while cycles.try_join_next().is_some() {}
            if cycles.len() >= MAX_PENDING_CYCLES {
                warn!(
                    pending = cycles.len(),
                    "earlier cycles still running (sink backlog or slow source), skipping tick"
                );
                continue;
            }

            let runner = self.clone();
            cycles.spawn(async move {
                if let Err(e) = runner.run_once().await {
                    warn!(error = %format!("{:#}", e), "cycle skipped: metric fetch failed");
                }
            });
        }
    }
}
