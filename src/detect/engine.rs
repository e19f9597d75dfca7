//! Per-sample and per-cycle evaluation.
//!
//! One sample goes tracker -> scorer -> classifier -> advisor -> factory.
//! A cycle evaluates every metric of a batch concurrently on the blocking
//! pool, each under its own timeout, so one misbehaving metric cannot hold
//! up or fail the rest.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::config::{ConfigError, DetectorConfig};
use crate::detect::advisor::ActionAdvisor;
use crate::detect::baseline::{BaselineState, BaselineTracker, WindowConfig};
use crate::detect::classifier::{SeverityClassifier, SeverityThresholds};
use crate::detect::record::{AnomalyRecord, AnomalyRecordFactory};
use crate::detect::sample::{CycleContext, MetricBatch, MetricSample};
use crate::detect::scorer::{DeviationResult, DeviationScorer};
use crate::detect::DetectError;

// Claim states for a queued evaluation.
const PENDING: u8 = 0;
const STARTED: u8 = 1;
const ABANDONED: u8 = 2;

/// Outcome of evaluating one sample that had enough history to be scored.
#[derive(Debug, Clone)]
pub enum Evaluation {
    Normal(DeviationResult),
    Anomalous(AnomalyRecord),
}

/// Summary of one evaluation cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub observed_at: DateTime<Utc>,
    /// Metrics that were scored, anomalous or not.
    pub evaluated: usize,
    /// Metrics still below the minimum sample count.
    pub warming_up: Vec<String>,
    pub failed: Vec<(String, DetectError)>,
    /// Anomalies, ordered by metric name.
    pub records: Vec<AnomalyRecord>,
}

struct EngineInner {
    tracker: BaselineTracker,
    scorer: DeviationScorer,
    classifier: RwLock<SeverityClassifier>,
    advisor: ActionAdvisor,
    factory: AnomalyRecordFactory,
    evaluation_timeout: Duration,
}

#[derive(Clone)]
pub struct AnomalyEngine {
    inner: Arc<EngineInner>,
}

impl AnomalyEngine {
    pub fn new(
        window: WindowConfig,
        scorer: DeviationScorer,
        classifier: SeverityClassifier,
        advisor: ActionAdvisor,
        evaluation_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                tracker: BaselineTracker::new(window),
                scorer,
                classifier: RwLock::new(classifier),
                advisor,
                factory: AnomalyRecordFactory,
                evaluation_timeout,
            }),
        }
    }

    pub fn from_config(config: &DetectorConfig) -> Self {
        Self::new(
            config.baseline.window(),
            config.scoring.scorer(),
            config.thresholds.classifier(),
            config.advisor.advisor(),
            Duration::from_millis(config.engine.evaluation_timeout_ms),
        )
    }

    pub fn tracker(&self) -> &BaselineTracker {
        &self.inner.tracker
    }

    pub fn baselines(&self) -> Vec<BaselineState> {
        self.inner.tracker.snapshot()
    }

    pub fn thresholds_for(&self, metric: &str) -> SeverityThresholds {
        *self
            .inner
            .classifier
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .thresholds_for(metric)
    }

    /// Replace one metric's thresholds at runtime. Later evaluations pick
    /// them up; baselines are untouched.
    pub fn update_thresholds(
        &self,
        metric: &str,
        thresholds: SeverityThresholds,
    ) -> Result<(), ConfigError> {
        crate::config::check_thresholds(metric, &thresholds)?;
        self.inner
            .classifier
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_thresholds(metric, thresholds);
        info!(metric = %metric, ?thresholds, "severity thresholds updated");
        Ok(())
    }

    /// Score `sample` against its baseline, then fold it in.
    ///
    /// `InsufficientHistory` means the sample was recorded but not scored.
    /// Stale samples are rejected without touching the baseline.
    pub fn evaluate(
        &self,
        sample: &MetricSample,
        context: &CycleContext,
    ) -> Result<Evaluation, DetectError> {
        let inner = &self.inner;
        let baseline = inner.tracker.record(sample)?;
        let deviation = inner.scorer.score(sample, &baseline);

        let severity = inner
            .classifier
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .classify(sample.name(), &deviation);

        let Some(severity) = severity else {
            return Ok(Evaluation::Normal(deviation));
        };

        let actions = inner.advisor.advise(sample.name(), severity);
        let record = inner
            .factory
            .build(sample, deviation, severity, context, actions);

        warn!(
            anomaly_id = %record.anomaly_id(),
            metric = %sample.name(),
            severity = %severity,
            current = deviation.current_value,
            baseline = deviation.baseline_value,
            deviation = deviation.deviation,
            pct_change = deviation.percentage_change,
            "anomaly detected"
        );
        Ok(Evaluation::Anomalous(record))
    }

    /// Evaluate every metric in `batch`. Never fails as a whole.
    pub async fn run_cycle(&self, batch: MetricBatch) -> CycleReport {
        let cycle_id = Uuid::new_v4();
        let span = info_span!("cycle", cycle_id = %cycle_id);
        self.run_cycle_inner(cycle_id, batch).instrument(span).await
    }

    async fn run_cycle_inner(&self, cycle_id: Uuid, batch: MetricBatch) -> CycleReport {
        let context = Arc::new(batch.context());
        if let crate::detect::ResourceUsage::Unavailable(reason) = &context.resource_usage {
            debug!(reason = %reason.error, "resource usage degraded for this cycle");
        }

        let mut report = CycleReport {
            cycle_id,
            observed_at: batch.observed_at,
            evaluated: 0,
            warming_up: Vec::new(),
            failed: Vec::new(),
            records: Vec::new(),
        };

        let mut pending = Vec::new();
        for (name, sample) in batch.samples() {
            match sample {
                Ok(sample) => pending.push(self.evaluate_isolated(sample, Arc::clone(&context))),
                Err(e) => {
                    warn!(metric = %name, error = %e, "sample rejected");
                    report.failed.push((name, e));
                }
            }
        }

        for (metric, outcome) in join_all(pending).await {
            match outcome {
                Ok(Evaluation::Normal(_)) => report.evaluated += 1,
                Ok(Evaluation::Anomalous(record)) => {
                    report.evaluated += 1;
                    report.records.push(record);
                }
                Err(DetectError::InsufficientHistory { have, needed, .. }) => {
                    debug!(metric = %metric, have, needed, "baseline warming up");
                    report.warming_up.push(metric);
                }
                Err(e) => {
                    warn!(metric = %metric, error = %e, "metric evaluation failed");
                    report.failed.push((metric, e));
                }
            }
        }
        report.records.sort_by(|a, b| a.metric_name().cmp(b.metric_name()));

        info!(
            evaluated = report.evaluated,
            anomalies = report.records.len(),
            warming_up = report.warming_up.len(),
            failed = report.failed.len(),
            "cycle complete"
        );
        report
    }

    /// Evaluate one sample on the blocking pool under the per-metric budget.
    ///
    /// The deadline only cancels work that has not started. Once the blocking
    /// task claims the sample it runs to completion and its result is kept,
    /// so a late sample is never folded in with its anomaly thrown away.
    async fn evaluate_isolated(
        &self,
        sample: MetricSample,
        context: Arc<CycleContext>,
    ) -> (String, Result<Evaluation, DetectError>) {
        let metric = sample.name().to_string();
        let timeout = self.inner.evaluation_timeout;
        let engine = self.clone();
        let span = Span::current();
        let claim = Arc::new(AtomicU8::new(PENDING));
        let task_claim = Arc::clone(&claim);

        let mut handle = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            if task_claim
                .compare_exchange(PENDING, STARTED, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return None;
            }
            Some(engine.evaluate(&sample, &context))
        });

        let joined = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                let abandoned = claim
                    .compare_exchange(PENDING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
                if abandoned {
                    return (
                        metric.clone(),
                        Err(DetectError::EvaluationTimeout {
                            metric,
                            timeout_ms: timeout.as_millis() as u64,
                        }),
                    );
                }
                warn!(
                    metric = %metric,
                    timeout_ms = timeout.as_millis() as u64,
                    "evaluation overran its budget, waiting for the result"
                );
                handle.await
            }
        };

        let outcome = match joined {
            Ok(Some(result)) => result,
            Ok(None) => Err(DetectError::EvaluationTimeout {
                metric: metric.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
            Err(join_err) => Err(DetectError::EvaluationAborted {
                metric: metric.clone(),
                reason: join_err.to_string(),
            }),
        };
        (metric, outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::sample::{EfficiencySnapshot, SystemState, ACTIVE_REQUESTS};
    use crate::detect::{ResourceUsage, Severity};

    fn engine() -> AnomalyEngine {
        let mut config = DetectorConfig::default();
        config.engine.evaluation_timeout_ms = 5_000;
        AnomalyEngine::from_config(&config)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_718_000_000 + secs, 0).unwrap()
    }

    fn batch(secs: i64, active: u64, rt: f64, rps: f64) -> MetricBatch {
        MetricBatch::from_snapshots(
            at(secs),
            SystemState {
                active_requests: active,
                completed_requests_1min: 10,
                error_rate_1min: 0.0,
                avg_response_time_1min: rt,
            },
            EfficiencySnapshot {
                requests_per_second: rps,
                ..EfficiencySnapshot::default()
            },
        )
    }

    #[test]
    fn test_evaluate_warms_up_then_scores() {
        let engine = engine();
        let ctx = CycleContext::default();
        for (i, v) in [10.0, 11.0].into_iter().enumerate() {
            let s = MetricSample::new("latency", v, at(i as i64)).unwrap();
            assert!(matches!(
                engine.evaluate(&s, &ctx),
                Err(DetectError::InsufficientHistory { .. })
            ));
        }
        let s = MetricSample::new("latency", 10.5, at(2)).unwrap();
        assert!(matches!(engine.evaluate(&s, &ctx), Ok(Evaluation::Normal(_))));
        assert_eq!(engine.tracker().baseline("latency").unwrap().sample_count, 3);
    }

    #[test]
    fn test_evaluate_flags_spike_with_actions() {
        let engine = engine();
        let ctx = CycleContext::default();
        for i in 0..10 {
            let v = if i % 2 == 0 { 0.0 } else { 1.0 };
            let s = MetricSample::new(ACTIVE_REQUESTS, v, at(i)).unwrap();
            let _ = engine.evaluate(&s, &ctx);
        }
        let spike = MetricSample::new(ACTIVE_REQUESTS, 9.0, at(20)).unwrap();
        let Ok(Evaluation::Anomalous(record)) = engine.evaluate(&spike, &ctx) else {
            panic!("expected an anomaly");
        };
        assert_eq!(record.severity(), Severity::Critical);
        assert_eq!(record.anomaly_id(), format!("active_requests_{}.000000", 1_718_000_020));
        assert_eq!(
            record.suggested_actions().last().map(String::as_str),
            Some(crate::detect::advisor::CRITICAL_ESCALATION)
        );
    }

    #[test]
    fn test_update_thresholds_applies_without_restart() {
        let engine = engine();
        let ctx = CycleContext::default();
        for (i, v) in [100.0, 102.0, 98.0, 101.0, 99.0].into_iter().enumerate() {
            let s = MetricSample::new("queue_wait_ms", v, at(i as i64)).unwrap();
            let _ = engine.evaluate(&s, &ctx);
        }
        let s = MetricSample::new("queue_wait_ms", 104.0, at(10)).unwrap();
        assert!(matches!(engine.evaluate(&s, &ctx), Ok(Evaluation::Normal(_))));

        engine
            .update_thresholds("queue_wait_ms", SeverityThresholds::new(1.0, 2.0, 50.0))
            .unwrap();
        let s = MetricSample::new("queue_wait_ms", 104.5, at(11)).unwrap();
        assert!(matches!(engine.evaluate(&s, &ctx), Ok(Evaluation::Anomalous(_))));

        let bad = SeverityThresholds::new(5.0, 1.0, 50.0);
        assert!(engine.update_thresholds("queue_wait_ms", bad).is_err());
        assert_eq!(engine.thresholds_for("queue_wait_ms").warning_deviation, 1.0);
    }

    #[tokio::test]
    async fn test_cycle_reports_warmup_and_isolates_failures() {
        let engine = engine();

        let first = engine.run_cycle(batch(0, 1, 80.0, 0.5)).await;
        assert_eq!(first.evaluated, 0);
        assert_eq!(first.warming_up.len(), 3);
        assert!(first.records.is_empty());

        // A non-finite custom metric fails alone; the derived metrics are
        // not present because explicit metrics take precedence.
        let mixed = batch(60, 1, 80.0, 0.5)
            .with_metric("good", 1.0)
            .with_metric("bad", f64::NAN);
        let report = engine.run_cycle(mixed).await;
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "bad");
        assert_eq!(report.warming_up, vec!["good".to_string()]);
    }

    #[tokio::test]
    async fn test_replayed_batch_is_rejected_as_stale() {
        let engine = engine();
        engine.run_cycle(batch(0, 1, 80.0, 0.5)).await;
        let again = engine.run_cycle(batch(0, 1, 80.0, 0.5)).await;
        assert_eq!(again.failed.len(), 3);
        assert!(again
            .failed
            .iter()
            .all(|(_, e)| matches!(e, DetectError::StaleSample { .. })));
        assert_eq!(engine.tracker().baseline(ACTIVE_REQUESTS).unwrap().sample_count, 1);
    }

    #[tokio::test]
    async fn test_degraded_resource_usage_passes_through() {
        let engine = engine();
        for i in 0..8 {
            engine
                .run_cycle(batch(i * 60, (i % 2) as u64, 85.0 + (i % 3) as f64, 0.4))
                .await;
        }
        let mut spike = batch(600, 40, 86.0, 0.4);
        spike.resource_usage = Some(ResourceUsage::unavailable("host metrics not available"));
        let report = engine.run_cycle(spike).await;

        assert_eq!(report.records.len(), 1);
        let record = &report.records[0];
        assert_eq!(record.metric_name(), ACTIVE_REQUESTS);
        assert_eq!(
            record.resource_usage(),
            &ResourceUsage::unavailable("host metrics not available")
        );
        assert_eq!(engine.baselines().len(), 3);
    }

    fn tight_engine() -> AnomalyEngine {
        let mut config = DetectorConfig::default();
        config.engine.evaluation_timeout_ms = 50;
        AnomalyEngine::from_config(&config)
    }

    fn spike_history(engine: &AnomalyEngine) {
        let ctx = CycleContext::default();
        for i in 0..10 {
            let s = MetricSample::new(ACTIVE_REQUESTS, (i % 2) as f64, at(i)).unwrap();
            let _ = engine.evaluate(&s, &ctx);
        }
    }

    fn spike_batch() -> MetricBatch {
        MetricBatch::from_snapshots(at(100), SystemState::default(), EfficiencySnapshot::default())
            .with_metric(ACTIVE_REQUESTS, 12.0)
    }

    #[test]
    fn test_queued_evaluation_past_deadline_is_not_committed() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(1)
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let engine = tight_engine();
            spike_history(&engine);

            // Occupy the only blocking thread past the budget.
            let blocker = tokio::task::spawn_blocking(|| {
                std::thread::sleep(std::time::Duration::from_millis(200))
            });
            let report = engine.run_cycle(spike_batch()).await;
            assert!(report.records.is_empty());
            assert!(matches!(
                report.failed.as_slice(),
                [(_, DetectError::EvaluationTimeout { timeout_ms: 50, .. })]
            ));
            assert_eq!(engine.tracker().baseline(ACTIVE_REQUESTS).unwrap().sample_count, 10);

            // The sample was never folded in, so it can still be detected.
            blocker.await.unwrap();
            let retry = engine.run_cycle(spike_batch()).await;
            assert_eq!(retry.records.len(), 1);
            assert_eq!(retry.records[0].severity(), Severity::Critical);
            assert_eq!(engine.tracker().baseline(ACTIVE_REQUESTS).unwrap().sample_count, 11);
        });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_started_evaluation_keeps_its_anomaly_after_deadline() {
        let engine = tight_engine();
        spike_history(&engine);

        // Hold the classifier so the evaluation commits, then stalls.
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = {
            let engine = engine.clone();
            std::thread::spawn(move || {
                let _guard = engine.inner.classifier.write().unwrap();
                locked_tx.send(()).unwrap();
                std::thread::sleep(std::time::Duration::from_millis(200));
            })
        };
        locked_rx.recv().unwrap();

        let report = engine.run_cycle(spike_batch()).await;
        holder.join().unwrap();

        assert!(report.failed.is_empty(), "{:?}", report.failed);
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].severity(), Severity::Critical);
        assert_eq!(engine.tracker().baseline(ACTIVE_REQUESTS).unwrap().sample_count, 11);
    }
}
