//! Samples and the per-cycle context snapshot supplied by the metric source.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::detect::DetectError;

pub const REQUESTS_PER_SECOND: &str = "requests_per_second";
pub const ACTIVE_REQUESTS: &str = "active_requests";
pub const AVG_RESPONSE_TIME_1MIN: &str = "avg_response_time_1min";

/// One observation of one metric.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    name: String,
    value: f64,
    observed_at: DateTime<Utc>,
}

impl MetricSample {
    /// Non-finite values are rejected so they can never reach a baseline.
    pub fn new(
        name: impl Into<String>,
        value: f64,
        observed_at: DateTime<Utc>,
    ) -> Result<Self, DetectError> {
        let name = name.into();
        if !value.is_finite() {
            return Err(DetectError::NonFiniteValue {
                metric: name,
                value,
            });
        }
        Ok(Self {
            name,
            value,
            observed_at,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }
}

/// Request-serving state at the time of the cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemState {
    pub active_requests: u64,
    pub completed_requests_1min: u64,
    pub error_rate_1min: f64,
    pub avg_response_time_1min: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EfficiencySnapshot {
    pub requests_per_second: f64,
    pub cache_hit_rate: f64,
    pub queue_depth: u64,
}

/// Payload of a degraded resource sample: exactly `{"error": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceError {
    pub error: String,
}

/// Host resource usage, passed through untouched.
///
/// When the sampling collaborator is missing, the source reports
/// `{"error": "<reason>"}` instead of real numbers. Both shapes are valid
/// input and neither fails the cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceUsage {
    Unavailable(ResourceError),
    Available(serde_json::Map<String, serde_json::Value>),
}

impl ResourceUsage {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        ResourceUsage::Unavailable(ResourceError {
            error: reason.into(),
        })
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, ResourceUsage::Unavailable(_))
    }
}

impl Default for ResourceUsage {
    fn default() -> Self {
        ResourceUsage::unavailable("resource usage not reported")
    }
}

/// Read-only context shared by every metric evaluated in one cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleContext {
    pub system_state: SystemState,
    pub efficiency: EfficiencySnapshot,
    pub resource_usage: ResourceUsage,
}

/// Everything the source hands over for one evaluation cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricBatch {
    #[serde(default = "Utc::now")]
    pub observed_at: DateTime<Utc>,
    /// Explicit metric values. When empty, the standard request metrics are
    /// derived from the snapshots.
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub system_state: SystemState,
    #[serde(default)]
    pub efficiency: EfficiencySnapshot,
    #[serde(default)]
    pub resource_usage: Option<ResourceUsage>,
}

impl MetricBatch {
    pub fn from_snapshots(
        observed_at: DateTime<Utc>,
        system_state: SystemState,
        efficiency: EfficiencySnapshot,
    ) -> Self {
        Self {
            observed_at,
            metrics: BTreeMap::new(),
            system_state,
            efficiency,
            resource_usage: None,
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    /// The metric values this batch carries, explicit or derived.
    pub fn metric_values(&self) -> BTreeMap<String, f64> {
        if !self.metrics.is_empty() {
            return self.metrics.clone();
        }
        BTreeMap::from([
            (
                REQUESTS_PER_SECOND.to_string(),
                self.efficiency.requests_per_second,
            ),
            (
                ACTIVE_REQUESTS.to_string(),
                self.system_state.active_requests as f64,
            ),
            (
                AVG_RESPONSE_TIME_1MIN.to_string(),
                self.system_state.avg_response_time_1min,
            ),
        ])
    }

    /// One sample per metric, keyed by name. Invalid values come back as
    /// errors so the caller can report them without dropping the rest of
    /// the batch.
    pub fn samples(&self) -> Vec<(String, Result<MetricSample, DetectError>)> {
        self.metric_values()
            .into_iter()
            .map(|(name, value)| {
                let sample = MetricSample::new(name.clone(), value, self.observed_at);
                (name, sample)
            })
            .collect()
    }

    pub fn context(&self) -> CycleContext {
        CycleContext {
            system_state: self.system_state.clone(),
            efficiency: self.efficiency.clone(),
            resource_usage: self.resource_usage.clone().unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_finite_sample_rejected() {
        let err = MetricSample::new("active_requests", f64::NAN, Utc::now()).unwrap_err();
        assert!(matches!(err, DetectError::NonFiniteValue { .. }));
        assert!(MetricSample::new("active_requests", f64::INFINITY, Utc::now()).is_err());
    }

    #[test]
    fn test_degraded_resource_usage_round_trips() {
        let usage: ResourceUsage =
            serde_json::from_str(r#"{"error": "host metrics not available"}"#).unwrap();
        assert!(usage.is_degraded());
        assert_eq!(
            serde_json::to_value(&usage).unwrap(),
            serde_json::json!({"error": "host metrics not available"})
        );

        // An object that merely contains an "error" key is real data.
        let usage: ResourceUsage =
            serde_json::from_str(r#"{"error": "none", "cpu_percent": 12.5}"#).unwrap();
        assert!(!usage.is_degraded());
    }

    #[test]
    fn test_batch_derives_standard_metrics() {
        let json = r#"{
            "observed_at": "2025-06-10T14:20:00Z",
            "system_state": {
                "active_requests": 2,
                "completed_requests_1min": 48,
                "error_rate_1min": 0.0,
                "avg_response_time_1min": 92.45
            },
            "efficiency": {"requests_per_second": 0.8, "cache_hit_rate": 0.0, "queue_depth": 0},
            "resource_usage": {"error": "host metrics not available"}
        }"#;
        let batch: MetricBatch = serde_json::from_str(json).unwrap();
        let values = batch.metric_values();
        assert_eq!(values.len(), 3);
        assert_eq!(values[ACTIVE_REQUESTS], 2.0);
        assert_eq!(values[AVG_RESPONSE_TIME_1MIN], 92.45);
        assert_eq!(values[REQUESTS_PER_SECOND], 0.8);
        assert!(batch.context().resource_usage.is_degraded());
    }

    #[test]
    fn test_explicit_metrics_take_precedence() {
        let batch = MetricBatch::from_snapshots(
            Utc::now(),
            SystemState::default(),
            EfficiencySnapshot::default(),
        )
        .with_metric("queue_wait_ms", 14.0);
        let values = batch.metric_values();
        assert_eq!(values.len(), 1);
        assert_eq!(values["queue_wait_ms"], 14.0);
    }

    #[test]
    fn test_samples_keep_names_of_rejected_values() {
        let batch = MetricBatch::from_snapshots(
            Utc::now(),
            SystemState::default(),
            EfficiencySnapshot::default(),
        )
        .with_metric("good", 1.0)
        .with_metric("bad", f64::INFINITY);

        let samples = batch.samples();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].0, "bad");
        assert!(matches!(samples[0].1, Err(DetectError::NonFiniteValue { .. })));
        assert_eq!(samples[1].0, "good");
        let good = samples[1].1.as_ref().unwrap();
        assert_eq!(good.value(), 1.0);
        assert_eq!(good.observed_at(), batch.observed_at);
    }

    #[test]
    fn test_partial_snapshot_defaults_missing_fields() {
        let batch: MetricBatch =
            serde_json::from_str(r#"{"system_state": {"active_requests": 3}}"#).unwrap();
        assert_eq!(batch.system_state.active_requests, 3);
        assert_eq!(batch.system_state.avg_response_time_1min, 0.0);
        assert!(batch.resource_usage.is_none());
    }
}
