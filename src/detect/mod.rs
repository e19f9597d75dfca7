//! Anomaly detection core: baselines, scoring, classification and records.

pub mod advisor;
pub mod baseline;
pub mod classifier;
pub mod engine;
pub mod record;
pub mod sample;
pub mod scorer;

use chrono::{DateTime, Utc};
use thiserror::Error;

pub use self::advisor::ActionAdvisor;
pub use self::baseline::{BaselineState, BaselineTracker, WindowConfig};
pub use self::classifier::{SeverityClassifier, SeverityThresholds};
pub use self::engine::{AnomalyEngine, CycleReport, Evaluation};
pub use self::record::{AnomalyRecord, AnomalyRecordFactory, ResolutionStatus};
pub use self::sample::{
    CycleContext, EfficiencySnapshot, MetricBatch, MetricSample, ResourceUsage, SystemState,
};
pub use self::scorer::{DeviationResult, DeviationScorer};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DetectError {
    #[error("insufficient history for {metric}: need {needed} samples, have {have}")]
    InsufficientHistory {
        metric: String,
        needed: u64,
        have: u64,
    },

    #[error("non-finite value {value} for {metric}")]
    NonFiniteValue { metric: String, value: f64 },

    #[error("stale sample for {metric}: observed at {observed_at}, last committed {last_observed_at}")]
    StaleSample {
        metric: String,
        observed_at: DateTime<Utc>,
        last_observed_at: DateTime<Utc>,
    },

    #[error("invalid resolution transition: {from} -> {to}")]
    InvalidTransition {
        from: ResolutionStatus,
        to: ResolutionStatus,
    },

    #[error("evaluation of {metric} timed out after {timeout_ms}ms")]
    EvaluationTimeout { metric: String, timeout_ms: u64 },

    #[error("evaluation of {metric} aborted: {reason}")]
    EvaluationAborted { metric: String, reason: String },

    #[error("sink queue closed, anomaly {anomaly_id} not emitted")]
    SinkClosed { anomaly_id: String },
}

/// Severity levels for emitted anomalies.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_orders_critical_above_warning() {
        assert!(Severity::Critical > Severity::Warning);
        assert_eq!(
            serde_json::to_string(&Severity::Critical).unwrap(),
            "\"critical\""
        );
        assert_eq!("warning".parse::<Severity>().unwrap(), Severity::Warning);
        assert!("info".parse::<Severity>().is_err());
    }
}
