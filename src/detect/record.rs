//! Anomaly records and their resolution lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::detect::sample::{CycleContext, EfficiencySnapshot, MetricSample, ResourceUsage, SystemState};
use crate::detect::scorer::DeviationResult;
use crate::detect::{DetectError, Severity};

/// Lifecycle of an emitted anomaly.
///
/// `open -> acknowledged -> resolved` and `open -> resolved`; nothing leaves
/// `resolved`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStatus {
    #[default]
    Open,
    Acknowledged,
    Resolved,
}

impl ResolutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStatus::Open => "open",
            ResolutionStatus::Acknowledged => "acknowledged",
            ResolutionStatus::Resolved => "resolved",
        }
    }

    pub fn can_transition_to(self, next: ResolutionStatus) -> bool {
        use ResolutionStatus::*;
        matches!(
            (self, next),
            (Open, Acknowledged) | (Open, Resolved) | (Acknowledged, Resolved)
        )
    }

    pub fn transition_to(self, next: ResolutionStatus) -> Result<ResolutionStatus, DetectError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DetectError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl std::fmt::Display for ResolutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResolutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(ResolutionStatus::Open),
            "acknowledged" => Ok(ResolutionStatus::Acknowledged),
            "resolved" => Ok(ResolutionStatus::Resolved),
            other => Err(format!("unknown resolution status '{}'", other)),
        }
    }
}

/// `<metric_name>_<unix seconds>.<microseconds>`, stable for a given
/// metric and observation time.
pub fn anomaly_id(metric_name: &str, observed_at: DateTime<Utc>) -> String {
    format!(
        "{}_{}.{:06}",
        metric_name,
        observed_at.timestamp(),
        observed_at.timestamp_subsec_micros()
    )
}

/// One detected deviation event. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    anomaly_id: String,
    metric_name: String,
    #[serde(rename = "timestamp")]
    observed_at: DateTime<Utc>,
    #[serde(flatten)]
    deviation: DeviationResult,
    severity: Severity,
    system_state: SystemState,
    efficiency: EfficiencySnapshot,
    resource_usage: ResourceUsage,
    suggested_actions: Vec<String>,
    resolution_status: ResolutionStatus,
    created_at: DateTime<Utc>,
}

impl AnomalyRecord {
    pub fn anomaly_id(&self) -> &str {
        &self.anomaly_id
    }

    pub fn metric_name(&self) -> &str {
        &self.metric_name
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }

    pub fn deviation(&self) -> &DeviationResult {
        &self.deviation
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn system_state(&self) -> &SystemState {
        &self.system_state
    }

    pub fn efficiency(&self) -> &EfficiencySnapshot {
        &self.efficiency
    }

    pub fn resource_usage(&self) -> &ResourceUsage {
        &self.resource_usage
    }

    pub fn suggested_actions(&self) -> &[String] {
        &self.suggested_actions
    }

    /// Status at creation time. Later transitions live with the sink.
    pub fn resolution_status(&self) -> ResolutionStatus {
        self.resolution_status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Sole constructor of [`AnomalyRecord`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnomalyRecordFactory;

impl AnomalyRecordFactory {
    pub fn build(
        &self,
        sample: &MetricSample,
        deviation: DeviationResult,
        severity: Severity,
        context: &CycleContext,
        suggested_actions: Vec<String>,
    ) -> AnomalyRecord {
        AnomalyRecord {
            anomaly_id: anomaly_id(sample.name(), sample.observed_at()),
            metric_name: sample.name().to_string(),
            observed_at: sample.observed_at(),
            deviation,
            severity,
            system_state: context.system_state.clone(),
            efficiency: context.efficiency.clone(),
            resource_usage: context.resource_usage.clone(),
            suggested_actions,
            resolution_status: ResolutionStatus::Open,
            created_at: Utc::now(),
        }
    }
}
