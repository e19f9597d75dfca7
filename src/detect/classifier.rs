//! Per-metric severity policy.
//!
//! A deviation score alone misjudges metrics whose baseline sits near zero
//! (tiny absolute moves produce huge scores), and a percentage change alone
//! misjudges large, steady metrics. Each metric therefore carries its own
//! thresholds for both, plus an optional absolute-change floor below which
//! nothing is reported.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::detect::scorer::DeviationResult;
use crate::detect::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeverityThresholds {
    pub warning_deviation: f64,
    pub critical_deviation: f64,
    /// Absolute percentage change that is critical on its own.
    pub critical_percentage_change: f64,
    /// Moves smaller than this (in the metric's own unit) are never anomalous.
    #[serde(default)]
    pub min_absolute_change: f64,
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        Self {
            warning_deviation: 3.0,
            critical_deviation: 6.0,
            critical_percentage_change: 500.0,
            min_absolute_change: 0.0,
        }
    }
}

impl SeverityThresholds {
    pub fn new(warning_deviation: f64, critical_deviation: f64, critical_percentage_change: f64) -> Self {
        Self {
            warning_deviation,
            critical_deviation,
            critical_percentage_change,
            min_absolute_change: 0.0,
        }
    }

    pub fn with_min_absolute_change(mut self, floor: f64) -> Self {
        self.min_absolute_change = floor;
        self
    }

    /// `None` means the result is not anomalous.
    pub fn classify(&self, result: &DeviationResult) -> Option<Severity> {
        if result.absolute_change() < self.min_absolute_change {
            return None;
        }
        if result.deviation >= self.critical_deviation
            || result.percentage_change.abs() >= self.critical_percentage_change
        {
            Some(Severity::Critical)
        } else if result.deviation >= self.warning_deviation {
            Some(Severity::Warning)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SeverityClassifier {
    default: SeverityThresholds,
    per_metric: HashMap<String, SeverityThresholds>,
}

impl SeverityClassifier {
    pub fn new(default: SeverityThresholds, per_metric: HashMap<String, SeverityThresholds>) -> Self {
        Self { default, per_metric }
    }

    pub fn set_thresholds(&mut self, metric: impl Into<String>, thresholds: SeverityThresholds) {
        self.per_metric.insert(metric.into(), thresholds);
    }

    pub fn is_configured(&self, metric: &str) -> bool {
        self.per_metric.contains_key(metric)
    }

    /// Thresholds for `metric`, falling back to the default set.
    pub fn thresholds_for(&self, metric: &str) -> &SeverityThresholds {
        self.per_metric.get(metric).unwrap_or(&self.default)
    }

    pub fn classify(&self, metric: &str, result: &DeviationResult) -> Option<Severity> {
        self.thresholds_for(metric).classify(result)
    }
}
