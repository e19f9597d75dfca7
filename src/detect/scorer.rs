//! Deviation scoring against a baseline.

use serde::{Deserialize, Serialize};

use crate::detect::baseline::BaselineState;
use crate::detect::sample::MetricSample;

/// How far one sample sits from its baseline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviationResult {
    pub current_value: f64,
    /// Baseline mean at scoring time.
    pub baseline_value: f64,
    pub baseline_std_dev: f64,
    /// Absolute distance in standard deviations (or in `min_std_floor`
    /// units when the baseline variance is degenerate).
    pub deviation: f64,
    pub percentage_change: f64,
}

impl DeviationResult {
    pub fn absolute_change(&self) -> f64 {
        (self.current_value - self.baseline_value).abs()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviationScorer {
    /// Standard deviations at or below this are treated as zero.
    pub epsilon: f64,
    /// Divisor used in place of a degenerate standard deviation.
    pub min_std_floor: f64,
    /// Magnitude bound for percentage change; also stands in for an
    /// infinite change from a zero baseline.
    pub percentage_cap: f64,
}

impl Default for DeviationScorer {
    fn default() -> Self {
        Self {
            epsilon: 1e-9,
            min_std_floor: 0.01,
            percentage_cap: 1_000_000.0,
        }
    }
}

impl DeviationScorer {
    pub fn score(&self, sample: &MetricSample, baseline: &BaselineState) -> DeviationResult {
        let current = sample.value();
        let mean = baseline.mean;
        let std_dev = baseline.std_dev();
        let diff = current - mean;

        let scale = if std_dev > self.epsilon {
            std_dev
        } else {
            self.min_std_floor
        };
        let deviation = finite_or_max(diff.abs() / scale);

        DeviationResult {
            current_value: current,
            baseline_value: mean,
            baseline_std_dev: std_dev,
            deviation,
            percentage_change: self.percentage_change(current, mean),
        }
    }

    fn percentage_change(&self, current: f64, baseline: f64) -> f64 {
        let diff = current - baseline;
        if baseline.abs() <= self.epsilon {
            if diff.abs() <= self.epsilon {
                return 0.0;
            }
            return self.percentage_cap.copysign(diff);
        }
        let pct = diff / baseline.abs() * 100.0;
        if pct.is_finite() {
            pct.clamp(-self.percentage_cap, self.percentage_cap)
        } else {
            self.percentage_cap.copysign(diff)
        }
    }
}

fn finite_or_max(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        f64::MAX
    }
}
