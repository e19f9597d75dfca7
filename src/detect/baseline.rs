//! Rolling per-metric baselines.
//!
//! Each metric keeps a bounded window of recent samples together with
//! Welford accumulators (count, mean, M2), so reading the baseline is O(1)
//! and memory is bounded by the window size rather than by history length.
//! Samples leave the window by count or by age; removals are applied to the
//! accumulators incrementally and the accumulators are periodically rebuilt
//! from the window to shed rounding drift.
//!
//! Every metric sits behind its own mutex. The outer map lock is only held
//! long enough to find or create an entry, so unrelated metrics never
//! serialize on each other.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::detect::sample::MetricSample;
use crate::detect::DetectError;

/// Window and eligibility settings shared by every tracked metric.
#[derive(Debug, Clone)]
pub struct WindowConfig {
    /// Maximum samples kept per metric.
    pub max_samples: usize,
    /// Samples older than this (relative to the newest sample) are evicted.
    pub max_age: Option<Duration>,
    /// Minimum samples before a metric may be scored.
    pub min_samples: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_samples: 120,
            max_age: Some(Duration::hours(1)),
            min_samples: 2,
        }
    }
}

/// Point-in-time view of one metric's baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineState {
    pub metric_name: String,
    pub mean: f64,
    /// Sample variance (n - 1 denominator), zero below two samples.
    pub variance: f64,
    pub sample_count: u64,
    pub window_start: Option<DateTime<Utc>>,
    pub last_observed_at: Option<DateTime<Utc>>,
}

impl BaselineState {
    pub fn std_dev(&self) -> f64 {
        self.variance.sqrt()
    }
}

#[derive(Debug, Default)]
struct MetricHistory {
    window: VecDeque<(DateTime<Utc>, f64)>,
    count: u64,
    mean: f64,
    m2: f64,
    last_observed_at: Option<DateTime<Utc>>,
    evictions_since_rebuild: usize,
}

impl MetricHistory {
    fn push(&mut self, observed_at: DateTime<Utc>, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
        self.window.push_back((observed_at, value));
        self.last_observed_at = Some(observed_at);
    }

    fn evict_front(&mut self, max_samples: usize) {
        let Some((_, value)) = self.window.pop_front() else {
            return;
        };

        if self.count <= 1 {
            self.count = 0;
            self.mean = 0.0;
            self.m2 = 0.0;
        } else {
            let old_mean = self.mean;
            self.count -= 1;
            self.mean = (old_mean * (self.count + 1) as f64 - value) / self.count as f64;
            self.m2 -= (value - old_mean) * (value - self.mean);
            self.m2 = self.m2.max(0.0);
        }

        self.evictions_since_rebuild += 1;
        if self.evictions_since_rebuild >= max_samples.max(1) {
            self.rebuild();
        }
    }

    fn rebuild(&mut self) {
        self.count = 0;
        self.mean = 0.0;
        self.m2 = 0.0;
        for &(_, value) in &self.window {
            self.count += 1;
            let delta = value - self.mean;
            self.mean += delta / self.count as f64;
            self.m2 += delta * (value - self.mean);
        }
        self.evictions_since_rebuild = 0;
    }

    fn prune_by_age(&mut self, now: DateTime<Utc>, config: &WindowConfig) {
        let Some(max_age) = config.max_age else {
            return;
        };
        // A window reaching past the representable range evicts nothing.
        let Some(cutoff) = now.checked_sub_signed(max_age) else {
            return;
        };
        while matches!(self.window.front(), Some(&(ts, _)) if ts < cutoff) {
            self.evict_front(config.max_samples);
        }
    }

    fn prune_by_count(&mut self, config: &WindowConfig) {
        while self.window.len() > config.max_samples {
            self.evict_front(config.max_samples);
        }
    }

    fn ensure_newer(&self, sample: &MetricSample) -> Result<(), DetectError> {
        match self.last_observed_at {
            Some(last) if sample.observed_at() <= last => Err(DetectError::StaleSample {
                metric: sample.name().to_string(),
                observed_at: sample.observed_at(),
                last_observed_at: last,
            }),
            _ => Ok(()),
        }
    }

    fn state(&self, metric_name: &str) -> BaselineState {
        let variance = if self.count > 1 {
            (self.m2 / (self.count - 1) as f64).max(0.0)
        } else {
            0.0
        };
        BaselineState {
            metric_name: metric_name.to_string(),
            mean: self.mean,
            variance,
            sample_count: self.count,
            window_start: self.window.front().map(|&(ts, _)| ts),
            last_observed_at: self.last_observed_at,
        }
    }
}

/// Owner of every metric's baseline.
#[derive(Debug, Default)]
pub struct BaselineTracker {
    config: WindowConfig,
    metrics: RwLock<HashMap<String, Arc<Mutex<MetricHistory>>>>,
}

impl BaselineTracker {
    pub fn new(config: WindowConfig) -> Self {
        Self {
            config,
            metrics: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    fn entry(&self, metric: &str) -> Arc<Mutex<MetricHistory>> {
        if let Some(history) = self
            .metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(metric)
        {
            return Arc::clone(history);
        }
        let mut metrics = self
            .metrics
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(metrics.entry(metric.to_string()).or_default())
    }

    fn eligible(&self, state: BaselineState) -> Result<BaselineState, DetectError> {
        if state.sample_count < self.config.min_samples {
            return Err(DetectError::InsufficientHistory {
                metric: state.metric_name,
                needed: self.config.min_samples,
                have: state.sample_count,
            });
        }
        Ok(state)
    }

    /// Baseline to score `sample` against, before `sample` is folded in.
    ///
    /// Samples that have aged out relative to `sample` are evicted first.
    /// Returns `InsufficientHistory` while the metric is still warming up.
    pub fn observe(&self, sample: &MetricSample) -> Result<BaselineState, DetectError> {
        let entry = self.entry(sample.name());
        let mut history = entry.lock().unwrap_or_else(PoisonError::into_inner);
        history.ensure_newer(sample)?;
        history.prune_by_age(sample.observed_at(), &self.config);
        self.eligible(history.state(sample.name()))
    }

    /// Fold `sample` into the running statistics.
    pub fn commit(&self, sample: &MetricSample) -> Result<(), DetectError> {
        let entry = self.entry(sample.name());
        let mut history = entry.lock().unwrap_or_else(PoisonError::into_inner);
        history.ensure_newer(sample)?;
        history.prune_by_age(sample.observed_at(), &self.config);
        history.push(sample.observed_at(), sample.value());
        history.prune_by_count(&self.config);
        Ok(())
    }

    /// `observe` then `commit` under a single lock.
    ///
    /// The sample is folded in even when the metric is still warming up, in
    /// which case `InsufficientHistory` is returned after the commit.
    pub fn record(&self, sample: &MetricSample) -> Result<BaselineState, DetectError> {
        let entry = self.entry(sample.name());
        let mut history = entry.lock().unwrap_or_else(PoisonError::into_inner);
        history.ensure_newer(sample)?;
        history.prune_by_age(sample.observed_at(), &self.config);

        let before = history.state(sample.name());
        history.push(sample.observed_at(), sample.value());
        history.prune_by_count(&self.config);
        drop(history);

        self.eligible(before)
    }

    pub fn baseline(&self, metric: &str) -> Option<BaselineState> {
        let entry = self
            .metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(metric)
            .cloned()?;
        let history = entry.lock().unwrap_or_else(PoisonError::into_inner);
        Some(history.state(metric))
    }

    /// All baselines, sorted by metric name.
    pub fn snapshot(&self) -> Vec<BaselineState> {
        let entries: Vec<(String, Arc<Mutex<MetricHistory>>)> = self
            .metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, entry)| (name.clone(), Arc::clone(entry)))
            .collect();

        let mut states: Vec<BaselineState> = entries
            .iter()
            .map(|(name, entry)| {
                entry
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .state(name)
            })
            .collect();
        states.sort_by(|a, b| a.metric_name.cmp(&b.metric_name));
        states
    }

    pub fn tracked_metrics(&self) -> usize {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
