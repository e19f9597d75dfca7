//! TOML configuration for the anomaly detector.
//!
//! Layered the usual way: an explicit path, then the
//! `ANOMALY_DETECTOR_CONFIG` environment variable, then the system location,
//! then compiled-in defaults. Every section is optional. `validate` is run
//! once at startup; anything it rejects is fatal.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::detect::advisor::{default_playbook, CRITICAL_ESCALATION};
use crate::detect::baseline::WindowConfig;
use crate::detect::classifier::{SeverityClassifier, SeverityThresholds};
use crate::detect::sample::{ACTIVE_REQUESTS, AVG_RESPONSE_TIME_1MIN, REQUESTS_PER_SECOND};
use crate::detect::scorer::DeviationScorer;
use crate::detect::ActionAdvisor;

pub const CONFIG_ENV_VAR: &str = "ANOMALY_DETECTOR_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/anomaly-detector/anomaly-detector.toml";

/// Upper bound for `[baseline] max_age_secs`: ten years.
pub const MAX_BASELINE_AGE_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("thresholds for '{metric}': {reason}")]
    InvalidThresholds { metric: String, reason: String },

    #[error("metric '{0}' is tracked but has no thresholds configured")]
    MissingThresholds(String),

    #[error("[{section}] {field}: {reason}")]
    InvalidValue {
        section: &'static str,
        field: &'static str,
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectorConfig {
    #[serde(default)]
    pub baseline: BaselineConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub thresholds: ThresholdsConfig,
    #[serde(default)]
    pub advisor: AdvisorConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub resources: ResourcesConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl DetectorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded detector configuration");
        Ok(config)
    }

    /// Resolve the configuration file.
    ///
    /// An explicit path must load. The environment variable and system path
    /// are best effort and fall back to defaults with a warning.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
            let path = PathBuf::from(env_path);
            match Self::load(&path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "{} set but file could not be loaded, trying fallback",
                    CONFIG_ENV_VAR
                ),
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => warn!(
                    path = %system_path.display(),
                    error = %e,
                    "system config file exists but could not be loaded, using defaults"
                ),
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.baseline.validate()?;
        self.scoring.validate()?;
        self.thresholds.validate()?;
        self.sink.validate()?;

        if self.engine.evaluation_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                section: "engine",
                field: "evaluation_timeout_ms",
                reason: "must be greater than zero".into(),
            });
        }
        if self.source.interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                section: "source",
                field: "interval_secs",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Baseline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    /// Samples required before a metric is scored.
    pub min_samples: u64,
    /// Samples retained per metric.
    pub window_size: usize,
    /// Maximum sample age in seconds; 0 disables age eviction.
    pub max_age_secs: u64,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            min_samples: 2,
            window_size: 120,
            max_age_secs: 3600,
        }
    }
}

impl BaselineConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.min_samples < 2 {
            return Err(ConfigError::InvalidValue {
                section: "baseline",
                field: "min_samples",
                reason: "a variance needs at least 2 samples".into(),
            });
        }
        if (self.window_size as u64) < self.min_samples {
            return Err(ConfigError::InvalidValue {
                section: "baseline",
                field: "window_size",
                reason: format!("must be at least min_samples ({})", self.min_samples),
            });
        }
        if self.max_age_secs > MAX_BASELINE_AGE_SECS {
            return Err(ConfigError::InvalidValue {
                section: "baseline",
                field: "max_age_secs",
                reason: format!("must be at most {} (ten years)", MAX_BASELINE_AGE_SECS),
            });
        }
        Ok(())
    }

    /// Age eviction is off when `max_age_secs` is 0 or out of range.
    pub fn window(&self) -> WindowConfig {
        WindowConfig {
            max_samples: self.window_size,
            max_age: i64::try_from(self.max_age_secs)
                .ok()
                .filter(|secs| *secs > 0)
                .and_then(chrono::Duration::try_seconds),
            min_samples: self.min_samples,
        }
    }
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub epsilon: f64,
    pub min_std_floor: f64,
    pub percentage_cap: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        let scorer = DeviationScorer::default();
        Self {
            epsilon: scorer.epsilon,
            min_std_floor: scorer.min_std_floor,
            percentage_cap: scorer.percentage_cap,
        }
    }
}

impl ScoringConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, f64, bool); 3] = [
            ("epsilon", self.epsilon, self.epsilon >= 0.0),
            ("min_std_floor", self.min_std_floor, self.min_std_floor > 0.0),
            ("percentage_cap", self.percentage_cap, self.percentage_cap > 0.0),
        ];
        for (field, value, ok) in checks {
            if !value.is_finite() || !ok {
                return Err(ConfigError::InvalidValue {
                    section: "scoring",
                    field,
                    reason: format!("{} is out of range", value),
                });
            }
        }
        Ok(())
    }

    pub fn scorer(&self) -> DeviationScorer {
        DeviationScorer {
            epsilon: self.epsilon,
            min_std_floor: self.min_std_floor,
            percentage_cap: self.percentage_cap,
        }
    }
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdsConfig {
    /// Require explicit thresholds for every entry in `tracked_metrics`.
    pub strict: bool,
    pub tracked_metrics: Vec<String>,
    pub default: SeverityThresholds,
    pub metrics: HashMap<String, SeverityThresholds>,
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            strict: false,
            tracked_metrics: Vec::new(),
            default: SeverityThresholds::default(),
            metrics: HashMap::from([
                (
                    ACTIVE_REQUESTS.to_string(),
                    SeverityThresholds::new(3.0, 6.0, 1000.0).with_min_absolute_change(1.0),
                ),
                (
                    AVG_RESPONSE_TIME_1MIN.to_string(),
                    SeverityThresholds::new(2.0, 4.0, 50.0),
                ),
                (
                    REQUESTS_PER_SECOND.to_string(),
                    SeverityThresholds::new(2.5, 5.0, 90.0),
                ),
            ]),
        }
    }
}

impl ThresholdsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        check_thresholds("default", &self.default)?;
        for (metric, thresholds) in &self.metrics {
            check_thresholds(metric, thresholds)?;
        }
        if self.strict {
            if let Some(missing) = self
                .tracked_metrics
                .iter()
                .find(|m| !self.metrics.contains_key(m.as_str()))
            {
                return Err(ConfigError::MissingThresholds(missing.clone()));
            }
        }
        Ok(())
    }

    pub fn classifier(&self) -> SeverityClassifier {
        SeverityClassifier::new(self.default, self.metrics.clone())
    }
}

pub(crate) fn check_thresholds(metric: &str, t: &SeverityThresholds) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidThresholds {
        metric: metric.to_string(),
        reason: reason.to_string(),
    };
    let values = [
        t.warning_deviation,
        t.critical_deviation,
        t.critical_percentage_change,
        t.min_absolute_change,
    ];
    if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
        return Err(invalid("values must be finite and non-negative"));
    }
    if t.warning_deviation > t.critical_deviation {
        return Err(invalid("warning_deviation exceeds critical_deviation"));
    }
    if t.critical_percentage_change <= 0.0 {
        return Err(invalid("critical_percentage_change must be positive"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Advisor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisorConfig {
    /// Appended to every critical anomaly; empty disables it.
    pub critical_escalation: String,
    /// Metric name to ordered actions.
    pub playbook: HashMap<String, Vec<String>>,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            critical_escalation: CRITICAL_ESCALATION.to_string(),
            playbook: default_playbook(),
        }
    }
}

impl AdvisorConfig {
    pub fn advisor(&self) -> ActionAdvisor {
        ActionAdvisor::new(self.playbook.clone(), Some(self.critical_escalation.clone()))
    }
}

// ---------------------------------------------------------------------------
// Engine, sink, source
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-metric evaluation budget within a cycle.
    pub evaluation_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            evaluation_timeout_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub queue_capacity: usize,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    /// Append every record to this JSON-lines file as well as the store.
    pub jsonl_path: Option<PathBuf>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            retry_initial_ms: 200,
            retry_max_ms: 30_000,
            jsonl_path: None,
        }
    }
}

impl SinkConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                section: "sink",
                field: "queue_capacity",
                reason: "must be greater than zero".into(),
            });
        }
        if self.retry_initial_ms == 0 || self.retry_max_ms < self.retry_initial_ms {
            return Err(ConfigError::InvalidValue {
                section: "sink",
                field: "retry_max_ms",
                reason: "retry delays must be positive with max >= initial".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Endpoint returning one metric batch as JSON.
    pub url: String,
    pub interval_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8000/metrics/snapshot".to_string(),
            interval_secs: 60,
            request_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    pub enabled: bool,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

// ---------------------------------------------------------------------------
// Storage, API, logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/anomalies.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8090".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level; `RUST_LOG` takes precedence.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = DetectorConfig::default();
        cfg.validate().unwrap();

        assert_eq!(cfg.baseline.min_samples, 2);
        assert_eq!(cfg.baseline.window_size, 120);
        assert_eq!(cfg.engine.evaluation_timeout_ms, 50);
        assert_eq!(cfg.sink.queue_capacity, 256);
        assert_eq!(cfg.logging.format, LogFormat::Text);
        assert_eq!(cfg.thresholds.metrics.len(), 3);
        assert!(cfg.advisor.playbook.contains_key("avg_response_time_1min"));
        assert!(!cfg.advisor.playbook.contains_key("requests_per_second"));
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[baseline]
min_samples = 5
window_size = 30
max_age_secs = 0

[scoring]
min_std_floor = 0.05

[thresholds]
strict = true
tracked_metrics = ["active_requests", "queue_wait_ms"]

[thresholds.default]
warning_deviation = 2.0
critical_deviation = 5.0
critical_percentage_change = 300.0

[thresholds.metrics.active_requests]
warning_deviation = 3.0
critical_deviation = 6.0
critical_percentage_change = 1000.0
min_absolute_change = 1.0

[thresholds.metrics.queue_wait_ms]
warning_deviation = 2.5
critical_deviation = 4.0
critical_percentage_change = 75.0

[advisor]
critical_escalation = ""

[advisor.playbook]
queue_wait_ms = ["Check worker pool saturation"]

[sink]
queue_capacity = 16
jsonl_path = "/var/lib/anomaly-detector/anomalies.jsonl"

[logging]
level = "debug"
format = "json"
"#;
        let cfg: DetectorConfig = toml::from_str(toml_str).unwrap();
        cfg.validate().unwrap();

        assert_eq!(cfg.baseline.min_samples, 5);
        assert!(cfg.baseline.window().max_age.is_none());
        assert_eq!(cfg.scoring.min_std_floor, 0.05);
        assert_eq!(cfg.thresholds.default.warning_deviation, 2.0);
        assert_eq!(cfg.thresholds.metrics["active_requests"].min_absolute_change, 1.0);
        assert_eq!(cfg.thresholds.metrics["queue_wait_ms"].min_absolute_change, 0.0);
        assert_eq!(cfg.advisor.playbook.len(), 1);
        assert_eq!(cfg.sink.queue_capacity, 16);
        assert_eq!(cfg.sink.retry_initial_ms, 200);
        assert_eq!(cfg.logging.format, LogFormat::Json);

        let advisor = cfg.advisor.advisor();
        assert_eq!(
            advisor.advise("queue_wait_ms", crate::detect::Severity::Critical),
            vec!["Check worker pool saturation".to_string()]
        );
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: DetectorConfig = toml::from_str("[api]\nbind = \"0.0.0.0:9000\"\n").unwrap();
        assert_eq!(cfg.api.bind, "0.0.0.0:9000");
        assert_eq!(cfg.source.interval_secs, 60);
        assert_eq!(cfg.thresholds.metrics.len(), 3);
    }

    #[test]
    fn test_strict_mode_requires_thresholds() {
        let mut cfg = DetectorConfig::default();
        cfg.thresholds.strict = true;
        cfg.thresholds.tracked_metrics = vec!["active_requests".into(), "cpu_steal".into()];
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::MissingThresholds("cpu_steal".into()))
        );

        cfg.thresholds.strict = false;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let mut cfg = DetectorConfig::default();
        cfg.thresholds
            .metrics
            .insert("rps".into(), SeverityThresholds::new(5.0, 3.0, 100.0));
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidThresholds { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_window_and_sink() {
        let mut cfg = DetectorConfig::default();
        cfg.baseline.min_samples = 1;
        assert!(cfg.validate().is_err());

        let mut cfg = DetectorConfig::default();
        cfg.baseline.window_size = 1;
        assert!(cfg.validate().is_err());

        let mut cfg = DetectorConfig::default();
        cfg.sink.queue_capacity = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = DetectorConfig::default();
        cfg.scoring.min_std_floor = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_out_of_range_max_age() {
        for secs in [MAX_BASELINE_AGE_SECS + 1, 20_000_000_000_000, u64::MAX] {
            let mut cfg = DetectorConfig::default();
            cfg.baseline.max_age_secs = secs;
            assert!(matches!(
                cfg.validate(),
                Err(ConfigError::InvalidValue { field: "max_age_secs", .. })
            ));
            // Never wraps to a negative window even if validation is skipped.
            if let Some(max_age) = cfg.baseline.window().max_age {
                assert!(max_age.num_seconds() > 0);
            }
        }
        let mut cfg = DetectorConfig::default();
        cfg.baseline.max_age_secs = u64::MAX;
        assert!(cfg.baseline.window().max_age.is_none());

        let mut cfg = DetectorConfig::default();
        cfg.baseline.max_age_secs = MAX_BASELINE_AGE_SECS;
        assert!(cfg.validate().is_ok());
        cfg.baseline.max_age_secs = 0;
        assert!(cfg.baseline.window().max_age.is_none());
    }

    #[test]
    fn test_explicit_missing_path_is_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(DetectorConfig::resolve(Some(&missing)).is_err());

        let path = dir.path().join("detector.toml");
        std::fs::write(&path, "[engine]\nevaluation_timeout_ms = 20\n").unwrap();
        let cfg = DetectorConfig::resolve(Some(&path)).unwrap();
        assert_eq!(cfg.engine.evaluation_timeout_ms, 20);
    }

    #[test]
    fn test_shipped_example_matches_defaults() {
        let cfg: DetectorConfig =
            toml::from_str(include_str!("../anomaly-detector.example.toml")).unwrap();
        cfg.validate().unwrap();

        let defaults = DetectorConfig::default();
        assert_eq!(cfg.thresholds.metrics, defaults.thresholds.metrics);
        assert_eq!(cfg.thresholds.tracked_metrics.len(), 3);
        assert_eq!(cfg.api.bind, defaults.api.bind);
        assert_eq!(cfg.sink.jsonl_path, None);
    }
}
