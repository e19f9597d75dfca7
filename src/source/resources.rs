//! Host resource usage attached to each cycle.
//!
//! Returns `{"error": "<reason>"}` instead of numbers when sampling is off
//! or the platform is unsupported, so a missing collaborator only degrades
//! the context of a cycle.

use std::sync::{Mutex, PoisonError};

use serde_json::{json, Map, Value};
use sysinfo::System;

use crate::detect::ResourceUsage;

pub const UNSUPPORTED: &str = "resource sampling not available";
pub const DISABLED: &str = "resource sampling disabled";

pub struct ResourceSampler {
    system: Option<Mutex<System>>,
}

impl ResourceSampler {
    pub fn new(enabled: bool) -> Self {
        let system = (enabled && sysinfo::IS_SUPPORTED_SYSTEM).then(|| Mutex::new(System::new()));
        Self { system }
    }

    pub fn disabled() -> Self {
        Self { system: None }
    }

    pub fn sample(&self) -> ResourceUsage {
        let Some(system) = &self.system else {
            let reason = if sysinfo::IS_SUPPORTED_SYSTEM { DISABLED } else { UNSUPPORTED };
            return ResourceUsage::unavailable(reason);
        };

        // CPU usage is measured between successive refreshes, so the
        // first sample after startup reads as zero.
        let mut sys = system.lock().unwrap_or_else(PoisonError::into_inner);
        sys.refresh_memory();
        sys.refresh_cpu_usage();

        let total = sys.total_memory();
        let used = sys.used_memory();
        let memory_percent = if total > 0 {
            used as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        let load = System::load_average();

        let mut usage = Map::new();
        usage.insert("cpu_percent".into(), round2(sys.global_cpu_usage() as f64));
        usage.insert("memory_percent".into(), round2(memory_percent));
        usage.insert("memory_used_mb".into(), json!(used / (1024 * 1024)));
        usage.insert("load_avg_1min".into(), round2(load.one));
        ResourceUsage::Available(usage)
    }
}

fn round2(v: f64) -> Value {
    if v.is_finite() {
        json!((v * 100.0).round() / 100.0)
    } else {
        Value::Null
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_sampler_degrades() {
        let usage = ResourceSampler::disabled().sample();
        assert!(usage.is_degraded());
        let json = serde_json::to_value(&usage).unwrap();
        assert!(json["error"].is_string());
    }

    #[test]
    fn test_enabled_sampler_reports_numbers() {
        let usage = ResourceSampler::new(true).sample();
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            assert_eq!(usage, ResourceUsage::unavailable(UNSUPPORTED));
            return;
        }
        let ResourceUsage::Available(map) = usage else {
            panic!("expected resource numbers");
        };
        assert!(map.contains_key("cpu_percent"));
        assert!(map["memory_used_mb"].as_u64().is_some());
    }
}
