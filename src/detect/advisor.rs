//! Remediation hints attached to each anomaly.

use std::collections::HashMap;

use crate::detect::sample::{ACTIVE_REQUESTS, AVG_RESPONSE_TIME_1MIN};
use crate::detect::Severity;

pub const CRITICAL_ESCALATION: &str = "Investigate immediately - critical system issue detected";

/// Maps (metric, severity) to an ordered list of suggested actions.
///
/// Total over its inputs: a metric without a playbook entry gets no
/// metric-specific actions, which is a valid outcome.
#[derive(Debug, Clone)]
pub struct ActionAdvisor {
    playbook: HashMap<String, Vec<String>>,
    critical_escalation: Option<String>,
}

impl Default for ActionAdvisor {
    fn default() -> Self {
        Self::new(default_playbook(), Some(CRITICAL_ESCALATION.to_string()))
    }
}

impl ActionAdvisor {
    pub fn new(playbook: HashMap<String, Vec<String>>, critical_escalation: Option<String>) -> Self {
        Self {
            playbook,
            critical_escalation: critical_escalation.filter(|s| !s.trim().is_empty()),
        }
    }

    pub fn advise(&self, metric: &str, severity: Severity) -> Vec<String> {
        let mut actions = self.playbook.get(metric).cloned().unwrap_or_default();
        if severity == Severity::Critical {
            if let Some(escalation) = &self.critical_escalation {
                actions.push(escalation.clone());
            }
        }
        actions
    }
}

pub fn default_playbook() -> HashMap<String, Vec<String>> {
    let entries: [(&str, &[&str]); 3] = [
        (
            AVG_RESPONSE_TIME_1MIN,
            &[
                "Check for slow upstream services or database queries",
                "Review recent code changes that might affect performance",
            ],
        ),
        (
            ACTIVE_REQUESTS,
            &[
                "Check for stuck or long-running requests",
                "Consider scaling out request workers",
            ],
        ),
        (
            "error_rate_1min",
            &[
                "Inspect recent error logs for failing endpoints",
                "Check health of downstream dependencies",
            ],
        ),
    ];

    entries
        .into_iter()
        .map(|(metric, actions)| {
            (
                metric.to_string(),
                actions.iter().map(|a| a.to_string()).collect(),
            )
        })
        .collect()
}
