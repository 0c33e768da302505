//! Module health classification.
//!
//! Every module the guardian watches is registered once with a fixed
//! criticality and timeout budget; the health record itself is
//! refreshed each check cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Criticality is fixed at registration and never changes at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModuleCriticality {
    /// Unhealthy => sensitive operations are denied.
    Critical,
    /// Unhealthy => degraded operation, logged only.
    NonCritical,
}

/// Health check failure. A timeout is a failure; uncertainty never
/// resolves to healthy.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HealthError {
    #[error("module unavailable: {0}")]
    Unavailable(String),

    #[error("health check exceeded {budget_secs}s budget")]
    Timeout { budget_secs: f64 },

    #[error("module data invalid: {0}")]
    Invalid(String),
}

/// Point-in-time health of one registered module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleHealthRecord {
    pub name: String,
    pub criticality: ModuleCriticality,
    /// Seconds the module's health check may take before it is treated
    /// as failed.
    pub timeout_budget_secs: f64,
    pub last_check_time: Option<DateTime<Utc>>,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ModuleHealthRecord {
    /// Record for a module that has not been checked yet. Unchecked is
    /// unhealthy: the guardian denies under uncertainty.
    pub fn unchecked(name: &str, criticality: ModuleCriticality, timeout_budget_secs: f64) -> Self {
        ModuleHealthRecord {
            name: name.to_string(),
            criticality,
            timeout_budget_secs,
            last_check_time: None,
            healthy: false,
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unchecked_is_unhealthy() {
        let rec = ModuleHealthRecord::unchecked("decision_core", ModuleCriticality::Critical, 5.0);
        assert!(!rec.healthy);
        assert!(rec.last_check_time.is_none());
    }

    #[test]
    fn test_criticality_serialization() {
        let json = serde_json::to_string(&ModuleCriticality::NonCritical).unwrap();
        assert_eq!(json, "\"NON_CRITICAL\"");
    }

    #[test]
    fn test_timeout_error_message() {
        let err = HealthError::Timeout { budget_secs: 5.0 };
        assert!(err.to_string().contains("5"));
    }
}
