//! Fail-closed guardian over business decisions.
//!
//! Every decision cycle asks `can_proceed()` first. The guardian
//! denies unless it can positively establish that the system is in
//! RUNNING, every critical module answered a bounded-time health check,
//! and the core invariants hold. Timeouts, check errors and panicked
//! probes all read as unhealthy; there is no path where uncertainty
//! permits a decision.

pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};
use vigil_common::{
    HealthError, IncidentId, ModuleCriticality, Severity, SystemState, TransitionRequest,
};

use crate::introspect::OperationRegistry;
use crate::machine::StateView;

pub use registry::{HealthCheckable, HealthFuture, ModuleRegistry};

/// A broken invariant, attributed to the module that broke it.
#[derive(Debug, Clone)]
pub struct Violation {
    pub invariant: &'static str,
    pub severity: Severity,
    pub message: String,
    pub module: Option<String>,
}

/// Outcome of one `can_proceed()` evaluation.
#[derive(Debug, Clone)]
pub struct Decision {
    pub allowed: bool,
    pub reason: String,
    pub blocked_by: Vec<String>,
    pub violations: Vec<Violation>,
}

impl Decision {
    fn allow() -> Self {
        Decision {
            allowed: true,
            reason: "all checks passed".to_string(),
            blocked_by: Vec::new(),
            violations: Vec::new(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Decision {
            allowed: false,
            reason: reason.into(),
            blocked_by: Vec::new(),
            violations: Vec::new(),
        }
    }
}

pub struct Guardian {
    view: StateView,
    registry: Mutex<ModuleRegistry>,
    requests: mpsc::Sender<TransitionRequest>,
    introspector: Arc<OperationRegistry>,
}

impl Guardian {
    pub fn new(
        view: StateView,
        registry: ModuleRegistry,
        requests: mpsc::Sender<TransitionRequest>,
        introspector: Arc<OperationRegistry>,
    ) -> Self {
        Guardian {
            view,
            registry: Mutex::new(registry),
            requests,
            introspector,
        }
    }

    pub async fn module_records(&self) -> Vec<vigil_common::ModuleHealthRecord> {
        self.registry.lock().await.records()
    }

    /// Gate one business decision. Denies on anything short of a fully
    /// healthy RUNNING system; a critical violation additionally
    /// escalates to SAFE_MODE through the transition request channel.
    pub async fn can_proceed(&self) -> Decision {
        let state = self.view.state();
        if state != SystemState::Running {
            let decision = Decision::deny(format!("system state is {}, decisions require RUNNING", state));
            info!("GUARDIAN_DENIED reason={}", decision.reason);
            return decision;
        }

        let mut blocked_by = Vec::new();
        let mut violations = Vec::new();

        {
            let mut registry = self.registry.lock().await;
            for entry in registry.entries_mut() {
                let budget = Duration::from_secs_f64(entry.record.timeout_budget_secs);
                let result = run_bounded_check(entry.module.as_ref(), budget).await;
                entry.record.last_check_time = Some(Utc::now());
                match result {
                    Ok(()) => {
                        entry.record.healthy = true;
                        entry.record.last_error = None;
                    }
                    Err(err) => {
                        entry.record.healthy = false;
                        entry.record.last_error = Some(err.to_string());
                        if entry.record.criticality == ModuleCriticality::Critical {
                            blocked_by.push(entry.record.name.clone());
                            violations.push(Violation {
                                invariant: "critical_module_available",
                                severity: Severity::Critical,
                                message: format!(
                                    "critical module {} failed health check: {}",
                                    entry.record.name, err
                                ),
                                module: Some(entry.record.name.clone()),
                            });
                        } else {
                            warn!(
                                "GUARDIAN non-critical module {} unhealthy: {}",
                                entry.record.name, err
                            );
                        }
                    }
                }
            }

            let authorities = registry.decision_authority_count();
            if authorities != 1 {
                violations.push(Violation {
                    invariant: "single_decision_authority",
                    severity: Severity::Critical,
                    message: format!("expected exactly one decision authority, found {}", authorities),
                    module: None,
                });
            }
        }

        // The SAFE_MODE entry marker must be clear whenever the state
        // reads RUNNING; a stale marker means the two views diverged.
        if self.view.state() == SystemState::Running && self.view.safe_mode_elapsed().is_some() {
            violations.push(Violation {
                invariant: "safe_mode_marker_consistent",
                severity: Severity::Critical,
                message: "SAFE_MODE entry marker set while state reads RUNNING".to_string(),
                module: None,
            });
        }

        let critical = violations.iter().any(|v| v.severity == Severity::Critical);
        if critical {
            self.escalate(&violations).await;
            let reason = violations
                .iter()
                .map(|v| v.invariant)
                .collect::<Vec<_>>()
                .join(", ");
            let mut decision = Decision::deny(format!("invariant violations: {}", reason));
            decision.blocked_by = blocked_by;
            decision.violations = violations;
            return decision;
        }

        Decision::allow()
    }

    async fn escalate(&self, violations: &[Violation]) {
        let incident_id = IncidentId::new("guardian");
        for v in violations {
            error!(
                "INVARIANT_VIOLATION incident_id={} invariant={} severity={} module={} message={}",
                incident_id,
                v.invariant,
                v.severity,
                v.module.as_deref().unwrap_or("-"),
                v.message
            );
        }
        self.introspector.dump(&incident_id, "INVARIANT_VIOLATION");
        let req = TransitionRequest {
            target: SystemState::SafeMode,
            reason: "guardian invariant violation".to_string(),
            owner: "guardian".to_string(),
            incident_id,
        };
        if let Err(err) = self.requests.try_send(req) {
            // The cooperative side has stopped draining. The thread
            // watchdog owns escalation past this point.
            error!("GUARDIAN escalation handoff failed: {}", err);
        }
    }
}

/// Run one health check under its timeout budget. A check that
/// overruns its budget fails with `HealthError::Timeout`.
async fn run_bounded_check(
    module: &dyn HealthCheckable,
    budget: Duration,
) -> Result<(), HealthError> {
    match tokio::time::timeout(budget, module.check_health()).await {
        Ok(result) => result,
        Err(_) => Err(HealthError::Timeout {
            budget_secs: budget.as_secs_f64(),
        }),
    }
}
