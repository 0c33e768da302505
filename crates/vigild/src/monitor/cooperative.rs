//! Cooperative heartbeat monitor.
//!
//! A periodic task inside the scheduler. Each tick it drains the
//! cross-context transition requests, checks heartbeat age against the
//! long threshold, and runs the orderly SAFE_MODE TTL check.
//!
//! Known limitation, stated rather than hidden: if the scheduler
//! itself is monopolized this task cannot run at all. It is the
//! best-effort inner ring; the thread watchdog is the mechanism that
//! survives a total stall.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{debug, error};
use vigil_common::{IncidentId, SystemState};

use crate::heartbeat::HeartbeatSignal;
use crate::introspect::OperationRegistry;
use crate::machine::StateMachine;

pub struct CooperativeMonitor {
    machine: Arc<Mutex<StateMachine>>,
    heartbeat: Arc<HeartbeatSignal>,
    introspector: Arc<OperationRegistry>,
    check_interval: Duration,
    stall_threshold: Duration,
}

impl CooperativeMonitor {
    pub fn new(
        machine: Arc<Mutex<StateMachine>>,
        heartbeat: Arc<HeartbeatSignal>,
        introspector: Arc<OperationRegistry>,
        check_interval: Duration,
        stall_threshold: Duration,
    ) -> Self {
        CooperativeMonitor {
            machine,
            heartbeat,
            introspector,
            check_interval,
            stall_threshold,
        }
    }

    /// Monitor loop. Runs until the shutdown signal flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("cooperative monitor stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One monitor pass. Public so scenario tests can drive it
    /// without the timer.
    pub async fn tick(&self) {
        let mut machine = self.machine.lock().await;

        // Requests posted by the watchdog thread or the guardian are
        // applied here, on the cooperative side, preserving the
        // single-writer ownership of the state machine.
        for record in machine.drain_requests() {
            if record.to == SystemState::SafeMode {
                self.introspector.dump(&record.incident_id, "SAFE_MODE_ENTRY");
            }
        }

        machine.check_safe_mode_ttl();

        if machine.state().is_terminal() {
            return;
        }

        let age = match self.heartbeat.age() {
            Some(age) => age,
            None => return, // no business cycle has run yet
        };
        let stalled = age > self.stall_threshold
            && matches!(machine.state(), SystemState::Running | SystemState::Degraded);
        if !stalled {
            return;
        }

        let incident_id = IncidentId::new("stall");
        error!(
            "LOOP_GUARD_TIMEOUT incident_id={} timeout={:.1} time_since_heartbeat={:.1}",
            incident_id,
            self.stall_threshold.as_secs_f64(),
            age.as_secs_f64()
        );
        self.introspector.dump(&incident_id, "LOOP_GUARD_TIMEOUT");
        let _ = machine.transition_to(
            SystemState::SafeMode,
            "stall_detected",
            "cooperative_monitor",
            Some(incident_id),
            serde_json::json!({ "time_since_heartbeat": age.as_secs_f64() }),
        );
    }
}
