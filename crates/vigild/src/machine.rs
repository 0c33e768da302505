//! The system state machine: sole authority over system state.
//!
//! Ownership is strictly single-writer. The `StateMachine` lives on
//! the cooperative side and is the only component that mutates state.
//! Other execution contexts get two things:
//!
//! - a `StateView`: lock-free read-only handle backed by atomics,
//!   safe to poll from the watchdog thread;
//! - a `TransitionRequest` sender: a bounded handoff channel whose
//!   receiver is drained by the cooperative side each tick.
//!
//! Sustained failure to deliver requests (a saturated channel) means
//! the cooperative side has stopped draining, which the sender treats
//! as an event-delivery failure and escalates.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use vigil_common::{IncidentId, StateError, SystemState, TransitionRecord, TransitionRequest};

/// Capacity of the cross-context handoff channel.
pub const REQUEST_CHANNEL_CAPACITY: usize = 8;

/// Transitions kept in the in-memory history.
const MAX_TRANSITION_HISTORY: usize = 100;

fn state_to_u8(state: SystemState) -> u8 {
    match state {
        SystemState::Running => 0,
        SystemState::Degraded => 1,
        SystemState::SafeMode => 2,
        SystemState::Recovering => 3,
        SystemState::Fatal => 4,
    }
}

fn u8_to_state(raw: u8) -> SystemState {
    match raw {
        0 => SystemState::Running,
        1 => SystemState::Degraded,
        2 => SystemState::SafeMode,
        3 => SystemState::Recovering,
        // Unknown encodings read as FATAL: fail closed.
        _ => SystemState::Fatal,
    }
}

struct ViewInner {
    anchor: Instant,
    state: AtomicU8,
    /// Millis since anchor when SAFE_MODE was entered, plus one.
    /// Zero means "not in SAFE_MODE".
    safe_mode_entered_ms: AtomicU64,
    consecutive_errors: AtomicU32,
    recovery_cycles: AtomicU32,
    shutdown: AtomicBool,
}

/// Read-only view of the state machine.
///
/// Cheap to clone, safe to read from any thread. Writes happen only
/// inside `StateMachine`.
#[derive(Clone)]
pub struct StateView {
    inner: Arc<ViewInner>,
}

impl StateView {
    pub fn state(&self) -> SystemState {
        u8_to_state(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn is_fatal(&self) -> bool {
        self.state() == SystemState::Fatal
    }

    pub fn is_safe_mode(&self) -> bool {
        self.state() == SystemState::SafeMode
    }

    /// Time spent in SAFE_MODE so far, timed on this reader's clock.
    /// `None` when not in SAFE_MODE.
    pub fn safe_mode_elapsed(&self) -> Option<Duration> {
        let raw = self.inner.safe_mode_entered_ms.load(Ordering::SeqCst);
        if raw == 0 {
            return None;
        }
        let entered_ms = raw - 1;
        let now_ms = self.inner.anchor.elapsed().as_millis() as u64;
        Some(Duration::from_millis(now_ms.saturating_sub(entered_ms)))
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.inner.consecutive_errors.load(Ordering::SeqCst)
    }

    pub fn recovery_cycles(&self) -> u32 {
        self.inner.recovery_cycles.load(Ordering::SeqCst)
    }

    pub fn shutdown_started(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }
}

/// Thresholds driving automatic transitions. Taken from configuration
/// at startup; fixed for process lifetime.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    /// consecutive_errors >= warn  => RUNNING -> DEGRADED
    pub warn_errors: u32,
    /// consecutive_errors >= critical => -> SAFE_MODE
    pub critical_errors: u32,
    /// Consecutive successful recovery cycles required per step.
    pub recovery_cycles: u32,
    /// Maximum time in SAFE_MODE before FATAL.
    pub safe_mode_ttl: Duration,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            warn_errors: 3,
            critical_errors: 5,
            recovery_cycles: 3,
            safe_mode_ttl: Duration::from_secs(600),
        }
    }
}

pub struct StateMachine {
    state: SystemState,
    view: StateView,
    thresholds: Thresholds,
    consecutive_errors: u32,
    recovery_cycles: u32,
    state_entered_at: Instant,
    transitions: VecDeque<TransitionRecord>,
    requests: mpsc::Receiver<TransitionRequest>,
    shutdown_started: bool,
}

impl StateMachine {
    /// Create the machine in RUNNING, together with its read-only view
    /// and the sender end of the cross-context handoff channel.
    pub fn new(thresholds: Thresholds) -> (Self, StateView, mpsc::Sender<TransitionRequest>) {
        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let view = StateView {
            inner: Arc::new(ViewInner {
                anchor: Instant::now(),
                state: AtomicU8::new(state_to_u8(SystemState::Running)),
                safe_mode_entered_ms: AtomicU64::new(0),
                consecutive_errors: AtomicU32::new(0),
                recovery_cycles: AtomicU32::new(0),
                shutdown: AtomicBool::new(false),
            }),
        };
        let machine = StateMachine {
            state: SystemState::Running,
            view: view.clone(),
            thresholds,
            consecutive_errors: 0,
            recovery_cycles: 0,
            state_entered_at: Instant::now(),
            transitions: VecDeque::new(),
            requests: rx,
            shutdown_started: false,
        };
        (machine, view, tx)
    }

    pub fn state(&self) -> SystemState {
        self.state
    }

    pub fn view(&self) -> StateView {
        self.view.clone()
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn recovery_cycles(&self) -> u32 {
        self.recovery_cycles
    }

    pub fn transitions(&self) -> impl Iterator<Item = &TransitionRecord> {
        self.transitions.iter()
    }

    pub fn last_transition(&self) -> Option<&TransitionRecord> {
        self.transitions.back()
    }

    /// Request a state transition. Validates against the guard table;
    /// a rejected request logs, returns an error and mutates nothing.
    pub fn transition_to(
        &mut self,
        target: SystemState,
        reason: &str,
        owner: &str,
        incident_id: Option<IncidentId>,
        metadata: serde_json::Value,
    ) -> Result<TransitionRecord, StateError> {
        if self.shutdown_started {
            warn!(
                "STATE_TRANSITION_BLOCKED from={} to={} owner={} reason=shutdown_in_progress",
                self.state, target, owner
            );
            return Err(StateError::ShutdownInProgress);
        }
        if self.state.is_terminal() {
            error!(
                "STATE_TRANSITION_BLOCKED from={} to={} owner={} reason=terminal_state",
                self.state, target, owner
            );
            return Err(StateError::Terminal { from: self.state });
        }
        if !self.state.can_transition_to(target) {
            warn!(
                "STATE_TRANSITION_DENIED from={} to={} reason={} owner={}",
                self.state, target, reason, owner
            );
            return Err(StateError::TransitionDenied {
                from: self.state,
                to: target,
            });
        }

        let from = self.state;
        let duration = self.state_entered_at.elapsed().as_secs_f64();
        let incident_id = incident_id.unwrap_or_else(|| IncidentId::new("state"));

        self.state = target;
        self.state_entered_at = Instant::now();
        self.view.inner.state.store(state_to_u8(target), Ordering::SeqCst);

        // SAFE_MODE bookkeeping: the entry timestamp is what the
        // watchdog thread times the TTL against.
        if target == SystemState::SafeMode {
            let ms = self.view.inner.anchor.elapsed().as_millis() as u64;
            self.view.inner.safe_mode_entered_ms.store(ms + 1, Ordering::SeqCst);
            self.set_recovery_cycles(0);
        } else if from == SystemState::SafeMode {
            self.view.inner.safe_mode_entered_ms.store(0, Ordering::SeqCst);
        }
        if target == SystemState::Recovering {
            self.set_recovery_cycles(0);
        }

        let record = TransitionRecord {
            from,
            to: target,
            reason: reason.to_string(),
            owner: owner.to_string(),
            incident_id: incident_id.clone(),
            timestamp: Utc::now(),
            duration_in_previous_state: Some(duration),
            metadata,
        };
        self.transitions.push_back(record.clone());
        while self.transitions.len() > MAX_TRANSITION_HISTORY {
            self.transitions.pop_front();
        }

        let line = format!(
            "STATE_TRANSITION incident_id={} from={} to={} reason={} owner={} duration_in_old_state={:.1}",
            incident_id, from, target, reason, owner, duration
        );
        match target {
            SystemState::SafeMode | SystemState::Fatal => error!("{}", line),
            _ => info!("{}", line),
        }

        Ok(record)
    }

    /// Record one failed business cycle. Crossing the documented
    /// thresholds drives RUNNING -> DEGRADED -> SAFE_MODE.
    pub fn record_error(&mut self, last_error: &str) {
        self.set_consecutive_errors(self.consecutive_errors + 1);
        let errors = self.consecutive_errors;

        if errors >= self.thresholds.critical_errors
            && matches!(self.state, SystemState::Running | SystemState::Degraded)
        {
            let reason = format!(
                "consecutive_errors >= {} (current: {})",
                self.thresholds.critical_errors, errors
            );
            let _ = self.transition_to(
                SystemState::SafeMode,
                &reason,
                "error_handler",
                None,
                serde_json::json!({ "error_count": errors, "last_error": last_error }),
            );
        } else if errors >= self.thresholds.warn_errors && self.state == SystemState::Running {
            let reason = format!(
                "consecutive_errors >= {} (current: {})",
                self.thresholds.warn_errors, errors
            );
            let _ = self.transition_to(
                SystemState::Degraded,
                &reason,
                "error_handler",
                None,
                serde_json::json!({ "error_count": errors, "last_error": last_error }),
            );
        }
    }

    /// Record one clean business cycle: resets the error counter and
    /// returns DEGRADED to RUNNING.
    pub fn reset_errors(&mut self) {
        if self.consecutive_errors == 0 {
            return;
        }
        let was = self.consecutive_errors;
        self.set_consecutive_errors(0);
        if self.state == SystemState::Degraded {
            let reason = format!("errors reset after clean cycle (was {})", was);
            let _ = self.transition_to(
                SystemState::Running,
                &reason,
                "recovery_mechanism",
                None,
                serde_json::Value::Null,
            );
        }
    }

    /// Record one recovery cycle while in SAFE_MODE or RECOVERING.
    ///
    /// Enough consecutive successes climb SAFE_MODE -> RECOVERING ->
    /// RUNNING; a failure resets the counter and drops RECOVERING back
    /// to SAFE_MODE. Returns true when a climb happened.
    pub fn record_recovery_cycle(&mut self, success: bool) -> bool {
        if !matches!(self.state, SystemState::SafeMode | SystemState::Recovering) {
            return false;
        }

        if !success {
            if self.recovery_cycles > 0 {
                warn!(
                    "RECOVERY_CYCLE_FAILED state={} recovery_cycles={} resetting counter",
                    self.state, self.recovery_cycles
                );
                self.set_recovery_cycles(0);
            }
            if self.state == SystemState::Recovering {
                let _ = self.transition_to(
                    SystemState::SafeMode,
                    "recovery cycle failed",
                    "recovery_mechanism",
                    None,
                    serde_json::Value::Null,
                );
            }
            return false;
        }

        self.set_recovery_cycles(self.recovery_cycles + 1);
        info!(
            "RECOVERY_CYCLE_SUCCESS recovery_cycles={} state={}",
            self.recovery_cycles, self.state
        );

        let needed = self.thresholds.recovery_cycles;
        if self.state == SystemState::SafeMode && self.recovery_cycles >= needed {
            let reason = format!("recovery_cycles >= {} (current: {})", needed, self.recovery_cycles);
            return self
                .transition_to(
                    SystemState::Recovering,
                    &reason,
                    "recovery_mechanism",
                    None,
                    serde_json::Value::Null,
                )
                .is_ok();
        }
        if self.state == SystemState::Recovering && self.recovery_cycles >= needed {
            let reason = format!("recovery completed (cycles: {})", self.recovery_cycles);
            return self
                .transition_to(
                    SystemState::Running,
                    &reason,
                    "recovery_mechanism",
                    None,
                    serde_json::Value::Null,
                )
                .is_ok();
        }
        false
    }

    /// Apply every queued cross-context transition request. Returns
    /// the records actually applied so the caller can trigger task
    /// dumps for watchdog-driven SAFE_MODE entries.
    pub fn drain_requests(&mut self) -> Vec<TransitionRecord> {
        let mut applied = Vec::new();
        loop {
            let req = match self.requests.try_recv() {
                Ok(req) => req,
                Err(_) => break,
            };
            match self.transition_to(
                req.target,
                &req.reason,
                &req.owner,
                Some(req.incident_id),
                serde_json::Value::Null,
            ) {
                Ok(record) => applied.push(record),
                // Already reported by transition_to; a stale request
                // (e.g. SAFE_MODE requested twice) is not an error.
                Err(_) => {}
            }
        }
        applied
    }

    /// Cooperative-side TTL check. The watchdog thread enforces the
    /// same TTL independently with process termination; this path is
    /// the orderly one.
    pub fn check_safe_mode_ttl(&mut self) -> bool {
        if self.state != SystemState::SafeMode {
            return false;
        }
        let elapsed = match self.view.safe_mode_elapsed() {
            Some(elapsed) => elapsed,
            None => return false,
        };
        if elapsed < self.thresholds.safe_mode_ttl {
            return false;
        }
        let reason = format!(
            "SAFE_MODE TTL expired (duration: {:.1}s, limit: {:.1}s)",
            elapsed.as_secs_f64(),
            self.thresholds.safe_mode_ttl.as_secs_f64()
        );
        self.transition_to(
            SystemState::Fatal,
            &reason,
            "safe_mode_ttl_guard",
            None,
            serde_json::Value::Null,
        )
        .is_ok()
    }

    /// After shutdown begins every transition request is refused.
    pub fn mark_shutdown_started(&mut self) {
        self.shutdown_started = true;
        self.view.inner.shutdown.store(true, Ordering::SeqCst);
        info!("STATE_MACHINE shutdown started, transitions disabled");
    }

    fn set_consecutive_errors(&mut self, value: u32) {
        self.consecutive_errors = value;
        self.view.inner.consecutive_errors.store(value, Ordering::SeqCst);
    }

    fn set_recovery_cycles(&mut self, value: u32) {
        self.recovery_cycles = value;
        self.view.inner.recovery_cycles.store(value, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> (StateMachine, StateView, mpsc::Sender<TransitionRequest>) {
        StateMachine::new(Thresholds::default())
    }

    #[test]
    fn test_starts_running() {
        let (m, view, _tx) = machine();
        assert_eq!(m.state(), SystemState::Running);
        assert_eq!(view.state(), SystemState::Running);
    }

    #[test]
    fn test_error_thresholds_drive_degraded_then_safe_mode() {
        let (mut m, _view, _tx) = machine();
        m.record_error("boom");
        m.record_error("boom");
        assert_eq!(m.state(), SystemState::Running);
        m.record_error("boom");
        assert_eq!(m.state(), SystemState::Degraded);
        m.record_error("boom");
        assert_eq!(m.state(), SystemState::Degraded);
        m.record_error("boom");
        assert_eq!(m.state(), SystemState::SafeMode);
    }

    #[test]
    fn test_running_never_jumps_to_safe_mode_on_errors() {
        // The first threshold crossed is always the warn one, so the
        // machine passes through DEGRADED on every error-driven path.
        let (mut m, _view, _tx) = machine();
        for _ in 0..10 {
            m.record_error("x");
            if m.state() == SystemState::SafeMode {
                break;
            }
        }
        let reached: Vec<SystemState> = m.transitions().map(|t| t.to).collect();
        assert_eq!(reached, vec![SystemState::Degraded, SystemState::SafeMode]);
    }

    #[test]
    fn test_clean_cycle_returns_degraded_to_running() {
        let (mut m, _view, _tx) = machine();
        m.record_error("a");
        m.record_error("b");
        m.record_error("c");
        assert_eq!(m.state(), SystemState::Degraded);
        m.reset_errors();
        assert_eq!(m.state(), SystemState::Running);
        assert_eq!(m.consecutive_errors(), 0);
    }

    #[test]
    fn test_recovery_ladder() {
        let (mut m, _view, _tx) = machine();
        for _ in 0..5 {
            m.record_error("x");
        }
        assert_eq!(m.state(), SystemState::SafeMode);

        for _ in 0..3 {
            m.record_recovery_cycle(true);
        }
        assert_eq!(m.state(), SystemState::Recovering);

        for _ in 0..3 {
            m.record_recovery_cycle(true);
        }
        assert_eq!(m.state(), SystemState::Running);
    }

    #[test]
    fn test_failed_recovery_cycle_drops_back_to_safe_mode() {
        let (mut m, _view, _tx) = machine();
        for _ in 0..5 {
            m.record_error("x");
        }
        for _ in 0..3 {
            m.record_recovery_cycle(true);
        }
        assert_eq!(m.state(), SystemState::Recovering);
        m.record_recovery_cycle(false);
        assert_eq!(m.state(), SystemState::SafeMode);
        assert_eq!(m.recovery_cycles(), 0);
    }

    #[test]
    fn test_fatal_is_immutable() {
        let (mut m, view, _tx) = machine();
        m.transition_to(SystemState::Fatal, "corruption", "test", None, serde_json::Value::Null)
            .unwrap();
        assert!(view.is_fatal());
        let err = m
            .transition_to(SystemState::Running, "nope", "test", None, serde_json::Value::Null)
            .unwrap_err();
        assert_eq!(err, StateError::Terminal { from: SystemState::Fatal });
        assert_eq!(m.state(), SystemState::Fatal);
    }

    #[test]
    fn test_invalid_transition_rejected_without_mutation() {
        let (mut m, _view, _tx) = machine();
        let err = m
            .transition_to(SystemState::Recovering, "bad", "test", None, serde_json::Value::Null)
            .unwrap_err();
        assert!(matches!(err, StateError::TransitionDenied { .. }));
        assert_eq!(m.state(), SystemState::Running);
        assert_eq!(m.transitions().count(), 0);
    }

    #[test]
    fn test_drain_applies_watchdog_request() {
        let (mut m, _view, tx) = machine();
        tx.try_send(TransitionRequest {
            target: SystemState::SafeMode,
            reason: "stall_detected".to_string(),
            owner: "thread_watchdog".to_string(),
            incident_id: IncidentId::new("stall"),
        })
        .unwrap();
        let applied = m.drain_requests();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].owner, "thread_watchdog");
        assert_eq!(m.state(), SystemState::SafeMode);
    }

    #[test]
    fn test_safe_mode_ttl_expiry_goes_fatal() {
        let thresholds = Thresholds {
            safe_mode_ttl: Duration::from_millis(30),
            ..Thresholds::default()
        };
        let (mut m, _view, _tx) = StateMachine::new(thresholds);
        m.transition_to(SystemState::SafeMode, "stall", "test", None, serde_json::Value::Null)
            .unwrap();
        assert!(!m.check_safe_mode_ttl());
        std::thread::sleep(Duration::from_millis(40));
        assert!(m.check_safe_mode_ttl());
        assert_eq!(m.state(), SystemState::Fatal);
    }

    #[test]
    fn test_no_transitions_after_shutdown() {
        let (mut m, _view, _tx) = machine();
        m.mark_shutdown_started();
        let err = m
            .transition_to(SystemState::Degraded, "late", "test", None, serde_json::Value::Null)
            .unwrap_err();
        assert_eq!(err, StateError::ShutdownInProgress);
    }

    #[test]
    fn test_view_mirrors_counters() {
        let (mut m, view, _tx) = machine();
        m.record_error("x");
        m.record_error("x");
        assert_eq!(view.consecutive_errors(), 2);
        m.reset_errors();
        assert_eq!(view.consecutive_errors(), 0);
    }

    #[test]
    fn test_safe_mode_elapsed_visible_to_view() {
        let (mut m, view, _tx) = machine();
        assert!(view.safe_mode_elapsed().is_none());
        m.transition_to(SystemState::SafeMode, "stall", "test", None, serde_json::Value::Null)
            .unwrap();
        std::thread::sleep(Duration::from_millis(15));
        assert!(view.safe_mode_elapsed().unwrap() >= Duration::from_millis(10));
    }
}
