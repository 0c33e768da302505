//! System state machine types.
//!
//! Five explicit states replace the boolean safe-mode flag the system
//! grew up with. Transitions are validated against a fixed guard table;
//! FATAL is terminal and SAFE_MODE is never allowed to be.

use crate::incident::IncidentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// System state. Mutated only through the state machine's transition
/// API; everyone else gets a read-only view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemState {
    /// Normal operation.
    Running,
    /// Errors accumulating, but actions still permitted.
    Degraded,
    /// Actions blocked; recovery cycles or the TTL decide what is next.
    SafeMode,
    /// Consecutive successful recovery cycles observed; probing a
    /// return to normal operation.
    Recovering,
    /// Terminal. The process must exit; only a restart clears it.
    Fatal,
}

impl SystemState {
    /// Guard table. A transition not listed here is a caller bug and
    /// is rejected without mutating state.
    pub fn can_transition_to(self, to: SystemState) -> bool {
        use SystemState::*;
        match self {
            Running => matches!(to, Degraded | SafeMode | Fatal),
            Degraded => matches!(to, Running | SafeMode | Fatal),
            SafeMode => matches!(to, Recovering | Fatal),
            Recovering => matches!(to, Running | SafeMode | Fatal),
            Fatal => false,
        }
    }

    /// Terminal states have no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, SystemState::Fatal)
    }

    /// Sensitive operations are only permitted in RUNNING.
    pub fn actions_permitted(self) -> bool {
        matches!(self, SystemState::Running)
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SystemState::Running => "RUNNING",
            SystemState::Degraded => "DEGRADED",
            SystemState::SafeMode => "SAFE_MODE",
            SystemState::Recovering => "RECOVERING",
            SystemState::Fatal => "FATAL",
        };
        f.write_str(s)
    }
}

/// Immutable record of one applied transition. Appended to the
/// structured log and to the in-memory history; never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: SystemState,
    pub to: SystemState,
    pub reason: String,
    /// Component that initiated the transition, e.g. `thread_watchdog`.
    pub owner: String,
    pub incident_id: IncidentId,
    pub timestamp: DateTime<Utc>,
    /// Seconds spent in `from` before this transition.
    pub duration_in_previous_state: Option<f64>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

/// Cross-context transition request.
///
/// The thread watchdog and the guardian never touch the state machine
/// directly; they post one of these onto the handoff channel and the
/// cooperative side applies it on its own turn.
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub target: SystemState,
    pub reason: String,
    pub owner: String,
    pub incident_id: IncidentId,
}

/// Errors produced by the transition API. Rejections are returned,
/// never thrown past the caller.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("transition denied: {from} -> {to} is not in the guard table")]
    TransitionDenied { from: SystemState, to: SystemState },

    #[error("transition refused: {from} is terminal")]
    Terminal { from: SystemState },

    #[error("transition refused: shutdown in progress")]
    ShutdownInProgress,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_is_terminal() {
        for to in [
            SystemState::Running,
            SystemState::Degraded,
            SystemState::SafeMode,
            SystemState::Recovering,
            SystemState::Fatal,
        ] {
            assert!(!SystemState::Fatal.can_transition_to(to));
        }
        assert!(SystemState::Fatal.is_terminal());
    }

    #[test]
    fn test_running_cannot_jump_to_recovering() {
        assert!(!SystemState::Running.can_transition_to(SystemState::Recovering));
    }

    #[test]
    fn test_safe_mode_only_recovers_or_dies() {
        assert!(SystemState::SafeMode.can_transition_to(SystemState::Recovering));
        assert!(SystemState::SafeMode.can_transition_to(SystemState::Fatal));
        assert!(!SystemState::SafeMode.can_transition_to(SystemState::Running));
        assert!(!SystemState::SafeMode.can_transition_to(SystemState::Degraded));
    }

    #[test]
    fn test_every_non_terminal_state_can_reach_fatal() {
        for from in [
            SystemState::Running,
            SystemState::Degraded,
            SystemState::SafeMode,
            SystemState::Recovering,
        ] {
            assert!(from.can_transition_to(SystemState::Fatal));
        }
    }

    #[test]
    fn test_display_matches_log_contract() {
        assert_eq!(SystemState::SafeMode.to_string(), "SAFE_MODE");
        assert_eq!(SystemState::Running.to_string(), "RUNNING");
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&SystemState::SafeMode).unwrap();
        assert_eq!(json, "\"SAFE_MODE\"");
        let back: SystemState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, SystemState::SafeMode);
    }
}
