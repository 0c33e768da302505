//! Process exit-code contract with the external supervisor.
//!
//! The supervisor's restart policy keys off these values, so they are
//! fixed: changing one silently changes restart behavior in the field.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Exit codes consumed by the external process supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitCode {
    /// Graceful shutdown. No restart.
    Success,
    /// Recoverable failure. Supervisor restarts.
    Recoverable,
    /// Critical failure or deadlock. Supervisor restarts.
    Critical,
    /// Configuration error, detected before RUNNING was ever reached.
    /// Restarting would fail identically, so the supervisor must not.
    ConfigError,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::Recoverable => 2,
            ExitCode::Critical => 10,
            ExitCode::ConfigError => 77,
        }
    }

    /// Whether the supervisor is expected to restart the process.
    pub fn restart_expected(self) -> bool {
        matches!(self, ExitCode::Recoverable | ExitCode::Critical)
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExitCode::Success => "SUCCESS",
            ExitCode::Recoverable => "RECOVERABLE",
            ExitCode::Critical => "CRITICAL",
            ExitCode::ConfigError => "CONFIG_ERROR",
        };
        write!(f, "{}({})", name, self.code())
    }
}
