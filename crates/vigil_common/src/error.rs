//! Error taxonomy.
//!
//! The taxonomy mirrors how faults propagate: configuration errors
//! fail before RUNNING is reached, recoverable faults accumulate
//! toward DEGRADED / SAFE_MODE, unrecoverable faults drive FATAL, and
//! invariant violations either force SAFE_MODE (CRITICAL) or are
//! logged (WARNING) but never dropped.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Invariant violation severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// Forces SAFE_MODE immediately.
    Critical,
    /// Logged and surfaced, operation continues.
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Critical => f.write_str("CRITICAL"),
            Severity::Warning => f.write_str("WARNING"),
        }
    }
}

/// Top-level fault taxonomy.
#[derive(Debug, Error)]
pub enum VigilError {
    /// Fatal before startup completes; exit 77, no restart, never
    /// entered into the state machine.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Transient fault; drives the DEGRADED/SAFE_MODE error counters.
    #[error("recoverable fault: {0}")]
    Recoverable(String),

    /// Drives directly to FATAL.
    #[error("unrecoverable fault: {0}")]
    Unrecoverable(String),

    /// Named invariant did not hold.
    #[error("invariant violation [{severity}] {invariant}: {message}")]
    Invariant {
        invariant: &'static str,
        severity: Severity,
        message: String,
    },

    /// Heartbeat went stale. Two independent sources funnel into the
    /// same SAFE_MODE path, distinguished only by `owner`.
    #[error("watchdog timeout ({owner}): {stalled_for_secs:.1}s since last heartbeat")]
    WatchdogTimeout { owner: String, stalled_for_secs: f64 },
}

impl VigilError {
    /// Whether this fault should drive the system straight to FATAL.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, VigilError::Unrecoverable(_))
    }
}
