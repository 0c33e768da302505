//! Control-socket wire protocol.
//!
//! Newline-delimited JSON over a unix socket: one `Request` per line,
//! one `Response` per line back.

use crate::incident::IncidentId;
use crate::state::SystemState;
use serde::{Deserialize, Serialize};

/// Administrative request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    /// Current state machine and heartbeat status.
    Status,
    /// Trigger a chaos injection. Only honored when chaos is enabled
    /// in configuration.
    ChaosInject { chaos_type: String, duration_secs: f64 },
    /// Cancel an active chaos injection.
    ChaosStop,
}

/// Administrative response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
}

impl Response {
    pub fn ok(data: ResponseData) -> Self {
        Response { ok: true, error: None, data: Some(data) }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Response { ok: false, error: Some(message.into()), data: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseData {
    Status(StatusData),
    /// Acknowledges the trigger with the assigned incident id; the
    /// stall begins after this response is written.
    ChaosStarted { incident_id: IncidentId },
    ChaosStopped { was_active: bool },
}

/// Snapshot returned by `Request::Status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusData {
    pub version: String,
    pub state: SystemState,
    pub consecutive_errors: u32,
    pub recovery_cycles: u32,
    pub heartbeat_age_secs: f64,
    pub chaos_active: bool,
}
