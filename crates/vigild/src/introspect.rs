//! On-demand snapshots of in-flight concurrent operations.
//!
//! The runtime does not expose its task set, so the daemon tracks its
//! own: every long-lived operation is spawned through
//! `OperationRegistry::spawn_tracked`, which registers a snapshot
//! entry and clears it on completion. `dump` serializes the registry
//! at the instant of the call, tagged with the incident id of the
//! triggering event.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;
use vigil_common::IncidentId;

/// Entries kept after completion; older done entries are pruned when
/// the registry grows past this.
const MAX_TRACKED_OPERATIONS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Running,
    Pending,
    Done,
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationStatus::Running => f.write_str("running"),
            OperationStatus::Pending => f.write_str("pending"),
            OperationStatus::Done => f.write_str("done"),
        }
    }
}

/// Point-in-time view of one tracked operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationSnapshot {
    pub id: u64,
    pub label: String,
    pub status: OperationStatus,
    pub spawned_at: DateTime<Utc>,
    pub running_for_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Full dump, produced on demand and never retained beyond the log
/// sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDump {
    pub incident_id: IncidentId,
    pub timestamp: DateTime<Utc>,
    pub total: usize,
    pub operations: Vec<OperationSnapshot>,
}

struct OperationEntry {
    label: String,
    status: OperationStatus,
    spawned_at_wall: DateTime<Utc>,
    spawned_at: Instant,
    last_error: Option<String>,
}

pub struct OperationRegistry {
    next_id: AtomicU64,
    ops: Mutex<HashMap<u64, OperationEntry>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        OperationRegistry {
            next_id: AtomicU64::new(1),
            ops: Mutex::new(HashMap::new()),
        }
    }

    /// Register an operation without spawning it. Used for operations
    /// whose lifecycle is driven elsewhere.
    pub fn register(&self, label: &str) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut ops = self.ops.lock().expect("operation registry poisoned");
        if ops.len() >= MAX_TRACKED_OPERATIONS {
            ops.retain(|_, entry| entry.status != OperationStatus::Done);
        }
        ops.insert(
            id,
            OperationEntry {
                label: label.to_string(),
                status: OperationStatus::Running,
                spawned_at_wall: Utc::now(),
                spawned_at: Instant::now(),
                last_error: None,
            },
        );
        id
    }

    pub fn complete(&self, id: u64) {
        let mut ops = self.ops.lock().expect("operation registry poisoned");
        if let Some(entry) = ops.get_mut(&id) {
            entry.status = OperationStatus::Done;
        }
    }

    pub fn fail(&self, id: u64, error: &str) {
        let mut ops = self.ops.lock().expect("operation registry poisoned");
        if let Some(entry) = ops.get_mut(&id) {
            entry.status = OperationStatus::Done;
            entry.last_error = Some(error.to_string());
        }
    }

    /// Spawn a tracked operation on the runtime. The registry entry is
    /// marked done when the future completes.
    pub fn spawn_tracked<F>(self: &Arc<Self>, label: &str, fut: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let id = self.register(label);
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let out = fut.await;
            registry.complete(id);
            out
        })
    }

    pub fn live_count(&self) -> usize {
        let ops = self.ops.lock().expect("operation registry poisoned");
        ops.values()
            .filter(|e| e.status != OperationStatus::Done)
            .count()
    }

    /// Snapshot every tracked operation and emit the structured dump
    /// events, all correlated by `incident_id`.
    pub fn dump(&self, incident_id: &IncidentId, context: &str) -> TaskDump {
        let ops = self.ops.lock().expect("operation registry poisoned");
        let mut operations: Vec<OperationSnapshot> = ops
            .iter()
            .map(|(id, entry)| OperationSnapshot {
                id: *id,
                label: entry.label.clone(),
                status: entry.status,
                spawned_at: entry.spawned_at_wall,
                running_for_secs: entry.spawned_at.elapsed().as_secs_f64(),
                last_error: entry.last_error.clone(),
            })
            .collect();
        drop(ops);
        operations.sort_by_key(|op| op.id);

        let dump = TaskDump {
            incident_id: incident_id.clone(),
            timestamp: Utc::now(),
            total: operations.len(),
            operations,
        };

        error!(
            "TASK_DUMP_START incident_id={} context={} total_tasks={}",
            incident_id, context, dump.total
        );
        for op in &dump.operations {
            error!(
                "TASK_DUMP_TASK incident_id={} task_id={} task_name={} state={} running_for={:.1}s has_error={}",
                incident_id,
                op.id,
                op.label,
                op.status,
                op.running_for_secs,
                op.last_error.is_some()
            );
        }
        dump
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}
