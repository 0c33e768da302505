//! vigild - controlled-failure and recovery daemon core.
//!
//! The daemon wraps a repeating business cycle in a layered failure
//! posture: a guarded state machine, two independent stall monitors,
//! a fail-closed decision guardian, and deterministic chaos injection
//! to prove the whole stack detects real pathologies.

pub mod chaos;
pub mod config;
pub mod context;
pub mod control;
pub mod daemon;
pub mod guardian;
pub mod heartbeat;
pub mod introspect;
pub mod machine;
pub mod monitor;
pub mod supervision;

pub use context::DaemonContext;
pub use daemon::{BusinessCycle, CycleFuture, IdleCycle};
