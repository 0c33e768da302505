//! Shared types for the vigil failure-containment core.
//!
//! Everything that crosses a boundary lives here: system states and
//! transition records, incident correlation ids, the error taxonomy,
//! the supervisor exit-code contract, module health records, and the
//! control-socket wire protocol.

pub mod error;
pub mod exit;
pub mod health;
pub mod incident;
pub mod ipc;
pub mod state;

pub use error::{Severity, VigilError};
pub use exit::ExitCode;
pub use health::{HealthError, ModuleCriticality, ModuleHealthRecord};
pub use incident::IncidentId;
pub use state::{StateError, SystemState, TransitionRecord, TransitionRequest};
