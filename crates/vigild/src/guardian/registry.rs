//! Typed module registry.
//!
//! Modules register once, at process start, with a fixed criticality
//! and timeout budget. The contract is a single bounded-time health
//! check; there are no loose "get instance" callables.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{info, warn};
use vigil_common::{HealthError, ModuleCriticality, ModuleHealthRecord};

pub type HealthFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HealthError>> + Send + 'a>>;

/// Capability contract for anything the guardian watches.
pub trait HealthCheckable: Send + Sync {
    /// Bounded-time health check. The guardian wraps this in the
    /// module's timeout budget; overrunning the budget counts as
    /// failure, never as success.
    fn check_health(&self) -> HealthFuture<'_>;
}

pub(crate) struct ModuleEntry {
    pub record: ModuleHealthRecord,
    pub module: Arc<dyn HealthCheckable>,
    /// Marks this module as a decision authority. The system invariant
    /// requires exactly one to be registered.
    pub decision_authority: bool,
}

#[derive(Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, ModuleEntry>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        ModuleRegistry {
            modules: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        name: &str,
        criticality: ModuleCriticality,
        timeout_budget_secs: f64,
        decision_authority: bool,
        module: Arc<dyn HealthCheckable>,
    ) {
        if self.modules.contains_key(name) {
            warn!("module {} already registered, overwriting", name);
        }
        self.modules.insert(
            name.to_string(),
            ModuleEntry {
                record: ModuleHealthRecord::unchecked(name, criticality, timeout_budget_secs),
                module,
                decision_authority,
            },
        );
        info!(
            "module registered: {} criticality={:?} timeout_budget={}s decision_authority={}",
            name, criticality, timeout_budget_secs, decision_authority
        );
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn record(&self, name: &str) -> Option<&ModuleHealthRecord> {
        self.modules.get(name).map(|e| &e.record)
    }

    pub fn records(&self) -> Vec<ModuleHealthRecord> {
        self.modules.values().map(|e| e.record.clone()).collect()
    }

    pub fn decision_authority_count(&self) -> usize {
        self.modules.values().filter(|e| e.decision_authority).count()
    }

    pub(crate) fn entries_mut(&mut self) -> impl Iterator<Item = &mut ModuleEntry> {
        self.modules.values_mut()
    }
}
