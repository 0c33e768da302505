//! Daemon wiring.
//!
//! Everything long-lived is constructed once, here, before the run
//! loop starts: the state machine and its view, the heartbeat, the
//! operation registry, the chaos injector and the guardian. The
//! construction order matters only in one place: the watchdog thread
//! is created later, by the run loop, after the handoff channel
//! already exists.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use vigil_common::TransitionRequest;

use crate::chaos::ChaosInjector;
use crate::config::DaemonConfig;
use crate::guardian::{Guardian, ModuleRegistry};
use crate::heartbeat::HeartbeatSignal;
use crate::introspect::OperationRegistry;
use crate::machine::{StateMachine, StateView};
use crate::supervision::SupervisionAdapter;

pub struct DaemonContext {
    pub config: DaemonConfig,
    pub heartbeat: Arc<HeartbeatSignal>,
    pub machine: Arc<Mutex<StateMachine>>,
    pub view: StateView,
    pub requests: mpsc::Sender<TransitionRequest>,
    pub introspector: Arc<OperationRegistry>,
    pub chaos: Arc<ChaosInjector>,
    pub guardian: Arc<Guardian>,
    pub supervision: Arc<SupervisionAdapter>,
}

impl DaemonContext {
    pub fn build(
        config: DaemonConfig,
        modules: ModuleRegistry,
        supervision: SupervisionAdapter,
    ) -> Self {
        let (machine, view, requests) = StateMachine::new(config.thresholds());
        let introspector = Arc::new(OperationRegistry::new());
        let chaos = Arc::new(ChaosInjector::new(
            config.chaos.enabled,
            Duration::from_secs_f64(config.chaos.max_duration_secs),
            Arc::clone(&introspector),
        ));
        let guardian = Arc::new(Guardian::new(
            view.clone(),
            modules,
            requests.clone(),
            Arc::clone(&introspector),
        ));
        DaemonContext {
            config,
            heartbeat: Arc::new(HeartbeatSignal::new()),
            machine: Arc::new(Mutex::new(machine)),
            view,
            requests,
            introspector,
            chaos,
            guardian,
            supervision: Arc::new(supervision),
        }
    }
}
