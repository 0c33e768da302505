//! Daemon run loop.
//!
//! Drives the business cycle on a heartbeat cadence and wires the two
//! monitoring rings around it: the cooperative monitor inside the
//! scheduler and the thread watchdog outside it. The loop itself is
//! the heartbeat source, so anything that stops this loop stops the
//! heartbeat and the monitoring rings take over.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};
use vigil_common::{ExitCode, SystemState, VigilError};

use crate::context::DaemonContext;
use crate::control::{self, ControlState};
use crate::monitor::{CooperativeMonitor, FatalAction, ThreadWatchdog};

pub type CycleFuture<'a> = Pin<Box<dyn Future<Output = Result<(), VigilError>> + 'a>>;

/// The domain work the daemon exists to repeat.
///
/// In SAFE_MODE and RECOVERING the same cycle runs as a recovery
/// probe: its result feeds the recovery counter instead of the error
/// counter, and no side-effecting decisions should be taken (the
/// guardian is not consulted on the probe path, state alone gates it).
pub trait BusinessCycle: Send {
    fn run_cycle(&mut self) -> CycleFuture<'_>;
}

/// Placeholder cycle for deployments that only exercise the
/// monitoring stack.
pub struct IdleCycle;

impl BusinessCycle for IdleCycle {
    fn run_cycle(&mut self) -> CycleFuture<'_> {
        Box::pin(async { Ok(()) })
    }
}

/// Run the daemon until FATAL or a shutdown signal. Returns the exit
/// code; the caller owns actually ending the process.
pub async fn run(
    ctx: &DaemonContext,
    cycle: &mut dyn BusinessCycle,
    fatal_action: Arc<dyn FatalAction>,
) -> ExitCode {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor = CooperativeMonitor::new(
        Arc::clone(&ctx.machine),
        Arc::clone(&ctx.heartbeat),
        Arc::clone(&ctx.introspector),
        Duration::from_secs_f64(ctx.config.monitor.coop_check_interval_secs),
        Duration::from_secs_f64(ctx.config.monitor.coop_stall_threshold_secs),
    );
    ctx.introspector
        .spawn_tracked("cooperative_monitor", monitor.run(shutdown_rx.clone()));

    {
        let supervision = Arc::clone(&ctx.supervision);
        let interval = Duration::from_secs_f64(ctx.config.supervision.pulse_interval_secs);
        let pulse_rx = shutdown_rx.clone();
        ctx.introspector.spawn_tracked("supervisor_pulse", async move {
            supervision.run_pulse(interval, pulse_rx).await;
        });
    }

    {
        let control_state = Arc::new(ControlState {
            version: env!("CARGO_PKG_VERSION").to_string(),
            view: ctx.view.clone(),
            heartbeat: Arc::clone(&ctx.heartbeat),
            chaos: Arc::clone(&ctx.chaos),
        });
        let socket_path = std::path::PathBuf::from(&ctx.config.control.socket_path);
        ctx.introspector.spawn_tracked("control_socket", async move {
            if let Err(e) = control::start_server(socket_path, control_state).await {
                error!("control socket failed: {:#}", e);
            }
        });
    }

    // The handoff must be registered before the first heartbeat so the
    // watchdog can never arm without an escalation path.
    let mut watchdog = ThreadWatchdog::new(
        ctx.view.clone(),
        Arc::clone(&ctx.heartbeat),
        Duration::from_secs_f64(ctx.config.monitor.watchdog_check_interval_secs),
        Duration::from_secs_f64(ctx.config.monitor.watchdog_stall_threshold_secs),
        Duration::from_secs_f64(ctx.config.recovery.safe_mode_ttl_secs),
        fatal_action,
    );
    watchdog.register_handoff(ctx.requests.clone());
    watchdog.start();

    ctx.supervision.notify_ready();
    info!("daemon running, heartbeat every {:.1}s", ctx.config.monitor.heartbeat_interval_secs);

    let mut ticker =
        tokio::time::interval(Duration::from_secs_f64(ctx.config.monitor.heartbeat_interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let exit_code = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => info!("shutdown signal received"),
                    Err(e) => error!("signal handler failed: {}", e),
                }
                ctx.machine.lock().await.mark_shutdown_started();
                break ExitCode::Success;
            }
            _ = ticker.tick() => {
                ctx.heartbeat.beat();
                if let Some(code) = run_one_cycle(ctx, cycle).await {
                    break code;
                }
            }
        }
    };

    let _ = shutdown_tx.send(true);
    watchdog.stop();
    exit_code
}

/// One pass of the main loop. Returns an exit code when the loop must
/// end.
async fn run_one_cycle(ctx: &DaemonContext, cycle: &mut dyn BusinessCycle) -> Option<ExitCode> {
    let state = ctx.view.state();
    match state {
        SystemState::Fatal => {
            error!("state machine is FATAL, stopping");
            return Some(ExitCode::Critical);
        }

        SystemState::SafeMode | SystemState::Recovering => {
            // Recovery probe: the result feeds the recovery ladder.
            let success = match cycle.run_cycle().await {
                Ok(()) => true,
                Err(e) => {
                    warn!("recovery probe failed: {}", e);
                    false
                }
            };
            let mut machine = ctx.machine.lock().await;
            machine.record_recovery_cycle(success);
            if machine.state() == SystemState::Fatal {
                return Some(ExitCode::Critical);
            }
        }

        SystemState::Running | SystemState::Degraded => {
            // DEGRADED still runs cycles; that is how the error
            // counter either climbs to SAFE_MODE or resets back to
            // RUNNING. The guardian gate applies in RUNNING, where
            // decisions with side effects are permitted.
            if state == SystemState::Running {
                let decision = ctx.guardian.can_proceed().await;
                if !decision.allowed {
                    // A denial is not a cycle error; the guardian has
                    // already escalated anything critical.
                    warn!("cycle skipped: {}", decision.reason);
                    return None;
                }
            }
            match cycle.run_cycle().await {
                Ok(()) => {
                    ctx.machine.lock().await.reset_errors();
                }
                Err(e) if e.is_unrecoverable() => {
                    error!("unrecoverable cycle error: {}", e);
                    let mut machine = ctx.machine.lock().await;
                    let _ = machine.transition_to(
                        SystemState::Fatal,
                        &e.to_string(),
                        "business_cycle",
                        None,
                        serde_json::Value::Null,
                    );
                    return Some(ExitCode::Critical);
                }
                Err(e) => {
                    warn!("cycle error: {}", e);
                    ctx.machine.lock().await.record_error(&e.to_string());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::guardian::{HealthCheckable, HealthFuture, ModuleRegistry};
    use crate::supervision::SupervisionAdapter;
    use vigil_common::ModuleCriticality;

    struct Healthy;
    impl HealthCheckable for Healthy {
        fn check_health(&self) -> HealthFuture<'_> {
            Box::pin(async { Ok(()) })
        }
    }

    fn context() -> DaemonContext {
        let mut modules = ModuleRegistry::new();
        modules.register("core", ModuleCriticality::Critical, 1.0, true, Arc::new(Healthy));
        DaemonContext::build(DaemonConfig::default(), modules, SupervisionAdapter::disabled())
    }

    struct FailingCycle;
    impl BusinessCycle for FailingCycle {
        fn run_cycle(&mut self) -> CycleFuture<'_> {
            Box::pin(async { Err(VigilError::Recoverable("feed timeout".to_string())) })
        }
    }

    struct CorruptionCycle;
    impl BusinessCycle for CorruptionCycle {
        fn run_cycle(&mut self) -> CycleFuture<'_> {
            Box::pin(async { Err(VigilError::Unrecoverable("ledger corrupt".to_string())) })
        }
    }

    #[tokio::test]
    async fn test_repeated_errors_walk_the_degradation_ladder() {
        let ctx = context();
        let mut cycle = FailingCycle;
        for _ in 0..3 {
            run_one_cycle(&ctx, &mut cycle).await;
        }
        assert_eq!(ctx.view.state(), SystemState::Degraded);
        for _ in 0..2 {
            run_one_cycle(&ctx, &mut cycle).await;
        }
        assert_eq!(ctx.view.state(), SystemState::SafeMode);
    }

    #[tokio::test]
    async fn test_unrecoverable_error_exits_critical() {
        let ctx = context();
        let mut cycle = CorruptionCycle;
        let code = run_one_cycle(&ctx, &mut cycle).await;
        assert_eq!(code, Some(ExitCode::Critical));
        assert!(ctx.view.is_fatal());
    }

    #[tokio::test]
    async fn test_clean_probes_climb_back_to_running() {
        let ctx = context();
        let mut failing = FailingCycle;
        for _ in 0..5 {
            run_one_cycle(&ctx, &mut failing).await;
        }
        assert_eq!(ctx.view.state(), SystemState::SafeMode);

        let mut idle = IdleCycle;
        for _ in 0..6 {
            run_one_cycle(&ctx, &mut idle).await;
        }
        assert_eq!(ctx.view.state(), SystemState::Running);

        // A clean cycle in RUNNING leaves the counters at zero.
        run_one_cycle(&ctx, &mut idle).await;
        assert_eq!(ctx.view.consecutive_errors(), 0);
    }

    #[tokio::test]
    async fn test_fatal_state_terminates_loop() {
        let ctx = context();
        ctx.machine
            .lock()
            .await
            .transition_to(SystemState::Fatal, "test", "test", None, serde_json::Value::Null)
            .unwrap();
        let mut idle = IdleCycle;
        let code = run_one_cycle(&ctx, &mut idle).await;
        assert_eq!(code, Some(ExitCode::Critical));
    }
}
