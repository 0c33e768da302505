//! Thread-based watchdog: the only component guaranteed to run while
//! the cooperative scheduler is fully monopolized.
//!
//! Runs on a dedicated OS thread with its own clock. It never blocks
//! on scheduler primitives and never mutates the state machine; stall
//! detection posts a transition request onto the handoff channel for
//! the cooperative side to apply. The one exception to that
//! discipline is SAFE_MODE TTL enforcement: if the TTL elapses the
//! watchdog terminates the process directly, because waiting for a
//! scheduler that may never run again is not an option.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use vigil_common::{ExitCode, IncidentId, SystemState, TransitionRequest};

use crate::heartbeat::HeartbeatSignal;
use crate::machine::StateView;

/// Consecutive failed handoffs tolerated before the watchdog treats
/// the scheduler as unable to ever drain the channel.
const MAX_CONSECUTIVE_DROPS: u32 = 5;

/// Watchdog lifecycle. The watchdog takes no action until it is
/// armed, and arming requires both a first observed heartbeat and a
/// registered handoff target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogLifecycle {
    /// Created or started, not yet armed.
    Init,
    /// Ready to detect stalls.
    Armed,
    /// Stall detected and reported; TTL enforcement continues.
    Triggered,
    /// Stopped, no further work.
    Stopped,
}

/// Seam for the terminal action so tests can observe the kill instead
/// of dying with the process.
pub trait FatalAction: Send + Sync {
    fn terminate(&self, code: ExitCode, reason: &str);
}

/// Production action: exit the process immediately, bypassing the
/// cooperative scheduler and all higher-level error handling.
pub struct ProcessExit;

impl FatalAction for ProcessExit {
    fn terminate(&self, code: ExitCode, reason: &str) {
        error!("SYSTEM_EXIT exit_code={} reason={}", code.code(), reason);
        std::process::exit(code.code());
    }
}

struct WatchdogShared {
    lifecycle: Mutex<WatchdogLifecycle>,
    handoff: Mutex<Option<mpsc::Sender<TransitionRequest>>>,
    consecutive_drops: AtomicU32,
}

impl WatchdogShared {
    fn lifecycle(&self) -> WatchdogLifecycle {
        *self.lifecycle.lock().expect("watchdog lifecycle poisoned")
    }

    fn set_lifecycle(&self, next: WatchdogLifecycle) {
        *self.lifecycle.lock().expect("watchdog lifecycle poisoned") = next;
    }
}

pub struct ThreadWatchdog {
    view: StateView,
    heartbeat: Arc<HeartbeatSignal>,
    check_interval: Duration,
    stall_threshold: Duration,
    safe_mode_ttl: Duration,
    fatal_action: Arc<dyn FatalAction>,
    shared: Arc<WatchdogShared>,
    stop_tx: Option<std_mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ThreadWatchdog {
    pub fn new(
        view: StateView,
        heartbeat: Arc<HeartbeatSignal>,
        check_interval: Duration,
        stall_threshold: Duration,
        safe_mode_ttl: Duration,
        fatal_action: Arc<dyn FatalAction>,
    ) -> Self {
        ThreadWatchdog {
            view,
            heartbeat,
            check_interval,
            stall_threshold,
            safe_mode_ttl,
            fatal_action,
            shared: Arc::new(WatchdogShared {
                lifecycle: Mutex::new(WatchdogLifecycle::Init),
                handoff: Mutex::new(None),
                consecutive_drops: AtomicU32::new(0),
            }),
            stop_tx: None,
            handle: None,
        }
    }

    /// Register the handoff target into the cooperative scheduler.
    /// The watchdog stays disarmed until this has happened, however
    /// many heartbeats it has already seen.
    pub fn register_handoff(&self, sender: mpsc::Sender<TransitionRequest>) {
        let mut handoff = self.shared.handoff.lock().expect("watchdog handoff poisoned");
        *handoff = Some(sender);
        debug!("thread watchdog handoff registered");
    }

    pub fn lifecycle(&self) -> WatchdogLifecycle {
        self.shared.lifecycle()
    }

    /// Spawn the watchdog thread.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            warn!("thread watchdog already running");
            return;
        }
        let (stop_tx, stop_rx) = std_mpsc::channel();
        self.stop_tx = Some(stop_tx);

        let view = self.view.clone();
        let heartbeat = Arc::clone(&self.heartbeat);
        let shared = Arc::clone(&self.shared);
        let fatal_action = Arc::clone(&self.fatal_action);
        let check_interval = self.check_interval;
        let stall_threshold = self.stall_threshold;
        let safe_mode_ttl = self.safe_mode_ttl;

        let handle = thread::Builder::new()
            .name("thread-watchdog".to_string())
            .spawn(move || {
                watchdog_loop(
                    view,
                    heartbeat,
                    shared,
                    fatal_action,
                    stop_rx,
                    check_interval,
                    stall_threshold,
                    safe_mode_ttl,
                );
            })
            .expect("failed to spawn watchdog thread");
        self.handle = Some(handle);

        info!(
            "THREAD_WATCHDOG_STARTED heartbeat_timeout={:.1}s check_interval={:.1}s safe_mode_ttl={:.1}s",
            self.stall_threshold.as_secs_f64(),
            self.check_interval.as_secs_f64(),
            self.safe_mode_ttl.as_secs_f64()
        );
    }

    /// Stop the watchdog and join its thread.
    pub fn stop(&mut self) {
        self.shared.set_lifecycle(WatchdogLifecycle::Stopped);
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("thread watchdog panicked before join");
            }
        }
    }
}

impl Drop for ThreadWatchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

#[allow(clippy::too_many_arguments)]
fn watchdog_loop(
    view: StateView,
    heartbeat: Arc<HeartbeatSignal>,
    shared: Arc<WatchdogShared>,
    fatal_action: Arc<dyn FatalAction>,
    stop_rx: std_mpsc::Receiver<()>,
    check_interval: Duration,
    stall_threshold: Duration,
    safe_mode_ttl: Duration,
) {
    loop {
        match stop_rx.recv_timeout(check_interval) {
            Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
            Err(std_mpsc::RecvTimeoutError::Timeout) => {}
        }

        // No work after FATAL: the process is exiting, one way or
        // another, and double-reporting helps nobody.
        if view.is_fatal() {
            info!("THREAD_WATCHDOG system FATAL, watchdog exiting");
            shared.set_lifecycle(WatchdogLifecycle::Stopped);
            break;
        }

        // SAFE_MODE TTL, timed entirely on this thread's clock. This
        // is the last line of defense and must not depend on the
        // scheduler in any way.
        if let Some(elapsed) = view.safe_mode_elapsed() {
            if elapsed >= safe_mode_ttl {
                let reason = format!(
                    "SAFE_MODE TTL expired (duration: {:.1}s, limit: {:.1}s)",
                    elapsed.as_secs_f64(),
                    safe_mode_ttl.as_secs_f64()
                );
                error!("THREAD_WATCHDOG {}", reason);
                shared.set_lifecycle(WatchdogLifecycle::Stopped);
                fatal_action.terminate(ExitCode::Critical, &reason);
                break;
            }
        }

        match shared.lifecycle() {
            WatchdogLifecycle::Stopped => break,
            WatchdogLifecycle::Triggered => continue, // only TTL duty remains
            WatchdogLifecycle::Init | WatchdogLifecycle::Armed => {}
        }

        let age = match heartbeat.age() {
            Some(age) => age,
            None => continue, // not a single heartbeat yet
        };

        // Arming requires a heartbeat AND a registered handoff. A
        // heartbeat arriving first must not arm the watchdog on its
        // own, otherwise it could detect a stall it cannot report.
        if shared.lifecycle() == WatchdogLifecycle::Init {
            let registered = shared
                .handoff
                .lock()
                .expect("watchdog handoff poisoned")
                .is_some();
            if registered {
                shared.set_lifecycle(WatchdogLifecycle::Armed);
                info!("THREAD_WATCHDOG_ARMED stall_threshold={:.1}s", stall_threshold.as_secs_f64());
            } else {
                continue;
            }
        }

        if age <= stall_threshold {
            continue;
        }

        // Stall detected. Post the request; never mutate state from
        // this thread.
        let incident_id = IncidentId::new("watchdog");
        error!(
            "THREAD_WATCHDOG_STALL incident_id={} time_since_heartbeat={:.1}s threshold={:.1}s",
            incident_id,
            age.as_secs_f64(),
            stall_threshold.as_secs_f64()
        );
        let request = TransitionRequest {
            target: SystemState::SafeMode,
            reason: format!("stall_detected ({:.1}s since heartbeat)", age.as_secs_f64()),
            owner: "thread_watchdog".to_string(),
            incident_id,
        };
        let sender = shared
            .handoff
            .lock()
            .expect("watchdog handoff poisoned")
            .clone();
        let Some(sender) = sender else { continue };
        match sender.try_send(request) {
            Ok(()) => {
                shared.consecutive_drops.store(0, Ordering::SeqCst);
                shared.set_lifecycle(WatchdogLifecycle::Triggered);
            }
            Err(err) => {
                let drops = shared.consecutive_drops.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    "THREAD_WATCHDOG_HANDOFF_FAILED error={} consecutive_drops={}",
                    err, drops
                );
                if drops >= MAX_CONSECUTIVE_DROPS {
                    // The cooperative side has stopped draining the
                    // channel entirely: event delivery has failed and
                    // no orderly path to FATAL remains.
                    let reason = format!(
                        "transition request channel saturated ({} consecutive drops)",
                        drops
                    );
                    error!("THREAD_WATCHDOG {}", reason);
                    shared.set_lifecycle(WatchdogLifecycle::Stopped);
                    fatal_action.terminate(ExitCode::Critical, &reason);
                    break;
                }
            }
        }
    }
    debug!("thread watchdog loop exited");
}
