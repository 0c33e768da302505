//! The outer monitoring ring works with zero scheduler cooperation.
//!
//! No async runtime is running in this test at all. The watchdog
//! thread must still detect the stale heartbeat and queue the
//! SAFE_MODE request, which the cooperative side applies whenever it
//! next gets to run.

use std::sync::Arc;
use std::time::Duration;

use vigil_common::{ExitCode, SystemState};
use vigild::heartbeat::HeartbeatSignal;
use vigild::machine::{StateMachine, Thresholds};
use vigild::monitor::{FatalAction, ThreadWatchdog, WatchdogLifecycle};

struct NoopFatal;
impl FatalAction for NoopFatal {
    fn terminate(&self, _code: ExitCode, _reason: &str) {}
}

#[test]
fn test_watchdog_detects_stall_without_a_running_scheduler() {
    let (mut machine, view, tx) = StateMachine::new(Thresholds::default());
    let heartbeat = Arc::new(HeartbeatSignal::new());

    let mut watchdog = ThreadWatchdog::new(
        view,
        Arc::clone(&heartbeat),
        Duration::from_millis(10),
        Duration::from_millis(50),
        Duration::from_secs(600),
        Arc::new(NoopFatal),
    );
    watchdog.register_handoff(tx);
    watchdog.start();
    heartbeat.beat();

    // The "scheduler" (this thread) sleeps, so nothing cooperative
    // runs while the heartbeat goes stale.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(watchdog.lifecycle(), WatchdogLifecycle::Triggered);

    // The scheduler comes back and drains the queued request.
    let applied = machine.drain_requests();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].owner, "thread_watchdog");
    assert_eq!(machine.state(), SystemState::SafeMode);

    watchdog.stop();
}
