//! End-to-end stall detection on the single-threaded runtime.
//!
//! These tests use real chaos injections on a current-thread runtime,
//! so the scheduler genuinely stops. Detection must come from the
//! normal monitoring path, the injector has no channel to the
//! monitors.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use vigil_common::SystemState;
use vigild::chaos::{ChaosInjector, ChaosType};
use vigild::heartbeat::HeartbeatSignal;
use vigild::introspect::OperationRegistry;
use vigild::machine::{StateMachine, Thresholds};
use vigild::monitor::CooperativeMonitor;

struct Rig {
    machine: Arc<Mutex<StateMachine>>,
    heartbeat: Arc<HeartbeatSignal>,
    monitor: CooperativeMonitor,
    chaos: Arc<ChaosInjector>,
    introspector: Arc<OperationRegistry>,
}

fn rig(stall_threshold: Duration) -> Rig {
    let (machine, _view, _tx) = StateMachine::new(Thresholds::default());
    let machine = Arc::new(Mutex::new(machine));
    let heartbeat = Arc::new(HeartbeatSignal::new());
    let introspector = Arc::new(OperationRegistry::new());
    let monitor = CooperativeMonitor::new(
        Arc::clone(&machine),
        Arc::clone(&heartbeat),
        Arc::clone(&introspector),
        Duration::from_millis(10),
        stall_threshold,
    );
    let chaos = Arc::new(ChaosInjector::new(
        true,
        Duration::from_secs(600),
        Arc::clone(&introspector),
    ));
    Rig { machine, heartbeat, monitor, chaos, introspector }
}

/// Inject, prove the scheduler was actually held, then prove the
/// monitor classifies the stale heartbeat as a stall.
async fn assert_detected(rig: &Rig, chaos_type: ChaosType) {
    rig.heartbeat.beat();
    rig.chaos.inject(chaos_type, 0.3).await.unwrap();

    // This sleep is scheduled for 10ms; the injected task runs first
    // and holds the thread, so wall time proves the stall was real.
    let before = Instant::now();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(
        before.elapsed() >= Duration::from_millis(200),
        "{}: scheduler was not actually stalled ({:?})",
        chaos_type,
        before.elapsed()
    );

    rig.monitor.tick().await;
    assert_eq!(
        rig.machine.lock().await.state(),
        SystemState::SafeMode,
        "{}: stall not classified",
        chaos_type
    );
}

#[tokio::test]
async fn test_cpu_bound_loop_detected() {
    let rig = rig(Duration::from_millis(150));
    assert_detected(&rig, ChaosType::CpuBoundLoop).await;
}

#[tokio::test]
async fn test_blocking_io_detected() {
    let rig = rig(Duration::from_millis(150));
    assert_detected(&rig, ChaosType::BlockingIo).await;
}

#[tokio::test]
async fn test_recursive_suspend_detected() {
    let rig = rig(Duration::from_millis(150));
    assert_detected(&rig, ChaosType::RecursiveSuspend).await;
}

#[tokio::test]
async fn test_cross_lock_deadlock_detected() {
    let rig = rig(Duration::from_millis(150));
    assert_detected(&rig, ChaosType::CrossLockDeadlock).await;
}

/// A fresh heartbeat right before the tick means no stall.
#[tokio::test]
async fn test_fresh_heartbeat_is_not_a_stall() {
    let rig = rig(Duration::from_millis(150));
    rig.heartbeat.beat();
    rig.monitor.tick().await;
    assert_eq!(rig.machine.lock().await.state(), SystemState::Running);
}

/// A stall caught mid-flight must leave every in-flight operation
/// visible in the dump. Ten tracked operations are still pending when
/// the injection stalls the scheduler; after the monitor classifies
/// the stall, the dump reports all ten as running.
#[tokio::test]
async fn test_dump_captures_in_flight_operations_during_stall() {
    use vigil_common::IncidentId;
    use vigild::introspect::OperationStatus;

    let rig = rig(Duration::from_millis(150));
    rig.heartbeat.beat();

    for i in 0..10 {
        let label = format!("ingest_{i}");
        rig.introspector
            .spawn_tracked(&label, std::future::pending::<()>());
    }
    assert_eq!(rig.introspector.live_count(), 10);

    rig.chaos
        .inject(ChaosType::CpuBoundLoop, 0.3)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await; // held by the stall

    rig.monitor.tick().await;
    assert_eq!(rig.machine.lock().await.state(), SystemState::SafeMode);

    // The injection task itself is tracked too and has finished, so
    // count only the operations that are still live.
    let dump = rig
        .introspector
        .dump(&IncidentId::new("stall"), "in-flight snapshot");
    let running: Vec<&str> = dump
        .operations
        .iter()
        .filter(|op| op.status == OperationStatus::Running)
        .map(|op| op.label.as_str())
        .collect();
    assert_eq!(running.len(), 10);
    for i in 0..10 {
        let label = format!("ingest_{i}");
        assert!(running.contains(&label.as_str()), "missing {label}");
    }
    assert_eq!(dump.total, dump.operations.len());
}

/// With the stall duration between the two thresholds only the outer
/// ring fires: the watchdog thread keeps running through the
/// monopolization and posts the request, while the cooperative
/// monitor, threshold not reached, stays quiet.
#[tokio::test]
async fn test_watchdog_fires_while_cooperative_stays_quiet() {
    use vigild::monitor::{FatalAction, ThreadWatchdog, WatchdogLifecycle};

    struct NoopFatal;
    impl FatalAction for NoopFatal {
        fn terminate(&self, _code: vigil_common::ExitCode, _reason: &str) {}
    }

    // Cooperative threshold far above the stall duration.
    let (machine, view, tx) = StateMachine::new(Thresholds::default());
    let machine = Arc::new(Mutex::new(machine));
    let heartbeat = Arc::new(HeartbeatSignal::new());
    let introspector = Arc::new(OperationRegistry::new());
    let monitor = CooperativeMonitor::new(
        Arc::clone(&machine),
        Arc::clone(&heartbeat),
        Arc::clone(&introspector),
        Duration::from_millis(10),
        Duration::from_secs(10),
    );
    let chaos = Arc::new(ChaosInjector::new(true, Duration::from_secs(600), introspector));

    let mut watchdog = ThreadWatchdog::new(
        view,
        Arc::clone(&heartbeat),
        Duration::from_millis(10),
        Duration::from_millis(100),
        Duration::from_secs(600),
        Arc::new(NoopFatal),
    );
    watchdog.register_handoff(tx);
    watchdog.start();
    heartbeat.beat();

    // Wait for the watchdog thread to arm before the stall begins.
    let arm_deadline = Instant::now() + Duration::from_secs(2);
    while watchdog.lifecycle() != WatchdogLifecycle::Armed {
        assert!(Instant::now() < arm_deadline, "watchdog never armed");
        std::thread::sleep(Duration::from_millis(5));
    }

    chaos.inject(ChaosType::CpuBoundLoop, 0.4).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await; // held by the stall

    assert_eq!(watchdog.lifecycle(), WatchdogLifecycle::Triggered);

    // The cooperative monitor applies the watchdog's request but does
    // not detect a stall of its own.
    monitor.tick().await;
    let machine = machine.lock().await;
    assert_eq!(machine.state(), SystemState::SafeMode);
    let owners: Vec<&str> = machine.transitions().map(|t| t.owner.as_str()).collect();
    assert_eq!(owners, vec!["thread_watchdog"]);

    drop(machine);
    watchdog.stop();
}
