//! Deterministic fault injection.
//!
//! Each pattern produces a genuine pathological condition on the
//! cooperative scheduler, not a simulation of one: held locks, real
//! blocking file I/O, unbounded recursion depth, a busy CPU loop. On
//! the single-threaded runtime these actually starve the heartbeat,
//! which is the point: the monitoring stack must detect them through
//! its normal stall path, with no shortcut wired from injector to
//! detector.

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use vigil_common::IncidentId;

use crate::introspect::OperationRegistry;

/// Hard ceiling on any injection, independent of the requested
/// duration.
pub const MAX_INJECTION_SECS: f64 = 600.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChaosType {
    /// Two locks taken in opposite order across the async/thread
    /// boundary.
    CrossLockDeadlock,
    /// Synchronous file I/O on the cooperative scheduler.
    BlockingIo,
    /// Deep future recursion followed by a yield-free wait.
    RecursiveSuspend,
    /// Pure CPU spin without yield points.
    CpuBoundLoop,
}

impl ChaosType {
    pub const ALL: [ChaosType; 4] = [
        ChaosType::CrossLockDeadlock,
        ChaosType::BlockingIo,
        ChaosType::RecursiveSuspend,
        ChaosType::CpuBoundLoop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChaosType::CrossLockDeadlock => "cross_lock_deadlock",
            ChaosType::BlockingIo => "blocking_io",
            ChaosType::RecursiveSuspend => "recursive_suspend",
            ChaosType::CpuBoundLoop => "cpu_bound_loop",
        }
    }
}

impl std::fmt::Display for ChaosType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChaosType {
    type Err = ChaosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cross_lock_deadlock" => Ok(ChaosType::CrossLockDeadlock),
            "blocking_io" => Ok(ChaosType::BlockingIo),
            "recursive_suspend" => Ok(ChaosType::RecursiveSuspend),
            "cpu_bound_loop" => Ok(ChaosType::CpuBoundLoop),
            other => Err(ChaosError::UnknownType(other.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChaosError {
    #[error("chaos injection is disabled in configuration")]
    Disabled,

    #[error("an injection is already active")]
    AlreadyActive,

    #[error("unknown chaos type: {0}")]
    UnknownType(String),

    #[error("invalid injection duration: {0}")]
    BadDuration(String),
}

struct ActiveInjection {
    chaos_type: ChaosType,
    incident_id: IncidentId,
    started_at: Instant,
    duration: Duration,
}

pub struct ChaosInjector {
    enabled: bool,
    max_duration: Duration,
    active: Mutex<Option<ActiveInjection>>,
    introspector: Arc<OperationRegistry>,
}

impl ChaosInjector {
    pub fn new(enabled: bool, max_duration: Duration, introspector: Arc<OperationRegistry>) -> Self {
        ChaosInjector {
            enabled,
            max_duration,
            active: Mutex::new(None),
            introspector,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub async fn is_active(&self) -> bool {
        let mut active = self.active.lock().await;
        if let Some(inj) = active.as_ref() {
            if inj.started_at.elapsed() >= inj.duration {
                *active = None;
            }
        }
        active.is_some()
    }

    /// Start one injection. The trigger log line is written before the
    /// pathological task is spawned, so the incident is on record even
    /// if the scheduler never runs another line of this function's
    /// caller.
    pub async fn inject(
        &self,
        chaos_type: ChaosType,
        duration_secs: f64,
    ) -> Result<IncidentId, ChaosError> {
        if !self.enabled {
            return Err(ChaosError::Disabled);
        }
        if !duration_secs.is_finite() || duration_secs <= 0.0 {
            return Err(ChaosError::BadDuration(format!("{}", duration_secs)));
        }
        let duration = Duration::from_secs_f64(duration_secs.min(self.max_duration.as_secs_f64()));

        let mut active = self.active.lock().await;
        if let Some(inj) = active.as_ref() {
            if inj.started_at.elapsed() < inj.duration {
                return Err(ChaosError::AlreadyActive);
            }
        }

        let incident_id = IncidentId::new("chaos");
        error!(
            "CHAOS_INJECTION_TRIGGERED incident_id={} chaos_type={} duration={:.1}s",
            incident_id,
            chaos_type,
            duration.as_secs_f64()
        );

        *active = Some(ActiveInjection {
            chaos_type,
            incident_id: incident_id.clone(),
            started_at: Instant::now(),
            duration,
        });
        drop(active);

        let label = format!("chaos:{}", chaos_type);
        match chaos_type {
            ChaosType::CrossLockDeadlock => {
                self.introspector.spawn_tracked(&label, cross_lock_deadlock(duration));
            }
            ChaosType::BlockingIo => {
                self.introspector.spawn_tracked(&label, blocking_io(duration));
            }
            ChaosType::RecursiveSuspend => {
                self.introspector.spawn_tracked(&label, recursive_suspend(duration));
            }
            ChaosType::CpuBoundLoop => {
                self.introspector.spawn_tracked(&label, cpu_bound_loop(duration));
            }
        }

        Ok(incident_id)
    }

    /// Clear the active-injection marker. The injected task itself
    /// runs to its deadline; what stops is the accounting.
    pub async fn stop(&self) -> bool {
        let mut active = self.active.lock().await;
        match active.take() {
            Some(inj) => {
                info!(
                    "CHAOS_INJECTION_STOPPED incident_id={} chaos_type={} ran_for={:.1}s",
                    inj.incident_id,
                    inj.chaos_type,
                    inj.started_at.elapsed().as_secs_f64()
                );
                true
            }
            None => false,
        }
    }
}

/// Lock ordering inversion across the async/thread boundary: the
/// async side holds lock A (tokio mutex) and blocks on lock B (OS
/// mutex); a spawned thread holds lock B and polls for lock A. Each
/// party holds one lock the other wants. The deadlock is bounded: at
/// the deadline the thread gives up on A and releases B, which
/// unblocks the scheduler. `std::sync::Mutex::lock` on the async side
/// is a true blocking call, so the scheduler stops here.
async fn cross_lock_deadlock(duration: Duration) {
    let lock_a = Arc::new(Mutex::new(()));
    let lock_b = Arc::new(std::sync::Mutex::new(()));

    let _guard_a = lock_a.lock().await;

    let thread_a = Arc::clone(&lock_a);
    let thread_b = Arc::clone(&lock_b);
    let deadline = Instant::now() + duration;
    let holder = std::thread::Builder::new()
        .name("chaos-lock-holder".to_string())
        .spawn(move || {
            let _guard_b = thread_b.lock().unwrap_or_else(|p| p.into_inner());
            // Wants A while holding B; the async side holds A and
            // wants B. Gives up at the deadline, ending the stall.
            while Instant::now() < deadline {
                if thread_a.try_lock().is_ok() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        });
    if holder.is_err() {
        warn!("chaos: could not spawn lock-holder thread");
        return;
    }
    // Give the holder time to actually take lock B.
    std::thread::sleep(Duration::from_millis(50));

    let _guard_b = lock_b.lock().unwrap_or_else(|p| p.into_inner());
}

/// Synchronous 1 MiB write/read loop straight on the cooperative
/// scheduler, no spawn_blocking.
async fn blocking_io(duration: Duration) {
    let deadline = Instant::now() + duration;
    let path = std::env::temp_dir().join(format!("vigil-chaos-{}.dat", std::process::id()));
    let chunk = vec![0xA5u8; 1024 * 1024];
    while Instant::now() < deadline {
        if std::fs::write(&path, &chunk).is_err() {
            // Filesystem refused to cooperate; degrade to a busy wait
            // so the stall still happens.
            busy_wait(deadline);
            break;
        }
        let _ = std::fs::read(&path);
    }
    let _ = std::fs::remove_file(&path);
}

/// Builds a deep chain of boxed futures, then holds the scheduler in a
/// yield-free wait. Depth is capped so the stack survives; the stall
/// comes from the wait, the recursion makes the dump interesting.
async fn recursive_suspend(duration: Duration) {
    fn descend(depth: u32, deadline: Instant) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
            if depth == 0 {
                busy_wait(deadline);
                return;
            }
            descend(depth - 1, deadline).await;
        })
    }
    descend(256, Instant::now() + duration).await;
}

/// Pure CPU spin with no await points.
async fn cpu_bound_loop(duration: Duration) {
    busy_wait(Instant::now() + duration);
}

fn busy_wait(deadline: Instant) {
    let mut x: u64 = 0;
    while Instant::now() < deadline {
        x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        std::hint::black_box(x);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn injector(enabled: bool) -> ChaosInjector {
        ChaosInjector::new(
            enabled,
            Duration::from_secs_f64(MAX_INJECTION_SECS),
            Arc::new(OperationRegistry::new()),
        )
    }

    #[test]
    fn test_chaos_type_round_trip() {
        for ct in ChaosType::ALL {
            assert_eq!(ct.as_str().parse::<ChaosType>().unwrap(), ct);
        }
        assert!(matches!(
            "segfault".parse::<ChaosType>(),
            Err(ChaosError::UnknownType(_))
        ));
    }

    #[derive(Clone, Default)]
    struct LogCapture(Arc<std::sync::Mutex<Vec<u8>>>);

    impl LogCapture {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl std::io::Write for LogCapture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_injection_events_use_chaos_type_key() {
        let capture = LogCapture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let inj = injector(true);
        inj.inject(ChaosType::CpuBoundLoop, 0.05).await.unwrap();
        inj.stop().await;

        let logs = capture.contents();
        assert!(logs.contains("CHAOS_INJECTION_TRIGGERED"));
        assert!(
            logs.contains("chaos_type=cpu_bound_loop"),
            "trigger event must carry the chaos_type key: {}",
            logs
        );
        assert!(logs.contains("CHAOS_INJECTION_STOPPED"));
        assert!(!logs.contains(" type="), "bare type= key must not appear: {}", logs);
    }

    #[tokio::test]
    async fn test_disabled_injector_refuses() {
        let inj = injector(false);
        let err = inj.inject(ChaosType::CpuBoundLoop, 1.0).await.unwrap_err();
        assert_eq!(err, ChaosError::Disabled);
        assert!(!inj.is_active().await);
    }

    #[tokio::test]
    async fn test_rejects_nonsense_durations() {
        let inj = injector(true);
        assert!(matches!(
            inj.inject(ChaosType::CpuBoundLoop, 0.0).await,
            Err(ChaosError::BadDuration(_))
        ));
        assert!(matches!(
            inj.inject(ChaosType::CpuBoundLoop, f64::NAN).await,
            Err(ChaosError::BadDuration(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_single_active_injection() {
        let inj = injector(true);
        inj.inject(ChaosType::BlockingIo, 0.5).await.unwrap();
        let err = inj.inject(ChaosType::CpuBoundLoop, 1.0).await.unwrap_err();
        assert_eq!(err, ChaosError::AlreadyActive);
        assert!(inj.stop().await);
        assert!(!inj.is_active().await);
        assert!(!inj.stop().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cpu_bound_loop_occupies_a_worker() {
        // On a multi-thread runtime the spin occupies one worker for
        // its full duration; on the daemon's single-thread runtime the
        // same future stalls everything, which is the production case.
        let inj = injector(true);
        let before = Instant::now();
        inj.inject(ChaosType::CpuBoundLoop, 0.2).await.unwrap();
        assert!(before.elapsed() < Duration::from_millis(100), "inject must not block the caller");
        assert!(inj.is_active().await);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!inj.is_active().await);
    }
}
