//! Heartbeat signal shared between the cooperative scheduler and the
//! watchdog thread.
//!
//! Single writer (the business cycle), multiple readers (both
//! monitors). The value is an atomic millisecond offset from a fixed
//! `Instant` anchor, so reads from the watchdog thread need no lock
//! and no syscall beyond the clock itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Offset 0 means "never beaten"; the first beat is clamped to 1ms.
pub struct HeartbeatSignal {
    anchor: Instant,
    last_beat_ms: AtomicU64,
}

impl HeartbeatSignal {
    pub fn new() -> Self {
        HeartbeatSignal {
            anchor: Instant::now(),
            last_beat_ms: AtomicU64::new(0),
        }
    }

    /// Record one business-cycle heartbeat. Called once per cycle by
    /// the cooperative side; never from a thread.
    pub fn beat(&self) {
        let ms = self.anchor.elapsed().as_millis() as u64;
        self.last_beat_ms.store(ms.max(1), Ordering::SeqCst);
    }

    /// Age of the last heartbeat, or `None` if no beat has happened
    /// yet. Safe to call from any thread.
    pub fn age(&self) -> Option<Duration> {
        let last = self.last_beat_ms.load(Ordering::SeqCst);
        if last == 0 {
            return None;
        }
        let now = self.anchor.elapsed().as_millis() as u64;
        Some(Duration::from_millis(now.saturating_sub(last)))
    }

    pub fn has_beaten(&self) -> bool {
        self.last_beat_ms.load(Ordering::SeqCst) != 0
    }
}

impl Default for HeartbeatSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_age_before_first_beat() {
        let hb = HeartbeatSignal::new();
        assert!(hb.age().is_none());
        assert!(!hb.has_beaten());
    }

    #[test]
    fn test_age_grows_after_beat() {
        let hb = HeartbeatSignal::new();
        hb.beat();
        assert!(hb.has_beaten());
        let first = hb.age().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let later = hb.age().unwrap();
        assert!(later >= first);
        assert!(later >= Duration::from_millis(15));
    }

    #[test]
    fn test_beat_resets_age() {
        let hb = HeartbeatSignal::new();
        hb.beat();
        std::thread::sleep(Duration::from_millis(20));
        hb.beat();
        assert!(hb.age().unwrap() < Duration::from_millis(15));
    }

    #[test]
    fn test_readable_from_another_thread() {
        let hb = std::sync::Arc::new(HeartbeatSignal::new());
        hb.beat();
        let hb2 = std::sync::Arc::clone(&hb);
        let age = std::thread::spawn(move || hb2.age()).join().unwrap();
        assert!(age.is_some());
    }
}
