//! Dual watchdog: a cooperative heartbeat monitor inside the
//! scheduler and an independent thread-based watchdog outside it.
//!
//! The cooperative monitor is the best-effort inner ring: it cannot
//! run at all if the scheduler is monopolized. The thread watchdog is
//! the safety-critical outer ring with its own clock and a strictly
//! shorter threshold, so under a total stall it always fires first.

pub mod cooperative;
pub mod watchdog;

pub use cooperative::CooperativeMonitor;
pub use watchdog::{FatalAction, ProcessExit, ThreadWatchdog, WatchdogLifecycle};
