//! Tick clock abstraction
//!
//! All window arithmetic runs on integer ticks so that the scheduler,
//! the ring and the tests agree on time without touching the wall clock.
//! The production clock counts milliseconds from process start on a
//! monotonic base (never SystemTime).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic tick source consumed by the monitor.
///
/// One tick is `1 / ticks_per_second()` seconds. Implementations must be
/// cheap to call from hot paths and must never go backwards.
pub trait Clock: Send + Sync + 'static {
    /// Current time in ticks.
    fn now_ticks(&self) -> u64;

    /// Tick resolution. The default is millisecond ticks.
    fn ticks_per_second(&self) -> u64 {
        1000
    }
}

/// Millisecond ticks anchored at construction time.
#[derive(Debug)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    #[inline]
    fn now_ticks(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

/// Hand-driven clock for deterministic window tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    ticks: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ticks: u64) -> Self {
        Self {
            ticks: AtomicU64::new(start_ticks),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, ticks: u64) {
        self.ticks.fetch_add(ticks, Ordering::Release);
    }

    /// Jump the clock to an absolute tick value.
    pub fn set(&self, ticks: u64) {
        self.ticks.store(ticks, Ordering::Release);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now_ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now_ticks();
        let b = clock.now_ticks();
        assert!(b >= a);
        assert_eq!(clock.ticks_per_second(), 1000);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now_ticks(), 100);
        clock.advance(50);
        assert_eq!(clock.now_ticks(), 150);
        clock.set(1_000);
        assert_eq!(clock.now_ticks(), 1_000);
    }
}
