//! Per-server monitor state
//!
//! Everything the monitor keeps for one tracked server: the interval
//! ring the samples land in, the recompute bookkeeping, the published
//! stats, and the scheduling flags. Shared as `Arc`: queued samples,
//! calculation queues and external handles each hold a reference, and
//! the state goes away when the last one drops.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::publish::StatsPublisher;
use crate::ring::{Ring, RingControl};

/// A computation came back incomplete; retry on the next tick.
pub(crate) const FLAG_RECALC: u32 = 1 << 0;
/// Already moved to the calculation queue during this drain.
pub(crate) const FLAG_PENDING: u32 = 1 << 1;

pub(crate) struct ServerStats {
    pub ring: Ring,
    /// Touched only by the tick task; the lock is uncontended and
    /// merely keeps the single-consumer discipline honest.
    pub rbctl: Mutex<RingControl>,
    pub publisher: StatsPublisher,
    flags: AtomicU32,
}

impl ServerStats {
    pub fn new(scale: usize, result_len: usize) -> Self {
        Self {
            ring: Ring::new(scale),
            rbctl: Mutex::new(RingControl::new()),
            publisher: StatsPublisher::new(result_len),
            flags: AtomicU32::new(0),
        }
    }

    /// Set the pending flag; true if it was already set.
    pub fn test_and_set_pending(&self) -> bool {
        (self.flags.fetch_or(FLAG_PENDING, Ordering::AcqRel) & FLAG_PENDING) != 0
    }

    pub fn clear_pending(&self) {
        self.flags.fetch_and(!FLAG_PENDING, Ordering::AcqRel);
    }

    /// Clear the retry flag, returning whether it was set.
    pub fn take_recalc(&self) -> bool {
        (self.flags.fetch_and(!FLAG_RECALC, Ordering::AcqRel) & FLAG_RECALC) != 0
    }

    pub fn mark_recalc(&self) {
        self.flags.fetch_or(FLAG_RECALC, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_flag_is_test_and_set() {
        let s = ServerStats::new(5, 8);
        assert!(!s.test_and_set_pending());
        assert!(s.test_and_set_pending());
        s.clear_pending();
        assert!(!s.test_and_set_pending());
    }

    #[test]
    fn recalc_flag_is_take_once() {
        let s = ServerStats::new(5, 8);
        assert!(!s.take_recalc());
        s.mark_recalc();
        assert!(s.take_recalc());
        assert!(!s.take_recalc());
    }

    #[test]
    fn flags_do_not_interfere() {
        let s = ServerStats::new(5, 8);
        s.mark_recalc();
        assert!(!s.test_and_set_pending());
        assert!(s.take_recalc());
        assert!(s.test_and_set_pending());
    }
}
