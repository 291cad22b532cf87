//! Interval ring
//!
//! A fixed array of histogram entries that are reused as time moves on.
//! The ring as a whole holds the stats for the latest observation
//! window; each entry holds the stats for one interval of that window.
//! An entry past its interval is reset lazily, on first touch in the
//! new interval, by exactly one of the touching parties.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use tracing::debug;

use crate::config::Timing;
use crate::histogram::Histogram;

/// One ring slot: a histogram plus the start tick of the interval the
/// counters belong to, and a single-shot token electing the resetter.
pub struct RingEntry {
    hist: Histogram,
    interval_start: AtomicU64,
    reset: AtomicI32,
}

impl RingEntry {
    fn new() -> Self {
        Self {
            hist: Histogram::new(),
            interval_start: AtomicU64::new(0),
            reset: AtomicI32::new(1),
        }
    }

    #[inline]
    pub fn histogram(&self) -> &Histogram {
        &self.hist
    }

    /// Reset the entry if it still carries a previous interval.
    ///
    /// Many parties may race here; the token admits exactly one into
    /// the actual clearing. While it runs, a few concurrent updates may
    /// land in half-cleared counters and be lost. That is acceptable.
    pub fn check_reset(&self, interval_start: u64) {
        if self.interval_start.load(Ordering::Acquire) == interval_start {
            return;
        }
        if self.reset.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        self.hist.reset_counters();
        self.interval_start.store(interval_start, Ordering::Release);
        self.reset.store(1, Ordering::Release);
    }

    #[cfg(test)]
    fn interval_start(&self) -> u64 {
        self.interval_start.load(Ordering::Acquire)
    }
}

/// The ring proper. Entry for tick `t` is `(t / interval) % scale`.
pub struct Ring {
    entries: Box<[RingEntry]>,
}

impl Ring {
    pub fn new(scale: usize) -> Self {
        Self {
            entries: (0..scale).map(|_| RingEntry::new()).collect(),
        }
    }

    #[inline]
    pub fn entries(&self) -> &[RingEntry] {
        &self.entries
    }

    #[inline]
    pub fn entry_for(&self, ticks: u64, timing: &Timing) -> &RingEntry {
        &self.entries[timing.entry_index(ticks)]
    }

    /// Route one sample into the ring.
    pub fn record(&self, ts_ticks: u64, rtt: u16, timing: &Timing) {
        let entry = self.entry_for(ts_ticks, timing);
        entry.check_reset(timing.interval_start(ts_ticks));
        entry.histogram().record(rtt);
    }
}

/// Memoized counters deciding whether a recompute is worth running.
///
/// Owned by the single calculating party; producers never touch it.
#[derive(Debug, Default)]
pub struct RingControl {
    window_start: u64,
    entry_cnt: u64,
    total_cnt: u64,
}

impl RingControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total hits within the current window, as of the last refresh.
    #[inline]
    pub fn total_count(&self) -> u64 {
        self.total_cnt
    }

    /// Bring the memoized counters up to date and report whether the
    /// percentiles need recomputing.
    ///
    /// `force` requests a recompute even when the counters did not move
    /// (a previous computation came back incomplete). Forcing only
    /// matters when there is cached data to recombine; with no new hits
    /// and no force there is nothing to do.
    pub fn refresh(&mut self, ring: &Ring, now_ticks: u64, timing: &Timing, force: bool) -> bool {
        let interval_start = timing.interval_start(now_ticks);
        // Wrapping keeps the label well-defined near tick zero; it is
        // only ever compared for equality.
        let window_start = interval_start.wrapping_sub(timing.window_ticks);
        let current = ring.entry_for(now_ticks, timing);

        if self.window_start != window_start {
            // The window rolled: make sure the current entry is fresh,
            // then recount from scratch.
            current.check_reset(interval_start);

            let total_cnt: u64 = ring
                .entries()
                .iter()
                .map(|e| e.histogram().total_count())
                .sum();
            self.entry_cnt = current.histogram().total_count();
            self.total_cnt = total_cnt;
            self.window_start = window_start;

            debug!(total_cnt, "window rolled, recounted");
            return true;
        }

        let entry_cnt = current.histogram().total_count();
        if entry_cnt == self.entry_cnt {
            return force;
        }
        debug_assert!(entry_cnt >= self.entry_cnt, "entry count went backwards");

        // Update the totals incrementally.
        self.total_cnt += entry_cnt - self.entry_cnt;
        self.entry_cnt = entry_cnt;

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApmConfig;

    fn timing() -> Timing {
        ApmConfig::default().resolve(1000).unwrap()
    }

    #[test]
    fn samples_land_in_their_interval_entry() {
        let timing = timing();
        let ring = Ring::new(timing.scale);

        ring.record(0, 10, &timing);
        ring.record(timing.interval_ticks, 20, &timing);
        ring.record(timing.interval_ticks * 2 + 17, 30, &timing);

        assert_eq!(ring.entries()[0].histogram().total_count(), 1);
        assert_eq!(ring.entries()[1].histogram().total_count(), 1);
        assert_eq!(ring.entries()[2].histogram().total_count(), 1);
        assert_eq!(
            ring.entries()[2].interval_start(),
            timing.interval_ticks * 2
        );
    }

    #[test]
    fn reuse_resets_counters_exactly_once() {
        let timing = timing();
        let ring = Ring::new(timing.scale);

        ring.record(100, 42, &timing);
        let entry = &ring.entries()[0];
        assert_eq!(entry.histogram().total_count(), 1);
        let layout = entry.histogram().ctl(3);

        // One window later the same slot is reused for a new interval.
        let later = timing.window_ticks + 100;
        entry.check_reset(timing.interval_start(later));
        assert_eq!(entry.histogram().total_count(), 0);
        assert_eq!(entry.interval_start(), timing.interval_start(later));
        // Re-running with the same stamp is a no-op.
        entry.check_reset(timing.interval_start(later));
        assert_eq!(entry.interval_start(), timing.interval_start(later));
        assert_eq!(entry.histogram().ctl(3), layout);
    }

    #[test]
    fn concurrent_reset_zeroes_once_and_keeps_layout() {
        use std::sync::Arc;

        let timing = timing();
        let ring = Arc::new(Ring::new(timing.scale));
        ring.record(5, 900, &timing); // grows the last range
        let layout = ring.entries()[0].histogram().ctl(3);

        let stamp = timing.window_ticks;
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let ring = Arc::clone(&ring);
                std::thread::spawn(move || ring.entries()[0].check_reset(stamp))
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let entry = &ring.entries()[0];
        assert_eq!(entry.histogram().total_count(), 0);
        assert_eq!(entry.histogram().ctl(3), layout);
        assert_eq!(entry.interval_start(), stamp);
    }

    #[test]
    fn refresh_skips_when_nothing_changed() {
        let timing = timing();
        let ring = Ring::new(timing.scale);
        let mut ctl = RingControl::new();

        ring.record(10, 5, &timing);
        assert!(ctl.refresh(&ring, 10, &timing, false));
        assert_eq!(ctl.total_count(), 1);

        // Same interval, no new hits: nothing to recompute.
        assert!(!ctl.refresh(&ring, 20, &timing, false));
        // Unless a retry was requested.
        assert!(ctl.refresh(&ring, 20, &timing, true));

        // New hits bump the totals incrementally.
        ring.record(30, 6, &timing);
        ring.record(31, 7, &timing);
        assert!(ctl.refresh(&ring, 40, &timing, false));
        assert_eq!(ctl.total_count(), 3);
    }

    #[test]
    fn window_roll_recounts_and_triggers_once() {
        let timing = timing();
        let ring = Ring::new(timing.scale);
        let mut ctl = RingControl::new();

        // Load the first interval only, then fall silent.
        for rtt in [10u16, 20, 30] {
            ring.record(50, rtt, &timing);
        }
        assert!(ctl.refresh(&ring, 60, &timing, false));
        assert_eq!(ctl.total_count(), 3);

        // One full window later the slot holding those hits is reused;
        // the recount comes back empty and fires exactly once.
        let t = timing.window_ticks + 60;
        assert!(ctl.refresh(&ring, t, &timing, false));
        assert_eq!(ctl.total_count(), 0);
        assert!(!ctl.refresh(&ring, t + 1, &timing, false));
    }
}
