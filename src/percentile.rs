//! Percentile computation over the ring
//!
//! A single k-way merge walks every ring entry's buckets in ascending
//! response-time order and fills the requested percentiles as the
//! running hit count crosses each target. Bucket counts and the total
//! are updated by producers at slightly different times, so the merge
//! may run out of buckets before the last target is reached; the
//! caller then keeps the previous figures and retries on the next
//! tick.

use serde::Serialize;
use tracing::debug;

use crate::histogram::{Histogram, BUCKETS, RANGES};
use crate::ring::Ring;

/// Result slots ahead of the percentile values.
pub(crate) const SLOT_MIN: usize = 0;
pub(crate) const SLOT_MAX: usize = 1;
pub(crate) const SLOT_AVG: usize = 2;
pub(crate) const SLOT_ITH: usize = 3;

/// Cursor over one histogram's non-empty buckets in value order.
///
/// Values ascend across ranges because the partition is contiguous and
/// non-overlapping. `v` holds the sentinel when the entry is drained.
struct Cursor<'a> {
    hist: &'a Histogram,
    v: u32,
    i: usize,
    r: usize,
    b: usize,
}

const EXHAUSTED: u32 = u32::MAX;
const TOTAL_BUCKETS: usize = RANGES * BUCKETS;

impl<'a> Cursor<'a> {
    fn new(hist: &'a Histogram) -> Self {
        let mut cur = Self {
            hist,
            v: 0,
            i: 0,
            r: 0,
            b: 0,
        };
        cur.seek();
        cur
    }

    /// Position on the first non-zero bucket at flat index >= `i`.
    fn seek(&mut self) {
        while self.i < TOTAL_BUCKETS {
            let (r, b) = (self.i / BUCKETS, self.i % BUCKETS);
            if self.hist.bucket_count(r, b) != 0 {
                self.v = self.hist.ctl(r).bucket_value(b);
                self.r = r;
                self.b = b;
                return;
            }
            self.i += 1;
        }
        self.v = EXHAUSTED;
    }

    fn advance(&mut self) {
        debug_assert!(self.i < TOTAL_BUCKETS);
        self.i += 1;
        self.seek();
    }

    #[inline]
    fn count(&self) -> u64 {
        self.hist.bucket_count(self.r, self.b) as u64
    }
}

/// Fill `vals` (`[min, max, avg, ith...]`) from the ring.
///
/// `total_cnt` is the windowed hit total the targets are derived from.
/// Returns how many of the `ith` percentiles were filled; fewer than
/// `ith.len()` means the bucket counts lagged the total and the result
/// is only partially usable.
pub(crate) fn calculate(ring: &Ring, total_cnt: u64, ith: &[u8], vals: &mut [u64]) -> usize {
    debug_assert_eq!(vals.len(), SLOT_ITH + ith.len());

    let mut cursors: Vec<Cursor<'_>> = ring
        .entries()
        .iter()
        .map(|e| Cursor::new(e.histogram()))
        .collect();

    // Hits to collect for each percentile. The set is ascending, so
    // the targets are too and the fill pointer only moves forward.
    let pval: Vec<u64> = ith
        .iter()
        .map(|&q| total_cnt * q as u64 / 100)
        .collect();
    let mut p = 0;
    while p < ith.len() && pval[p] == 0 {
        vals[SLOT_ITH + p] = 0;
        p += 1;
    }

    let mut cnt = 0u64;
    while p < ith.len() {
        let v_min = cursors.iter().map(|c| c.v).min().unwrap_or(EXHAUSTED);
        // The counts ran short of the total: the results are
        // incomplete and can only be used partially.
        if v_min == EXHAUSTED {
            debug!(cnt, total_cnt, filled = p, "percentile merge ran dry");
            break;
        }
        for cur in cursors.iter_mut() {
            if cur.v == v_min {
                cnt += cur.count();
                cur.advance();
            }
        }
        while p < ith.len() && pval[p] <= cnt {
            vals[SLOT_ITH + p] = v_min as u64;
            p += 1;
        }
    }
    let filled = p;

    let mut min = u32::MAX;
    let mut max = 0u32;
    let mut hits = 0u64;
    let mut value_sum = 0u64;
    for entry in ring.entries() {
        let h = entry.histogram();
        min = min.min(h.min_value());
        max = max.max(h.max_value());
        hits += h.total_count();
        value_sum += h.total_value();
    }
    vals[SLOT_MIN] = if min == u32::MAX { 0 } else { min as u64 };
    vals[SLOT_MAX] = max as u64;
    vals[SLOT_AVG] = if hits != 0 { value_sum / hits } else { 0 };

    filled
}

/// A percentile stats request/response pair.
///
/// Holds the percentile set the caller asked for, the latest values
/// copied out on [`crate::Apm::query`], and the publication sequence
/// those values were read at. The value layout is min, max, average,
/// then one slot per requested percentile. All values are in
/// milliseconds.
#[derive(Debug, Clone, Serialize)]
pub struct PercentileReport {
    ith: Vec<u8>,
    vals: Vec<u64>,
    #[serde(skip)]
    seq: u32,
}

impl PercentileReport {
    pub(crate) fn new(ith: Vec<u8>) -> Self {
        let vals = vec![0; SLOT_ITH + ith.len()];
        Self { ith, vals, seq: 0 }
    }

    /// The percentile set this report observes.
    pub fn percentile_set(&self) -> &[u8] {
        &self.ith
    }

    /// Smallest response time seen in the window, 0 when idle.
    pub fn min_ms(&self) -> u64 {
        self.vals[SLOT_MIN]
    }

    /// Largest response time seen in the window.
    pub fn max_ms(&self) -> u64 {
        self.vals[SLOT_MAX]
    }

    /// Mean response time over the window, 0 when idle.
    pub fn avg_ms(&self) -> u64 {
        self.vals[SLOT_AVG]
    }

    /// Value for percentile `q`, when `q` is in the observed set.
    pub fn percentile_ms(&self, q: u8) -> Option<u64> {
        self.ith
            .iter()
            .position(|&p| p == q)
            .map(|i| self.vals[SLOT_ITH + i])
    }

    /// All percentile values, parallel to [`Self::percentile_set`].
    pub fn percentile_values(&self) -> &[u64] {
        &self.vals[SLOT_ITH..]
    }

    /// Publication sequence of the last [`crate::Apm::query`].
    pub fn sequence(&self) -> u32 {
        self.seq
    }

    pub(crate) fn values_mut(&mut self) -> &mut [u64] {
        &mut self.vals
    }

    pub(crate) fn set_sequence(&mut self, seq: u32) {
        self.seq = seq;
    }
}
