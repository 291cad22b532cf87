//! Adaptive multi-range latency histogram
//!
//! The response-time axis is split into four ranges of sixteen buckets
//! each. Bucket width inside a range is `2^order` milliseconds, so the
//! ranges grow logarithmically: estimation error becomes negligible as
//! the time grows, and a long tail is covered with a fixed number of
//! counters. Server response times are unknown up front, so the
//! partition rearranges itself on line, without a lock, as samples
//! arrive:
//!
//! - the last range extends to the right to cover new maxima;
//! - a range crowding its leftmost bucket shrinks from the left, and
//!   its left neighbour may grow right into the gap.
//!
//! The leftmost bound stays fixed at 1 ms, so the ranges only worm to
//! the right and the layout converges at the largest response time
//! faced. Rearrangement redistributes counters approximately and a few
//! concurrent increments may be lost while it runs. That is accepted:
//! the consumer of this data tolerates inexact counts.
//!
//! Single writer is not assumed anywhere here. Any number of producers
//! may call [`Histogram::record`] concurrently; readers see counters
//! and control words at independent times and must tolerate any
//! stale/fresh combination.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tracing::trace;

/// Number of ranges partitioning the response-time axis.
pub const RANGES: usize = 4;
/// Buckets per range.
pub const BUCKETS: usize = 16;
/// Last (open-ended, growable) range.
const LAST: usize = RANGES - 1;

/// Largest response time the histogram can hold, in milliseconds.
pub const MAX_RTT_MS: u32 = u16::MAX as u32;

/// One range's bucket layout: `(order, begin, end)` packed into a
/// single word so producers never observe a torn triple.
///
/// `end == begin + (BUCKETS - 1) << order` except at the very top,
/// where `end` saturates at [`MAX_RTT_MS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeCtl {
    /// Bucket width exponent; bucket width is `1 << order` ms.
    pub order: u32,
    /// Inclusive left edge of the range.
    pub begin: u16,
    /// Inclusive right edge of the range.
    pub end: u16,
}

impl RangeCtl {
    const fn pack(self) -> u64 {
        ((self.order as u64) << 32) | ((self.begin as u64) << 16) | self.end as u64
    }

    const fn unpack(word: u64) -> Self {
        Self {
            order: (word >> 32) as u32,
            begin: (word >> 16) as u16,
            end: word as u16,
        }
    }

    /// Right edge for the current `begin`/`order`, saturated to the
    /// representable maximum.
    fn computed_end(self) -> u16 {
        let end = self.begin as u32 + (((BUCKETS - 1) as u32) << self.order);
        end.min(MAX_RTT_MS) as u16
    }

    /// Upper-edge response time of bucket `b` in this range.
    #[inline]
    pub fn bucket_value(self, b: usize) -> u32 {
        self.begin as u32 + ((b as u32) << self.order)
    }
}

/// [1ms, 349ms] is sufficient for almost any installation, including
/// cross-atlantic backends; the last range extends itself beyond that.
const INITIAL_RANGES: [RangeCtl; RANGES] = [
    RangeCtl { order: 0, begin: 1, end: 16 },
    RangeCtl { order: 1, begin: 17, end: 47 },
    RangeCtl { order: 2, begin: 48, end: 108 },
    RangeCtl { order: 4, begin: 109, end: 349 },
];

/// One row of bucket counters, sized and aligned to one cache line so
/// rearrangement in one range does not bounce its neighbours' lines.
#[repr(C, align(64))]
struct BucketRow([AtomicU32; BUCKETS]);

impl BucketRow {
    fn new() -> Self {
        Self(std::array::from_fn(|_| AtomicU32::new(0)))
    }
}

const CTL_PAD: usize = 64 - RANGES * 8;
const TOTALS_PAD: usize = 64 - 2 * 8 - 2 * 4;

/// Adaptive four-range bucketed counter array with running totals.
///
/// Control words, totals and each bucket row live on separate cache
/// lines. All counters are plain atomics updated with relaxed ordering;
/// the only published invariant is that a control word is always a
/// consistent `(order, begin, end)` triple.
#[repr(C, align(64))]
pub struct Histogram {
    ctl: [AtomicU64; RANGES],
    _pad0: [u8; CTL_PAD],
    // Everything below is cleared when a ring entry is reused; the
    // learned control words above carry over between windows.
    tot_cnt: AtomicU64,
    tot_val: AtomicU64,
    min_val: AtomicU32,
    max_val: AtomicU32,
    _pad1: [u8; TOTALS_PAD],
    cnt: [BucketRow; RANGES],
}

impl Histogram {
    pub fn new() -> Self {
        Self {
            ctl: std::array::from_fn(|r| AtomicU64::new(INITIAL_RANGES[r].pack())),
            _pad0: [0; CTL_PAD],
            tot_cnt: AtomicU64::new(0),
            tot_val: AtomicU64::new(0),
            min_val: AtomicU32::new(u32::MAX),
            max_val: AtomicU32::new(0),
            _pad1: [0; TOTALS_PAD],
            cnt: std::array::from_fn(|_| BucketRow::new()),
        }
    }

    /// Record one response-time sample, `rtt` in milliseconds.
    ///
    /// Lock-free and safe under any number of concurrent callers. A
    /// control word may change between the range lookup and the bucket
    /// increment; the increment then lands in a freshly rewritten
    /// bucket. Only correct array indexing matters, the miscount is
    /// bounded and accepted.
    pub fn record(&self, rtt: u16) {
        if !self.note_min(rtt) {
            self.note_max(rtt);
        }
        self.tot_val.fetch_add(rtt as u64, Ordering::Relaxed);

        // Descending binary search for the range.
        let pc2 = self.ctl(2);
        if rtt <= pc2.end {
            let pc1 = self.ctl(1);
            if pc1.end < rtt {
                self.bump(2, pc2, rtt);
                return;
            }
            let pc0 = self.ctl(0);
            debug_assert_eq!(pc0.begin, 1, "left bound is never moved");
            if pc0.end < rtt {
                self.bump(1, pc1, rtt);
                return;
            }
            self.bump(0, pc0, rtt);
            return;
        }

        let mut pc3 = self.ctl(LAST);
        if rtt > pc3.end {
            self.extend(rtt);
            pc3 = self.ctl(LAST);
        }
        self.bump(LAST, pc3, rtt);
    }

    #[inline]
    fn bump(&self, r: usize, pc: RangeCtl, rtt: u16) {
        self.cnt[r].0[bucket_index(pc, rtt)].fetch_add(1, Ordering::Relaxed);
        self.adjust(r);
        self.tot_cnt.fetch_add(1, Ordering::Relaxed);
    }

    /// Lower the running minimum; true if this sample set it.
    fn note_min(&self, rtt: u16) -> bool {
        let mut cur = self.min_val.load(Ordering::Relaxed);
        while (rtt as u32) < cur {
            match self.min_val.compare_exchange_weak(
                cur,
                rtt as u32,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(seen) => cur = seen,
            }
        }
        false
    }

    /// Raise the running maximum; true if this sample set it.
    fn note_max(&self, rtt: u16) -> bool {
        let mut cur = self.max_val.load(Ordering::Relaxed);
        while (rtt as u32) > cur {
            match self.max_val.compare_exchange_weak(
                cur,
                rtt as u32,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(seen) => cur = seen,
            }
        }
        false
    }

    /// Extend the last range until it covers `rtt`.
    fn extend(&self, rtt: u16) {
        let mut pc = self.ctl(LAST);
        loop {
            pc.order += 1;
            pc.end = pc.computed_end();
            if pc.end >= rtt {
                break;
            }
        }
        self.store_ctl(LAST, pc);
        trace!(
            begin = pc.begin,
            order = pc.order,
            end = pc.end,
            "extended last range"
        );
        // Coalesce all counters into the left half of the buckets.
        // Some concurrent updates may be lost.
        self.coalesce_left(LAST);
    }

    /// See if range `r` holds a large outlier and rearrange if so.
    ///
    /// Invoked right after a bucket increment in `r`, so the range
    /// snapshot below normally holds at least one non-zero bucket; a
    /// concurrent rearrangement can transiently empty it, in which case
    /// there is nothing to do.
    fn adjust(&self, r: usize) {
        let mut sum: u64 = 0;
        let mut cnt_nz: u64 = 0;
        let mut max: u32 = 0;
        let mut i_max = 0usize;

        for (i, bucket) in self.cnt[r].0.iter().enumerate() {
            let v = bucket.load(Ordering::Relaxed);
            if v != 0 {
                sum += v as u64;
                cnt_nz += 1;
            }
            if v > max {
                max = v;
                i_max = i;
            }
        }
        if cnt_nz == 0 {
            return;
        }
        // Outlier means max > avg * 2.
        if (max as u64) <= 2 * sum / cnt_nz {
            return;
        }

        if r > 0 && i_max == 0 {
            // Too many hits in the gap between ranges r and r-1. Move
            // the right bound of range r-1 up into the gap, when the
            // grown range still fits below our left edge.
            let pc_curr = self.ctl(r);
            let mut pc_prev = self.ctl(r - 1);
            let grown_end =
                pc_prev.begin as u32 + (((BUCKETS - 1) as u32) << (pc_prev.order + 1));
            if grown_end < pc_curr.begin as u32 {
                self.grow_right(r - 1, &mut pc_prev);
                // Spread the outlier mass evenly over the right half of
                // range r-1. A rough approximation: the sample split
                // between the two ranges is unknown.
                let share = max / (BUCKETS as u32 / 2 + 1);
                let _ = self.cnt[r].0[0].fetch_update(
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                    |v| Some(v.saturating_sub(share * (BUCKETS as u32 / 2))),
                );
                for i in BUCKETS / 2..BUCKETS {
                    self.cnt[r - 1].0[i].store(share, Ordering::Relaxed);
                }
            }
            // Fall through to reduce the order. The left bound moves
            // right, so the right bound of range r-1 can follow on a
            // later pass.
        }

        // The bucket width is too big for the traffic. Narrow the range
        // by moving the left bound. If all responses fit in range 0
        // there is nothing to narrow.
        if r == 0 {
            return;
        }
        let pc = self.ctl(r);
        if pc.order > 0 {
            self.shrink_left(r, pc);
        }
    }

    fn grow_right(&self, r: usize, pc: &mut RangeCtl) {
        pc.order += 1;
        pc.end = pc.computed_end();
        self.store_ctl(r, *pc);
        trace!(
            range = r,
            begin = pc.begin,
            order = pc.order,
            end = pc.end,
            "grew right bound"
        );
        self.coalesce_left(r);
    }

    fn shrink_left(&self, r: usize, mut pc: RangeCtl) {
        pc.order -= 1;
        pc.begin = (pc.end as u32 - (((BUCKETS - 1) as u32) << pc.order)) as u16;
        self.store_ctl(r, pc);
        trace!(
            range = r,
            begin = pc.begin,
            order = pc.order,
            end = pc.end,
            "shrank left bound"
        );
        // Fold the left half into the first bucket, then split each
        // right-half bucket evenly over two new buckets. Some
        // concurrent updates may be lost.
        let row = &self.cnt[r].0;
        for i in 1..BUCKETS / 2 {
            row[0].fetch_add(row[i].load(Ordering::Relaxed), Ordering::Relaxed);
        }
        let full = row[BUCKETS / 2].load(Ordering::Relaxed);
        let half = full / 2;
        row[0].fetch_add(half, Ordering::Relaxed);
        row[1].store(full - half, Ordering::Relaxed);
        for i in 1..BUCKETS / 2 {
            let full = row[BUCKETS / 2 + i].load(Ordering::Relaxed);
            let half = full / 2;
            row[2 * i].store(half, Ordering::Relaxed);
            row[2 * i + 1].store(full - half, Ordering::Relaxed);
        }
    }

    /// `cnt[i] = cnt[2i] + cnt[2i+1]` over the left half after an order
    /// bump; the right half keeps stale values that subsequent traffic
    /// overwrites.
    fn coalesce_left(&self, r: usize) {
        let row = &self.cnt[r].0;
        for i in 0..BUCKETS / 2 {
            let merged = row[2 * i]
                .load(Ordering::Relaxed)
                .wrapping_add(row[2 * i + 1].load(Ordering::Relaxed));
            row[i].store(merged, Ordering::Relaxed);
        }
    }

    /// Clear all counters for reuse in a new interval. The control
    /// words are left alone so the learned layout survives the window.
    pub fn reset_counters(&self) {
        self.tot_cnt.store(0, Ordering::Relaxed);
        self.tot_val.store(0, Ordering::Relaxed);
        self.min_val.store(u32::MAX, Ordering::Relaxed);
        self.max_val.store(0, Ordering::Relaxed);
        for row in &self.cnt {
            for bucket in &row.0 {
                bucket.store(0, Ordering::Relaxed);
            }
        }
    }

    #[inline]
    pub fn ctl(&self, r: usize) -> RangeCtl {
        RangeCtl::unpack(self.ctl[r].load(Ordering::Relaxed))
    }

    #[inline]
    fn store_ctl(&self, r: usize, pc: RangeCtl) {
        self.ctl[r].store(pc.pack(), Ordering::Relaxed);
    }

    #[inline]
    pub fn bucket_count(&self, r: usize, b: usize) -> u32 {
        self.cnt[r].0[b].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn total_count(&self) -> u64 {
        self.tot_cnt.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn total_value(&self) -> u64 {
        self.tot_val.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn min_value(&self) -> u32 {
        self.min_val.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn max_value(&self) -> u32 {
        self.max_val.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Histogram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Histogram")
            .field("ranges", &[self.ctl(0), self.ctl(1), self.ctl(2), self.ctl(3)])
            .field("tot_cnt", &self.total_count())
            .field("tot_val", &self.total_value())
            .finish()
    }
}

/// Bucket index for `rtt` under the range snapshot `pc`, clamped so a
/// concurrently rewritten control word can never push the index out of
/// the row.
#[inline]
fn bucket_index(pc: RangeCtl, rtt: u16) -> usize {
    if rtt <= pc.begin {
        return 0;
    }
    let width = 1u32 << pc.order;
    let idx = ((rtt - pc.begin) as u32 + width - 1) >> pc.order;
    (idx as usize).min(BUCKETS - 1)
}
