//! Sharded sample ingest
//!
//! Producers hand their samples to the periodic worker through bounded
//! lock-free queues, one per core, so the hot path is a single push
//! with no shared write line between producer threads. Each producer
//! thread sticks to the shard it drew on first use. A full shard drops
//! the sample; losing a sample under overload is cheaper than stalling
//! the request path, and the drop is counted.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;

use crate::server::ServerStats;

/// Per-shard queue capacity. Power of two, sized for one tick's worth
/// of samples from a busy core with headroom.
const SHARD_CAPACITY: usize = 4096;

/// One queued response-time observation.
pub(crate) struct Sample {
    /// Keeps the server's stats alive until the worker pops the item.
    pub stats: Arc<ServerStats>,
    /// Completion timestamp of the response, in clock ticks.
    pub ts_ticks: u64,
    /// Response time in milliseconds.
    pub rtt_ms: u16,
}

struct Shard {
    queue: ArrayQueue<Sample>,
    dropped: AtomicU64,
}

/// The set of ingest queues, one per core.
pub(crate) struct SampleQueues {
    shards: Box<[Shard]>,
}

impl SampleQueues {
    pub fn new(nshards: usize) -> Self {
        let shards = (0..nshards.max(1))
            .map(|_| Shard {
                queue: ArrayQueue::new(SHARD_CAPACITY),
                dropped: AtomicU64::new(0),
            })
            .collect();
        Self { shards }
    }

    /// Queue one sample on the calling thread's shard.
    ///
    /// Returns false when the shard was full and the sample was
    /// dropped; the item (and the stats reference inside) is released
    /// either way the moment it stops being needed.
    pub fn push(&self, sample: Sample) -> bool {
        let shard = &self.shards[current_shard(self.shards.len())];
        if shard.queue.push(sample).is_err() {
            shard.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Pop every pending sample across all shards. Single consumer.
    pub fn drain(&self, mut f: impl FnMut(Sample)) {
        for shard in self.shards.iter() {
            while let Some(sample) = shard.queue.pop() {
                f(sample);
            }
        }
    }

    /// Samples dropped so far because a shard was full.
    pub fn dropped_total(&self) -> u64 {
        self.shards
            .iter()
            .map(|s| s.dropped.load(Ordering::Relaxed))
            .sum()
    }
}

/// Shard index for the calling thread, assigned round-robin on first
/// use and pinned for the thread's lifetime.
fn current_shard(nshards: usize) -> usize {
    static NEXT_SHARD: AtomicUsize = AtomicUsize::new(0);
    thread_local! {
        static SHARD: Cell<usize> = const { Cell::new(usize::MAX) };
    }
    SHARD.with(|slot| {
        let mut idx = slot.get();
        if idx == usize::MAX {
            idx = NEXT_SHARD.fetch_add(1, Ordering::Relaxed);
            slot.set(idx);
        }
        idx % nshards
    })
}
