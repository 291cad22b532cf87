//! Monitor front end and periodic scheduler
//!
//! The only party that calculates percentiles is the single worker
//! task below, woken on a short timer. Producers never wait on it:
//! they enqueue samples on their shard and move on. Each tick the
//! worker drains every shard, routes the samples into the owners'
//! rings, then recomputes stats once per server that saw updates.
//! Servers whose computation came back incomplete are parked on a
//! retry queue and the next tick is pulled in early for them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::{ApmConfig, Timing};
use crate::histogram::MAX_RTT_MS;
use crate::ingest::{Sample, SampleQueues};
use crate::percentile::{self, PercentileReport, SLOT_ITH};
use crate::server::ServerStats;

/// Timer period: one twentieth of a second.
const TICK_DIVISOR: u64 = 20;

/// Handle to one tracked server's statistics.
///
/// Clones share the same state. The state lives for as long as any
/// clone, queued sample or pending recalculation refers to it, so
/// dropping the last handle while samples are in flight is safe.
#[derive(Clone)]
pub struct ServerHandle {
    stats: Arc<ServerStats>,
}

struct Shared {
    timing: Timing,
    ith: Vec<u8>,
    queues: SampleQueues,
    clock: Arc<dyn Clock>,
    rearm: AtomicBool,
    shutdown: Notify,
    period: Duration,
    retry: Duration,
}

/// The adaptive performance monitor.
///
/// Create with [`Apm::start`] inside a tokio runtime; the periodic
/// worker runs until [`Apm::stop`].
pub struct Apm {
    shared: Arc<Shared>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Apm {
    /// Validate the configuration and start the periodic worker.
    pub fn start(config: ApmConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let shards = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let shared = new_shared(config, clock, shards)?;
        let worker = tokio::spawn(run(Arc::clone(&shared)));
        info!(
            window_ticks = shared.timing.window_ticks,
            interval_ticks = shared.timing.interval_ticks,
            scale = shared.timing.scale,
            shards,
            "apm stats started"
        );
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Begin tracking one server.
    pub fn track(&self) -> ServerHandle {
        ServerHandle {
            stats: Arc::new(ServerStats::new(
                self.shared.timing.scale,
                SLOT_ITH + self.shared.ith.len(),
            )),
        }
    }

    /// Record one response time, timestamped by the caller.
    ///
    /// Never blocks. Values past the bucket axis (65535 ms) and
    /// samples arriving on a full shard are dropped silently.
    pub fn record(&self, handle: &ServerHandle, ts_ticks: u64, rtt_ms: u64) {
        if rtt_ms > MAX_RTT_MS as u64 {
            return;
        }
        self.shared.queues.push(Sample {
            stats: Arc::clone(&handle.stats),
            ts_ticks,
            rtt_ms: rtt_ms as u16,
        });
    }

    /// Record one response time stamped with the monitor's clock.
    pub fn record_now(&self, handle: &ServerHandle, rtt_ms: u64) {
        self.record(handle, self.shared.clock.now_ticks(), rtt_ms);
    }

    /// Copy the latest published stats for `handle` into `report`.
    ///
    /// Returns whether the values may have changed since the report's
    /// previous query. The report must come from [`Apm::report`] of a
    /// monitor with the same percentile set.
    pub fn query(&self, handle: &ServerHandle, report: &mut PercentileReport) -> bool {
        let cached = report.sequence();
        let (seq, changed) = handle.stats.publisher.read_into(report.values_mut(), cached);
        report.set_sequence(seq);
        changed
    }

    /// A zeroed report for this monitor's percentile set.
    pub fn report(&self) -> PercentileReport {
        PercentileReport::new(self.shared.ith.clone())
    }

    /// Check that a report observes exactly this monitor's percentile
    /// set. All stats consumers must use the same set.
    pub fn verify_request(&self, report: &PercentileReport) -> bool {
        report.percentile_set() == self.shared.ith.as_slice()
    }

    /// Samples dropped so far on full ingest shards.
    pub fn dropped_samples(&self) -> u64 {
        self.shared.queues.dropped_total()
    }

    /// Stop the worker and release queued samples.
    ///
    /// Two phases: disarm and join the timer task, then drain whatever
    /// the producers managed to enqueue meanwhile.
    pub async fn stop(&self) {
        self.shared.rearm.store(false, Ordering::Release);
        self.shared.shutdown.notify_one();
        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            let _ = handle.await;
        }
        self.shared.queues.drain(|_| {});
        info!("apm stats stopped");
    }
}

impl Drop for Apm {
    fn drop(&mut self) {
        // Without an explicit stop the worker still has to wind down.
        self.shared.rearm.store(false, Ordering::Release);
        self.shared.shutdown.notify_one();
    }
}

fn new_shared(config: ApmConfig, clock: Arc<dyn Clock>, shards: usize) -> Result<Arc<Shared>> {
    let timing = config
        .resolve(clock.ticks_per_second())
        .context("apm stats configuration rejected")?;
    let tps = timing.ticks_per_second;
    Ok(Arc::new(Shared {
        timing,
        ith: config.percentiles,
        queues: SampleQueues::new(shards),
        clock,
        rearm: AtomicBool::new(true),
        shutdown: Notify::new(),
        period: ticks_to_duration((tps / TICK_DIVISOR).max(1), tps),
        retry: ticks_to_duration(1, tps).max(Duration::from_millis(1)),
    }))
}

fn ticks_to_duration(ticks: u64, tps: u64) -> Duration {
    Duration::from_secs_f64(ticks as f64 / tps as f64)
}

async fn run(shared: Arc<Shared>) {
    let mut qcalc: Vec<Arc<ServerStats>> = Vec::new();
    let mut qrecalc: Vec<Arc<ServerStats>> = Vec::new();
    let mut delay = shared.period;

    loop {
        tokio::select! {
            _ = shared.shutdown.notified() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        if !shared.rearm.load(Ordering::Acquire) {
            break;
        }
        tick(&shared, &mut qcalc, &mut qrecalc);
        // Recalculations are worth retrying as soon as fresh samples
        // can possibly have arrived.
        delay = if qrecalc.is_empty() {
            shared.period
        } else {
            shared.retry
        };
    }

    debug_assert!(qcalc.is_empty());
    if !qrecalc.is_empty() {
        debug!(parked = qrecalc.len(), "dropping parked recalculations");
        qrecalc.clear();
    }
}

/// One timer tick: route queued samples, then recompute stats once per
/// server that was updated.
fn tick(shared: &Shared, qcalc: &mut Vec<Arc<ServerStats>>, qrecalc: &mut Vec<Arc<ServerStats>>) {
    shared.queues.drain(|sample| {
        sample
            .stats
            .ring
            .record(sample.ts_ticks, sample.rtt_ms, &shared.timing);
        if !sample.stats.test_and_set_pending() {
            // A server parked for retry goes through the regular
            // calculation queue now that it has fresh data.
            if let Some(pos) = qrecalc.iter().position(|s| Arc::ptr_eq(s, &sample.stats)) {
                qrecalc.swap_remove(pos);
            }
            qcalc.push(Arc::clone(&sample.stats));
        }
    });

    for stats in qcalc.drain(..) {
        stats.clear_pending();
        if calc(shared, &stats) == CalcOutcome::Incomplete {
            qrecalc.push(stats);
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum CalcOutcome {
    /// Nothing changed, the published values stand.
    Idle,
    Published,
    /// The bucket counts lagged the total; retry when data arrives.
    Incomplete,
}

fn calc(shared: &Shared, stats: &ServerStats) -> CalcOutcome {
    let force = stats.take_recalc();
    let now = shared.clock.now_ticks();
    let total = {
        let mut rbctl = stats.rbctl.lock();
        if !rbctl.refresh(&stats.ring, now, &shared.timing, force) {
            return CalcOutcome::Idle;
        }
        rbctl.total_count()
    };

    let mut vals = vec![0u64; SLOT_ITH + shared.ith.len()];
    let filled = percentile::calculate(&stats.ring, total, &shared.ith, &mut vals);
    if filled < shared.ith.len() {
        debug!(
            filled,
            requested = shared.ith.len(),
            "percentile calculation incomplete"
        );
        stats.mark_recalc();
        return CalcOutcome::Incomplete;
    }
    stats.publisher.publish(&vals);
    CalcOutcome::Published
}
