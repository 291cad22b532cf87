//! Adaptive performance monitor for upstream servers
//!
//! Streaming approximate response-time statistics (min, max, average
//! and a configured set of percentiles) over a sliding window, for
//! many tracked servers at reverse-proxy throughput.
//!
//! Design principles:
//! - Producers never block: recording a sample is a handful of relaxed
//!   atomic operations plus one lock-free queue push.
//! - One periodic worker owns all window bookkeeping and percentile
//!   computation; readers take a short per-slot read lock for one
//!   memcpy and nothing else.
//! - Accuracy is traded for liveness throughout: histogram buckets
//!   rearrange themselves to the observed latency distribution and a
//!   bounded number of samples may be miscounted while they do.
//!
//! ```no_run
//! use std::sync::Arc;
//! use apm_stats::{Apm, ApmConfig, SystemClock};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let apm = Apm::start(ApmConfig::default(), Arc::new(SystemClock::new()))?;
//! let backend = apm.track();
//!
//! apm.record_now(&backend, 42);
//!
//! let mut report = apm.report();
//! if apm.query(&backend, &mut report) {
//!     println!("p95 = {:?} ms", report.percentile_ms(95));
//! }
//! apm.stop().await;
//! # Ok(())
//! # }
//! ```

mod clock;
mod config;
mod histogram;
mod ingest;
mod monitor;
mod percentile;
mod publish;
mod ring;
mod server;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ApmConfig, Timing};
pub use monitor::{Apm, ServerHandle};
pub use percentile::PercentileReport;
