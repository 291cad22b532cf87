//! Monitor configuration
//!
//! The observation window is split into `scale` equal intervals; each
//! interval maps to one ring entry. The percentile set is fixed for the
//! lifetime of the monitor, every stats consumer must use the same set.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Minimum observation window (seconds).
pub const MIN_WINDOW_SECS: u64 = 60;
/// Maximum observation window (seconds).
pub const MAX_WINDOW_SECS: u64 = 3600;
/// Default observation window (seconds).
pub const DEF_WINDOW_SECS: u64 = 300;

/// Minimum window scale (number of ring entries).
pub const MIN_SCALE: u32 = 1;
/// Maximum window scale.
pub const MAX_SCALE: u32 = 50;
/// Default window scale.
pub const DEF_SCALE: u32 = 5;

/// Minimum length of a single ring interval (seconds).
pub const MIN_INTERVAL_SECS: u64 = 5;

/// Configuration for the adaptive performance monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApmConfig {
    /// Sliding observation window in seconds.
    pub window_secs: u64,
    /// Number of intervals the window is split into (ring size).
    pub scale: u32,
    /// Percentiles to observe, strictly increasing, each in 0..=100.
    pub percentiles: Vec<u8>,
}

impl Default for ApmConfig {
    fn default() -> Self {
        Self {
            window_secs: DEF_WINDOW_SECS,
            scale: DEF_SCALE,
            percentiles: vec![50, 75, 90, 95, 99],
        }
    }
}

impl ApmConfig {
    /// Build a config from environment variables, falling back to defaults.
    ///
    /// Recognized: `APM_STATS_WINDOW_SECS`, `APM_STATS_SCALE`,
    /// `APM_STATS_PERCENTILES` (comma-separated, e.g. `50,90,99`).
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("APM_STATS_WINDOW_SECS") {
            if let Ok(secs) = v.parse() {
                cfg.window_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("APM_STATS_SCALE") {
            if let Ok(scale) = v.parse() {
                cfg.scale = scale;
            }
        }
        if let Ok(v) = std::env::var("APM_STATS_PERCENTILES") {
            let parsed: Result<Vec<u8>, _> =
                v.split(',').map(|s| s.trim().parse()).collect();
            if let Ok(ith) = parsed {
                if !ith.is_empty() {
                    cfg.percentiles = ith;
                }
            }
        }

        cfg
    }

    /// Validate the config and resolve it into tick-based timing.
    ///
    /// `scale == 1` is promoted to 2 so the ring always has a previous
    /// entry to age out. The window is snapped to `scale * interval`.
    pub fn resolve(&self, ticks_per_second: u64) -> Result<Timing> {
        if self.window_secs < MIN_WINDOW_SECS || self.window_secs > MAX_WINDOW_SECS {
            bail!(
                "window: value '{}' is out of limits [{}, {}]",
                self.window_secs,
                MIN_WINDOW_SECS,
                MAX_WINDOW_SECS
            );
        }
        if self.scale < MIN_SCALE || self.scale > MAX_SCALE {
            bail!(
                "scale: value '{}' is out of limits [{}, {}]",
                self.scale,
                MIN_SCALE,
                MAX_SCALE
            );
        }
        if self.percentiles.is_empty() {
            bail!("percentiles: at least one value is required");
        }
        for pair in self.percentiles.windows(2) {
            if pair[0] >= pair[1] {
                bail!("percentiles: values must be strictly increasing");
            }
        }
        if let Some(&last) = self.percentiles.last() {
            if last > 100 {
                bail!("percentiles: value '{}' is out of limits [0, 100]", last);
            }
        }

        let scale = if self.scale == 1 { 2 } else { self.scale } as u64;

        let window_ticks = self.window_secs * ticks_per_second;
        // Round the interval up so `scale` intervals always cover the window.
        let interval_ticks = window_ticks / scale + u64::from(window_ticks % scale != 0);

        if interval_ticks < MIN_INTERVAL_SECS * ticks_per_second {
            bail!(
                "window={} scale={}: the resulting interval is shorter than {}s",
                self.window_secs,
                self.scale,
                MIN_INTERVAL_SECS
            );
        }

        Ok(Timing {
            interval_ticks,
            window_ticks: interval_ticks * scale,
            scale: scale as usize,
            ticks_per_second,
        })
    }
}

/// Resolved tick-based timing shared by the ring and the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Length of one ring interval in ticks.
    pub interval_ticks: u64,
    /// Full window length in ticks, always `interval_ticks * scale`.
    pub window_ticks: u64,
    /// Number of ring entries.
    pub scale: usize,
    /// Tick resolution the timing was resolved against.
    pub ticks_per_second: u64,
}

impl Timing {
    /// Start of the interval containing `ticks`.
    #[inline]
    pub fn interval_start(&self, ticks: u64) -> u64 {
        ticks - ticks % self.interval_ticks
    }

    /// Ring slot for `ticks`.
    #[inline]
    pub fn entry_index(&self, ticks: u64) -> usize {
        (ticks / self.interval_ticks) as usize % self.scale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve() {
        let timing = ApmConfig::default().resolve(1000).unwrap();
        assert_eq!(timing.scale, 5);
        assert_eq!(timing.interval_ticks, 60_000);
        assert_eq!(timing.window_ticks, 300_000);
    }

    #[test]
    fn scale_one_is_promoted() {
        let cfg = ApmConfig {
            scale: 1,
            ..Default::default()
        };
        let timing = cfg.resolve(1000).unwrap();
        assert_eq!(timing.scale, 2);
        assert_eq!(timing.interval_ticks, 150_000);
    }

    #[test]
    fn window_is_snapped_to_whole_intervals() {
        let cfg = ApmConfig {
            window_secs: 300,
            scale: 7,
            ..Default::default()
        };
        let timing = cfg.resolve(1000).unwrap();
        // ceil(300s / 7) = 42858 ms, snapped window covers all 7 intervals.
        assert_eq!(timing.interval_ticks, 42_858);
        assert_eq!(timing.window_ticks, 42_858 * 7);
    }

    #[test]
    fn rejects_out_of_range_window() {
        let cfg = ApmConfig {
            window_secs: 10,
            ..Default::default()
        };
        assert!(cfg.resolve(1000).is_err());

        let cfg = ApmConfig {
            window_secs: 4000,
            ..Default::default()
        };
        assert!(cfg.resolve(1000).is_err());
    }

    #[test]
    fn rejects_too_short_interval() {
        // 60s split 50 ways is a 2s interval, below the 5s floor.
        let cfg = ApmConfig {
            window_secs: 60,
            scale: 50,
            ..Default::default()
        };
        assert!(cfg.resolve(1000).is_err());
    }

    #[test]
    fn rejects_bad_percentile_sets() {
        let mut cfg = ApmConfig {
            percentiles: vec![],
            ..Default::default()
        };
        assert!(cfg.resolve(1000).is_err());

        cfg.percentiles = vec![50, 50];
        assert!(cfg.resolve(1000).is_err());

        cfg.percentiles = vec![90, 101];
        assert!(cfg.resolve(1000).is_err());
    }

    #[test]
    fn interval_math() {
        let timing = ApmConfig::default().resolve(1000).unwrap();
        assert_eq!(timing.interval_start(60_000), 60_000);
        assert_eq!(timing.interval_start(61_234), 60_000);
        assert_eq!(timing.entry_index(0), 0);
        assert_eq!(timing.entry_index(60_000), 1);
        assert_eq!(timing.entry_index(300_000), 0);
    }
}
