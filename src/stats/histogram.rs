//! Latency histogram using HdrHistogram
//!
//! Tracks per-operation device latency from 1 ns to 1 hour with 3 significant
//! digits. Recording and percentile queries are O(1).
//!
//! # Example
//!
//! ```
//! use iovet::stats::histogram::LatencyHistogram;
//! use std::time::Duration;
//!
//! let mut hist = LatencyHistogram::new()?;
//! hist.record(Duration::from_micros(100));
//! hist.record(Duration::from_micros(200));
//!
//! assert_eq!(hist.len(), 2);
//! assert!(hist.percentile(99.0).unwrap() >= Duration::from_micros(199));
//! # Ok::<(), anyhow::Error>(())
//! ```

use crate::Result;
use anyhow::Context;
use hdrhistogram::Histogram;
use serde::Serialize;
use std::time::Duration;

const MAX_NANOS: u64 = 3_600_000_000_000;

/// Per-operation device latency
#[derive(Debug, Clone)]
pub struct LatencyHistogram {
    histogram: Histogram<u64>,
}

impl LatencyHistogram {
    pub fn new() -> Result<Self> {
        Histogram::new_with_bounds(1, MAX_NANOS, 3)
            .map(|histogram| Self { histogram })
            .context("cannot allocate latency histogram")
    }

    /// Record a latency sample, clamped to 1 ns .. 1 hour
    #[inline]
    pub fn record(&mut self, latency: Duration) {
        let nanos = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        self.histogram.saturating_record(nanos.max(1));
    }

    fn read(&self, f: impl FnOnce(&Histogram<u64>) -> u64) -> Option<Duration> {
        (!self.is_empty()).then(|| Duration::from_nanos(f(&self.histogram)))
    }

    /// Latency at `percentile` (0.0 - 100.0), None when empty
    pub fn percentile(&self, percentile: f64) -> Option<Duration> {
        self.read(|h| h.value_at_percentile(percentile))
    }

    pub fn min(&self) -> Option<Duration> {
        self.read(|h| h.min())
    }

    pub fn max(&self) -> Option<Duration> {
        self.read(|h| h.max())
    }

    pub fn mean(&self) -> Option<Duration> {
        self.read(|h| h.mean() as u64)
    }

    pub fn len(&self) -> u64 {
        self.histogram.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histogram.len() == 0
    }

    /// Merge another histogram into this one (job-level aggregation)
    pub fn merge(&mut self, other: &LatencyHistogram) -> Result<()> {
        self.histogram
            .add(&other.histogram)
            .map_err(|e| anyhow::anyhow!("latency histograms do not merge: {}", e))
    }

    /// Serializable digest for reports
    pub fn summary(&self) -> LatencySummary {
        let us = |d: Option<Duration>| d.map(|d| d.as_secs_f64() * 1e6).unwrap_or(0.0);
        LatencySummary {
            count: self.len(),
            min_us: us(self.min()),
            mean_us: us(self.mean()),
            p50_us: us(self.percentile(50.0)),
            p99_us: us(self.percentile(99.0)),
            p999_us: us(self.percentile(99.9)),
            max_us: us(self.max()),
        }
    }
}

/// Latency percentiles in microseconds
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct LatencySummary {
    pub count: u64,
    pub min_us: f64,
    pub mean_us: f64,
    pub p50_us: f64,
    pub p99_us: f64,
    pub p999_us: f64,
    pub max_us: f64,
}
