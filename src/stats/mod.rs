//! Statistics collection
//!
//! Each I/O context owns an [`IoStats`]: plain counters for the current pass
//! and the run, plus read and write latency histograms. Nothing in it is
//! shared, so recording needs no synchronization.
//!
//! The monitor needs a view of progress while the worker is busy. For that a
//! worker also bumps a [`LiveCounters`], a handful of cache-line aligned
//! atomics shared with the monitor thread.
//!
//! At thread exit the context is reduced to a [`StatsSnapshot`], which is
//! serializable and can be merged into job totals with [`aggregate`].
//!
//! # Example
//!
//! ```
//! use iovet::stats::IoStats;
//! use std::time::Duration;
//!
//! let mut stats = IoStats::new()?;
//! stats.start();
//! stats.record_write(4096, Duration::from_micros(80));
//! stats.record_read(4096, Duration::from_micros(50));
//! stats.end_pass();
//!
//! assert_eq!(stats.totals().records_written, 1);
//! assert_eq!(stats.passes(), 1);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod histogram;

use crate::Result;
use histogram::{LatencyHistogram, LatencySummary};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Cache-line aligned atomic counter
///
/// Workers update their own counters while the monitor reads all of them;
/// padding each counter to 64 bytes keeps one worker's updates from
/// invalidating a neighbour's cache line.
#[repr(align(64))]
#[derive(Debug)]
pub struct AlignedCounter {
    value: AtomicU64,
    _padding: [u8; 56],
}

impl AlignedCounter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
            _padding: [0; 56],
        }
    }

    #[inline]
    pub fn add(&self, val: u64) {
        self.value.fetch_add(val, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set(&self, val: u64) {
        self.value.store(val, Ordering::Relaxed);
    }
}

impl Default for AlignedCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress counters a worker publishes to the monitor
#[derive(Debug, Default)]
pub struct LiveCounters {
    pub records_read: AlignedCounter,
    pub records_written: AlignedCounter,
    pub bytes_read: AlignedCounter,
    pub bytes_written: AlignedCounter,
    pub errors: AlignedCounter,
    /// Current pass number
    pub pass: AlignedCounter,
}

impl LiveCounters {
    #[inline]
    pub fn record_read(&self, bytes: u64) {
        self.records_read.add(1);
        self.bytes_read.add(bytes);
    }

    #[inline]
    pub fn record_write(&self, bytes: u64) {
        self.records_written.add(1);
        self.bytes_written.add(bytes);
    }

    /// Records completed in either direction; never goes backwards
    pub fn records(&self) -> u64 {
        self.records_read.get() + self.records_written.get()
    }

    pub fn bytes(&self) -> u64 {
        self.bytes_read.get() + self.bytes_written.get()
    }
}

/// Operation and failure counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub records_read: u64,
    pub records_written: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Counted failures (after retries)
    pub errors: u64,
    /// Data compare failures (also counted in `errors`)
    pub mismatches: u64,
    /// In-place retries that were attempted
    pub retries: u64,
}

impl Counters {
    pub fn add(&mut self, other: &Counters) {
        self.records_read += other.records_read;
        self.records_written += other.records_written;
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
        self.errors += other.errors;
        self.mismatches += other.mismatches;
        self.retries += other.retries;
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_read + self.bytes_written
    }

    pub fn total_records(&self) -> u64 {
        self.records_read + self.records_written
    }
}

/// Statistics owned by one I/O context
#[derive(Debug, Clone)]
pub struct IoStats {
    pass: Counters,
    total: Counters,
    passes: u64,
    read_latency: LatencyHistogram,
    write_latency: LatencyHistogram,
    started: Option<Instant>,
    pass_started: Option<Instant>,
    /// Frozen by `finish()`
    elapsed: Option<Duration>,
}

impl IoStats {
    pub fn new() -> Result<Self> {
        Ok(Self {
            pass: Counters::default(),
            total: Counters::default(),
            passes: 0,
            read_latency: LatencyHistogram::new()?,
            write_latency: LatencyHistogram::new()?,
            started: None,
            pass_started: None,
            elapsed: None,
        })
    }

    /// Mark the start of the run (and of the first pass)
    pub fn start(&mut self) {
        let now = Instant::now();
        self.started = Some(now);
        self.pass_started = Some(now);
        self.elapsed = None;
    }

    pub fn start_pass(&mut self) {
        self.pass_started = Some(Instant::now());
    }

    #[inline]
    pub fn record_read(&mut self, bytes: u64, latency: Duration) {
        self.pass.records_read += 1;
        self.pass.bytes_read += bytes;
        self.read_latency.record(latency);
    }

    #[inline]
    pub fn record_write(&mut self, bytes: u64, latency: Duration) {
        self.pass.records_written += 1;
        self.pass.bytes_written += bytes;
        self.write_latency.record(latency);
    }

    pub fn record_error(&mut self) {
        self.pass.errors += 1;
    }

    /// A compare failure; counts as an error too
    pub fn record_mismatch(&mut self) {
        self.pass.mismatches += 1;
        self.pass.errors += 1;
    }

    pub fn record_retry(&mut self) {
        self.pass.retries += 1;
    }

    /// Fold the pass counters into the run totals; returns the pass counters
    pub fn end_pass(&mut self) -> Counters {
        let pass = std::mem::take(&mut self.pass);
        self.total.add(&pass);
        self.passes += 1;
        pass
    }

    /// Fold a partial pass (interrupted run) without counting it as a pass
    pub fn fold_partial(&mut self) {
        let pass = std::mem::take(&mut self.pass);
        self.total.add(&pass);
    }

    /// Freeze the elapsed time
    pub fn finish(&mut self) {
        self.fold_partial();
        if self.elapsed.is_none() {
            self.elapsed = Some(self.started.map(|s| s.elapsed()).unwrap_or_default());
        }
    }

    /// Counters of the pass in progress
    pub fn pass(&self) -> &Counters {
        &self.pass
    }

    /// Run totals including the pass in progress
    pub fn totals(&self) -> Counters {
        let mut t = self.total;
        t.add(&self.pass);
        t
    }

    pub fn passes(&self) -> u64 {
        self.passes
    }

    pub fn elapsed(&self) -> Duration {
        match self.elapsed {
            Some(e) => e,
            None => self.started.map(|s| s.elapsed()).unwrap_or_default(),
        }
    }

    pub fn pass_elapsed(&self) -> Duration {
        self.pass_started.map(|s| s.elapsed()).unwrap_or_default()
    }

    pub fn read_latency(&self) -> &LatencyHistogram {
        &self.read_latency
    }

    pub fn write_latency(&self) -> &LatencyHistogram {
        &self.write_latency
    }

    pub fn snapshot(&self, thread: usize, name: &str, device: &str) -> StatsSnapshot {
        StatsSnapshot {
            thread,
            name: name.to_string(),
            device: device.to_string(),
            counters: self.totals(),
            passes: self.passes,
            elapsed_secs: self.elapsed().as_secs_f64(),
            read_latency: self.read_latency.summary(),
            write_latency: self.write_latency.summary(),
            read_hist: Some(self.read_latency.clone()),
            write_hist: Some(self.write_latency.clone()),
        }
    }
}

/// Final (or captured) statistics of one worker
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub thread: usize,
    pub name: String,
    pub device: String,
    pub counters: Counters,
    pub passes: u64,
    pub elapsed_secs: f64,
    pub read_latency: LatencySummary,
    pub write_latency: LatencySummary,
    #[serde(skip)]
    pub read_hist: Option<LatencyHistogram>,
    #[serde(skip)]
    pub write_hist: Option<LatencyHistogram>,
}

impl StatsSnapshot {
    /// Snapshot for a worker that never produced statistics
    pub fn empty(thread: usize, name: &str, device: &str) -> Self {
        Self {
            thread,
            name: name.to_string(),
            device: device.to_string(),
            counters: Counters::default(),
            passes: 0,
            elapsed_secs: 0.0,
            read_latency: LatencySummary::default(),
            write_latency: LatencySummary::default(),
            read_hist: None,
            write_hist: None,
        }
    }

    /// Snapshot built from live counters only (forced cancellation)
    pub fn from_live(thread: usize, name: &str, device: &str, live: &LiveCounters, elapsed: Duration) -> Self {
        let mut snap = Self::empty(thread, name, device);
        snap.counters.records_read = live.records_read.get();
        snap.counters.records_written = live.records_written.get();
        snap.counters.bytes_read = live.bytes_read.get();
        snap.counters.bytes_written = live.bytes_written.get();
        snap.counters.errors = live.errors.get();
        snap.passes = live.pass.get();
        snap.elapsed_secs = elapsed.as_secs_f64();
        snap
    }
}

/// Job-level totals merged from worker snapshots
#[derive(Debug, Clone, Default, Serialize)]
pub struct Aggregate {
    pub counters: Counters,
    /// Fewest passes any worker completed
    pub passes: u64,
    /// Longest worker runtime
    pub elapsed_secs: f64,
    pub read_latency: LatencySummary,
    pub write_latency: LatencySummary,
}

/// Merge worker snapshots into job totals
pub fn aggregate(snapshots: &[StatsSnapshot]) -> Result<Aggregate> {
    let mut counters = Counters::default();
    let mut read = LatencyHistogram::new()?;
    let mut write = LatencyHistogram::new()?;
    let mut elapsed: f64 = 0.0;

    for snap in snapshots {
        counters.add(&snap.counters);
        elapsed = elapsed.max(snap.elapsed_secs);
        if let Some(h) = &snap.read_hist {
            read.merge(h)?;
        }
        if let Some(h) = &snap.write_hist {
            write.merge(h)?;
        }
    }

    Ok(Aggregate {
        counters,
        passes: snapshots.iter().map(|s| s.passes).min().unwrap_or(0),
        elapsed_secs: elapsed,
        read_latency: read.summary(),
        write_latency: write.summary(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_counter_layout() {
        assert_eq!(std::mem::size_of::<AlignedCounter>(), 64);
        assert_eq!(std::mem::align_of::<AlignedCounter>(), 64);
        let c = AlignedCounter::new();
        c.add(5);
        c.add(3);
        assert_eq!(c.get(), 8);
        c.set(1);
        assert_eq!(c.get(), 1);
    }

    #[test]
    fn test_live_counters() {
        let live = LiveCounters::default();
        live.record_write(512);
        live.record_read(512);
        live.errors.add(1);
        assert_eq!(live.records(), 2);
        assert_eq!(live.bytes(), 1024);

        let snap = StatsSnapshot::from_live(0, "t0", "dev", &live, Duration::from_secs(1));
        assert_eq!(snap.counters.records_written, 1);
        assert_eq!(snap.counters.errors, 1);
        assert_eq!(snap.elapsed_secs, 1.0);
    }

    #[test]
    fn test_pass_folding() {
        let mut stats = IoStats::new().unwrap();
        stats.start();
        stats.record_write(512, Duration::from_micros(10));
        stats.record_write(512, Duration::from_micros(10));
        stats.record_mismatch();
        assert_eq!(stats.pass().records_written, 2);

        let pass = stats.end_pass();
        assert_eq!(pass.errors, 1);
        assert_eq!(pass.mismatches, 1);
        assert_eq!(stats.pass(), &Counters::default());
        assert_eq!(stats.totals().bytes_written, 1024);
        assert_eq!(stats.passes(), 1);
    }

    #[test]
    fn test_finish_folds_partial_pass() {
        let mut stats = IoStats::new().unwrap();
        stats.start();
        stats.record_read(4096, Duration::from_micros(5));
        stats.finish();
        assert_eq!(stats.passes(), 0);
        assert_eq!(stats.totals().records_read, 1);
        let frozen = stats.elapsed();
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(stats.elapsed(), frozen);
    }

    #[test]
    fn test_aggregate() {
        let mut a = IoStats::new().unwrap();
        a.start();
        a.record_write(512, Duration::from_micros(100));
        a.end_pass();
        a.end_pass();
        let mut b = IoStats::new().unwrap();
        b.start();
        b.record_write(512, Duration::from_micros(300));
        b.record_error();
        b.end_pass();

        let snaps = vec![a.snapshot(0, "t0", "dev"), b.snapshot(1, "t1", "dev")];
        let agg = aggregate(&snaps).unwrap();
        assert_eq!(agg.counters.records_written, 2);
        assert_eq!(agg.counters.errors, 1);
        assert_eq!(agg.passes, 1);
        assert_eq!(agg.write_latency.count, 2);
    }

    #[test]
    fn test_snapshot_serializes_without_histograms() {
        let stats = IoStats::new().unwrap();
        let json = serde_json::to_string(&stats.snapshot(3, "w3", "/dev/null")).unwrap();
        assert!(json.contains("\"thread\":3"));
        assert!(!json.contains("read_hist"));
    }
}
