//! Per-worker progress bookkeeping for the monitor

use std::time::{Duration, Instant};

/// Outcome of one progress observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Progressing,
    /// Progress came back after a stall that had been reported
    Resumed { stalled: Duration },
    Stalled {
        stalled: Duration,
        /// First time this stretch crossed the diagnostic threshold
        warn: bool,
        /// First time this stretch crossed the trigger threshold
        escalate: bool,
    },
}

/// What the monitor remembers about one worker between ticks
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    last_records: u64,
    last_change: Instant,
    warned: bool,
    escalated: bool,
    max_stall: Duration,
    last_keepalive: Instant,
    rate_sample: (Instant, u64),
}

impl ProgressTracker {
    pub fn new(now: Instant, records: u64, bytes: u64) -> Self {
        Self {
            last_records: records,
            last_change: now,
            warned: false,
            escalated: false,
            max_stall: Duration::ZERO,
            last_keepalive: now,
            rate_sample: (now, bytes),
        }
    }

    /// Longest stall seen so far
    pub fn max_stall(&self) -> Duration {
        self.max_stall
    }

    /// Feed the current record count
    ///
    /// A paused worker is not stalled; pausing resets the baseline. A stall
    /// is timed from the start of the device call still in flight
    /// (`op_since`) when that is earlier than the last observed change. Each
    /// stretch without progress warns once at `noprog` and escalates once at
    /// `trigger` (defaulting to `noprog`).
    pub fn observe(
        &mut self,
        now: Instant,
        records: u64,
        paused: bool,
        op_since: Option<Instant>,
        noprog: Option<Duration>,
        trigger: Option<Duration>,
    ) -> Verdict {
        if paused || records != self.last_records {
            let reported = self.warned || self.escalated;
            let stalled = now.saturating_duration_since(self.last_change);
            self.last_records = records;
            self.last_change = now;
            self.warned = false;
            self.escalated = false;
            return if reported && !paused {
                Verdict::Resumed { stalled }
            } else {
                Verdict::Progressing
            };
        }

        let since = op_since.map_or(self.last_change, |s| s.min(self.last_change));
        let stalled = now.saturating_duration_since(since);
        let Some(noprog) = noprog else {
            return Verdict::Progressing;
        };
        self.max_stall = self.max_stall.max(stalled);

        let warn = !self.warned && stalled >= noprog;
        if warn {
            self.warned = true;
        }
        let threshold = trigger.unwrap_or(noprog);
        let escalate = !self.escalated && stalled >= threshold;
        if escalate {
            self.escalated = true;
        }
        Verdict::Stalled {
            stalled,
            warn,
            escalate,
        }
    }

    /// True when a keepalive message is due; restarts the interval
    pub fn keepalive_due(&mut self, now: Instant, every: Duration) -> bool {
        if now.saturating_duration_since(self.last_keepalive) >= every {
            self.last_keepalive = now;
            true
        } else {
            false
        }
    }

    /// Throughput in bytes per second since the previous sample
    pub fn sample_rate(&mut self, now: Instant, bytes: u64) -> Option<f64> {
        let (then, before) = self.rate_sample;
        let secs = now.saturating_duration_since(then).as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        self.rate_sample = (now, bytes);
        Some(bytes.saturating_sub(before) as f64 / secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOPROG: Option<Duration> = Some(Duration::from_secs(2));

    #[test]
    fn test_stall_warns_and_escalates_once() {
        let t0 = Instant::now();
        let mut p = ProgressTracker::new(t0, 10, 0);
        assert!(matches!(
            p.observe(t0 + Duration::from_secs(1), 10, false, None, NOPROG, None),
            Verdict::Stalled { warn: false, escalate: false, .. }
        ));
        assert_eq!(
            p.observe(t0 + Duration::from_secs(2), 10, false, None, NOPROG, None),
            Verdict::Stalled { stalled: Duration::from_secs(2), warn: true, escalate: true }
        );
        for s in 3..10 {
            assert!(matches!(
                p.observe(t0 + Duration::from_secs(s), 10, false, None, NOPROG, None),
                Verdict::Stalled { warn: false, escalate: false, .. }
            ));
        }
        assert_eq!(p.max_stall(), Duration::from_secs(9));
        assert_eq!(
            p.observe(t0 + Duration::from_secs(10), 11, false, None, NOPROG, None),
            Verdict::Resumed { stalled: Duration::from_secs(10) }
        );
    }

    #[test]
    fn test_separate_trigger_threshold() {
        let t0 = Instant::now();
        let mut p = ProgressTracker::new(t0, 0, 0);
        let trigger = Some(Duration::from_secs(5));
        assert!(matches!(
            p.observe(t0 + Duration::from_secs(3), 0, false, None, NOPROG, trigger),
            Verdict::Stalled { warn: true, escalate: false, .. }
        ));
        assert!(matches!(
            p.observe(t0 + Duration::from_secs(5), 0, false, None, NOPROG, trigger),
            Verdict::Stalled { warn: false, escalate: true, .. }
        ));
    }

    #[test]
    fn test_pause_resets_baseline() {
        let t0 = Instant::now();
        let mut p = ProgressTracker::new(t0, 0, 0);
        assert_eq!(p.observe(t0 + Duration::from_secs(5), 0, true, None, NOPROG, None), Verdict::Progressing);
        assert!(matches!(
            p.observe(t0 + Duration::from_secs(6), 0, false, None, NOPROG, None),
            Verdict::Stalled { warn: false, .. }
        ));
    }

    #[test]
    fn test_stall_timed_from_blocked_call() {
        let blocked = Instant::now();
        let t0 = blocked + Duration::from_millis(1500);
        let mut p = ProgressTracker::new(t0, 4, 0);
        assert_eq!(
            p.observe(t0 + Duration::from_millis(500), 4, false, Some(blocked), NOPROG, None),
            Verdict::Stalled { stalled: Duration::from_secs(2), warn: true, escalate: true }
        );
        // a call started after the last observed change does not shorten the stall
        assert!(matches!(
            p.observe(t0 + Duration::from_secs(1), 4, false, Some(t0 + Duration::from_millis(900)), NOPROG, None),
            Verdict::Stalled { stalled, warn: false, .. } if stalled == Duration::from_secs(1)
        ));
    }

    #[test]
    fn test_no_threshold_never_stalls() {
        let t0 = Instant::now();
        let mut p = ProgressTracker::new(t0, 0, 0);
        assert_eq!(p.observe(t0 + Duration::from_secs(60), 0, false, None, None, None), Verdict::Progressing);
    }

    #[test]
    fn test_keepalive_and_rate() {
        let t0 = Instant::now();
        let mut p = ProgressTracker::new(t0, 0, 0);
        assert!(!p.keepalive_due(t0 + Duration::from_millis(500), Duration::from_secs(1)));
        assert!(p.keepalive_due(t0 + Duration::from_secs(1), Duration::from_secs(1)));
        assert!(!p.keepalive_due(t0 + Duration::from_millis(1500), Duration::from_secs(1)));

        let rate = p.sample_rate(t0 + Duration::from_secs(2), 4096).unwrap();
        assert!((rate - 2048.0).abs() < 1e-9);
        assert_eq!(p.sample_rate(t0 + Duration::from_secs(2), 8192), None);
    }
}
