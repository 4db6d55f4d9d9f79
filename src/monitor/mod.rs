//! Process monitor
//!
//! A single thread watches every job. It wakes at least once a second and
//! ticks at the shortest interval any unfinished job asks for (never faster
//! than once a second). Per tick it:
//!
//! - checks the stop marker of each job
//! - force-cancels TERMINATING jobs whose grace period ran out, unless a
//!   trigger is still running for them
//! - for each live worker: no-progress diagnostics and escalation, keepalive
//!   messages (paused workers included), runtime expiry, grace force-cancel
//!   of a worker stopped on its own, and adaptive rate control
//!
//! A stall is timed from the start of the device call the worker is blocked
//! in, so a hang that began before the monitor first saw the job is not
//! under-reported.
//!
//! The job table lock is only held to copy the job list.

pub mod keepalive;
pub mod progress;
pub mod rate;
pub mod trigger;

use crate::job::{Job, JobId, JobState, JobTuning, ThreadState, WorkerShared};
use crate::state::ProcessState;
use crate::util::cancel::StopReason;
use crate::Result;
use anyhow::Context;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use keepalive::KeepaliveFields;
use progress::{ProgressTracker, Verdict};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use trigger::{ActionHook, CommandHook, EscalationOutcome, NoProgressEvent, TriggerHook};

/// Tick interval when no job asks for one
const DEFAULT_INTERVAL: Duration = Duration::from_secs(3);
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Handle to the monitor thread; dropping it stops the thread
pub struct Monitor {
    handle: Option<JoinHandle<()>>,
    shutdown: Sender<()>,
}

impl Monitor {
    pub fn start(state: Arc<ProcessState>) -> Result<Self> {
        Self::start_with_hook(state, None)
    }

    /// Start with a hook that replaces the configured trigger action and
    /// command of every job
    pub fn start_with_hook(state: Arc<ProcessState>, hook: Option<Arc<dyn TriggerHook>>) -> Result<Self> {
        let (shutdown, rx) = bounded(1);
        let handle = thread::Builder::new()
            .name("iovet-monitor".into())
            .spawn(move || MonitorLoop::new(state, hook).run(rx))
            .context("Failed to spawn monitor thread")?;
        Ok(Self {
            handle: Some(handle),
            shutdown,
        })
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.shutdown.try_send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("monitor thread panicked");
            }
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop();
    }
}

struct MonitorLoop {
    state: Arc<ProcessState>,
    escalator: Escalator,
    trackers: HashMap<(JobId, usize), ProgressTracker>,
}

impl MonitorLoop {
    fn new(state: Arc<ProcessState>, hook: Option<Arc<dyn TriggerHook>>) -> Self {
        Self {
            escalator: Escalator {
                state: Arc::clone(&state),
                hook,
                wedged: Arc::new(AtomicBool::new(false)),
            },
            state,
            trackers: HashMap::new(),
        }
    }

    fn run(mut self, shutdown: Receiver<()>) {
        debug!("monitor started");
        let mut last = Instant::now();
        loop {
            // a new job can shorten the interval at any time
            let wait = (last + self.interval())
                .saturating_duration_since(Instant::now())
                .min(MIN_INTERVAL);
            match shutdown.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
            let now = Instant::now();
            if now < last + self.interval() {
                continue;
            }
            last = now;
            if self.escalator.wedged.load(Ordering::SeqCst) {
                continue;
            }
            self.tick(now);
        }
        debug!("monitor stopped");
    }

    fn interval(&self) -> Duration {
        self.state
            .jobs
            .snapshot()
            .iter()
            .filter(|job| job.state() != JobState::Finished)
            .map(|job| job.tuning().interval())
            .min()
            .unwrap_or(DEFAULT_INTERVAL)
            .max(MIN_INTERVAL)
    }

    fn tick(&mut self, now: Instant) {
        let jobs = self.state.jobs.snapshot();
        for job in &jobs {
            let tuning = job.tuning();
            if let Some(marker) = &tuning.stop_on {
                if marker.exists() && job.begin_termination(StopReason::Marker) {
                    info!(job = job.id, marker = %marker.display(), "stop marker found");
                }
            }
            match job.state() {
                JobState::Terminating => self.check_grace(job, &tuning, now),
                JobState::Running | JobState::Paused => self.check_workers(job, &tuning, now),
                JobState::Created | JobState::Finished => {}
            }
        }
        self.trackers.retain(|(id, thread), _| {
            jobs.iter()
                .find(|job| job.id == *id)
                .and_then(|job| job.members.get(*thread))
                .map(|m| !m.is_finished())
                .unwrap_or(false)
        });
    }

    fn check_grace(&self, job: &Job, tuning: &JobTuning, now: Instant) {
        if job.triggers_in_flight() > 0 {
            return;
        }
        let Some(since) = job.stop_requested_at() else {
            return;
        };
        if now.saturating_duration_since(since) >= tuning.term_wait {
            warn!(job = job.id, term_wait = ?tuning.term_wait, "grace period expired, forcing cancellation");
            job.force_cancel();
        }
    }

    fn check_workers(&mut self, job: &Arc<Job>, tuning: &JobTuning, now: Instant) {
        let job_paused = job.state() == JobState::Paused;
        let mut live = 0usize;
        let mut expired = 0usize;

        for member in &job.members {
            if member.is_finished() {
                continue;
            }
            live += 1;

            if let Some(since) = member.stop_requested_at() {
                if job.triggers_in_flight() == 0 && now.saturating_duration_since(since) >= tuning.term_wait {
                    warn!(job = job.id, thread = %member.name, "worker grace period expired");
                    job.force_member(member);
                    continue;
                }
            }

            if let Some(runtime) = tuning.runtime {
                if member.active_elapsed(now) >= runtime {
                    expired += 1;
                    if member.stop_requested_at().is_none() {
                        info!(job = job.id, thread = %member.name, ?runtime, "runtime expired");
                        member.request_stop(StopReason::Runtime);
                    }
                }
            }

            let records = member.live.records();
            let bytes = member.live.bytes();
            let paused = job_paused || member.state() == ThreadState::Paused;
            let in_flight = member.in_flight();
            let tracker = self
                .trackers
                .entry((job.id, member.thread))
                .or_insert_with(|| ProgressTracker::new(now, records, bytes));

            let op_since = in_flight.map(|op| op.since);
            match tracker.observe(now, records, paused, op_since, tuning.noprog, tuning.noprog_trigger) {
                Verdict::Progressing => {}
                Verdict::Resumed { stalled } => {
                    info!(job = job.id, thread = %member.name, ?stalled, "progress resumed");
                }
                Verdict::Stalled {
                    stalled,
                    warn,
                    escalate,
                } => {
                    let op = in_flight.map(|op| op.op);
                    let addr = in_flight.and_then(|op| op.addr);
                    if warn {
                        warn!(
                            job = job.id,
                            thread = %member.name,
                            device = %member.device,
                            pass = member.live.pass.get(),
                            records,
                            op = ?op,
                            record = ?addr.map(|a| a.record),
                            offset = ?addr.map(|a| a.offset),
                            ?stalled,
                            max_stall = ?tracker.max_stall(),
                            "no progress"
                        );
                    }
                    if escalate {
                        let event = NoProgressEvent {
                            job: job.id,
                            tag: job.tag.clone(),
                            thread: member.name.clone(),
                            device: member.device.clone(),
                            stalled,
                            op,
                            record: addr.map(|a| a.record),
                            offset: addr.map(|a| a.offset),
                        };
                        self.escalator.escalate(job, tuning, event);
                    }
                }
            }

            if let Some(every) = tuning.keepalive {
                if tracker.keepalive_due(now, every) {
                    info!(job = job.id, state = %job.state(), "{}", keepalive_line(job.id, member, tuning));
                }
            }

            match tuning.rate {
                Some(target) if !paused => {
                    if let Some(observed) = tracker.sample_rate(now, bytes) {
                        let delay = rate::adjust_delay(
                            member.delay(),
                            observed,
                            target,
                            tuning.block_size,
                            tuning.rate_gain_up,
                            tuning.rate_gain_down,
                        );
                        member.set_delay(delay);
                    }
                }
                Some(_) => {}
                None => {
                    if !member.delay().is_zero() {
                        member.set_delay(Duration::ZERO);
                    }
                }
            }
        }

        if live > 0 && expired == live && job.begin_termination(StopReason::Runtime) {
            info!(job = job.id, "runtime expired for every worker");
        }
    }
}

struct Escalator {
    state: Arc<ProcessState>,
    hook: Option<Arc<dyn TriggerHook>>,
    wedged: Arc<AtomicBool>,
}

impl Escalator {
    /// Run the trigger hook on its own thread and apply the outcome
    fn escalate(&self, job: &Arc<Job>, tuning: &JobTuning, event: NoProgressEvent) {
        let hook: Arc<dyn TriggerHook> = match (&self.hook, &tuning.trigger_cmd) {
            (Some(hook), _) => Arc::clone(hook),
            (None, Some(cmd)) => Arc::new(CommandHook::new(cmd.clone(), tuning.trigger_action)),
            (None, None) => Arc::new(ActionHook(tuning.trigger_action)),
        };
        warn!(job = job.id, thread = %event.thread, stalled = ?event.stalled, "no-progress trigger fired");

        job.trigger_started();
        let job_ref = Arc::clone(job);
        let state = Arc::clone(&self.state);
        let wedged = Arc::clone(&self.wedged);
        let spawned = thread::Builder::new()
            .name(format!("iovet-trigger-j{}", job.id))
            .spawn(move || {
                let outcome = hook.escalate(&event);
                apply_outcome(&state, &job_ref, &wedged, outcome);
                job_ref.trigger_finished();
            });
        if let Err(e) = spawned {
            job.trigger_finished();
            error!(job = job.id, error = %e, "failed to spawn trigger thread");
        }
    }
}

fn apply_outcome(state: &ProcessState, job: &Job, wedged: &AtomicBool, outcome: EscalationOutcome) {
    info!(job = job.id, ?outcome, "escalation outcome");
    match outcome {
        EscalationOutcome::Continue => {}
        EscalationOutcome::TerminateJob => {
            job.begin_termination(StopReason::Escalation);
        }
        EscalationOutcome::Wedge => {
            warn!(job = job.id, "monitor wedged; leaving jobs untouched until shutdown");
            wedged.store(true, Ordering::SeqCst);
        }
        EscalationOutcome::AbortProcess => {
            error!(job = job.id, "aborting every job");
            state.request_termination(StopReason::Escalation);
        }
    }
}

fn keepalive_line(job: JobId, member: &WorkerShared, tuning: &JobTuning) -> String {
    let fields = KeepaliveFields {
        device: &member.device,
        job,
        thread: &member.name,
        pass: member.live.pass.get(),
        records: member.live.records(),
        bytes: member.live.bytes(),
        errors: member.live.errors.get(),
        elapsed: member.started.elapsed(),
    };
    keepalive::format(tuning.keepalive_fmt.as_deref().unwrap_or(keepalive::DEFAULT_FORMAT), &fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::util::cancel::CancelToken;
    use parking_lot::Mutex;

    fn job_in(state: &ProcessState, config: Config, members: usize) -> Arc<Job> {
        let token = state.token.child();
        let members = (0..members)
            .map(|t| Arc::new(WorkerShared::new(t, format!("t{}", t), "mem".into(), token.child())))
            .collect();
        let job = Arc::new(Job::new(state.jobs.next_id(), Arc::new(config), token, members, None));
        job.launch(false);
        state.jobs.insert(Arc::clone(&job));
        job
    }

    struct Recorder(Mutex<Vec<NoProgressEvent>>, EscalationOutcome);

    impl TriggerHook for Recorder {
        fn escalate(&self, event: &NoProgressEvent) -> EscalationOutcome {
            self.0.lock().push(event.clone());
            self.1
        }
    }

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_interval_floor() {
        let state = Arc::new(ProcessState::default());
        let monitor = MonitorLoop::new(Arc::clone(&state), None);
        assert_eq!(monitor.interval(), DEFAULT_INTERVAL);

        let mut config = Config::default();
        config.monitor.keepalive = Some(Duration::from_millis(100));
        job_in(&state, config, 1);
        assert_eq!(monitor.interval(), MIN_INTERVAL);
    }

    #[test]
    fn test_escalation_terminates_job_once() {
        let state = Arc::new(ProcessState::default());
        let mut config = Config::default();
        config.monitor.noprog = Some(Duration::from_secs(2));
        let job = job_in(&state, config, 1);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new()), EscalationOutcome::TerminateJob));
        let mut monitor = MonitorLoop::new(Arc::clone(&state), Some(recorder.clone() as Arc<dyn TriggerHook>));

        let t0 = Instant::now();
        monitor.tick(t0);
        monitor.tick(t0 + Duration::from_secs(1));
        assert!(recorder.0.lock().is_empty());
        monitor.tick(t0 + Duration::from_secs(2));
        monitor.tick(t0 + Duration::from_secs(3));

        assert!(wait_for(|| job.state() == JobState::Terminating && job.triggers_in_flight() == 0));
        assert_eq!(recorder.0.lock().len(), 1);
        assert_eq!(job.stop_reason(), Some(StopReason::Escalation));
    }

    #[test]
    fn test_grace_waits_for_trigger() {
        let state = Arc::new(ProcessState::default());
        let mut config = Config::default();
        config.monitor.term_wait = Duration::from_secs(1);
        let job = job_in(&state, config, 1);
        let mut monitor = MonitorLoop::new(Arc::clone(&state), None);

        job.begin_termination(StopReason::User);
        let later = Instant::now() + Duration::from_secs(2);
        job.trigger_started();
        monitor.tick(later);
        assert_eq!(job.state(), JobState::Terminating);

        job.trigger_finished();
        monitor.tick(later);
        assert_eq!(job.state(), JobState::Finished);
        assert!(job.members[0].token.is_forced());
    }

    #[test]
    fn test_runtime_expiry_terminates_job() {
        let state = Arc::new(ProcessState::default());
        let mut config = Config::default();
        config.test.runtime = Some(Duration::from_secs(1));
        let job = job_in(&state, config, 2);
        let mut monitor = MonitorLoop::new(Arc::clone(&state), None);

        monitor.tick(Instant::now() + Duration::from_secs(2));
        assert!(job.members.iter().all(|m| m.token.is_stopping()));
        assert_eq!(job.state(), JobState::Terminating);
        assert_eq!(job.stop_reason(), Some(StopReason::Runtime));
    }

    #[test]
    fn test_rate_sets_delay() {
        let state = Arc::new(ProcessState::default());
        let mut config = Config::default();
        config.monitor.rate = Some(1024);
        let job = job_in(&state, config, 1);
        let mut monitor = MonitorLoop::new(Arc::clone(&state), None);

        let t0 = Instant::now();
        monitor.tick(t0);
        job.members[0].live.record_write(1 << 20);
        monitor.tick(t0 + Duration::from_secs(1));
        assert!(!job.members[0].delay().is_zero());

        job.modify(&crate::job::JobModification {
            rate: Some(None),
            ..Default::default()
        });
        monitor.tick(t0 + Duration::from_secs(2));
        assert!(job.members[0].delay().is_zero());
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_keepalive_while_paused() {
        let state = Arc::new(ProcessState::default());
        let mut config = Config::default();
        config.monitor.keepalive = Some(Duration::from_secs(1));
        let job = job_in(&state, config, 1);
        job.pause().unwrap();
        let mut monitor = MonitorLoop::new(Arc::clone(&state), None);

        let sink = Captured::default();
        let writer = sink.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let t0 = Instant::now();
        tracing::subscriber::with_default(subscriber, || {
            monitor.tick(t0);
            monitor.tick(t0 + Duration::from_secs(1));
        });

        let text = String::from_utf8(sink.0.lock().clone()).unwrap();
        assert!(text.contains(&format!("mem [job {} t0] pass 0: 0 records", job.id)), "{}", text);
        assert!(text.contains("state=PAUSED"), "{}", text);
    }

    #[test]
    fn test_runtime_excludes_paused_time() {
        let state = Arc::new(ProcessState::default());
        let mut config = Config::default();
        config.test.runtime = Some(Duration::from_millis(200));
        let job = job_in(&state, config, 1);
        let member = &job.members[0];
        member.set_state(ThreadState::Running);
        member.set_state(ThreadState::Paused);
        thread::sleep(Duration::from_millis(300));
        member.set_state(ThreadState::Running);
        let mut monitor = MonitorLoop::new(Arc::clone(&state), None);

        monitor.tick(Instant::now());
        assert!(!member.token.is_stopping());
        assert_eq!(job.state(), JobState::Running);

        monitor.tick(Instant::now() + Duration::from_millis(250));
        assert!(member.token.is_stopping());
        assert_eq!(job.stop_reason(), Some(StopReason::Runtime));
    }

    #[test]
    fn test_wedge_outcome() {
        let state = ProcessState::default();
        let job = Job::new(1, Arc::new(Config::default()), CancelToken::new(), Vec::new(), None);
        let wedged = AtomicBool::new(false);
        apply_outcome(&state, &job, &wedged, EscalationOutcome::Wedge);
        assert!(wedged.load(Ordering::SeqCst));
    }

    #[test]
    fn test_monitor_shutdown_joins() {
        let state = Arc::new(ProcessState::default());
        let monitor = Monitor::start(state).unwrap();
        monitor.shutdown();
    }
}
