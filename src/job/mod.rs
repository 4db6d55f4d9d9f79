//! Jobs
//!
//! A job is a set of worker threads launched together from one configuration.
//! It carries a tag, an aggregate state, a cancellation token that parents the
//! workers' tokens, and the per-worker shared records ([`WorkerShared`]) that
//! the monitor and the control surface read.
//!
//! # State machine
//!
//! ```text
//! CREATED -> RUNNING <-> PAUSED
//!               |          |
//!               v          v
//!           TERMINATING -> FINISHED
//! ```
//!
//! RUNNING and PAUSED go straight to FINISHED when every worker completes on
//! its own. TERMINATING is entered on an explicit stop, an error limit under
//! the abort policy, runtime expiry of every worker, the stop marker, or a
//! no-progress escalation.
//!
//! Locks in here guard flags and lists only; none is held across device I/O.

pub mod control;
pub mod table;

use crate::config::{Config, OnErrorAction, TriggerAction};
use crate::distribution::Address;
use crate::stats::{self, Aggregate, LiveCounters, StatsSnapshot};
use crate::util::cancel::{CancelToken, StopReason};
use crate::worker::barrier::PassBarrier;
use crate::Result;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

pub type JobId = u64;

/// Aggregate job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Created,
    Running,
    Paused,
    Terminating,
    Finished,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Created => "CREATED",
            JobState::Running => "RUNNING",
            JobState::Paused => "PAUSED",
            JobState::Terminating => "TERMINATING",
            JobState::Finished => "FINISHED",
        };
        f.write_str(s)
    }
}

/// State of one worker thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum ThreadState {
    Starting = 0,
    Running = 1,
    Paused = 2,
    Terminating = 3,
    Finished = 4,
}

impl ThreadState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ThreadState::Starting,
            1 => ThreadState::Running,
            2 => ThreadState::Paused,
            3 => ThreadState::Terminating,
            _ => ThreadState::Finished,
        }
    }
}

/// Device call kinds a worker reports while it is inside one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Read,
    Write,
    Flush,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OpKind::Read => "read",
            OpKind::Write => "write",
            OpKind::Flush => "flush",
        })
    }
}

/// The device call a worker is blocked in, if any
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlight {
    pub op: OpKind,
    /// None for calls that cover the whole device (flush)
    pub addr: Option<Address>,
    pub since: Instant,
}

#[derive(Debug, Default)]
struct PauseClock {
    total: Duration,
    since: Option<Instant>,
}

/// Normalized end status of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Success,
    Failure,
    /// Force-cancelled; statistics were captured by the canceller
    Forced,
}

/// Which jobs an operation addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobSelector {
    /// Exactly one job
    Id(JobId),
    /// Every job carrying the tag (possibly none)
    Tag(String),
    All,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {job}: cannot {op} while {state}")]
    InvalidTransition {
        job: JobId,
        op: &'static str,
        state: JobState,
    },
}

/// Monitor settings of one job
#[derive(Debug, Clone)]
pub struct JobTuning {
    pub alarm: Duration,
    pub noprog: Option<Duration>,
    pub noprog_trigger: Option<Duration>,
    pub trigger_action: TriggerAction,
    pub trigger_cmd: Option<String>,
    pub keepalive: Option<Duration>,
    pub keepalive_fmt: Option<String>,
    pub term_wait: Duration,
    pub runtime: Option<Duration>,
    pub rate: Option<u64>,
    pub rate_gain_up: f64,
    pub rate_gain_down: f64,
    pub stop_on: Option<PathBuf>,
    pub block_size: u64,
}

impl JobTuning {
    pub fn from_config(config: &Config) -> Self {
        let m = &config.monitor;
        Self {
            alarm: m.alarm,
            noprog: m.noprog,
            noprog_trigger: m.noprog_trigger,
            trigger_action: m.trigger_action,
            trigger_cmd: m.trigger_cmd.clone(),
            keepalive: m.keepalive,
            keepalive_fmt: m.keepalive_fmt.clone(),
            term_wait: m.term_wait,
            runtime: config.test.runtime,
            rate: m.rate,
            rate_gain_up: m.rate_gain_up,
            rate_gain_down: m.rate_gain_down,
            stop_on: config.test.stop_on.clone(),
            block_size: config.test.block_size,
        }
    }

    /// Shortest interval this job asks the monitor for
    pub fn interval(&self) -> Duration {
        [Some(self.alarm), self.keepalive, self.noprog]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(self.alarm)
    }
}

/// Changes accepted by `modify_job`; `None` leaves a setting alone
#[derive(Debug, Clone, Default)]
pub struct JobModification {
    pub rate: Option<Option<u64>>,
    pub keepalive: Option<Option<Duration>>,
    pub noprog: Option<Option<Duration>>,
    pub noprog_trigger: Option<Option<Duration>>,
    pub trigger_action: Option<TriggerAction>,
    pub runtime: Option<Option<Duration>>,
    pub term_wait: Option<Duration>,
}

impl JobModification {
    fn apply(&self, t: &mut JobTuning) {
        if let Some(rate) = self.rate {
            t.rate = rate;
        }
        if let Some(k) = self.keepalive {
            t.keepalive = k;
        }
        if let Some(n) = self.noprog {
            t.noprog = n;
        }
        if let Some(n) = self.noprog_trigger {
            t.noprog_trigger = n;
        }
        if let Some(a) = self.trigger_action {
            t.trigger_action = a;
        }
        if let Some(r) = self.runtime {
            t.runtime = r;
        }
        if let Some(w) = self.term_wait {
            t.term_wait = w;
        }
    }
}

/// What a worker shares with the monitor and the control surface
pub struct WorkerShared {
    pub thread: usize,
    pub name: String,
    pub device: String,
    pub token: CancelToken,
    pub live: LiveCounters,
    pub started: Instant,
    state: AtomicU8,
    /// Per-record delay from rate control, in microseconds
    delay_us: AtomicU64,
    stop_requested_at: Mutex<Option<Instant>>,
    in_flight: Mutex<Option<InFlight>>,
    pause_clock: Mutex<PauseClock>,
    end: Mutex<Option<(WorkerStatus, StatsSnapshot)>>,
}

impl WorkerShared {
    pub fn new(thread: usize, name: String, device: String, token: CancelToken) -> Self {
        Self {
            thread,
            name,
            device,
            token,
            live: LiveCounters::default(),
            started: Instant::now(),
            state: AtomicU8::new(ThreadState::Starting as u8),
            delay_us: AtomicU64::new(0),
            stop_requested_at: Mutex::new(None),
            in_flight: Mutex::new(None),
            pause_clock: Mutex::new(PauseClock::default()),
            end: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Update the state; FINISHED is final
    pub fn set_state(&self, state: ThreadState) {
        let prev = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                if cur == ThreadState::Finished as u8 {
                    None
                } else {
                    Some(state as u8)
                }
            });
        if let Ok(prev) = prev {
            let was_paused = ThreadState::from_u8(prev) == ThreadState::Paused;
            let mut clock = self.pause_clock.lock();
            match (was_paused, state == ThreadState::Paused) {
                (false, true) => clock.since = Some(Instant::now()),
                (true, false) => {
                    if let Some(since) = clock.since.take() {
                        clock.total += since.elapsed();
                    }
                }
                _ => {}
            }
        }
    }

    /// Time since start, not counting time parked on a pause
    pub fn active_elapsed(&self, now: Instant) -> Duration {
        let clock = self.pause_clock.lock();
        let current = clock.since.map(|s| now.saturating_duration_since(s)).unwrap_or_default();
        now.saturating_duration_since(self.started)
            .saturating_sub(clock.total + current)
    }

    /// Publish the device call about to start
    pub fn begin_op(&self, op: OpKind, addr: Option<Address>) {
        *self.in_flight.lock() = Some(InFlight {
            op,
            addr,
            since: Instant::now(),
        });
    }

    pub fn end_op(&self) {
        *self.in_flight.lock() = None;
    }

    pub fn in_flight(&self) -> Option<InFlight> {
        *self.in_flight.lock()
    }

    pub fn delay(&self) -> Duration {
        Duration::from_micros(self.delay_us.load(Ordering::Relaxed))
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_us.store(delay.as_micros() as u64, Ordering::Relaxed);
    }

    /// Ask this worker alone to stop
    pub fn request_stop(&self, reason: StopReason) {
        self.token.stop(reason);
        self.set_state(ThreadState::Terminating);
        self.stop_requested_at.lock().get_or_insert_with(Instant::now);
    }

    pub fn stop_requested_at(&self) -> Option<Instant> {
        *self.stop_requested_at.lock()
    }

    /// Record the end of the worker. Only the first call counts.
    pub fn complete(&self, status: WorkerStatus, snapshot: StatsSnapshot) -> bool {
        let mut end = self.end.lock();
        if end.is_some() {
            return false;
        }
        *end = Some((status, snapshot));
        self.state.store(ThreadState::Finished as u8, Ordering::SeqCst);
        true
    }

    pub fn is_finished(&self) -> bool {
        self.end.lock().is_some()
    }

    pub fn status(&self) -> Option<WorkerStatus> {
        self.end.lock().as_ref().map(|(s, _)| *s)
    }

    pub fn snapshot(&self) -> Option<StatsSnapshot> {
        self.end.lock().as_ref().map(|(_, s)| s.clone())
    }

    /// Statistics as far as the live counters know them
    pub fn capture_live(&self) -> StatsSnapshot {
        StatsSnapshot::from_live(self.thread, &self.name, &self.device, &self.live, self.started.elapsed())
    }

    pub fn info(&self) -> ThreadInfo {
        ThreadInfo {
            thread: self.thread,
            name: self.name.clone(),
            device: self.device.clone(),
            state: self.state(),
            pass: self.live.pass.get(),
            records: self.live.records(),
            bytes: self.live.bytes(),
            errors: self.live.errors.get(),
        }
    }
}

struct JobInner {
    state: JobState,
    stop_requested_at: Option<Instant>,
    stop_reason: Option<StopReason>,
    failed: bool,
}

/// A running (or finished) job
pub struct Job {
    pub id: JobId,
    pub tag: Option<String>,
    pub config: Arc<Config>,
    pub token: CancelToken,
    pub members: Vec<Arc<WorkerShared>>,
    /// Writers rendezvous here before readers, once per pass
    pub barrier: Option<Arc<PassBarrier>>,
    pub created: Instant,
    inner: Mutex<JobInner>,
    finished: Condvar,
    tuning: Mutex<JobTuning>,
    triggers_in_flight: AtomicUsize,
    handles: Mutex<Vec<(usize, JoinHandle<()>)>>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}

impl Job {
    pub fn new(
        id: JobId,
        config: Arc<Config>,
        token: CancelToken,
        members: Vec<Arc<WorkerShared>>,
        barrier: Option<Arc<PassBarrier>>,
    ) -> Self {
        Self {
            id,
            tag: config.test.tag.clone(),
            tuning: Mutex::new(JobTuning::from_config(&config)),
            config,
            token,
            members,
            barrier,
            created: Instant::now(),
            inner: Mutex::new(JobInner {
                state: JobState::Created,
                stop_requested_at: None,
                stop_reason: None,
                failed: false,
            }),
            finished: Condvar::new(),
            triggers_in_flight: AtomicUsize::new(0),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> JobState {
        self.inner.lock().state
    }

    pub fn stop_requested_at(&self) -> Option<Instant> {
        self.inner.lock().stop_requested_at
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.inner.lock().stop_reason
    }

    /// True once any worker failed or the job was stopped for a failure
    pub fn failed(&self) -> bool {
        let inner = self.inner.lock();
        inner.failed || inner.stop_reason.map(|r| !r.is_benign()).unwrap_or(false)
    }

    pub fn tuning(&self) -> JobTuning {
        self.tuning.lock().clone()
    }

    pub fn modify(&self, change: &JobModification) {
        change.apply(&mut self.tuning.lock());
        info!(job = self.id, ?change, "job modified");
    }

    /// CREATED -> RUNNING (or PAUSED for a job created paused)
    pub(crate) fn launch(&self, paused: bool) {
        let mut inner = self.inner.lock();
        if inner.state == JobState::Created {
            if paused {
                self.token.pause();
                inner.state = JobState::Paused;
            } else {
                inner.state = JobState::Running;
            }
        }
    }

    pub(crate) fn add_handle(&self, thread: usize, handle: JoinHandle<()>) {
        self.handles.lock().push((thread, handle));
    }

    pub fn pause(&self) -> std::result::Result<(), JobError> {
        let mut inner = self.inner.lock();
        let state = inner.state;
        match state {
            JobState::Created | JobState::Running => {
                self.token.pause();
                inner.state = JobState::Paused;
                info!(job = self.id, "paused");
                Ok(())
            }
            JobState::Paused => Ok(()),
            state => Err(JobError::InvalidTransition {
                job: self.id,
                op: "pause",
                state,
            }),
        }
    }

    pub fn resume(&self) -> std::result::Result<(), JobError> {
        let mut inner = self.inner.lock();
        let state = inner.state;
        match state {
            JobState::Paused => {
                self.token.resume();
                inner.state = JobState::Running;
                info!(job = self.id, "resumed");
                Ok(())
            }
            JobState::Created | JobState::Running => Ok(()),
            state => Err(JobError::InvalidTransition {
                job: self.id,
                op: "resume",
                state,
            }),
        }
    }

    /// Enter TERMINATING. Returns false if the job was already terminating
    /// or finished.
    pub fn begin_termination(&self, reason: StopReason) -> bool {
        let mut inner = self.inner.lock();
        let state = inner.state;
        match state {
            JobState::Terminating | JobState::Finished => false,
            _ => {
                inner.state = JobState::Terminating;
                inner.stop_requested_at = Some(Instant::now());
                inner.stop_reason = Some(reason);
                drop(inner);
                self.token.stop(reason);
                info!(job = self.id, %reason, "terminating");
                true
            }
        }
    }

    /// Force-cancel every worker that has not finished
    ///
    /// Statistics are captured from the live counters first; a worker that
    /// returns later exits without cleanup.
    pub fn force_cancel(&self) {
        for member in &self.members {
            if member.is_finished() {
                continue;
            }
            self.force_member(member);
        }
    }

    /// Force-cancel one worker
    pub fn force_member(&self, member: &WorkerShared) {
        let snapshot = member.capture_live();
        if member.complete(WorkerStatus::Forced, snapshot) {
            warn!(job = self.id, thread = %member.name, "worker force-cancelled");
            member.token.force();
            if let Some(barrier) = &self.barrier {
                barrier.leave();
            }
            {
                let mut inner = self.inner.lock();
                inner.failed = true;
            }
            self.check_finished();
        }
    }

    /// Called by a worker's lifecycle wrapper after it completed
    pub(crate) fn member_finished(&self, member: &WorkerShared, status: WorkerStatus) {
        if status == WorkerStatus::Failure {
            self.inner.lock().failed = true;
            match self.config.errors.oncerr {
                OnErrorAction::Abort => {
                    if self.begin_termination(StopReason::ErrorLimit) {
                        warn!(job = self.id, thread = %member.name, "worker failed, stopping siblings");
                    }
                }
                OnErrorAction::Pause => {
                    if self.pause().is_ok() {
                        warn!(job = self.id, thread = %member.name, "worker failed, siblings paused");
                    }
                }
                OnErrorAction::Continue => {}
            }
        }
        self.check_finished();
    }

    fn check_finished(&self) {
        if !self.members.iter().all(|m| m.is_finished()) {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.state != JobState::Finished {
            inner.state = JobState::Finished;
            // release siblings parked on a pause
            self.token.resume();
            self.finished.notify_all();
        }
    }

    /// Block until every worker has finished (or was force-cancelled)
    pub fn wait(&self) {
        let mut inner = self.inner.lock();
        while inner.state != JobState::Finished {
            self.finished.wait(&mut inner);
        }
    }

    /// Like [`wait`](Self::wait) with a deadline; true if finished
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.state != JobState::Finished {
            if self.finished.wait_until(&mut inner, deadline).timed_out() {
                return inner.state == JobState::Finished;
            }
        }
        true
    }

    /// Join finished worker threads; force-cancelled ones are left detached
    pub(crate) fn join_workers(&self) {
        let handles: Vec<(usize, JoinHandle<()>)> = std::mem::take(&mut *self.handles.lock());
        for (thread, handle) in handles {
            let forced = self
                .members
                .get(thread)
                .and_then(|m| m.status())
                .map(|s| s == WorkerStatus::Forced)
                .unwrap_or(false);
            if forced {
                continue;
            }
            if handle.join().is_err() {
                error!(job = self.id, thread, "worker thread panicked");
            }
        }
    }

    pub fn trigger_started(&self) {
        self.triggers_in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub fn trigger_finished(&self) {
        self.triggers_in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn triggers_in_flight(&self) -> usize {
        self.triggers_in_flight.load(Ordering::SeqCst)
    }

    pub fn info(&self) -> JobInfo {
        let inner = self.inner.lock();
        JobInfo {
            id: self.id,
            tag: self.tag.clone(),
            state: inner.state,
            failed: inner.failed,
            stop_reason: inner.stop_reason,
            elapsed_secs: self.created.elapsed().as_secs_f64(),
            triggers_in_flight: self.triggers_in_flight(),
            threads: self.members.iter().map(|m| m.info()).collect(),
        }
    }

    /// Final report; meaningful once the job finished
    pub fn report(&self) -> Result<JobReport> {
        let threads: Vec<StatsSnapshot> = self
            .members
            .iter()
            .map(|m| m.snapshot().unwrap_or_else(|| m.capture_live()))
            .collect();
        let totals = stats::aggregate(&threads)?;
        let statuses = self.members.iter().map(|m| m.status()).collect::<Vec<_>>();
        let success = !self.failed()
            && totals.counters.errors == 0
            && statuses.iter().all(|s| *s == Some(WorkerStatus::Success));
        Ok(JobReport {
            id: self.id,
            tag: self.tag.clone(),
            success,
            stop_reason: self.stop_reason(),
            statuses: statuses
                .into_iter()
                .map(|s| s.unwrap_or(WorkerStatus::Forced))
                .collect(),
            threads,
            totals,
        })
    }
}

/// Worker view returned by `query_job`
#[derive(Debug, Clone, Serialize)]
pub struct ThreadInfo {
    pub thread: usize,
    pub name: String,
    pub device: String,
    pub state: ThreadState,
    pub pass: u64,
    pub records: u64,
    pub bytes: u64,
    pub errors: u64,
}

/// Job view returned by `query_job`
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: JobId,
    pub tag: Option<String>,
    pub state: JobState,
    pub failed: bool,
    pub stop_reason: Option<StopReason>,
    pub elapsed_secs: f64,
    pub triggers_in_flight: usize,
    pub threads: Vec<ThreadInfo>,
}

/// Final statistics of a reaped job
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub id: JobId,
    pub tag: Option<String>,
    pub success: bool,
    pub stop_reason: Option<StopReason>,
    pub statuses: Vec<WorkerStatus>,
    pub threads: Vec<StatsSnapshot>,
    pub totals: Aggregate,
}
