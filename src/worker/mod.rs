//! Worker thread implementation
//!
//! A worker drives one [`IoContext`] (plus its partner role in copy and
//! mirror jobs) through the I/O loop of its mode:
//!
//! ```text
//! STARTUP -> PASS_LOOP -> SHUTDOWN
//! ```
//!
//! - **STARTUP** opens the device(s), creating outputs on first open, and
//!   logs the run header. Any failure here is fatal to the thread.
//! - **PASS_LOOP** repeats while the worker is not stopping, the pass limit
//!   (or runtime) allows another pass, and the error limit is not reached.
//!   The mode modules ([`exercise`], [`copy`], [`mirror`]) implement the
//!   sub-passes; this module provides the record-level primitives they share.
//! - **SHUTDOWN** folds statistics, closes handles, applies the dispose
//!   policy, and hands a normalized [`WorkerStatus`] to the job.
//!
//! A failed device operation is counted and the loop moves on; the loop
//! breaks only on a stop request, the error limit, or end of data.
//!
//! # Thread Safety
//!
//! The worker owns its context outright. What the monitor and the control
//! surface see goes through [`WorkerShared`]: atomic live counters, the
//! thread state, and the cancel token.

pub mod barrier;
pub mod copy;
pub mod exercise;
pub mod hooks;
pub mod mirror;
pub mod retry;
pub mod verify;

use crate::config::{IoDir, IoType, Mode, NoSpacePolicy};
use crate::context::{IoContext, Outcome};
use crate::device::{DeviceError, DeviceResult, IoOutcome};
use crate::distribution::{pass_seed, Address};
use crate::job::{Job, OpKind, ThreadState, WorkerShared, WorkerStatus};
use crate::util::cancel::{Checkpoint, Flow, StopReason};
use crate::util::time::{calculate_throughput, format_duration, format_throughput};
use crate::Result;
use anyhow::anyhow;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use retry::RetryPolicy;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Salt for the vary-iotype/vary-iodir generator, kept apart from address
/// seeds
const VARY_SALT: u64 = 0x7661_7279_5f69_6f74;

/// How an I/O loop ended
#[derive(Debug)]
pub enum LoopEnd {
    /// Pass limit reached
    Completed,
    /// No more input (or no more room on the output)
    EndOfData,
    Stopped(StopReason),
    ErrorLimit,
    /// Unrecoverable setup or device state failure
    Fatal(anyhow::Error),
    /// Forced cancellation; the canceller already captured statistics
    Forced,
}

/// Which role of the context an operation addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The context itself (output in copy and mirror jobs)
    Primary,
    /// The read role of a copy/mirror pair
    Partner,
}

/// Which of a role's two buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Buf {
    Data,
    Verify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Write,
    Read(Buf),
}

/// Result of one record-level step
#[derive(Debug)]
pub enum Step {
    /// Full block transferred
    Done,
    /// End of the input, or the output is full
    EndOfData,
    /// Output was recreated; restart the pass
    Restart,
    /// Failure counted, carry on with the next record
    Skipped,
    /// Failure counted and the error limit is reached
    Limit,
    Fatal(anyhow::Error),
}

/// Per-thread runtime handed to the mode loops
pub struct Worker {
    pub job: Arc<Job>,
    pub member: Arc<WorkerShared>,
    pub ctx: IoContext,
    vary_rng: Xoshiro256PlusPlus,
    /// Delete-and-resume attempts used in the current pass
    enospc_attempts: u32,
    /// Records of this pass whose transfer failed and was already counted
    failed_records: HashSet<u64>,
}

/// Completes the member as failed if the worker thread unwinds
struct PanicGuard {
    job: Arc<Job>,
    member: Arc<WorkerShared>,
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if std::thread::panicking() && self.member.complete(WorkerStatus::Failure, self.member.capture_live()) {
            error!(job = self.job.id, thread = %self.member.name, "worker panicked");
            if let Some(barrier) = &self.job.barrier {
                barrier.leave();
            }
            self.job.member_finished(&self.member, WorkerStatus::Failure);
        }
    }
}

/// Thread entry point: run the loop for the context's mode and report the
/// outcome to the job
pub fn run_worker(job: Arc<Job>, member: Arc<WorkerShared>, ctx: IoContext) {
    let _guard = PanicGuard {
        job: Arc::clone(&job),
        member: Arc::clone(&member),
    };
    let mut worker = Worker::new(job, member, ctx);
    let end = worker.run();
    worker.finish(end);
}

impl Worker {
    pub fn new(job: Arc<Job>, member: Arc<WorkerShared>, ctx: IoContext) -> Self {
        let vary_rng = Xoshiro256PlusPlus::seed_from_u64(pass_seed(ctx.params.seed ^ VARY_SALT, ctx.thread, 0));
        Self {
            job,
            member,
            ctx,
            vary_rng,
            enospc_attempts: 0,
            failed_records: HashSet::new(),
        }
    }

    fn run(&mut self) -> LoopEnd {
        self.member.set_state(ThreadState::Running);
        // a job created paused parks here, before any device is touched
        if let Some(end) = self.control(Checkpoint::PassBoundary) {
            return end;
        }
        if let Err(e) = self.startup() {
            return LoopEnd::Fatal(e);
        }
        match self.ctx.params.mode {
            Mode::Exercise => exercise::run(self),
            Mode::Copy => copy::run(self),
            Mode::Mirror => mirror::run(self),
        }
    }

    fn startup(&mut self) -> Result<()> {
        self.ctx.open()?;
        if let Some(partner) = self.ctx.partner.as_deref_mut() {
            partner.open()?;
        }
        each_role(&mut self.ctx, |ctx| ctx.stats.start());

        let records = self.ctx.seq.as_ref().map(|s| s.records_per_pass()).unwrap_or(0);
        info!(
            job = self.job.id,
            thread = %self.ctx.name,
            device = self.ctx.device_name(),
            mode = %self.ctx.params.mode,
            pattern = %self.ctx.pattern.describe(),
            block_size = self.ctx.params.block_size,
            records,
            "worker started"
        );
        Ok(())
    }

    /// SHUTDOWN: normalize the outcome, clean up, and report to the job
    fn finish(mut self, end: LoopEnd) {
        if matches!(end, LoopEnd::Forced) || self.member.token.is_forced() {
            debug!(job = self.job.id, thread = %self.ctx.name, "forced, skipping cleanup");
            return;
        }

        let errors = self.ctx.errors.count;
        let mut status = match &end {
            LoopEnd::Completed | LoopEnd::EndOfData if errors == 0 => WorkerStatus::Success,
            LoopEnd::Stopped(reason) if reason.is_benign() && errors == 0 => WorkerStatus::Success,
            LoopEnd::Fatal(e) => {
                error!(job = self.job.id, thread = %self.ctx.name, error = %format!("{:#}", e), "worker failed");
                WorkerStatus::Failure
            }
            _ => WorkerStatus::Failure,
        };

        self.member.set_state(ThreadState::Terminating);
        each_role(&mut self.ctx, |ctx| ctx.stats.finish());
        let outcome = match status {
            WorkerStatus::Success => Outcome::Success,
            _ => Outcome::Failure,
        };
        if let Err(e) = self.ctx.cleanup(outcome) {
            error!(job = self.job.id, thread = %self.ctx.name, error = %format!("{:#}", e), "cleanup failed");
            status = WorkerStatus::Failure;
        }

        let snapshot = self.ctx.snapshot();
        info!(
            job = self.job.id,
            thread = %self.ctx.name,
            ?end,
            ?status,
            passes = self.ctx.pass_count,
            records = snapshot.counters.total_records(),
            errors = snapshot.counters.errors,
            elapsed = %format_duration(self.ctx.stats.elapsed()),
            "worker finished"
        );

        if self.member.complete(status, snapshot) {
            if let Some(barrier) = &self.job.barrier {
                barrier.leave();
            }
            self.job.member_finished(&self.member, status);
        }
    }

    /// Observe the token; `Some` ends the loop
    pub fn control(&self, at: Checkpoint) -> Option<LoopEnd> {
        let member = &self.member;
        let flow = member.token.checkpoint_with(at, |parked| {
            member.set_state(if parked {
                ThreadState::Paused
            } else {
                ThreadState::Running
            });
        });
        match flow {
            Flow::Continue => None,
            Flow::Stop(reason) => Some(LoopEnd::Stopped(reason)),
            Flow::Forced => Some(LoopEnd::Forced),
        }
    }

    /// Top-of-pass checks
    pub fn pass_gate(&mut self) -> Option<LoopEnd> {
        if let Some(end) = self.control(Checkpoint::PassBoundary) {
            return Some(end);
        }
        if self.ctx.errors.limit_reached() {
            return Some(LoopEnd::ErrorLimit);
        }
        if let Some(runtime) = self.job.tuning().runtime {
            if self.member.active_elapsed(Instant::now()) >= runtime {
                return Some(LoopEnd::Stopped(StopReason::Runtime));
            }
        }
        if !self.ctx.params.wants_pass(self.ctx.pass_count) {
            return Some(LoopEnd::Completed);
        }
        None
    }

    /// Before-record checks, including rate pacing
    pub fn record_gate(&mut self) -> Option<LoopEnd> {
        if let Some(end) = self.control(Checkpoint::RecordBoundary) {
            return Some(end);
        }
        if self.ctx.errors.limit_reached() {
            return Some(LoopEnd::ErrorLimit);
        }
        let delay = self.member.delay();
        if !delay.is_zero() && !self.member.token.sleep(delay) {
            return self.control(Checkpoint::RecordBoundary);
        }
        None
    }

    /// Start a pass: pattern, seed, and address order for `(thread, pass)`
    pub fn begin_pass(&mut self) {
        let pass = self.ctx.pass_count;
        let thread = self.ctx.thread;
        let seed = pass_seed(self.ctx.params.seed, thread, pass);
        let io_type = if self.ctx.params.vary_iotype {
            if self.vary_rng.gen_bool(0.5) {
                IoType::Random
            } else {
                IoType::Sequential
            }
        } else {
            self.ctx.params.io_type
        };
        let io_dir = if self.ctx.params.vary_iodir {
            if self.vary_rng.gen_bool(0.5) {
                IoDir::Reverse
            } else {
                IoDir::Forward
            }
        } else {
            self.ctx.params.io_dir
        };

        each_role(&mut self.ctx, |ctx| {
            ctx.pattern.derive(thread, pass);
            if let Some(seq) = ctx.seq.as_mut() {
                seq.start_pass(seed, io_type, io_dir);
            }
            ctx.stats.start_pass();
        });
        self.enospc_attempts = 0;
        self.failed_records.clear();
        self.member.live.pass.set(pass + 1);
        debug!(
            job = self.job.id,
            thread = %self.ctx.name,
            pass = pass + 1,
            %io_type,
            %io_dir,
            pattern = %self.ctx.pattern.describe(),
            "pass started"
        );
    }

    /// Fold statistics, run the per-pass hooks, and reopen for the next pass
    pub fn end_pass(&mut self) -> Option<LoopEnd> {
        let elapsed = self.ctx.stats.pass_elapsed();
        let mut counters = self.ctx.stats.end_pass();
        if let Some(partner) = self.ctx.partner.as_deref_mut() {
            counters.add(&partner.stats.end_pass());
            partner.pass_count += 1;
        }
        self.ctx.pass_count += 1;
        info!(
            job = self.job.id,
            thread = %self.ctx.name,
            pass = self.ctx.pass_count,
            written = counters.records_written,
            read = counters.records_read,
            errors = counters.errors,
            elapsed = %format_duration(elapsed),
            rate = %format_throughput(calculate_throughput(counters.total_bytes(), elapsed)),
            "pass complete"
        );

        if let Some(end) = hooks::after_pass(self) {
            return Some(end);
        }

        if let Some(marker) = &self.ctx.params.stop_on {
            if marker.exists() {
                info!(job = self.job.id, thread = %self.ctx.name, marker = %marker.display(), "stop marker present");
                return Some(LoopEnd::Stopped(StopReason::Marker));
            }
        }

        if self.ctx.params.wants_pass(self.ctx.pass_count) {
            for side in self.sides() {
                if let Step::Fatal(e) = self.reopen(side) {
                    return Some(LoopEnd::Fatal(e));
                }
            }
        }
        None
    }

    fn sides(&self) -> Vec<Side> {
        if self.ctx.partner.is_some() {
            vec![Side::Primary, Side::Partner]
        } else {
            vec![Side::Primary]
        }
    }

    /// Next address of the pass (the primary role drives both roles)
    pub fn next_address(&mut self) -> Option<Address> {
        self.ctx.seq.as_mut().and_then(|s| s.next_address())
    }

    /// Replay the pass from its seed
    pub fn rewind(&mut self) {
        if let Some(seq) = self.ctx.seq.as_mut() {
            seq.rewind();
        }
    }

    /// Fill the primary data buffer with the block expected at `offset`
    pub fn fill(&mut self, offset: u64) -> Result<()> {
        let IoContext { buffers, pattern, .. } = &mut self.ctx;
        let buffers = buffers.as_mut().ok_or_else(|| anyhow!("buffers not allocated"))?;
        pattern.fill(&mut buffers.data, offset);
        Ok(())
    }

    /// Copy the partner's data buffer into the primary's
    pub fn stage_input(&mut self) -> Result<()> {
        let IoContext { buffers, partner, .. } = &mut self.ctx;
        let output = buffers.as_mut().ok_or_else(|| anyhow!("buffers not allocated"))?;
        let input = partner
            .as_deref()
            .and_then(|p| p.buffers.as_ref())
            .ok_or_else(|| anyhow!("input buffers not allocated"))?;
        output.data.copy_from_slice(&input.data);
        Ok(())
    }

    pub fn buffer(&self, side: Side, buf: Buf) -> Result<&[u8]> {
        let ctx = match side {
            Side::Primary => &self.ctx,
            Side::Partner => self.ctx.partner.as_deref().ok_or_else(|| anyhow!("no input role bound"))?,
        };
        let buffers = ctx.buffers.as_ref().ok_or_else(|| anyhow!("buffers not allocated"))?;
        Ok(match buf {
            Buf::Data => &buffers.data[..],
            Buf::Verify => &buffers.verify[..],
        })
    }

    /// True when the transfer of `addr` failed earlier in this pass
    pub fn transfer_failed(&self, addr: Address) -> bool {
        self.failed_records.contains(&addr.record)
    }

    /// One device transfer with transport retries; with `tally`, statistics
    /// are recorded on the role that did the transfer
    fn io(&mut self, side: Side, op: Op, addr: Address, tally: bool) -> Result<DeviceResult<IoOutcome>> {
        let policy = RetryPolicy::transport(&self.ctx.params);
        let member = &self.member;
        let token = &member.token;
        let live = &member.live;
        let offset = addr.offset;
        let thread = self.ctx.thread;
        let ctx = match side {
            Side::Primary => &mut self.ctx,
            Side::Partner => self
                .ctx
                .partner
                .as_deref_mut()
                .ok_or_else(|| anyhow!("no input role bound"))?,
        };
        let IoContext {
            device,
            buffers,
            stats,
            ..
        } = ctx;
        let device = device.as_deref_mut().ok_or_else(|| anyhow!("no device bound"))?;
        let buffers = buffers.as_mut().ok_or_else(|| anyhow!("buffers not allocated"))?;

        let mut retries = 0;
        let on_retry = |attempt: u32, e: &DeviceError| {
            retries = attempt;
            warn!(thread, attempt, offset, error = %e, "retrying");
        };
        let kind = match op {
            Op::Write => OpKind::Write,
            Op::Read(_) => OpKind::Read,
        };
        member.begin_op(kind, Some(addr));
        let started = Instant::now();
        let result = match op {
            Op::Write => policy.run(token, || device.write(offset, &buffers.data), on_retry),
            Op::Read(Buf::Data) => policy.run(token, || device.read(offset, &mut buffers.data), on_retry),
            Op::Read(Buf::Verify) => policy.run(token, || device.read(offset, &mut buffers.verify), on_retry),
        };
        let latency = started.elapsed();
        member.end_op();

        for _ in 0..retries {
            stats.record_retry();
        }
        if !tally {
            return Ok(result);
        }
        if let Ok(IoOutcome::Transferred(n)) = &result {
            let n = *n as u64;
            match op {
                Op::Write => {
                    stats.record_write(n, latency);
                    live.record_write(n);
                }
                Op::Read(_) => {
                    stats.record_read(n, latency);
                    live.record_read(n);
                }
            }
        }
        Ok(result)
    }

    /// Write the primary data buffer at `addr`, applying the no-space policy
    pub fn write(&mut self, addr: Address) -> Step {
        let bs = self.ctx.params.block_size as usize;
        match self.io(Side::Primary, Op::Write, addr, true) {
            Err(e) => Step::Fatal(e),
            Ok(Ok(IoOutcome::Transferred(n))) if n >= bs => Step::Done,
            Ok(Ok(_)) => self.end_of_media(addr),
            Ok(Err(e)) if e.is_no_space() => self.no_space(addr, e),
            Ok(Err(e)) => self.failed("write", Some(addr), &e),
        }
    }

    /// Read a block at `addr` into one of `side`'s buffers
    pub fn read(&mut self, side: Side, buf: Buf, addr: Address) -> Step {
        let bs = self.ctx.params.block_size as usize;
        match self.io(side, Op::Read(buf), addr, true) {
            Err(e) => Step::Fatal(e),
            Ok(Ok(IoOutcome::Transferred(n))) if n >= bs => Step::Done,
            Ok(Ok(_)) => Step::EndOfData,
            Ok(Err(e)) => self.failed("read", Some(addr), &e),
        }
    }

    /// Re-read for a corruption retry; neither the transfer nor a failure
    /// is counted
    pub fn reread(&mut self, side: Side, buf: Buf, addr: Address) -> Result<bool> {
        let bs = self.ctx.params.block_size as usize;
        Ok(matches!(
            self.io(side, Op::Read(buf), addr, false)?,
            Ok(IoOutcome::Transferred(n)) if n >= bs
        ))
    }

    /// Flush the output
    pub fn flush(&mut self) -> Step {
        let policy = RetryPolicy::transport(&self.ctx.params);
        let token = &self.member.token;
        let device = match self.ctx.device.as_deref_mut() {
            Some(d) => d,
            None => return Step::Fatal(anyhow!("no device bound")),
        };
        self.member.begin_op(OpKind::Flush, None);
        let result = policy.run(token, || device.flush(), |_, _| {});
        self.member.end_op();
        match result {
            Ok(()) => Step::Done,
            Err(e) => self.failed("flush", None, &e),
        }
    }

    /// Close and reopen one role between sub-passes
    pub fn reopen(&mut self, side: Side) -> Step {
        let result = match side {
            Side::Primary => self.ctx.reopen(),
            Side::Partner => match self.ctx.partner.as_deref_mut() {
                Some(p) => p.reopen(),
                None => return Step::Fatal(anyhow!("no input role bound")),
            },
        };
        match result {
            Ok(()) => Step::Done,
            Err(e) => {
                let msg = format!("{:#}", e);
                self.count_error("reopen", None, &msg);
                Step::Fatal(e)
            }
        }
    }

    /// Writers of a shared device wait for each other before verifying
    pub fn rendezvous(&mut self) -> Option<LoopEnd> {
        let barrier = self.job.barrier.clone()?;
        if barrier.wait(&self.member.token) {
            None
        } else {
            Some(self.control(Checkpoint::AfterBlockingCall).unwrap_or(LoopEnd::Stopped(StopReason::User)))
        }
    }

    fn end_of_media(&mut self, addr: Address) -> Step {
        if let Some(seq) = self.ctx.seq.as_mut() {
            seq.truncate_to(addr.record);
        }
        info!(
            job = self.job.id,
            thread = %self.ctx.name,
            record = addr.record,
            offset = addr.offset,
            "end of media, pass truncated"
        );
        Step::EndOfData
    }

    fn no_space(&mut self, addr: Address, err: DeviceError) -> Step {
        match self.ctx.params.enospc {
            NoSpacePolicy::Fail => self.failed("write", Some(addr), &err),
            NoSpacePolicy::EndOfMedia => self.end_of_media(addr),
            NoSpacePolicy::DeleteAndResume if self.enospc_attempts < self.ctx.params.enospc_retries => {
                self.enospc_attempts += 1;
                warn!(
                    job = self.job.id,
                    thread = %self.ctx.name,
                    attempt = self.enospc_attempts,
                    offset = addr.offset,
                    "out of space, recreating output"
                );
                match self.ctx.recreate() {
                    Ok(()) => {
                        self.failed_records.clear();
                        Step::Restart
                    }
                    Err(e) => Step::Fatal(e),
                }
            }
            NoSpacePolicy::DeleteAndResume => self.failed("write", Some(addr), &err),
        }
    }

    fn failed(&mut self, what: &str, addr: Option<Address>, err: &dyn fmt::Display) -> Step {
        if let Some(addr) = addr {
            self.failed_records.insert(addr.record);
        }
        if self.count_error(what, addr, err) {
            Step::Limit
        } else {
            Step::Skipped
        }
    }

    /// Count one failure; true once the error limit is reached
    pub fn count_error(&mut self, what: &str, addr: Option<Address>, err: &dyn fmt::Display) -> bool {
        self.ctx.stats.record_error();
        self.member.live.errors.add(1);
        let limit = self.ctx.errors.record();
        error!(
            job = self.job.id,
            thread = %self.ctx.name,
            device = self.ctx.device_name(),
            pass = self.ctx.pass_count + 1,
            record = ?addr.map(|a| a.record),
            offset = ?addr.map(|a| a.offset),
            error = %err,
            "{} failed",
            what
        );
        if limit {
            warn!(job = self.job.id, thread = %self.ctx.name, limit = self.ctx.errors.limit, "error limit reached");
        }
        limit
    }

    /// Count one data mismatch; true once the error limit is reached
    pub fn count_mismatch(&mut self) -> bool {
        self.ctx.stats.record_mismatch();
        self.member.live.errors.add(1);
        let limit = self.ctx.errors.record();
        if limit {
            warn!(job = self.job.id, thread = %self.ctx.name, limit = self.ctx.errors.limit, "error limit reached");
        }
        limit
    }
}

/// Apply `f` to the context and then to its partner role
fn each_role(ctx: &mut IoContext, mut f: impl FnMut(&mut IoContext)) {
    f(ctx);
    if let Some(partner) = ctx.partner.as_deref_mut() {
        f(partner);
    }
}

/// Map a record step onto the loop: `Some` ends the loop
pub(crate) fn step_end(step: Step) -> Option<LoopEnd> {
    match step {
        Step::Limit => Some(LoopEnd::ErrorLimit),
        Step::Fatal(e) => Some(LoopEnd::Fatal(e)),
        _ => None,
    }
}
