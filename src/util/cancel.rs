//! Cooperative cancellation
//!
//! Every worker loop observes a single [`CancelToken`] at named checkpoints.
//! Tokens form a tree: the process token (signals), one token per job
//! (explicit stop/pause), and one per worker thread (runtime expiry, forced
//! cancel). A state change on any token is visible to all of its descendants.
//!
//! # States
//!
//! - **Paused**: checkpoints block until resumed or stopped
//! - **Stopping**: checkpoints return [`Flow::Stop`]; the loop unwinds through
//!   its normal shutdown so statistics and dispose policy still apply
//! - **Forced**: set only by the monitor (or an explicit cancel) for a worker
//!   stuck past its grace period; the loop exits without cleanup
//!
//! # Example
//!
//! ```
//! use iovet::util::cancel::{CancelToken, Checkpoint, Flow, StopReason};
//!
//! let job = CancelToken::new();
//! let thread = job.child();
//!
//! assert_eq!(thread.checkpoint(Checkpoint::RecordBoundary), Flow::Continue);
//! job.stop(StopReason::User);
//! assert_eq!(thread.checkpoint(Checkpoint::RecordBoundary), Flow::Stop(StopReason::User));
//! ```

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

const PAUSED: u8 = 0b001;
const STOPPING: u8 = 0b010;
const FORCED: u8 = 0b100;

/// Why a token was asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    /// Explicit stop from the job-control surface
    User,
    /// Process received a termination signal
    Signal,
    /// A worker reached its error limit under an abort policy
    ErrorLimit,
    /// Runtime budget expired
    Runtime,
    /// Stop-on marker file appeared
    Marker,
    /// No-progress escalation decided to terminate the job
    Escalation,
}

impl StopReason {
    /// Benign reasons do not turn a healthy run into a failing one
    pub fn is_benign(&self) -> bool {
        !matches!(self, StopReason::ErrorLimit | StopReason::Escalation)
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::User => "user stop",
            StopReason::Signal => "signal",
            StopReason::ErrorLimit => "error limit",
            StopReason::Runtime => "runtime expired",
            StopReason::Marker => "stop marker",
            StopReason::Escalation => "no-progress escalation",
        };
        f.write_str(s)
    }
}

/// Named places where a loop observes its token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    /// Top of each pass
    PassBoundary,
    /// Before each record
    RecordBoundary,
    /// Right after a blocking device call returned; stops are seen here,
    /// pauses wait for the next record or pass boundary
    AfterBlockingCall,
}

impl Checkpoint {
    fn parks(self) -> bool {
        !matches!(self, Checkpoint::AfterBlockingCall)
    }
}

/// What a loop should do after a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop(StopReason),
    /// Forced cancellation: skip normal cleanup
    Forced,
}

struct Inner {
    bits: AtomicU8,
    reason: Mutex<Option<StopReason>>,
    lock: Mutex<()>,
    cond: Condvar,
    parent: Option<Arc<Inner>>,
    children: Mutex<Vec<Weak<Inner>>>,
}

/// Hierarchical cancellation token
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("paused", &self.is_paused())
            .field("stopping", &self.is_stopping())
            .field("forced", &self.is_forced())
            .finish()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// Create a root token
    pub fn new() -> Self {
        Self::with_parent(None)
    }

    fn with_parent(parent: Option<Arc<Inner>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                bits: AtomicU8::new(0),
                reason: Mutex::new(None),
                lock: Mutex::new(()),
                cond: Condvar::new(),
                parent,
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a child that observes this token's state as well as its own
    pub fn child(&self) -> Self {
        let child = Self::with_parent(Some(Arc::clone(&self.inner)));
        let mut children = self.inner.children.lock();
        children.retain(|w| w.strong_count() > 0);
        children.push(Arc::downgrade(&child.inner));
        child
    }

    /// Request a cooperative stop. Returns true if this call set it.
    pub fn stop(&self, reason: StopReason) -> bool {
        let first = {
            let mut r = self.inner.reason.lock();
            if r.is_none() {
                *r = Some(reason);
                true
            } else {
                false
            }
        };
        self.inner.bits.fetch_or(STOPPING, Ordering::SeqCst);
        notify_tree(&self.inner);
        first
    }

    /// Forced, non-cooperative cancellation
    pub fn force(&self) {
        {
            let mut r = self.inner.reason.lock();
            if r.is_none() {
                *r = Some(StopReason::Escalation);
            }
        }
        self.inner.bits.fetch_or(STOPPING | FORCED, Ordering::SeqCst);
        notify_tree(&self.inner);
    }

    pub fn pause(&self) {
        self.inner.bits.fetch_or(PAUSED, Ordering::SeqCst);
        notify_tree(&self.inner);
    }

    pub fn resume(&self) {
        self.inner.bits.fetch_and(!PAUSED, Ordering::SeqCst);
        notify_tree(&self.inner);
    }

    fn effective_bits(&self) -> u8 {
        let mut bits = 0;
        let mut node = Some(&self.inner);
        while let Some(n) = node {
            bits |= n.bits.load(Ordering::SeqCst);
            node = n.parent.as_ref();
        }
        bits
    }

    pub fn is_paused(&self) -> bool {
        self.effective_bits() & PAUSED != 0
    }

    pub fn is_stopping(&self) -> bool {
        self.effective_bits() & STOPPING != 0
    }

    pub fn is_forced(&self) -> bool {
        self.effective_bits() & FORCED != 0
    }

    /// Nearest stop reason walking up towards the root
    pub fn stop_reason(&self) -> Option<StopReason> {
        let mut node = Some(&self.inner);
        while let Some(n) = node {
            if let Some(r) = *n.reason.lock() {
                return Some(r);
            }
            node = n.parent.as_ref();
        }
        None
    }

    fn flow(&self, bits: u8) -> Option<Flow> {
        if bits & FORCED != 0 {
            return Some(Flow::Forced);
        }
        if bits & STOPPING != 0 {
            return Some(Flow::Stop(self.stop_reason().unwrap_or(StopReason::User)));
        }
        None
    }

    /// Observe the token, blocking while paused at a record or pass boundary
    pub fn checkpoint(&self, at: Checkpoint) -> Flow {
        self.checkpoint_with(at, |_| {})
    }

    /// Like [`checkpoint`](Self::checkpoint), calling `on_park(true)` before
    /// blocking on a pause and `on_park(false)` once released.
    pub fn checkpoint_with(&self, at: Checkpoint, mut on_park: impl FnMut(bool)) -> Flow {
        let bits = self.effective_bits();
        if let Some(flow) = self.flow(bits) {
            return flow;
        }
        if bits & PAUSED == 0 || !at.parks() {
            return Flow::Continue;
        }

        let mut parked = false;
        let mut guard = self.inner.lock.lock();
        let flow = loop {
            let bits = self.effective_bits();
            if let Some(flow) = self.flow(bits) {
                break flow;
            }
            if bits & PAUSED == 0 {
                break Flow::Continue;
            }
            if !parked {
                parked = true;
                on_park(true);
            }
            self.inner.cond.wait(&mut guard);
        };
        drop(guard);
        if parked {
            on_park(false);
        }
        flow
    }

    /// Sleep for `dur` unless the token stops first.
    ///
    /// Returns false when woken by a stop.
    pub fn sleep(&self, dur: Duration) -> bool {
        let deadline = Instant::now() + dur;
        let mut guard = self.inner.lock.lock();
        loop {
            if self.is_stopping() {
                return false;
            }
            if self.inner.cond.wait_until(&mut guard, deadline).timed_out() {
                return !self.is_stopping();
            }
        }
    }
}

fn notify_tree(node: &Arc<Inner>) {
    {
        let _g = node.lock.lock();
        node.cond.notify_all();
    }
    let children: Vec<Arc<Inner>> = node
        .children
        .lock()
        .iter()
        .filter_map(Weak::upgrade)
        .collect();
    for child in children {
        notify_tree(&child);
    }
}
