//! Process state
//!
//! One [`ProcessState`] per process holds the job table and the root
//! cancellation token. It is passed around by reference (`Arc`); the signal
//! handler is the only place that keeps a handle to it on its own.

use crate::job::table::JobTable;
use crate::util::cancel::{CancelToken, StopReason};
use crate::Result;
use anyhow::Context;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Exit status used when a second signal aborts the process
const SIGNAL_EXIT_CODE: i32 = 130;

pub struct ProcessState {
    pub jobs: JobTable,
    /// Parent of every job token
    pub token: CancelToken,
    pub debug: bool,
    signals: AtomicUsize,
}

impl Default for ProcessState {
    fn default() -> Self {
        Self::new(false)
    }
}

impl ProcessState {
    pub fn new(debug: bool) -> Self {
        Self {
            jobs: JobTable::new(),
            token: CancelToken::new(),
            debug,
            signals: AtomicUsize::new(0),
        }
    }

    /// Stop every job; new jobs see the stop through the root token
    pub fn request_termination(&self, reason: StopReason) {
        self.token.stop(reason);
        for job in self.jobs.snapshot() {
            job.begin_termination(reason);
        }
    }

    pub fn is_terminating(&self) -> bool {
        self.token.is_stopping()
    }

    /// Handle SIGINT/SIGTERM: the first requests termination, a second one
    /// exits immediately
    pub fn install_signal_handler(self: &Arc<Self>) -> Result<()> {
        let state = Arc::clone(self);
        ctrlc::set_handler(move || {
            let n = state.signals.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                warn!("termination requested, stopping jobs (signal again to exit now)");
                state.request_termination(StopReason::Signal);
            } else {
                std::process::exit(SIGNAL_EXIT_CODE);
            }
        })
        .context("Failed to install signal handler")
    }
}
