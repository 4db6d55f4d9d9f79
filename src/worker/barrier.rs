//! Per-pass rendezvous for workers sharing one device
//!
//! Writers arrive after their write sub-pass; nobody starts verifying until
//! every live writer has arrived. The barrier re-arms itself for the next
//! pass. A worker that exits (or is force-cancelled) leaves, which lowers the
//! party count and may release the ones already waiting.

use crate::util::cancel::CancelToken;
use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// How often a parked worker re-checks its token
const POLL: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct State {
    parties: usize,
    arrived: usize,
    generation: u64,
}

#[derive(Debug)]
pub struct PassBarrier {
    state: Mutex<State>,
    cond: Condvar,
}

impl PassBarrier {
    pub fn new(parties: usize) -> Self {
        Self {
            state: Mutex::new(State {
                parties,
                arrived: 0,
                generation: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Wait for the other parties of this pass
    ///
    /// Returns false if `token` stopped while waiting; the arrival is then
    /// withdrawn.
    pub fn wait(&self, token: &CancelToken) -> bool {
        let mut state = self.state.lock();
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived >= state.parties {
            Self::release(&mut state);
            self.cond.notify_all();
            return true;
        }

        while state.generation == generation {
            if token.is_stopping() {
                state.arrived = state.arrived.saturating_sub(1);
                return false;
            }
            self.cond.wait_for(&mut state, POLL);
        }
        true
    }

    /// Deregister an exiting worker
    pub fn leave(&self) {
        let mut state = self.state.lock();
        state.parties = state.parties.saturating_sub(1);
        if state.arrived > 0 && state.arrived >= state.parties {
            Self::release(&mut state);
            self.cond.notify_all();
        }
    }

    pub fn parties(&self) -> usize {
        self.state.lock().parties
    }

    fn release(state: &mut State) {
        state.arrived = 0;
        state.generation = state.generation.wrapping_add(1);
    }
}
