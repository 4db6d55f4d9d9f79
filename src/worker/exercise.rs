//! Exercise loop: write a pass, then read it back and verify
//!
//! Contexts without an output only run the read-verify sub-pass over
//! existing data, which must carry the same pattern and seed.

use super::verify::{self, Compare};
use super::{step_end, Buf, LoopEnd, Side, Step, Worker};
use crate::context::Role;
use crate::util::cancel::Checkpoint;

pub fn run(w: &mut Worker) -> LoopEnd {
    loop {
        if let Some(end) = w.pass_gate() {
            return end;
        }
        w.begin_pass();
        let sub = match w.ctx.params.role {
            Role::Write => write_pass(w),
            Role::Read => verify_pass(w, false),
        };
        if let Some(end) = sub {
            return end;
        }
        if let Some(end) = w.end_pass() {
            return end;
        }
    }
}

fn write_pass(w: &mut Worker) -> Option<LoopEnd> {
    'pass: loop {
        w.rewind();
        while let Some(addr) = w.next_address() {
            if let Some(end) = w.record_gate() {
                return Some(end);
            }
            if let Err(e) = w.fill(addr.offset) {
                return Some(LoopEnd::Fatal(e));
            }
            match w.write(addr) {
                Step::Done | Step::Skipped => {}
                Step::EndOfData => break,
                Step::Restart => continue 'pass,
                step => return step_end(step),
            }
            if let Some(end) = w.control(Checkpoint::AfterBlockingCall) {
                return Some(end);
            }
        }
        break;
    }

    if let Some(end) = step_end(w.flush()) {
        return Some(end);
    }
    if let Some(end) = w.rendezvous() {
        return Some(end);
    }
    if w.ctx.params.verify {
        return verify_pass(w, true);
    }
    None
}

/// Replay the pass addresses and compare against the pattern
fn verify_pass(w: &mut Worker, after_write: bool) -> Option<LoopEnd> {
    if after_write {
        if let Some(end) = step_end(w.reopen(Side::Primary)) {
            return Some(end);
        }
    }
    w.rewind();
    while let Some(addr) = w.next_address() {
        if w.transfer_failed(addr) {
            continue;
        }
        if let Some(end) = w.record_gate() {
            return Some(end);
        }
        if let Err(e) = w.fill(addr.offset) {
            return Some(LoopEnd::Fatal(e));
        }
        match w.read(Side::Primary, Buf::Verify, addr) {
            Step::Done => {}
            Step::EndOfData if !after_write => return Some(LoopEnd::EndOfData),
            Step::EndOfData => {
                if w.count_error("verify read", Some(addr), &"short read of written data") {
                    return Some(LoopEnd::ErrorLimit);
                }
                continue;
            }
            Step::Skipped => continue,
            step => return step_end(step),
        }
        if let Some(end) = w.control(Checkpoint::AfterBlockingCall) {
            return Some(end);
        }
        match verify::check(w, addr, &Compare::EXERCISE) {
            Ok(false) => {}
            Ok(true) => return Some(LoopEnd::ErrorLimit),
            Err(e) => return Some(LoopEnd::Fatal(e)),
        }
    }
    None
}
