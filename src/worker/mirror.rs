//! Mirror loop: write the output, read it straight back through the input
//! role, and compare against the block just written
//!
//! Every record is verified as it goes, so there is no separate verify
//! sub-pass.

use super::verify::{self, Compare};
use super::{step_end, Buf, LoopEnd, Side, Step, Worker};
use crate::util::cancel::Checkpoint;
use anyhow::anyhow;

pub fn run(w: &mut Worker) -> LoopEnd {
    if w.ctx.partner.is_none() {
        return LoopEnd::Fatal(anyhow!("mirror needs an input role"));
    }
    loop {
        if let Some(end) = w.pass_gate() {
            return end;
        }
        w.begin_pass();
        if let Some(end) = mirror_pass(w) {
            return end;
        }
        if let Some(end) = w.end_pass() {
            return end;
        }
    }
}

fn mirror_pass(w: &mut Worker) -> Option<LoopEnd> {
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
                Step::Done => {}
                Step::Skipped => continue,
                Step::EndOfData => break,
                Step::Restart => continue 'pass,
                step => return step_end(step),
            }
            if let Some(end) = w.control(Checkpoint::AfterBlockingCall) {
                return Some(end);
            }
            if !w.ctx.params.verify {
                continue;
            }
            match w.read(Side::Partner, Buf::Verify, addr) {
                Step::Done => {}
                Step::EndOfData => {
                    if w.count_error("mirror read", Some(addr), &"input shorter than output") {
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
            match verify::check(w, addr, &Compare::MIRROR) {
                Ok(false) => {}
                Ok(true) => return Some(LoopEnd::ErrorLimit),
                Err(e) => return Some(LoopEnd::Fatal(e)),
            }
        }
        break;
    }
    step_end(w.flush())
}
