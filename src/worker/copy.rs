//! Copy loop: read the input role, write the output at the same address
//!
//! With verify, both ends are reopened after the pass and the input is
//! compared against the output block for block. Running out of input, or of room on
//! the output, ends the loop cleanly after what was copied has been verified.

use super::verify::{self, Compare};
use super::{step_end, Buf, LoopEnd, Side, Step, Worker};
use crate::util::cancel::Checkpoint;
use anyhow::anyhow;

pub fn run(w: &mut Worker) -> LoopEnd {
    if w.ctx.partner.is_none() {
        return LoopEnd::Fatal(anyhow!("copy needs an input role"));
    }
    loop {
        if let Some(end) = w.pass_gate() {
            return end;
        }
        w.begin_pass();
        let mut exhausted = false;
        if let Some(end) = copy_pass(w, &mut exhausted) {
            return end;
        }
        if w.ctx.params.verify {
            if let Some(end) = verify_pass(w) {
                return end;
            }
        }
        if let Some(end) = w.end_pass() {
            return end;
        }
        if exhausted {
            return LoopEnd::EndOfData;
        }
    }
}

fn copy_pass(w: &mut Worker, exhausted: &mut bool) -> Option<LoopEnd> {
    'pass: loop {
        w.rewind();
        while let Some(addr) = w.next_address() {
            if let Some(end) = w.record_gate() {
                return Some(end);
            }
            match w.read(Side::Partner, Buf::Data, addr) {
                Step::Done => {}
                Step::EndOfData => {
                    *exhausted = true;
                    if let Some(seq) = w.ctx.seq.as_mut() {
                        seq.truncate_to(addr.record);
                    }
                    break;
                }
                Step::Skipped => continue,
                step => return step_end(step),
            }
            if let Err(e) = w.stage_input() {
                return Some(LoopEnd::Fatal(e));
            }
            match w.write(addr) {
                Step::Done | Step::Skipped => {}
                Step::EndOfData => {
                    *exhausted = true;
                    break;
                }
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
    w.rendezvous()
}

fn verify_pass(w: &mut Worker) -> Option<LoopEnd> {
    for side in [Side::Primary, Side::Partner] {
        if let Some(end) = step_end(w.reopen(side)) {
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
        match w.read(Side::Partner, Buf::Data, addr) {
            Step::Done => {}
            Step::EndOfData => return None,
            Step::Skipped => continue,
            step => return step_end(step),
        }
        match w.read(Side::Primary, Buf::Verify, addr) {
            Step::Done => {}
            Step::EndOfData => {
                if w.count_error("verify read", Some(addr), &"output shorter than input") {
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
        match verify::check(w, addr, &Compare::COPY) {
            Ok(false) => {}
            Ok(true) => return Some(LoopEnd::ErrorLimit),
            Err(e) => return Some(LoopEnd::Fatal(e)),
        }
    }
    None
}
