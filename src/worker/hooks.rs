//! Per-pass hooks on the output
//!
//! Run after the pass statistics are folded, in this order: the post-write
//! command, trim of the pass range, delete-and-recreate of the output.
//! Read-only contexts skip them all.

use super::{LoopEnd, Worker};
use crate::context::Role;
use crate::device::DeviceError;
use crate::Result;
use anyhow::{bail, Context};
use std::process::Command;
use tracing::debug;

pub fn after_pass(w: &mut Worker) -> Option<LoopEnd> {
    if w.ctx.params.role != Role::Write {
        return None;
    }
    let hooks = w.ctx.params.hooks.clone();

    if let Some(cmd) = hooks.post_write_cmd.as_deref() {
        if let Err(e) = post_write_command(w, cmd) {
            let msg = format!("{:#}", e);
            if w.count_error("post-write command", None, &msg) {
                return Some(LoopEnd::ErrorLimit);
            }
        }
    }

    if hooks.trim {
        let bs = w.ctx.params.block_size;
        if let (Some(seq), Some(device)) = (w.ctx.seq.as_ref(), w.ctx.device.as_deref_mut()) {
            let range = seq.range();
            match device.deallocate(range.base, range.bytes(bs)) {
                Ok(()) => debug!(thread = %w.ctx.name, base = range.base, blocks = range.blocks, "range trimmed"),
                Err(DeviceError::Unsupported(_)) => {
                    debug!(thread = %w.ctx.name, "trim not supported by device")
                }
                Err(e) => {
                    if w.count_error("trim", None, &e) {
                        return Some(LoopEnd::ErrorLimit);
                    }
                }
            }
        }
    }

    if hooks.delete_per_pass && w.ctx.params.wants_pass(w.ctx.pass_count) {
        if let Err(e) = w.ctx.recreate() {
            return Some(LoopEnd::Fatal(e));
        }
    }
    None
}

fn post_write_command(w: &Worker, cmd: &str) -> Result<()> {
    let status = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .env("IOVET_DEVICE", w.ctx.device_name())
        .env("IOVET_PASS", w.ctx.pass_count.to_string())
        .env("IOVET_THREAD", w.ctx.thread.to_string())
        .status()
        .with_context(|| format!("Failed to run post-write command: {}", cmd))?;
    debug!(thread = %w.ctx.name, %status, "post-write command finished");
    if !status.success() {
        bail!("post-write command exited with {}", status);
    }
    Ok(())
}
