//! Compare and classify mismatches
//!
//! A block that fails to compare is re-read up to the corruption retry limit.
//! If a re-read matches, the corruption was transient (e.g. on the read
//! path); otherwise it is persistent. Either way it counts as one error.

use super::{Buf, Side, Worker};
use crate::distribution::Address;
use crate::pattern::{compare_buffers, Mismatch};
use crate::worker::retry::RetryPolicy;
use crate::Result;
use anyhow::Context;
use std::path::Path;
use tracing::{error, info, warn};

/// Where the two sides of a compare live
#[derive(Debug, Clone, Copy)]
pub struct Compare {
    pub expected: (Side, Buf),
    /// Re-read on corruption retries
    pub actual: (Side, Buf),
    /// Diagnose block tags with the primary's pattern state
    pub tagged: bool,
}

impl Compare {
    /// Pattern in the data buffer against the block read back into verify
    pub const EXERCISE: Compare = Compare {
        expected: (Side::Primary, Buf::Data),
        actual: (Side::Primary, Buf::Verify),
        tagged: true,
    };

    /// Input block against the output block at the same address
    pub const COPY: Compare = Compare {
        expected: (Side::Partner, Buf::Data),
        actual: (Side::Primary, Buf::Verify),
        tagged: false,
    };

    /// Block just written against the one read back from the input role
    pub const MIRROR: Compare = Compare {
        expected: (Side::Primary, Buf::Data),
        actual: (Side::Partner, Buf::Verify),
        tagged: true,
    };
}

impl Worker {
    fn compare(&self, addr: Address, cmp: &Compare) -> Result<Option<Mismatch>> {
        let expected = self.buffer(cmp.expected.0, cmp.expected.1)?;
        let actual = self.buffer(cmp.actual.0, cmp.actual.1)?;
        Ok(if cmp.tagged {
            self.ctx.pattern.compare(expected, actual, addr.offset)
        } else {
            compare_buffers(expected, actual)
        })
    }
}

/// Compare the record at `addr`, counting a mismatch once
///
/// Returns true when the error limit is reached.
pub fn check(w: &mut Worker, addr: Address, cmp: &Compare) -> Result<bool> {
    let first = match w.compare(addr, cmp)? {
        None => return Ok(false),
        Some(m) => m,
    };

    if let Some(dir) = w.ctx.params.save_corrupted.clone() {
        match capture(w, &dir, addr, cmp) {
            Ok(stem) => info!(thread = %w.ctx.name, path = %dir.join(stem).display(), "saved corrupted block"),
            Err(e) => warn!(thread = %w.ctx.name, error = %format!("{:#}", e), "could not save corrupted block"),
        }
    }

    let policy = RetryPolicy::corruption(&w.ctx.params);
    let mut transient = false;
    for _ in 0..policy.limit {
        if !w.member.token.sleep(policy.delay) {
            break;
        }
        w.ctx.stats.record_retry();
        if !w.reread(cmp.actual.0, cmp.actual.1, addr)? {
            break;
        }
        if w.compare(addr, cmp)?.is_none() {
            transient = true;
            break;
        }
    }

    error!(
        job = w.job.id,
        thread = %w.ctx.name,
        device = w.ctx.device_name(),
        pass = w.ctx.pass_count + 1,
        record = addr.record,
        offset = addr.offset,
        transient,
        "data mismatch: {}",
        first
    );
    Ok(w.count_mismatch())
}

/// Write expected and received bytes to `<dir>/<name>-p<pass>-r<record>.{exp,rcv}`
fn capture(w: &Worker, dir: &Path, addr: Address, cmp: &Compare) -> Result<String> {
    let stem = format!(
        "{}-{}-p{}-r{}",
        sanitize(w.ctx.device_name()),
        w.ctx.name,
        w.ctx.pass_count + 1,
        addr.record
    );
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let exp = dir.join(format!("{}.exp", stem));
    std::fs::write(&exp, w.buffer(cmp.expected.0, cmp.expected.1)?)
        .with_context(|| format!("Failed to write {}", exp.display()))?;
    let rcv = dir.join(format!("{}.rcv", stem));
    std::fs::write(&rcv, w.buffer(cmp.actual.0, cmp.actual.1)?)
        .with_context(|| format!("Failed to write {}", rcv.display()))?;
    Ok(stem)
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect();
    cleaned.trim_start_matches(['.', '_']).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("/dev/sdb"), "dev_sdb");
        assert_eq!(sanitize("vol-t1"), "vol-t1");
        assert_eq!(sanitize("../x y"), "x_y");
    }
}
