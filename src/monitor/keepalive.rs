//! Keepalive messages
//!
//! A keepalive format is plain text with `%` conversions:
//!
//! | Code | Value |
//! |------|-------|
//! | `%d` | device name |
//! | `%j` | job id |
//! | `%t` | thread name |
//! | `%p` | current pass |
//! | `%r` | records transferred |
//! | `%b` | bytes transferred |
//! | `%e` | errors |
//! | `%s` | elapsed seconds |
//! | `%%` | a literal `%` |

use crate::Result;
use anyhow::bail;
use std::fmt::Write;
use std::time::Duration;

pub const DEFAULT_FORMAT: &str = "%d [job %j %t] pass %p: %r records, %b bytes, %e errors, %ss";

/// Values substituted into a keepalive format
#[derive(Debug, Clone)]
pub struct KeepaliveFields<'a> {
    pub device: &'a str,
    pub job: u64,
    pub thread: &'a str,
    pub pass: u64,
    pub records: u64,
    pub bytes: u64,
    pub errors: u64,
    pub elapsed: Duration,
}

/// Reject unknown conversions and a trailing `%`
pub fn validate_format(fmt: &str) -> Result<()> {
    let mut chars = fmt.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            continue;
        }
        match chars.next() {
            Some('d' | 'j' | 't' | 'p' | 'r' | 'b' | 'e' | 's' | '%') => {}
            Some(other) => bail!("unknown conversion %{} in {:?}", other, fmt),
            None => bail!("format {:?} ends with a lone %", fmt),
        }
    }
    Ok(())
}

/// Expand `fmt`; formats are validated up front, unknown codes are copied
pub fn format(fmt: &str, f: &KeepaliveFields<'_>) -> String {
    let mut out = String::with_capacity(fmt.len() + 32);
    let mut chars = fmt.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let _ = match chars.next() {
            Some('d') => write!(out, "{}", f.device),
            Some('j') => write!(out, "{}", f.job),
            Some('t') => write!(out, "{}", f.thread),
            Some('p') => write!(out, "{}", f.pass),
            Some('r') => write!(out, "{}", f.records),
            Some('b') => write!(out, "{}", f.bytes),
            Some('e') => write!(out, "{}", f.errors),
            Some('s') => write!(out, "{}", f.elapsed.as_secs()),
            Some('%') => write!(out, "%"),
            Some(other) => write!(out, "%{}", other),
            None => write!(out, "%"),
        };
    }
    out
}
