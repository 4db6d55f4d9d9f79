//! Data pattern engine
//!
//! Decides what every written block contains and what a verify read should
//! find there. All variants are position-derived: the expected content of a
//! block is a pure function of the active pattern and the block's device byte
//! offset, so a verify pass can rebuild it without keeping the written data.
//!
//! # Variants
//!
//! - **Table**: a 32-bit word from the canonical worst-case list
//!   ([`DATA_PATTERNS`]), rotated per pass when uniqueness is enabled
//! - **Word**: one fixed user-supplied 32-bit word
//! - **Bytes**: a user byte string (or pattern file content), replicated
//! - **Incrementing**: `(offset + i) % 256`
//! - **IOT**: seed/position derived, see [`iot`]
//!
//! # Uniqueness
//!
//! With `unique` set, the table index or IOT seed is derived from the
//! (thread, pass) pair. A verify during the matching pass rebuilds exactly what
//! its own write produced while a block written by another thread or during
//! another pass compares unequal. That is how cross-thread overwrites and
//! stale data are caught in a shared address space.
//!
//! # Example
//!
//! ```
//! use iovet::pattern::{PatternSpec, PatternState};
//!
//! let mut state = PatternState::new(PatternSpec::Word(0xAAAA_AAAA), false, false);
//! state.derive(0, 0);
//!
//! let mut written = vec![0u8; 512];
//! state.fill(&mut written, 4096);
//!
//! let mut expected = vec![0u8; 512];
//! state.fill(&mut expected, 4096);
//! assert!(state.compare(&expected, &written, 4096).is_none());
//! ```

pub mod btag;
pub mod iot;

use self::btag::{TagInfo, TagMismatch, BTAG_SIZE};
use std::fmt;
use std::str::FromStr;

/// Canonical worst-case data patterns
///
/// Read-only after start; every context indexes the same table.
pub const DATA_PATTERNS: [u32; 13] = [
    0x39c3_9c39, 0x00ff_00ff, 0x0f0f_0f0f, 0xc6de_c6de, 0x6db6_db6d, 0x5555_5555, 0xaaaa_aaaa,
    0x3333_3333, 0x2667_3333, 0x6667_3326, 0x71c7_c71c, 0x0000_0000, 0xffff_ffff,
];

/// Pattern selected by configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PatternSpec {
    #[default]
    Table,
    Word(u32),
    Bytes(Vec<u8>),
    Incrementing,
    Iot,
}

impl FromStr for PatternSpec {
    type Err = anyhow::Error;

    /// Parse `table`, `iot`, `incr`, a hex (`0x...`) or decimal word, or
    /// `str:TEXT` for a literal byte string.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        match lower.as_str() {
            "table" | "default" => return Ok(PatternSpec::Table),
            "iot" => return Ok(PatternSpec::Iot),
            "incr" | "incrementing" => return Ok(PatternSpec::Incrementing),
            _ => {}
        }

        if let Some(text) = s.strip_prefix("str:") {
            if text.is_empty() {
                anyhow::bail!("pattern string must not be empty");
            }
            return Ok(PatternSpec::Bytes(text.as_bytes().to_vec()));
        }

        let word = if let Some(hex) = lower.strip_prefix("0x") {
            u32::from_str_radix(hex, 16)
        } else {
            lower.parse::<u32>()
        };
        word.map(PatternSpec::Word).map_err(|_| {
            anyhow::anyhow!(
                "invalid pattern '{}' (expected table, iot, incr, a 32-bit word, or str:TEXT)",
                s
            )
        })
    }
}

impl fmt::Display for PatternSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternSpec::Table => f.write_str("table"),
            PatternSpec::Word(w) => write!(f, "0x{:08x}", w),
            PatternSpec::Bytes(b) => write!(f, "bytes[{}]", b.len()),
            PatternSpec::Incrementing => f.write_str("incr"),
            PatternSpec::Iot => f.write_str("iot"),
        }
    }
}

/// Pattern in effect for the current pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivePattern {
    Word(u32),
    Bytes,
    Incrementing,
    Iot { seed: u32 },
}

/// First difference found by a compare
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    /// Byte index within the block
    pub index: usize,
    pub expected: u8,
    pub actual: u8,
    /// Number of differing bytes in the block
    pub bad_bytes: usize,
    /// Tag diagnosis when block tags are enabled
    pub tag: Option<TagMismatch>,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "byte {}: expected 0x{:02x}, received 0x{:02x} ({} bad bytes)",
            self.index, self.expected, self.actual, self.bad_bytes
        )?;
        if let Some(tag) = &self.tag {
            write!(f, "; {}", tag)?;
        }
        Ok(())
    }
}

/// Compare two buffers byte for byte
pub fn compare_buffers(expected: &[u8], actual: &[u8]) -> Option<Mismatch> {
    if expected == actual {
        return None;
    }
    let len = expected.len().min(actual.len());
    let mut first = None;
    let mut bad = expected.len().max(actual.len()) - len;
    for i in 0..len {
        if expected[i] != actual[i] {
            bad += 1;
            if first.is_none() {
                first = Some(i);
            }
        }
    }
    let index = first.unwrap_or(len);
    Some(Mismatch {
        index,
        expected: expected.get(index).copied().unwrap_or(0),
        actual: actual.get(index).copied().unwrap_or(0),
        bad_bytes: bad,
        tag: None,
    })
}

/// Per-context pattern state
///
/// Cloned into every thread context; the user byte string is deep-copied.
#[derive(Debug, Clone)]
pub struct PatternState {
    spec: PatternSpec,
    unique: bool,
    btag: bool,
    thread: usize,
    pass: u64,
    active: ActivePattern,
}

impl PatternState {
    pub fn new(spec: PatternSpec, unique: bool, btag: bool) -> Self {
        let mut state = Self {
            spec,
            unique,
            btag,
            thread: 0,
            pass: 0,
            active: ActivePattern::Incrementing,
        };
        state.derive(0, 0);
        state
    }

    /// Recompute the active pattern for `(thread, pass)`
    pub fn derive(&mut self, thread: usize, pass: u64) {
        self.thread = thread;
        self.pass = pass;
        self.active = match &self.spec {
            PatternSpec::Table => {
                let index = if self.unique {
                    (thread as u64).wrapping_add(pass) % DATA_PATTERNS.len() as u64
                } else {
                    0
                };
                ActivePattern::Word(DATA_PATTERNS[index as usize])
            }
            PatternSpec::Word(w) => ActivePattern::Word(*w),
            PatternSpec::Bytes(_) => ActivePattern::Bytes,
            PatternSpec::Incrementing => ActivePattern::Incrementing,
            PatternSpec::Iot => ActivePattern::Iot {
                seed: if self.unique {
                    iot::unique_seed(thread, pass)
                } else {
                    iot::pass_seed(pass)
                },
            },
        };
    }

    pub fn spec(&self) -> &PatternSpec {
        &self.spec
    }

    pub fn active(&self) -> ActivePattern {
        self.active
    }

    /// The word or seed recorded in block tags
    pub fn signature(&self) -> u32 {
        match self.active {
            ActivePattern::Word(w) => w,
            ActivePattern::Iot { seed } => seed,
            ActivePattern::Bytes | ActivePattern::Incrementing => 0,
        }
    }

    /// Short description for log headers
    pub fn describe(&self) -> String {
        match self.active {
            ActivePattern::Word(w) => format!("0x{:08x}", w),
            ActivePattern::Bytes => self.spec.to_string(),
            ActivePattern::Incrementing => "incrementing".to_string(),
            ActivePattern::Iot { seed } => format!("iot seed 0x{:08x}", seed),
        }
    }

    /// Tag expected on the block at `offset`
    pub fn tag_info(&self, offset: u64) -> TagInfo {
        TagInfo {
            lba: offset / iot::IOT_LBA_SIZE,
            offset,
            thread: if self.unique { self.thread as u32 } else { 0 },
            pass: self.pass as u32,
            pattern: self.signature(),
        }
    }

    /// Fill `buf` with the block that belongs at device byte `offset`
    pub fn fill(&self, buf: &mut [u8], offset: u64) {
        match self.active {
            ActivePattern::Word(w) => {
                let bytes = w.to_be_bytes();
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = bytes[((offset + i as u64) % 4) as usize];
                }
            }
            ActivePattern::Bytes => {
                if let PatternSpec::Bytes(pat) = &self.spec {
                    let len = pat.len() as u64;
                    for (i, b) in buf.iter_mut().enumerate() {
                        *b = pat[((offset + i as u64) % len) as usize];
                    }
                }
            }
            ActivePattern::Incrementing => {
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = ((offset + i as u64) % 256) as u8;
                }
            }
            ActivePattern::Iot { seed } => iot::fill(buf, offset, seed),
        }

        if self.btag && buf.len() > BTAG_SIZE {
            btag::stamp(buf, &self.tag_info(offset));
        }
    }

    /// Compare a block read back from `offset` against the expected block
    pub fn compare(&self, expected: &[u8], actual: &[u8], offset: u64) -> Option<Mismatch> {
        let mut mismatch = compare_buffers(expected, actual)?;
        if self.btag && actual.len() > BTAG_SIZE {
            mismatch.tag = btag::check(actual, &self.tag_info(offset)).err();
        }
        Some(mismatch)
    }
}
