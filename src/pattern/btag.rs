//! Block tags
//!
//! A block tag is a small header stamped at the front of every written
//! block. It records where the block was meant to land and who wrote it, plus
//! a CRC-32 of the rest of the block. On a compare failure the tag tells a
//! misplaced write (wrong LBA/offset) apart from stale data (wrong pass or
//! thread) and from payload corruption (CRC).

use std::fmt;

/// Tag size in bytes; blocks must be larger than this to carry a tag
pub const BTAG_SIZE: usize = 40;

const BTAG_MAGIC: u32 = 0x4254_4147; // "BTAG"
const BTAG_VERSION: u32 = 1;

/// Identity of one written block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagInfo {
    pub lba: u64,
    pub offset: u64,
    pub thread: u32,
    pub pass: u32,
    /// Pattern word or IOT seed in effect when written
    pub pattern: u32,
}

/// First tag field that disagreed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagMismatch {
    Magic { found: u32 },
    Lba { expected: u64, found: u64 },
    Offset { expected: u64, found: u64 },
    Thread { expected: u32, found: u32 },
    Pass { expected: u32, found: u32 },
    Pattern { expected: u32, found: u32 },
    Crc { expected: u32, found: u32 },
}

impl fmt::Display for TagMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagMismatch::Magic { found } => {
                write!(f, "no block tag (magic 0x{:08x}), block never written or overwritten", found)
            }
            TagMismatch::Lba { expected, found } => {
                write!(f, "misplaced write: tag lba {} where lba {} expected", found, expected)
            }
            TagMismatch::Offset { expected, found } => {
                write!(f, "misplaced write: tag offset {} where offset {} expected", found, expected)
            }
            TagMismatch::Thread { expected, found } => {
                write!(f, "block owned by thread {} where thread {} expected", found, expected)
            }
            TagMismatch::Pass { expected, found } => {
                write!(f, "stale data from pass {} where pass {} expected", found, expected)
            }
            TagMismatch::Pattern { expected, found } => {
                write!(f, "pattern 0x{:08x} where 0x{:08x} expected", found, expected)
            }
            TagMismatch::Crc { expected, found } => {
                write!(f, "payload crc 0x{:08x} where 0x{:08x} expected", found, expected)
            }
        }
    }
}

fn get_u32(buf: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(b)
}

fn get_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

/// Stamp a tag over the first [`BTAG_SIZE`] bytes of `block`
///
/// The payload (everything after the tag) must already hold its final data.
pub fn stamp(block: &mut [u8], info: &TagInfo) {
    debug_assert!(block.len() > BTAG_SIZE);
    let crc = crc32fast::hash(&block[BTAG_SIZE..]);
    block[0..4].copy_from_slice(&BTAG_MAGIC.to_le_bytes());
    block[4..8].copy_from_slice(&BTAG_VERSION.to_le_bytes());
    block[8..16].copy_from_slice(&info.lba.to_le_bytes());
    block[16..24].copy_from_slice(&info.offset.to_le_bytes());
    block[24..28].copy_from_slice(&info.thread.to_le_bytes());
    block[28..32].copy_from_slice(&info.pass.to_le_bytes());
    block[32..36].copy_from_slice(&info.pattern.to_le_bytes());
    block[36..40].copy_from_slice(&crc.to_le_bytes());
}

/// Check the tag in `block` against what should have been written there
pub fn check(block: &[u8], expected: &TagInfo) -> Result<(), TagMismatch> {
    let magic = get_u32(block, 0);
    if magic != BTAG_MAGIC {
        return Err(TagMismatch::Magic { found: magic });
    }
    let lba = get_u64(block, 8);
    if lba != expected.lba {
        return Err(TagMismatch::Lba { expected: expected.lba, found: lba });
    }
    let offset = get_u64(block, 16);
    if offset != expected.offset {
        return Err(TagMismatch::Offset { expected: expected.offset, found: offset });
    }
    let thread = get_u32(block, 24);
    if thread != expected.thread {
        return Err(TagMismatch::Thread { expected: expected.thread, found: thread });
    }
    let pass = get_u32(block, 28);
    if pass != expected.pass {
        return Err(TagMismatch::Pass { expected: expected.pass, found: pass });
    }
    let pattern = get_u32(block, 32);
    if pattern != expected.pattern {
        return Err(TagMismatch::Pattern { expected: expected.pattern, found: pattern });
    }
    let stored = get_u32(block, 36);
    let actual = crc32fast::hash(&block[BTAG_SIZE..]);
    if stored != actual {
        return Err(TagMismatch::Crc { expected: stored, found: actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> TagInfo {
        TagInfo { lba: 16, offset: 8192, thread: 2, pass: 3, pattern: 0x39c3_9c39 }
    }

    #[test]
    fn test_stamp_then_check() {
        let mut block = vec![0x5au8; 512];
        stamp(&mut block, &info());
        assert_eq!(check(&block, &info()), Ok(()));
    }

    #[test]
    fn test_misplaced_write_reported_as_lba() {
        let mut block = vec![0u8; 512];
        stamp(&mut block, &info());
        let mut other = info();
        other.lba = 17;
        assert_eq!(check(&block, &other), Err(TagMismatch::Lba { expected: 17, found: 16 }));
    }

    #[test]
    fn test_stale_pass_detected() {
        let mut block = vec![0u8; 512];
        stamp(&mut block, &info());
        let mut later = info();
        later.pass = 4;
        assert!(matches!(check(&block, &later), Err(TagMismatch::Pass { .. })));
    }

    #[test]
    fn test_payload_corruption_detected_by_crc() {
        let mut block = vec![0u8; 512];
        stamp(&mut block, &info());
        block[300] ^= 0x01;
        assert!(matches!(check(&block, &info()), Err(TagMismatch::Crc { .. })));
    }

    #[test]
    fn test_unwritten_block() {
        let block = vec![0u8; 512];
        assert_eq!(check(&block, &info()), Err(TagMismatch::Magic { found: 0 }));
    }
}
