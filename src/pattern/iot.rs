//! IOT (seed/position-derived) pattern
//!
//! Every logical block carries its own address: word 0 of an LBA is the LBA
//! itself and word `i` is `lba + i * seed`. The data is computed on the fly,
//! never stored flat, so two blocks only compare equal when both the address
//! and the seed match. That makes IOT the one pattern that catches misplaced
//! writes and stale data from another thread or pass.

/// Base seed; scaled by pass (and thread, when unique) to get the pass seed
pub const IOT_SEED: u32 = 0x0101_0101;

/// Logical block size used to number IOT blocks
pub const IOT_LBA_SIZE: u64 = 512;

/// Seed for a pass when patterns are not unique per thread
#[inline]
pub fn pass_seed(pass: u64) -> u32 {
    IOT_SEED.wrapping_mul((pass as u32).wrapping_add(1))
}

/// Seed unique to a (thread, pass) pair
///
/// Uses the splitmix64 finalizer so neighbouring pairs land far apart; the
/// result is forced odd so `i * seed` never collapses to zero for a whole LBA.
pub fn unique_seed(thread: usize, pass: u64) -> u32 {
    let mut z = ((thread as u64) << 32 | (pass & 0xffff_ffff)).wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    (z as u32) | 1
}

/// Value of the 32-bit word at `word` within `lba`
#[inline]
pub fn word_at(lba: u64, word: u64, seed: u32) -> u32 {
    (lba as u32).wrapping_add((word as u32).wrapping_mul(seed))
}

/// Fill `buf` with IOT data as if it lived at device byte `offset`
pub fn fill(buf: &mut [u8], offset: u64, seed: u32) {
    let mut pos = offset;
    let mut i = 0;
    while i < buf.len() {
        let lba = pos / IOT_LBA_SIZE;
        let in_lba = pos % IOT_LBA_SIZE;
        let word = in_lba / 4;
        let bytes = word_at(lba, word, seed).to_le_bytes();
        let start = (in_lba % 4) as usize;
        let take = (4 - start).min(buf.len() - i);
        buf[i..i + take].copy_from_slice(&bytes[start..start + take]);
        i += take;
        pos += take as u64;
    }
}
