//! Address sequencing
//!
//! A worker visits its range of the device one block at a time. The order is
//! produced by a [`Distribution`] (sequential forward/reverse or uniform
//! random) and wrapped by [`AddressSequence`], which turns block numbers into
//! byte offsets inside the worker's slice and stops after the record limit.
//!
//! # Block-Based Design
//!
//! Distributions generate block numbers (0, 1, 2, ..., N-1) rather than byte
//! offsets, so offsets stay naturally aligned to the block size, which O_DIRECT
//! requires: `offset = base + block_num * block_size`.
//!
//! # Replay
//!
//! A verify sub-pass must read the same addresses, in the same order, as the
//! write sub-pass before it. [`AddressSequence::rewind`] resets the generator
//! to the pass seed it was started with; reading in any other order would
//! report corruption that is not there.
//!
//! # Example
//!
//! ```
//! use iovet::config::{IoDir, IoType};
//! use iovet::distribution::{AddressSequence, SliceRange};
//!
//! let range = SliceRange { base: 0, blocks: 64 };
//! let mut seq = AddressSequence::new(range, 4096, 8, IoType::Random, IoDir::Forward);
//! seq.start_pass(99, IoType::Random, IoDir::Forward);
//!
//! let written: Vec<u64> = seq.by_ref().map(|a| a.offset).collect();
//! seq.rewind();
//! let verified: Vec<u64> = seq.map(|a| a.offset).collect();
//! assert_eq!(written, verified);
//! ```

pub mod sequential;
pub mod uniform;

use crate::config::{IoDir, IoType};
use sequential::SequentialDistribution;
use uniform::UniformDistribution;

/// Distribution trait for block number generation
///
/// Each worker owns its own instance; distributions are never shared.
pub trait Distribution: Send {
    /// Next block number in `[0, num_blocks)`
    fn next_block(&mut self, num_blocks: u64) -> u64;

    /// Restart the sequence; seeded distributions replay from `seed`
    fn reset(&mut self, seed: u64);
}

/// Portion of a device assigned to one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceRange {
    /// Byte offset of the first block
    pub base: u64,
    /// Number of blocks in the range
    pub blocks: u64,
}

impl SliceRange {
    /// Split `capacity` bytes into `count` disjoint block-aligned slices
    ///
    /// The last slice absorbs the remainder blocks.
    pub fn split(capacity: u64, block_size: u64, count: usize) -> Vec<SliceRange> {
        let total = capacity / block_size;
        let count = count.max(1) as u64;
        let per = total / count;
        (0..count)
            .map(|i| {
                let first = i * per;
                let blocks = if i == count - 1 { total - first } else { per };
                SliceRange {
                    base: first * block_size,
                    blocks,
                }
            })
            .collect()
    }

    pub fn bytes(&self, block_size: u64) -> u64 {
        self.blocks * block_size
    }
}

/// One address handed to a loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    /// Record number within the pass, starting at 0
    pub record: u64,
    /// Absolute byte offset on the device
    pub offset: u64,
}

/// Per-pass address generator for one worker
pub struct AddressSequence {
    range: SliceRange,
    block_size: u64,
    records: u64,
    limit: u64,
    io_type: IoType,
    io_dir: IoDir,
    seed: u64,
    issued: u64,
    dist: Box<dyn Distribution>,
}

impl std::fmt::Debug for AddressSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressSequence")
            .field("range", &self.range)
            .field("records", &self.limit)
            .field("io_type", &self.io_type)
            .field("io_dir", &self.io_dir)
            .field("seed", &self.seed)
            .field("issued", &self.issued)
            .finish()
    }
}

fn make_distribution(io_type: IoType, io_dir: IoDir, seed: u64) -> Box<dyn Distribution> {
    match io_type {
        IoType::Sequential => Box::new(SequentialDistribution::new(io_dir)),
        IoType::Random => Box::new(UniformDistribution::with_seed(seed)),
    }
}

impl AddressSequence {
    /// `records` is the per-pass record limit; sequential passes never exceed
    /// the range
    pub fn new(range: SliceRange, block_size: u64, records: u64, io_type: IoType, io_dir: IoDir) -> Self {
        let mut seq = Self {
            range,
            block_size,
            records,
            limit: 0,
            io_type,
            io_dir,
            seed: 0,
            issued: 0,
            dist: make_distribution(io_type, io_dir, 0),
        };
        seq.limit = seq.effective_limit();
        seq
    }

    fn effective_limit(&self) -> u64 {
        match self.io_type {
            IoType::Sequential => self.records.min(self.range.blocks),
            IoType::Random => self.records,
        }
    }

    /// Begin a pass with a fresh seed and (possibly re-rolled) order
    pub fn start_pass(&mut self, seed: u64, io_type: IoType, io_dir: IoDir) {
        if io_type != self.io_type || io_dir != self.io_dir {
            self.io_type = io_type;
            self.io_dir = io_dir;
            self.dist = make_distribution(io_type, io_dir, seed);
        }
        self.seed = seed;
        self.limit = self.effective_limit();
        self.rewind();
    }

    /// Reset to the start of the current pass, replaying the same addresses
    pub fn rewind(&mut self) {
        self.dist.reset(self.seed);
        self.issued = 0;
    }

    /// End the pass after `records` records; later rewinds replay only
    /// those. Used when the device runs out of space mid-pass.
    pub fn truncate_to(&mut self, records: u64) {
        self.limit = self.limit.min(records);
    }

    pub fn next_address(&mut self) -> Option<Address> {
        if self.issued >= self.limit || self.range.blocks == 0 {
            return None;
        }
        let block = self.dist.next_block(self.range.blocks);
        let record = self.issued;
        self.issued += 1;
        Some(Address {
            record,
            offset: self.range.base + block * self.block_size,
        })
    }

    pub fn records_per_pass(&self) -> u64 {
        self.limit
    }

    pub fn issued(&self) -> u64 {
        self.issued
    }

    pub fn io_type(&self) -> IoType {
        self.io_type
    }

    pub fn io_dir(&self) -> IoDir {
        self.io_dir
    }

    pub fn range(&self) -> SliceRange {
        self.range
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl Iterator for AddressSequence {
    type Item = Address;

    fn next(&mut self) -> Option<Address> {
        self.next_address()
    }
}

/// Seed for one (thread, pass), derived from the run's base seed
pub fn pass_seed(base: u64, thread: usize, pass: u64) -> u64 {
    let mut z = base
        ^ (thread as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ pass.wrapping_mul(0xD1B5_4A32_D192_ED03);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_is_disjoint_and_complete() {
        let slices = SliceRange::split(10 * 512 + 100, 512, 3);
        assert_eq!(slices.len(), 3);
        assert_eq!(slices[0], SliceRange { base: 0, blocks: 3 });
        assert_eq!(slices[1], SliceRange { base: 3 * 512, blocks: 3 });
        assert_eq!(slices[2], SliceRange { base: 6 * 512, blocks: 4 });
    }

    #[test]
    fn test_sequential_stops_at_range_end() {
        let range = SliceRange { base: 4096, blocks: 4 };
        let mut seq = AddressSequence::new(range, 512, 100, IoType::Sequential, IoDir::Forward);
        seq.start_pass(1, IoType::Sequential, IoDir::Forward);
        let offsets: Vec<u64> = seq.by_ref().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![4096, 4608, 5120, 5632]);
        assert_eq!(seq.records_per_pass(), 4);
    }

    #[test]
    fn test_reverse_order() {
        let range = SliceRange { base: 0, blocks: 3 };
        let mut seq = AddressSequence::new(range, 512, 3, IoType::Sequential, IoDir::Reverse);
        seq.start_pass(1, IoType::Sequential, IoDir::Reverse);
        let offsets: Vec<u64> = seq.map(|a| a.offset).collect();
        assert_eq!(offsets, vec![1024, 512, 0]);
    }

    #[test]
    fn test_random_replays_after_rewind() {
        let range = SliceRange { base: 0, blocks: 1000 };
        let mut seq = AddressSequence::new(range, 512, 50, IoType::Random, IoDir::Forward);
        seq.start_pass(1234, IoType::Random, IoDir::Forward);
        let first: Vec<Address> = seq.by_ref().collect();
        seq.rewind();
        let second: Vec<Address> = seq.by_ref().collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 50);
    }

    #[test]
    fn test_new_pass_seed_changes_order() {
        let range = SliceRange { base: 0, blocks: 1 << 20 };
        let mut seq = AddressSequence::new(range, 512, 8, IoType::Random, IoDir::Forward);
        seq.start_pass(pass_seed(7, 0, 0), IoType::Random, IoDir::Forward);
        let a: Vec<Address> = seq.by_ref().collect();
        seq.start_pass(pass_seed(7, 0, 1), IoType::Random, IoDir::Forward);
        let b: Vec<Address> = seq.by_ref().collect();
        assert_ne!(a, b);
    }

    #[test]
    fn test_truncate_limits_replay() {
        let range = SliceRange { base: 0, blocks: 10 };
        let mut seq = AddressSequence::new(range, 512, 10, IoType::Sequential, IoDir::Forward);
        seq.start_pass(0, IoType::Sequential, IoDir::Forward);
        seq.next_address();
        seq.next_address();
        seq.next_address();
        seq.truncate_to(2);
        seq.rewind();
        assert_eq!(seq.count(), 2);
    }

    #[test]
    fn test_switching_order_mid_run() {
        let range = SliceRange { base: 0, blocks: 4 };
        let mut seq = AddressSequence::new(range, 512, 4, IoType::Sequential, IoDir::Forward);
        seq.start_pass(0, IoType::Sequential, IoDir::Reverse);
        assert_eq!(seq.next_address().map(|a| a.offset), Some(1536));
        assert_eq!(seq.io_dir(), IoDir::Reverse);
    }
}
