//! Sequential addressing
//!
//! Forward walks 0, 1, 2, ...; reverse walks N-1, N-2, .... Either wraps at
//! the end of the range. `reset` rewinds to the first address of the pass.

use crate::config::IoDir;
use crate::distribution::Distribution;

#[derive(Debug)]
pub struct SequentialDistribution {
    /// Blocks handed out since the last reset
    issued: u64,
    dir: IoDir,
}

impl SequentialDistribution {
    pub fn new(dir: IoDir) -> Self {
        Self { issued: 0, dir }
    }
}

impl Default for SequentialDistribution {
    fn default() -> Self {
        Self::new(IoDir::Forward)
    }
}

impl Distribution for SequentialDistribution {
    fn next_block(&mut self, num_blocks: u64) -> u64 {
        if num_blocks == 0 {
            return 0;
        }

        let step = self.issued % num_blocks;
        self.issued += 1;

        match self.dir {
            IoDir::Forward => step,
            IoDir::Reverse => num_blocks - 1 - step,
        }
    }

    fn reset(&mut self, _seed: u64) {
        self.issued = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn take(dist: &mut SequentialDistribution, n: usize, blocks: u64) -> Vec<u64> {
        (0..n).map(|_| dist.next_block(blocks)).collect()
    }

    #[test]
    fn test_forward_wraps() {
        let mut dist = SequentialDistribution::default();
        assert_eq!(take(&mut dist, 5, 3), [0, 1, 2, 0, 1]);
    }

    #[test]
    fn test_reverse_rewinds_to_the_top() {
        let mut dist = SequentialDistribution::new(IoDir::Reverse);
        assert_eq!(take(&mut dist, 2, 4), [3, 2]);
        dist.reset(0);
        assert_eq!(take(&mut dist, 4, 4), [3, 2, 1, 0]);
    }

    #[test]
    fn test_empty_range() {
        let mut dist = SequentialDistribution::default();
        assert_eq!(dist.next_block(0), 0);
        assert_eq!(dist.next_block(8), 0);
    }
}
