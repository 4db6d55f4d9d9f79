//! Uniform random distribution
//!
//! All blocks have equal probability. The generator is xoshiro256++ seeded
//! from the pass seed, so resetting to the same seed replays the exact same
//! block sequence; a verify sub-pass relies on that.
//!
//! # Example
//!
//! ```
//! use iovet::distribution::{Distribution, uniform::UniformDistribution};
//!
//! let mut dist = UniformDistribution::with_seed(7);
//! let first: Vec<u64> = (0..4).map(|_| dist.next_block(1024)).collect();
//!
//! dist.reset(7);
//! let again: Vec<u64> = (0..4).map(|_| dist.next_block(1024)).collect();
//! assert_eq!(first, again);
//! ```

use super::Distribution;
use rand::Rng;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

/// Seeded random block order
pub struct UniformDistribution {
    rng: Xoshiro256PlusPlus,
}

impl UniformDistribution {
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
        }
    }
}

impl Distribution for UniformDistribution {
    fn next_block(&mut self, num_blocks: u64) -> u64 {
        if num_blocks == 0 {
            return 0;
        }
        self.rng.gen_range(0..num_blocks)
    }

    fn reset(&mut self, seed: u64) {
        self.rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    }
}
