// bathy_sim/src/simulation/prng.rs

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// The central, deterministic pseudo-random number generator for a run.
pub struct SimulationRng(pub ChaCha8Rng);

impl SimulationRng {
    /// Seeded when a seed is given, otherwise from OS entropy.
    pub fn new(seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => Self(ChaCha8Rng::seed_from_u64(seed)),
            None => Self(ChaCha8Rng::from_entropy()),
        }
    }

    /// An independent generator, so one consumer's draws don't shift another's.
    pub fn fork(&mut self) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.0.next_u64())
    }

    pub fn next_seed(&mut self) -> u64 {
        self.0.next_u64()
    }
}
