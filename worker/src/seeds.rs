use rand::{Rng, SeedableRng, rngs::StdRng};

/// The independent random streams a worker draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Method = 1,
    Masker = 2,
    Perturbation = 3,
    Reference = 4,
}

/// Derives one seed per `(rank, stream, index)` from a single run seed.
///
/// Every coordinate is written into its own word of the 32 byte rng key, so
/// two different coordinates never share a key, whatever the values are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Seeds {
    run: u64,
    rank: u64,
}

impl Seeds {
    pub fn new(run: u64, rank: usize) -> Self {
        Self {
            run,
            rank: rank as u64,
        }
    }

    /// A generator for the `index`th consumer of `stream`.
    pub fn rng(&self, stream: Stream, index: usize) -> StdRng {
        let words = [self.run, self.rank, stream as u64, index as u64];

        let mut key = [0u8; 32];
        for (chunk, word) in key.chunks_exact_mut(8).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }

        StdRng::from_seed(key)
    }

    /// A plain `u64` seed for consumers that seed themselves.
    pub fn seed(&self, stream: Stream, index: usize) -> u64 {
        self.rng(stream, index).random()
    }
}
