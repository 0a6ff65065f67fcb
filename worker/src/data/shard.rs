use std::num::NonZeroUsize;

/// The global indices owned by `rank` when `total` samples are dealt among
/// `world_size` workers: every index `i` with `i mod world_size == rank`.
///
/// Properties:
/// - Shards of all ranks are disjoint and cover `[0..total)`.
/// - Sizes differ by at most 1.
pub fn shard_indices(total: usize, rank: usize, world_size: usize) -> Vec<usize> {
    assert!(world_size > 0);
    assert!(rank < world_size);

    (rank..total).step_by(world_size).collect()
}

/// Shard specification for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSpec {
    pub rank: usize,
    pub world_size: NonZeroUsize,
}

impl ShardSpec {
    pub fn new(rank: usize, world_size: NonZeroUsize) -> Option<Self> {
        (rank < world_size.get()).then_some(Self { rank, world_size })
    }

    #[inline]
    pub fn indices(self, total: usize) -> Vec<usize> {
        shard_indices(total, self.rank, self.world_size.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shards_partition_the_dataset() {
        let mut seen = vec![0; 37];
        for rank in 0..4 {
            let shard = shard_indices(37, rank, 4);
            assert!(shard.len() == 9 || shard.len() == 10);
            for i in shard {
                seen[i] += 1;
            }
        }
        assert!(seen.iter().all(|&count| count == 1));
    }

    #[test]
    fn shard_spec_matches_function() {
        let spec = ShardSpec::new(1, NonZeroUsize::new(3).unwrap()).unwrap();
        assert_eq!(spec.indices(10), vec![1, 4, 7]);
        assert!(ShardSpec::new(3, NonZeroUsize::new(3).unwrap()).is_none());
    }
}
