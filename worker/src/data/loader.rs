use std::{num::NonZeroUsize, sync::Arc};

use evaluation::{Dataset, gather};
use ndarray::Array4;

use super::shard::ShardSpec;
use crate::Result;

/// One gathered batch of a shard.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Global dataset index of every sample.
    pub indices: Vec<usize>,
    pub samples: Array4<f32>,
    pub labels: Vec<usize>,
}

/// Shard aware loader producing batches in index order.
pub struct ShardLoader {
    dataset: Arc<dyn Dataset>,
    indices: Vec<usize>,
    batch_size: usize,
    cursor: usize,
}

impl ShardLoader {
    pub fn new(dataset: Arc<dyn Dataset>, shard: ShardSpec, batch_size: NonZeroUsize) -> Self {
        let indices = shard.indices(dataset.len());

        Self {
            dataset,
            indices,
            batch_size: batch_size.get(),
            cursor: 0,
        }
    }

    /// The amount of samples in this shard.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Returns the next batch of this shard, or None if exhausted.
    pub fn next_batch(&mut self) -> Option<Result<Batch>> {
        if self.cursor >= self.indices.len() {
            return None;
        }

        let end = (self.cursor + self.batch_size).min(self.indices.len());
        let indices = self.indices[self.cursor..end].to_vec();
        self.cursor = end;

        Some(
            gather(self.dataset.as_ref(), &indices)
                .map(|(samples, labels)| Batch {
                    indices,
                    samples,
                    labels,
                })
                .map_err(Into::into),
        )
    }
}

#[cfg(test)]
mod tests {
    use evaluation::builtin::InMemoryDataset;

    use super::*;

    #[test]
    fn loader_batches_respect_shard_and_batch_size() {
        let dataset = InMemoryDataset::from_flat(
            [1, 1, 1],
            (0..10).map(|i| i as f32).collect(),
            (0..10).map(|i| i % 3).collect(),
        )
        .unwrap();

        let shard = ShardSpec::new(1, NonZeroUsize::new(3).unwrap()).unwrap();
        let mut loader = ShardLoader::new(Arc::new(dataset), shard, NonZeroUsize::new(2).unwrap());
        assert_eq!(loader.len(), 3);

        let first = loader.next_batch().unwrap().unwrap();
        assert_eq!(first.indices, vec![1, 4]);
        assert_eq!(first.labels, vec![1, 1]);
        assert_eq!(first.samples[[1, 0, 0, 0]], 4.0);

        let second = loader.next_batch().unwrap().unwrap();
        assert_eq!(second.indices, vec![7]);

        assert!(loader.next_batch().is_none());
    }
}
