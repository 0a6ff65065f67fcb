use ndarray::{Array3, Array4, Axis};
use ndarray_rand::RandomExt;
use rand::{SeedableRng, rngs::StdRng};
use rand_distr::Uniform;

use crate::{Dataset, EvalErr, Result};

/// A dataset fully held in memory.
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    samples: Array4<f32>,
    labels: Vec<usize>,
}

impl InMemoryDataset {
    /// Creates a new `InMemoryDataset`.
    ///
    /// # Arguments
    /// * `samples` - An `[N, C, H, W]` array.
    /// * `labels` - One label per sample.
    pub fn new(samples: Array4<f32>, labels: Vec<usize>) -> Result<Self> {
        if samples.dim().0 != labels.len() {
            return Err(EvalErr::shape("dataset labels", labels.len(), samples.dim().0));
        }

        Ok(Self { samples, labels })
    }

    /// Builds a dataset from flat row major values.
    pub fn from_flat(shape: [usize; 3], values: Vec<f32>, labels: Vec<usize>) -> Result<Self> {
        let [c, h, w] = shape;
        let samples = Array4::from_shape_vec((labels.len(), c, h, w), values)?;
        Self::new(samples, labels)
    }

    /// Uniform `[0, 1)` images, sample `i` labelled `i mod num_classes`.
    pub fn synthetic(len: usize, shape: [usize; 3], num_classes: usize, seed: u64) -> Result<Self> {
        if num_classes == 0 {
            return Err(EvalErr::config("a synthetic dataset needs at least one class"));
        }

        let [c, h, w] = shape;
        let mut rng = StdRng::seed_from_u64(seed);
        let dist = Uniform::new(0.0f32, 1.0)
            .map_err(|err| EvalErr::config(format!("invalid synthetic range: {err}")))?;
        let samples = Array4::random_using((len, c, h, w), dist, &mut rng);
        let labels = (0..len).map(|i| i % num_classes).collect();

        Self::new(samples, labels)
    }
}

impl Dataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.labels.len()
    }

    fn sample_shape(&self) -> [usize; 3] {
        let (_, c, h, w) = self.samples.dim();
        [c, h, w]
    }

    fn get(&self, index: usize) -> Result<(Array3<f32>, usize)> {
        let label = *self
            .labels
            .get(index)
            .ok_or_else(|| EvalErr::shape("dataset index", index, format!("< {}", self.len())))?;

        Ok((self.samples.index_axis(Axis(0), index).to_owned(), label))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gather;

    #[test]
    fn gather_keeps_the_requested_order() {
        let dataset =
            InMemoryDataset::from_flat([1, 1, 2], (0..8).map(|v| v as f32).collect(), vec![0, 1, 2, 3])
                .unwrap();

        let (batch, labels) = gather(&dataset, &[3, 1]).unwrap();
        assert_eq!(labels, vec![3, 1]);
        assert_eq!(batch[[0, 0, 0, 0]], 6.0);
        assert_eq!(batch[[1, 0, 0, 1]], 3.0);

        assert!(gather(&dataset, &[4]).is_err());
    }

    #[test]
    fn synthetic_is_reproducible() {
        let a = InMemoryDataset::synthetic(5, [2, 3, 3], 4, 42).unwrap();
        let b = InMemoryDataset::synthetic(5, [2, 3, 3], 4, 42).unwrap();
        assert_eq!(a.samples, b.samples);
        assert_eq!(a.labels, b.labels);
        assert_eq!(a.labels, vec![0, 1, 2, 3, 0]);
        assert!(a.samples.iter().all(|v| (0.0..1.0).contains(v)));
    }
}
