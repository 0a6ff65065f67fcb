use ndarray::{Array2, Array4, ArrayView2, ArrayView4};
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand_distr::Uniform;

use crate::{EvalErr, Result};

/// How the baseline a masker blends in is derived from the samples.
#[derive(Debug, Clone, PartialEq)]
pub enum Baseline {
    Constant(f32),
    /// Every channel filled with its own spatial mean.
    ChannelMean,
    /// A box blur of the sample, edges clamped.
    Blur { radius: usize },
    Uniform { low: f32, high: f32 },
}

impl Baseline {
    /// Computes the `[N, C, H, W]` baseline for `samples`.
    pub fn compute(&self, samples: ArrayView4<f32>, rng: &mut StdRng) -> Result<Array4<f32>> {
        let dim = samples.raw_dim();

        match *self {
            Baseline::Constant(value) => Ok(Array4::from_elem(dim, value)),
            Baseline::ChannelMean => {
                let mut out = Array4::zeros(dim);
                for (mut out, sample) in out.outer_iter_mut().zip(samples.outer_iter()) {
                    for (mut plane, src) in out.outer_iter_mut().zip(sample.outer_iter()) {
                        plane.fill(src.mean().unwrap_or_default());
                    }
                }
                Ok(out)
            }
            Baseline::Blur { radius } => {
                let mut out = Array4::zeros(dim);
                for (mut out, sample) in out.outer_iter_mut().zip(samples.outer_iter()) {
                    for (mut plane, src) in out.outer_iter_mut().zip(sample.outer_iter()) {
                        plane.assign(&box_blur(src, radius));
                    }
                }
                Ok(out)
            }
            Baseline::Uniform { low, high } => {
                let dist = Uniform::new(low, high).map_err(|err| {
                    EvalErr::config(format!("invalid uniform baseline [{low}, {high}): {err}"))
                })?;
                Ok(Array4::random_using(dim, dist, rng))
            }
        }
    }
}

/// Separable box blur over a single plane.
fn box_blur(plane: ArrayView2<f32>, radius: usize) -> Array2<f32> {
    let horizontal = blur_rows(plane, radius);
    blur_rows(horizontal.t(), radius).reversed_axes()
}

fn blur_rows(plane: ArrayView2<f32>, radius: usize) -> Array2<f32> {
    let (h, w) = plane.dim();
    let window = (2 * radius + 1) as f32;

    Array2::from_shape_fn((h, w), |(r, c)| {
        (0..=2 * radius)
            .map(|offset| {
                let col = (c + offset).saturating_sub(radius).min(w - 1);
                plane[[r, col]]
            })
            .sum::<f32>()
            / window
    })
}

#[cfg(test)]
mod tests {
    use ndarray::{Axis, array};
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn channel_mean_fills_each_plane() {
        let samples = array![[[[1.0, 3.0], [5.0, 7.0]], [[0.0, 0.0], [0.0, 2.0]]]];
        let mut rng = StdRng::seed_from_u64(0);
        let base = Baseline::ChannelMean.compute(samples.view(), &mut rng).unwrap();

        assert!(base.index_axis(Axis(1), 0).iter().all(|&v| v == 4.0));
        assert!(base.index_axis(Axis(1), 1).iter().all(|&v| v == 0.5));
    }

    #[test]
    fn blur_of_a_constant_image_is_the_same_image() {
        let samples = Array4::from_elem((1, 2, 3, 5), 2.5f32);
        let mut rng = StdRng::seed_from_u64(0);
        let base = Baseline::Blur { radius: 2 }
            .compute(samples.view(), &mut rng)
            .unwrap();

        assert!(base.iter().all(|&v| (v - 2.5).abs() < 1e-6));
    }

    #[test]
    fn uniform_stays_in_range() {
        let samples = Array4::<f32>::zeros((2, 1, 4, 4));
        let mut rng = StdRng::seed_from_u64(3);
        let base = Baseline::Uniform {
            low: -1.0,
            high: 1.0,
        }
        .compute(samples.view(), &mut rng)
        .unwrap();

        assert!(base.iter().all(|&v| (-1.0..1.0).contains(&v)));
    }
}
