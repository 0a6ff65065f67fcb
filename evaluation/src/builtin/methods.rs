use ndarray::{Array4, ArrayView4, s};
use ndarray_rand::RandomExt;
use rand::{SeedableRng, rngs::StdRng};
use rand_distr::StandardNormal;

use crate::{ActivationFn, AttributionMethod, EvalErr, Model, Result, model::forward_checked};

/// Attributions drawn from a standard normal, the reference any method should beat.
#[derive(Debug, Clone)]
pub struct RandomAttribution {
    rng: StdRng,
    per_channel: bool,
}

impl RandomAttribution {
    /// # Arguments
    /// * `seed` - Seed of the draws.
    /// * `per_channel` - Whether to draw `[N, C, H, W]` maps instead of `[N, 1, H, W]`.
    pub fn new(seed: u64, per_channel: bool) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            per_channel,
        }
    }

    /// Draws a map of exactly `shape`, used for the random reference runs.
    pub fn draw(&mut self, shape: (usize, usize, usize, usize)) -> Array4<f32> {
        Array4::random_using(shape, StandardNormal, &mut self.rng)
    }
}

impl AttributionMethod for RandomAttribution {
    fn attribute(
        &mut self,
        _model: &dyn Model,
        x: ArrayView4<f32>,
        _labels: &[usize],
    ) -> Result<Array4<f32>> {
        let (n, c, h, w) = x.dim();
        let channels = if self.per_channel { c } else { 1 };
        Ok(self.draw((n, channels, h, w)))
    }
}

/// Attributes to every window the drop in the label score caused by zeroing it.
#[derive(Debug, Clone, Copy)]
pub struct Occlusion {
    window: usize,
}

impl Occlusion {
    pub fn new(window: usize) -> Result<Self> {
        if window == 0 {
            return Err(EvalErr::config("occlusion window must be positive"));
        }

        Ok(Self { window })
    }
}

impl AttributionMethod for Occlusion {
    fn attribute(
        &mut self,
        model: &dyn Model,
        x: ArrayView4<f32>,
        labels: &[usize],
    ) -> Result<Array4<f32>> {
        let (n, _, h, w) = x.dim();
        let original = ActivationFn::Linear.target_scores(forward_checked(model, x)?.view(), labels)?;
        let mut attrs = Array4::zeros((n, 1, h, w));

        for row in (0..h).step_by(self.window) {
            for col in (0..w).step_by(self.window) {
                let rows = row..(row + self.window).min(h);
                let cols = col..(col + self.window).min(w);

                let mut occluded = x.to_owned();
                occluded
                    .slice_mut(s![.., .., rows.clone(), cols.clone()])
                    .fill(0.0);

                let scores = ActivationFn::Linear
                    .target_scores(forward_checked(model, occluded.view())?.view(), labels)?;

                for (i, drop) in (&original - &scores).iter().enumerate() {
                    attrs.slice_mut(s![i, 0, rows.clone(), cols.clone()]).fill(*drop);
                }
            }
        }

        Ok(attrs)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array1, Array2, array};

    use super::*;
    use crate::builtin::LinearClassifier;

    #[test]
    fn occlusion_of_a_linear_model_recovers_weight_times_input() {
        let model = LinearClassifier::new(
            [1, 1, 3],
            Array2::from_shape_vec((1, 3), vec![1.0, -2.0, 0.5]).unwrap(),
            Array1::zeros(1),
        )
        .unwrap();

        let x = array![[[[2.0, 1.0, 4.0]]]];
        let attrs = Occlusion::new(1)
            .unwrap()
            .attribute(&model, x.view(), &[0])
            .unwrap();

        assert_eq!(attrs, array![[[[2.0, -2.0, 2.0]]]]);
    }

    #[test]
    fn random_maps_follow_the_requested_channels() {
        let model = LinearClassifier::random([3, 2, 2], 2, 0).unwrap();
        let x = Array4::<f32>::zeros((4, 3, 2, 2));

        let single = RandomAttribution::new(0, false)
            .attribute(&model, x.view(), &[0; 4])
            .unwrap();
        let full = RandomAttribution::new(0, true)
            .attribute(&model, x.view(), &[0; 4])
            .unwrap();

        assert_eq!(single.dim(), (4, 1, 2, 2));
        assert_eq!(full.dim(), (4, 3, 2, 2));
    }
}
