use log::warn;
use ndarray::{Array1, Array2, Array4, ArrayView4};
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand_distr::Uniform;

use super::check_batch;
use crate::{
    EvalErr, Result,
    model::{AttributionMethod, Model},
};

/// Max-Sensitivity: the largest relative change of an attribution when the
/// input is perturbed with uniform noise of a given radius.
#[derive(Debug, Clone, PartialEq)]
pub struct MaxSensitivity {
    radii: Vec<f32>,
    num_perturbations: usize,
}

impl MaxSensitivity {
    /// Creates a new `MaxSensitivity`.
    ///
    /// # Arguments
    /// * `radii` - Noise radii, each value is drawn from `[-radius, radius]`.
    /// * `num_perturbations` - Noisy copies drawn per radius.
    pub fn new(radii: Vec<f32>, num_perturbations: usize) -> Result<Self> {
        if radii.is_empty() {
            return Err(EvalErr::config("max-sensitivity needs at least one radius"));
        }

        if let Some(radius) = radii.iter().find(|&&r| !(r > 0.0 && r.is_finite())) {
            return Err(EvalErr::config(format!("radii must be positive, got {radius}")));
        }

        if num_perturbations == 0 {
            return Err(EvalErr::config("max-sensitivity needs at least one perturbation"));
        }

        Ok(Self {
            radii,
            num_perturbations,
        })
    }

    pub fn radii(&self) -> &[f32] {
        &self.radii
    }

    /// Explains noisy copies of `samples` again and compares them with `attrs`.
    ///
    /// # Arguments
    /// * `method` - The method that produced `attrs`.
    /// * `attrs` - Attributions of the unperturbed batch.
    /// * `rng` - Source of the noise.
    ///
    /// # Returns
    /// An `[N, radii]` array of `max ||noisy - attrs|| / ||attrs||`.
    pub fn run(
        &self,
        samples: ArrayView4<f32>,
        labels: &[usize],
        model: &dyn Model,
        method: &mut dyn AttributionMethod,
        attrs: ArrayView4<f32>,
        rng: &mut StdRng,
    ) -> Result<Array2<f32>> {
        check_batch(samples, labels, attrs)?;

        let norms = l2_norms(attrs);
        let mut out = Array2::<f32>::zeros((labels.len(), self.radii.len()));

        for (r, &radius) in self.radii.iter().enumerate() {
            let dist = Uniform::new_inclusive(-radius, radius)
                .map_err(|err| EvalErr::config(format!("invalid radius {radius}: {err}")))?;

            for _ in 0..self.num_perturbations {
                let noisy = &samples + &Array4::random_using(samples.raw_dim(), &dist, rng);
                let noisy_attrs = method.attribute(model, noisy.view(), labels)?;
                if noisy_attrs.dim() != attrs.dim() {
                    return Err(EvalErr::shape("noisy attributions", noisy_attrs.dim(), attrs.dim()));
                }

                let diffs = l2_norms((&noisy_attrs - &attrs).view());
                for (i, mut row) in out.rows_mut().into_iter().enumerate() {
                    if norms[i] > 0.0 {
                        row[r] = row[r].max(diffs[i] / norms[i]);
                    }
                }
            }
        }

        let zero = norms.iter().filter(|&&norm| norm == 0.0).count();
        if zero > 0 {
            warn!(samples = zero; "all zero attributions, max-sensitivity set to 0");
        }

        Ok(out)
    }
}

fn l2_norms(x: ArrayView4<f32>) -> Array1<f32> {
    x.outer_iter()
        .map(|sample| sample.mapv(|v| v * v).sum().sqrt())
        .collect()
}
