use std::collections::BTreeMap;

use ndarray::{Array1, Array2, Array4, ArrayView4, Axis, s};
use ndarray_rand::RandomExt;
use rand::{Rng, rngs::StdRng};
use rand_distr::Normal;

use super::check_batch;
use crate::{
    ActivationFn, EvalErr, Result,
    model::{Model, forward_checked},
};

/// Draws the perturbation `I` subtracted from a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum PerturbationGenerator {
    /// Independent gaussian noise on every value.
    Gaussian { std: f32 },
    /// A random `size x size` square of the sample itself, so that `x - I`
    /// zeroes the square.
    Square { size: usize },
}

impl PerturbationGenerator {
    /// Draws one `[N, C, H, W]` perturbation for `samples`.
    pub fn generate(&self, samples: ArrayView4<f32>, rng: &mut StdRng) -> Result<Array4<f32>> {
        let (_, _, h, w) = samples.dim();

        match *self {
            PerturbationGenerator::Gaussian { std } => {
                if !(std > 0.0) {
                    return Err(EvalErr::config(format!("gaussian std must be positive, got {std}")));
                }

                let dist = Normal::new(0.0, std)
                    .map_err(|err| EvalErr::config(format!("invalid gaussian std {std}: {err}")))?;
                Ok(Array4::random_using(samples.raw_dim(), dist, rng))
            }
            PerturbationGenerator::Square { size } => {
                if size == 0 || size > h || size > w {
                    return Err(EvalErr::config(format!(
                        "square of size {size} does not fit {h}x{w} images"
                    )));
                }

                let mut out = Array4::zeros(samples.raw_dim());
                for (mut out, sample) in out.outer_iter_mut().zip(samples.outer_iter()) {
                    let row = rng.random_range(0..=h - size);
                    let col = rng.random_range(0..=w - size);
                    let square = s![.., row..row + size, col..col + size];
                    out.slice_mut(square).assign(&sample.slice(square));
                }
                Ok(out)
            }
        }
    }
}

/// Infidelity: the expected squared gap between `I . attrs` and the output drop
/// caused by subtracting `I`.
#[derive(Debug, Clone)]
pub struct Infidelity {
    num_perturbations: usize,
    activation_fns: Vec<ActivationFn>,
}

/// The model dependent half of infidelity, reusable across attribution methods.
#[derive(Debug, Clone)]
pub struct InfidelityPerturbations {
    vectors: Vec<Array4<f32>>,
    /// Output drops per activation function, `[N, perturbations]`.
    diffs: BTreeMap<ActivationFn, Array2<f32>>,
}

impl Infidelity {
    pub fn new(num_perturbations: usize, activation_fns: Vec<ActivationFn>) -> Result<Self> {
        if num_perturbations == 0 {
            return Err(EvalErr::config("infidelity needs at least one perturbation"));
        }

        if activation_fns.is_empty() {
            return Err(EvalErr::config("at least one activation function is required"));
        }

        Ok(Self {
            num_perturbations,
            activation_fns,
        })
    }

    pub fn activation_fns(&self) -> &[ActivationFn] {
        &self.activation_fns
    }

    /// Draws the perturbations and records the output drop each one causes.
    pub fn perturb(
        &self,
        samples: ArrayView4<f32>,
        labels: &[usize],
        model: &dyn Model,
        generator: &PerturbationGenerator,
        rng: &mut StdRng,
    ) -> Result<InfidelityPerturbations> {
        let n = samples.dim().0;
        if labels.len() != n {
            return Err(EvalErr::shape("labels", labels.len(), n));
        }

        let original = forward_checked(model, samples)?;
        let mut vectors = Vec::with_capacity(self.num_perturbations);
        let mut diffs: BTreeMap<ActivationFn, Array2<f32>> = self
            .activation_fns
            .iter()
            .map(|&afn| (afn, Array2::zeros((n, self.num_perturbations))))
            .collect();

        for j in 0..self.num_perturbations {
            let perturbation = generator.generate(samples, rng)?;
            let perturbed = &samples - &perturbation;
            let logits = forward_checked(model, perturbed.view())?;

            for (afn, diff) in diffs.iter_mut() {
                let before = afn.target_scores(original.view(), labels)?;
                let after = afn.target_scores(logits.view(), labels)?;
                diff.column_mut(j).assign(&(before - after));
            }

            vectors.push(perturbation);
        }

        Ok(InfidelityPerturbations { vectors, diffs })
    }

    /// Scores an attribution against recorded perturbations.
    ///
    /// # Returns
    /// The `[N]` mean squared error per activation function.
    pub fn score(
        &self,
        perturbations: &InfidelityPerturbations,
        attrs: ArrayView4<f32>,
    ) -> Result<BTreeMap<ActivationFn, Array1<f32>>> {
        let n = attrs.dim().0;
        let mut dots = Array2::<f32>::zeros((n, perturbations.vectors.len()));

        for (j, perturbation) in perturbations.vectors.iter().enumerate() {
            let (pn, pc, ph, pw) = perturbation.dim();
            let (_, ac, ah, aw) = attrs.dim();
            if pn != n || ph != ah || pw != aw || (ac != pc && ac != 1) {
                return Err(EvalErr::shape("attributions", attrs.dim(), perturbation.dim()));
            }

            for (i, (p, a)) in perturbation.outer_iter().zip(attrs.outer_iter()).enumerate() {
                dots[[i, j]] = if ac == 1 {
                    (&p.sum_axis(Axis(0)) * &a.index_axis(Axis(0), 0)).sum()
                } else {
                    (&p * &a).sum()
                };
            }
        }

        Ok(perturbations
            .diffs
            .iter()
            .map(|(&afn, diff)| {
                let err = (&dots - diff).mapv(|v| v * v);
                let mse = err
                    .mean_axis(Axis(1))
                    .unwrap_or_else(|| Array1::zeros(n));
                (afn, mse)
            })
            .collect())
    }

    /// Perturbs and scores a single attribution.
    pub fn run(
        &self,
        samples: ArrayView4<f32>,
        labels: &[usize],
        model: &dyn Model,
        attrs: ArrayView4<f32>,
        generator: &PerturbationGenerator,
        rng: &mut StdRng,
    ) -> Result<BTreeMap<ActivationFn, Array1<f32>>> {
        check_batch(samples, labels, attrs)?;
        let perturbations = self.perturb(samples, labels, model, generator, rng)?;
        self.score(&perturbations, attrs)
    }
}
