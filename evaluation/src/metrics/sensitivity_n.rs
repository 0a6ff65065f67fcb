use std::collections::BTreeMap;

use ndarray::{Array1, Array2, ArrayView4};

use super::{Scores, check_batch};
use crate::{
    ActivationFn, EvalErr, Result,
    masking::Masker,
    model::{Model, forward_checked},
    stats::corrcoef,
};

/// Sensitivity-N: how well summed attributions of random unit subsets track
/// the output drop caused by removing them.
#[derive(Debug, Clone)]
pub struct SensitivityN {
    min_subset_size: f64,
    max_subset_size: f64,
    num_steps: usize,
    num_subsets: usize,
    shared_subsets: bool,
    activation_fns: Vec<ActivationFn>,
}

/// The model dependent half of Sensitivity-N, reusable across attribution methods.
#[derive(Debug, Clone)]
pub struct SensitivityPerturbations {
    sizes: Vec<usize>,
    /// Removed units indexed by step, subset and sample.
    removed: Vec<Vec<Vec<Vec<usize>>>>,
    /// Output drops per activation function, one `[N, subsets]` array per step.
    diffs: BTreeMap<ActivationFn, Vec<Array2<f32>>>,
}

impl SensitivityPerturbations {
    /// The subset size used at every step.
    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }
}

impl SensitivityN {
    /// Creates a new `SensitivityN`.
    ///
    /// # Arguments
    /// * `min_subset_size` - Smallest subset as a fraction of the units, in `(0, 1]`.
    /// * `max_subset_size` - Largest subset as a fraction, at least `min_subset_size`.
    /// * `num_steps` - Amount of subset sizes between both bounds.
    /// * `num_subsets` - Random subsets drawn per size, at least 2.
    /// * `shared_subsets` - Whether every sample of a batch uses the same draws.
    /// * `activation_fns` - The output activations to score.
    pub fn new(
        min_subset_size: f64,
        max_subset_size: f64,
        num_steps: usize,
        num_subsets: usize,
        shared_subsets: bool,
        activation_fns: Vec<ActivationFn>,
    ) -> Result<Self> {
        if !(min_subset_size > 0.0 && min_subset_size <= max_subset_size && max_subset_size <= 1.0)
        {
            return Err(EvalErr::config(format!(
                "subset sizes must satisfy 0 < min <= max <= 1, got {min_subset_size} and {max_subset_size}"
            )));
        }

        if num_steps == 0 {
            return Err(EvalErr::config("sensitivity-n needs at least one step"));
        }

        if num_subsets < 2 {
            return Err(EvalErr::config(format!(
                "sensitivity-n needs at least 2 subsets per step, got {num_subsets}"
            )));
        }

        if activation_fns.is_empty() {
            return Err(EvalErr::config("at least one activation function is required"));
        }

        Ok(Self {
            min_subset_size,
            max_subset_size,
            num_steps,
            num_subsets,
            shared_subsets,
            activation_fns,
        })
    }

    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    pub fn activation_fns(&self) -> &[ActivationFn] {
        &self.activation_fns
    }

    /// Subset sizes for `total` units, clamped to `[1, total]`.
    pub fn subset_sizes(&self, total: usize) -> Vec<usize> {
        let span = self.max_subset_size - self.min_subset_size;
        let last = self.num_steps.saturating_sub(1).max(1) as f64;

        (0..self.num_steps)
            .map(|step| {
                let fraction = self.min_subset_size + span * step as f64 / last;
                ((fraction * total as f64).floor() as usize).clamp(1, total.max(1))
            })
            .collect()
    }

    /// Removes random subsets and records how much each removal lowers the output.
    ///
    /// Subset sizes follow the smallest unit count of the batch. The masker
    /// must be bound to `samples`.
    pub fn perturb(
        &self,
        samples: ArrayView4<f32>,
        labels: &[usize],
        model: &dyn Model,
        masker: &mut Masker,
    ) -> Result<SensitivityPerturbations> {
        let total = masker.min_units()?;
        self.perturb_with_total(samples, labels, model, masker, total)
    }

    /// Like `perturb`, with subset sizes derived from a fixed `total` so they
    /// don't change from one batch to the next.
    ///
    /// # Errors
    /// Fails if a sample of the batch holds fewer than `total` units.
    pub fn perturb_with_total(
        &self,
        samples: ArrayView4<f32>,
        labels: &[usize],
        model: &dyn Model,
        masker: &mut Masker,
        total: usize,
    ) -> Result<SensitivityPerturbations> {
        let n = labels.len();
        if masker.samples()?.dim() != samples.dim() || samples.dim().0 != n {
            return Err(EvalErr::config("the masker is bound to a different batch"));
        }

        if total == 0 {
            return Err(EvalErr::config("there are no units to remove"));
        }

        let available = masker.min_units()?;
        if available < total {
            return Err(EvalErr::config(format!(
                "a sample of the batch holds {available} units, subset sizes assume {total}"
            )));
        }

        let original = forward_checked(model, samples)?;
        let original: BTreeMap<ActivationFn, Array1<f32>> = self
            .activation_fns
            .iter()
            .map(|&afn| Ok((afn, afn.target_scores(original.view(), labels)?)))
            .collect::<Result<_>>()?;

        let sizes = self.subset_sizes(total);
        let mut removed = Vec::with_capacity(sizes.len());
        let mut diffs: BTreeMap<ActivationFn, Vec<Array2<f32>>> = self
            .activation_fns
            .iter()
            .map(|&afn| (afn, Vec::with_capacity(sizes.len())))
            .collect();

        for &size in &sizes {
            let mut step_removed = Vec::with_capacity(self.num_subsets);
            let mut step_diffs: BTreeMap<ActivationFn, Array2<f32>> = self
                .activation_fns
                .iter()
                .map(|&afn| (afn, Array2::zeros((n, self.num_subsets))))
                .collect();

            for subset in 0..self.num_subsets {
                let (masked, units) = if self.shared_subsets {
                    let (masked, units) = masker.mask_rand_shared(size)?;
                    (masked, vec![units; n])
                } else {
                    masker.mask_rand(size)?
                };

                let logits = forward_checked(model, masked.view())?;
                for (afn, diff) in step_diffs.iter_mut() {
                    let scores = afn.target_scores(logits.view(), labels)?;
                    diff.column_mut(subset).assign(&(&original[afn] - &scores));
                }

                step_removed.push(units);
            }

            for (afn, diff) in step_diffs {
                if let Some(per_step) = diffs.get_mut(&afn) {
                    per_step.push(diff);
                }
            }
            removed.push(step_removed);
        }

        Ok(SensitivityPerturbations {
            sizes,
            removed,
            diffs,
        })
    }

    /// Correlates the attributions of the removed subsets with the recorded drops.
    ///
    /// # Returns
    /// One `[N, steps]` array per activation function.
    pub fn score(
        &self,
        perturbations: &SensitivityPerturbations,
        masker: &Masker,
        attrs: ArrayView4<f32>,
    ) -> Result<Scores> {
        let importance = masker.unit_importance(attrs)?;
        let n = importance.nrows();
        let steps = perturbations.sizes.len();

        let mut scores: Scores = perturbations
            .diffs
            .keys()
            .map(|&afn| (afn, Array2::zeros((n, steps))))
            .collect();

        for (step, subsets) in perturbations.removed.iter().enumerate() {
            let mut summed = Array2::<f32>::zeros((n, subsets.len()));
            for (subset, per_sample) in subsets.iter().enumerate() {
                if per_sample.len() != n {
                    return Err(EvalErr::shape("perturbed samples", per_sample.len(), n));
                }

                for (i, units) in per_sample.iter().enumerate() {
                    summed[[i, subset]] = units.iter().map(|&unit| importance[[i, unit]]).sum();
                }
            }

            for (afn, out) in scores.iter_mut() {
                let corr = corrcoef(summed.view(), perturbations.diffs[afn][step].view())?;
                out.column_mut(step).assign(&corr);
            }
        }

        Ok(scores)
    }

    /// Perturbs and scores a single attribution.
    pub fn run(
        &self,
        samples: ArrayView4<f32>,
        labels: &[usize],
        model: &dyn Model,
        attrs: ArrayView4<f32>,
        masker: &mut Masker,
    ) -> Result<Scores> {
        check_batch(samples, labels, attrs)?;
        let perturbations = self.perturb(samples, labels, model, masker)?;
        self.score(&perturbations, masker, attrs)
    }
}
