//! Attribution quality metrics.
//!
//! Every metric takes a batch, the labels it is explained for, the model and
//! the attributions, and returns `[N, ...]` arrays with one row per sample.

mod deletion_until_flip;
mod impact_coverage;
mod impact_score;
mod infidelity;
mod insertion_deletion;
mod irof;
mod max_sensitivity;
mod sensitivity_n;

use std::collections::BTreeMap;

use ndarray::{Array2, ArrayView4};

pub use deletion_until_flip::DeletionUntilFlip;
pub use impact_coverage::{Patch, apply_patches, coverage_iou, flipped, select_patch};
pub use impact_score::ImpactScore;
pub use infidelity::{Infidelity, InfidelityPerturbations, PerturbationGenerator};
pub use insertion_deletion::{
    Aggregation, CurveKind, InsertionDeletion, Mode, aoc, auc, higher_is_better,
};
pub use irof::Irof;
pub use max_sensitivity::MaxSensitivity;
pub use sensitivity_n::{SensitivityN, SensitivityPerturbations};

use crate::{ActivationFn, EvalErr, Result};

/// Per activation function scores, each `[N, steps]`.
pub type Scores = BTreeMap<ActivationFn, Array2<f32>>;

/// Checks that a batch, its labels and its attributions agree.
pub(crate) fn check_batch(
    samples: ArrayView4<f32>,
    labels: &[usize],
    attrs: ArrayView4<f32>,
) -> Result<()> {
    let (n, c, h, w) = samples.dim();
    if labels.len() != n {
        return Err(EvalErr::shape("labels", labels.len(), n));
    }

    let (an, ac, ah, aw) = attrs.dim();
    if an != n || ah != h || aw != w || (ac != c && ac != 1) {
        return Err(EvalErr::shape("attributions", attrs.dim(), (n, c, h, w)));
    }

    Ok(())
}
