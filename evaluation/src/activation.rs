use std::{fmt, str::FromStr};

use ndarray::{Array1, Array2, ArrayView2, Axis};

use crate::{EvalErr, Result};

/// Function applied to raw model outputs before scores are read off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ActivationFn {
    Linear,
    Softmax,
    Sigmoid,
}

impl ActivationFn {
    pub fn name(&self) -> &'static str {
        match self {
            ActivationFn::Linear => "linear",
            ActivationFn::Softmax => "softmax",
            ActivationFn::Sigmoid => "sigmoid",
        }
    }

    /// Parses every name in `names`, failing on the first unknown one.
    pub fn parse_all<S: AsRef<str>>(names: &[S]) -> Result<Vec<Self>> {
        if names.is_empty() {
            return Err(EvalErr::config("at least one activation function is required"));
        }

        let mut parsed = names
            .iter()
            .map(|name| name.as_ref().parse())
            .collect::<Result<Vec<Self>>>()?;

        parsed.sort();
        parsed.dedup();
        Ok(parsed)
    }

    /// Applies the activation to a `[N, K]` block of logits.
    pub fn apply(&self, logits: ArrayView2<f32>) -> Array2<f32> {
        match self {
            ActivationFn::Linear => logits.to_owned(),
            ActivationFn::Sigmoid => logits.mapv(|z| 1. / (1. + (-z).exp())),
            ActivationFn::Softmax => {
                let mut out = logits.to_owned();
                for mut row in out.axis_iter_mut(Axis(0)) {
                    let max = row.fold(f32::NEG_INFINITY, |acc, &z| acc.max(z));
                    row.mapv_inplace(|z| (z - max).exp());
                    let sum = row.sum();
                    row.mapv_inplace(|z| z / sum);
                }
                out
            }
        }
    }

    /// Activated score of each sample's `labels[i]` class.
    ///
    /// # Arguments
    /// * `logits` - Raw model outputs of shape `[N, K]`.
    /// * `labels` - One class index per row.
    ///
    /// # Returns
    /// The `[N]` scores or a shape error when a label is out of range.
    pub fn target_scores(&self, logits: ArrayView2<f32>, labels: &[usize]) -> Result<Array1<f32>> {
        let (n, k) = logits.dim();
        if labels.len() != n {
            return Err(EvalErr::shape("labels", labels.len(), n));
        }

        if let Some(&label) = labels.iter().find(|&&label| label >= k) {
            return Err(EvalErr::shape("label index", label, format!("< {k}")));
        }

        let activated = self.apply(logits);
        Ok(labels
            .iter()
            .enumerate()
            .map(|(i, &label)| activated[[i, label]])
            .collect())
    }
}

impl FromStr for ActivationFn {
    type Err = EvalErr;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linear" => Ok(Self::Linear),
            "softmax" => Ok(Self::Softmax),
            "sigmoid" => Ok(Self::Sigmoid),
            other => Err(EvalErr::config(format!("unknown activation function {other:?}"))),
        }
    }
}

impl fmt::Display for ActivationFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
