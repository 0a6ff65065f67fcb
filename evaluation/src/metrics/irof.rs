use std::collections::BTreeMap;

use log::warn;
use ndarray::{Array1, Array2, ArrayView1, ArrayView4, s};

use super::{CurveKind, Mode, check_batch};
use crate::{
    ActivationFn, EvalErr, Result,
    masking::{Masker, RankOrder},
    model::{Model, forward_checked},
};

/// Iterative removal (IROF) or insertion (IIOF) of every unit of a sample, one
/// at a time in ranked order.
///
/// Curves are divided by the original output and integrated over `[0, 1]`
/// with the trapezoidal rule, one point per unit count. Removal reports the
/// area over the curve, insertion the area under it. Usually paired with a
/// segment masker, where a sample may hold fewer units than others.
#[derive(Debug, Clone)]
pub struct Irof {
    kind: CurveKind,
    mode: Mode,
    activation_fns: Vec<ActivationFn>,
}

impl Irof {
    pub fn new(kind: CurveKind, mode: Mode, activation_fns: Vec<ActivationFn>) -> Result<Self> {
        if activation_fns.is_empty() {
            return Err(EvalErr::config("at least one activation function is required"));
        }

        Ok(Self {
            kind,
            mode,
            activation_fns,
        })
    }

    pub fn kind(&self) -> CurveKind {
        self.kind
    }

    /// # Returns
    /// The `[N]` summaries per activation function.
    pub fn run(
        &self,
        samples: ArrayView4<f32>,
        labels: &[usize],
        model: &dyn Model,
        attrs: ArrayView4<f32>,
        masker: &Masker,
    ) -> Result<BTreeMap<ActivationFn, Array1<f32>>> {
        check_batch(samples, labels, attrs)?;
        if masker.samples()?.dim() != samples.dim() {
            return Err(EvalErr::config("the masker is bound to a different batch"));
        }

        let order = match self.mode {
            Mode::Morf => RankOrder::MostRelevantFirst,
            Mode::Lerf => RankOrder::LeastRelevantFirst,
        };
        let ranking = masker.ranking(attrs, order)?;
        let max_units = ranking.iter().map(Vec::len).max().unwrap_or(0);

        // `curves[afn][[i, t]]` is the output once `t` units are taken.
        let n = labels.len();
        let mut curves: BTreeMap<ActivationFn, Array2<f32>> = self
            .activation_fns
            .iter()
            .map(|&afn| (afn, Array2::zeros((n, max_units + 1))))
            .collect();

        for taken in 0..=max_units {
            let selected: Vec<Vec<usize>> = ranking
                .iter()
                .map(|ranked| {
                    let (head, tail) = ranked.split_at(taken.min(ranked.len()));
                    match self.kind {
                        CurveKind::Deletion => head.to_vec(),
                        CurveKind::Insertion => tail.to_vec(),
                    }
                })
                .collect();

            let logits = forward_checked(model, masker.mask(&selected)?.view())?;
            for (afn, curve) in curves.iter_mut() {
                curve
                    .column_mut(taken)
                    .assign(&afn.target_scores(logits.view(), labels)?);
            }
        }

        let original = forward_checked(model, samples)?;
        let mut out = BTreeMap::new();

        for (afn, curve) in curves {
            let top = afn.target_scores(original.view(), labels)?;
            let mut summary = Array1::zeros(n);
            let mut degenerate = 0;

            for (i, ranked) in ranking.iter().enumerate() {
                if top[i] == 0.0 || ranked.is_empty() {
                    degenerate += 1;
                    continue;
                }

                let points = curve.row(i).slice_move(s![..=ranked.len()]);
                let area = trapezoid(points.mapv(|y| y / top[i]).view());
                summary[i] = match self.kind {
                    CurveKind::Deletion => 1.0 - area,
                    CurveKind::Insertion => area,
                };
            }

            if degenerate > 0 {
                warn!(activation = afn.name(), samples = degenerate;
                    "zero original output or no units, summaries set to 0");
            }
            out.insert(afn, summary);
        }

        Ok(out)
    }
}

/// Trapezoidal area of evenly spaced `points` over `[0, 1]`.
fn trapezoid(points: ArrayView1<f32>) -> f32 {
    let intervals = points.len().saturating_sub(1);
    if intervals == 0 {
        return 0.0;
    }

    let sum: f32 = points
        .windows(2)
        .into_iter()
        .map(|pair| (pair[0] + pair[1]) / 2.0)
        .sum();
    sum / intervals as f32
}
