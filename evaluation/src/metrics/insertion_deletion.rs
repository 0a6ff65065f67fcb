use std::str::FromStr;

use log::warn;
use ndarray::{Array1, Array2, ArrayView2, ArrayView4, Axis};

use super::{Scores, check_batch};
use crate::{
    ActivationFn, EvalErr, Result,
    masking::{Masker, RankOrder},
    model::{Model, forward_checked},
    schedule::Schedule,
};

/// The order units are taken in, by attributed importance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Most relevant first.
    Morf,
    /// Least relevant first.
    Lerf,
}

impl FromStr for Mode {
    type Err = EvalErr;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "morf" => Ok(Self::Morf),
            "lerf" => Ok(Self::Lerf),
            other => Err(EvalErr::config(format!("unknown mode {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurveKind {
    /// Start from the baseline and reveal units.
    Insertion,
    /// Start from the sample and mask units.
    Deletion,
}

/// How a curve is summarised into a single number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Auc,
    Aoc,
}

/// Insertion and deletion curves over a schedule of unit fractions.
#[derive(Debug, Clone)]
pub struct InsertionDeletion {
    kind: CurveKind,
    mode: Mode,
    schedule: Schedule,
    activation_fns: Vec<ActivationFn>,
}

impl InsertionDeletion {
    pub fn new(
        kind: CurveKind,
        mode: Mode,
        schedule: Schedule,
        activation_fns: Vec<ActivationFn>,
    ) -> Result<Self> {
        if activation_fns.is_empty() {
            return Err(EvalErr::config("at least one activation function is required"));
        }

        Ok(Self {
            kind,
            mode,
            schedule,
            activation_fns,
        })
    }

    pub fn kind(&self) -> CurveKind {
        self.kind
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn activation_fns(&self) -> &[ActivationFn] {
        &self.activation_fns
    }

    /// Computes the normalised curve of every sample.
    ///
    /// The masker must be bound to `samples`. A curve value of `1` matches the
    /// original output and `0` matches the fully masked output.
    ///
    /// # Returns
    /// One `[N, steps]` array per activation function.
    pub fn run(
        &self,
        samples: ArrayView4<f32>,
        labels: &[usize],
        model: &dyn Model,
        attrs: ArrayView4<f32>,
        masker: &Masker,
    ) -> Result<Scores> {
        check_batch(samples, labels, attrs)?;
        if masker.samples()?.dim() != samples.dim() {
            return Err(EvalErr::config("the masker is bound to a different batch"));
        }

        let order = match self.mode {
            Mode::Morf => RankOrder::MostRelevantFirst,
            Mode::Lerf => RankOrder::LeastRelevantFirst,
        };

        let ranking = masker.ranking(attrs, order)?;
        let counts: Vec<Vec<usize>> = ranking
            .iter()
            .map(|ranked| self.schedule.units(ranked.len()))
            .collect();

        let shape = (labels.len(), self.schedule.len());
        let mut scores: Scores = self
            .activation_fns
            .iter()
            .map(|&afn| (afn, Array2::zeros(shape)))
            .collect();

        for step in 0..self.schedule.len() {
            let selected: Vec<Vec<usize>> = ranking
                .iter()
                .zip(&counts)
                .map(|(ranked, counts)| {
                    let (taken, rest) = ranked.split_at(counts[step]);
                    match self.kind {
                        CurveKind::Deletion => taken.to_vec(),
                        CurveKind::Insertion => rest.to_vec(),
                    }
                })
                .collect();

            let masked = masker.mask(&selected)?;
            let logits = forward_checked(model, masked.view())?;

            for (afn, curve) in scores.iter_mut() {
                curve
                    .column_mut(step)
                    .assign(&afn.target_scores(logits.view(), labels)?);
            }
        }

        let original = forward_checked(model, samples)?;
        let neutral = forward_checked(model, masker.baseline()?)?;

        for (afn, curve) in scores.iter_mut() {
            let top = afn.target_scores(original.view(), labels)?;
            let bottom = afn.target_scores(neutral.view(), labels)?;
            normalize(curve, &top, &bottom, *afn);
        }

        Ok(scores)
    }
}

fn normalize(curve: &mut Array2<f32>, top: &Array1<f32>, bottom: &Array1<f32>, afn: ActivationFn) {
    let mut degenerate = 0;

    for ((mut row, &top), &bottom) in curve.axis_iter_mut(Axis(0)).zip(top).zip(bottom) {
        let range = top - bottom;
        if range == 0.0 {
            degenerate += 1;
            row.fill(0.0);
        } else {
            row.mapv_inplace(|y| (y - bottom) / range);
        }
    }

    if degenerate > 0 {
        warn!(activation = afn.name(), samples = degenerate;
            "original and fully masked outputs coincide, curves set to 0");
    }
}

/// Area under each `[N, steps]` curve, the mean over steps.
pub fn auc(curves: ArrayView2<f32>) -> Array1<f32> {
    curves
        .mean_axis(Axis(1))
        .unwrap_or_else(|| Array1::zeros(curves.nrows()))
}

/// Area over each curve, measured from its first value.
pub fn aoc(curves: ArrayView2<f32>) -> Array1<f32> {
    if curves.ncols() == 0 {
        return Array1::zeros(curves.nrows());
    }

    &curves.column(0) - &auc(curves)
}

/// Whether a larger summary means a better attribution.
pub fn higher_is_better(kind: CurveKind, mode: Mode, aggregation: Aggregation) -> bool {
    let aoc = aggregation == Aggregation::Aoc;
    match (kind, mode) {
        (CurveKind::Deletion, Mode::Morf) | (CurveKind::Insertion, Mode::Lerf) => aoc,
        (CurveKind::Deletion, Mode::Lerf) | (CurveKind::Insertion, Mode::Morf) => !aoc,
    }
}
