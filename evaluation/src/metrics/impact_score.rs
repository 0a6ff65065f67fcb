use ndarray::{Array2, ArrayView4};

use super::check_batch;
use crate::{
    ActivationFn, EvalErr, Result,
    masking::{Masker, RankOrder},
    model::{Model, forward_checked, predictions},
};

/// Impact Score: whether removing the most relevant units flips the
/// prediction or, unless strict, drops its confidence by a factor `tau`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImpactScore {
    num_steps: usize,
    /// Confidence ratio at or below which a sample counts as flipped.
    tau: Option<f32>,
}

impl ImpactScore {
    /// Creates a new `ImpactScore`.
    ///
    /// # Arguments
    /// * `num_steps` - Amount of mask sizes, evenly spread up to every unit.
    /// * `strict` - Only count changed predictions.
    /// * `tau` - Confidence ratio used when `strict` is off, in `(0, 1]`.
    pub fn new(num_steps: usize, strict: bool, tau: Option<f32>) -> Result<Self> {
        if num_steps == 0 {
            return Err(EvalErr::config("impact score needs at least one step"));
        }

        let tau = match (strict, tau) {
            (true, _) => None,
            (false, Some(tau)) if tau > 0.0 && tau <= 1.0 => Some(tau),
            (false, Some(tau)) => {
                return Err(EvalErr::config(format!("tau must be in (0, 1], got {tau}")));
            }
            (false, None) => {
                return Err(EvalErr::config("impact score needs either strict mode or a tau"));
            }
        };

        Ok(Self { num_steps, tau })
    }

    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    /// The amount of units masked at every step, for a sample with `total` units.
    pub fn mask_sizes(&self, total: usize) -> Vec<usize> {
        (1..=self.num_steps)
            .map(|step| step * total / self.num_steps)
            .collect()
    }

    /// # Returns
    /// An `[N, steps]` array holding `1` where the sample counts as flipped.
    pub fn run(
        &self,
        samples: ArrayView4<f32>,
        labels: &[usize],
        model: &dyn Model,
        attrs: ArrayView4<f32>,
        masker: &Masker,
    ) -> Result<Array2<f32>> {
        check_batch(samples, labels, attrs)?;
        if masker.samples()?.dim() != samples.dim() {
            return Err(EvalErr::config("the masker is bound to a different batch"));
        }

        let ranking = masker.ranking(attrs, RankOrder::MostRelevantFirst)?;
        let sizes: Vec<Vec<usize>> = ranking
            .iter()
            .map(|ranked| self.mask_sizes(ranked.len()))
            .collect();

        let original = forward_checked(model, samples)?;
        let confidence = ActivationFn::Softmax.target_scores(original.view(), labels)?;

        let mut out = Array2::zeros((labels.len(), self.num_steps));
        for step in 0..self.num_steps {
            let selected: Vec<Vec<usize>> = ranking
                .iter()
                .zip(&sizes)
                .map(|(ranked, sizes)| ranked[..sizes[step]].to_vec())
                .collect();

            let logits = forward_checked(model, masker.mask(&selected)?.view())?;
            let predicted = predictions(logits.view());
            let masked_confidence = ActivationFn::Softmax.target_scores(logits.view(), labels)?;

            for (i, mut row) in out.rows_mut().into_iter().enumerate() {
                let changed = predicted[i] != labels[i];
                let dropped = self
                    .tau
                    .is_some_and(|tau| masked_confidence[i] <= confidence[i] * tau);
                if changed || dropped {
                    row[step] = 1.0;
                }
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array4, array};

    use super::*;
    use crate::masking::{Baseline, Granularity};

    /// Two classes, class 0 scores the first pixel and class 1 a constant.
    struct FirstPixel;

    impl Model for FirstPixel {
        fn num_classes(&self) -> usize {
            2
        }

        fn forward(&self, x: ArrayView4<f32>) -> Result<Array2<f32>> {
            Ok(Array2::from_shape_fn((x.dim().0, 2), |(i, k)| {
                if k == 0 { x[[i, 0, 0, 0]] } else { 1.0 }
            }))
        }
    }

    fn setup() -> (Array4<f32>, Masker) {
        // Both samples predict class 0 until pixel 0 is masked.
        let samples = array![[[[3.0, 1.0, 1.0, 1.0]]], [[[3.0, 1.0, 1.0, 1.0]]]];
        let mut masker = Masker::new(Granularity::Pixel, Baseline::Constant(0.0));
        masker.set_batch(samples.view(), None).unwrap();
        (samples, masker)
    }

    #[test]
    fn strict_mode_counts_changed_predictions() {
        let (samples, masker) = setup();
        // Sample 0 ranks pixel 0 first, sample 1 ranks it last.
        let attrs = array![[[[4.0, 3.0, 2.0, 1.0]]], [[[1.0, 2.0, 3.0, 4.0]]]];

        let metric = ImpactScore::new(2, true, None).unwrap();
        assert_eq!(metric.mask_sizes(4), vec![2, 4]);

        let out = metric
            .run(samples.view(), &[0, 0], &FirstPixel, attrs.view(), &masker)
            .unwrap();
        assert_eq!(out, array![[1.0, 1.0], [0.0, 1.0]]);
    }

    #[test]
    fn tau_counts_confidence_drops() {
        let samples = array![[[[3.0, 1.0]]]];
        let mut masker = Masker::new(Granularity::Pixel, Baseline::Constant(1.5));
        masker.set_batch(samples.view(), None).unwrap();
        let attrs = array![[[[1.0, 0.0]]]];

        // A single step masks both pixels. Class 0 stays on top at 1.5
        // against 1.0, but its confidence falls from about 0.88 to 0.62.
        let strict = ImpactScore::new(1, true, None).unwrap();
        let loose = ImpactScore::new(1, false, Some(0.8)).unwrap();

        let unchanged = strict
            .run(samples.view(), &[0], &FirstPixel, attrs.view(), &masker)
            .unwrap();
        let dropped = loose
            .run(samples.view(), &[0], &FirstPixel, attrs.view(), &masker)
            .unwrap();

        assert_eq!(unchanged, array![[0.0]]);
        assert_eq!(dropped, array![[1.0]]);
    }

    #[test]
    fn needs_strict_mode_or_tau() {
        assert!(ImpactScore::new(3, false, None).is_err());
        assert!(ImpactScore::new(3, false, Some(1.5)).is_err());
        assert!(ImpactScore::new(0, true, None).is_err());
        assert!(ImpactScore::new(3, true, None).is_ok());
    }
}
