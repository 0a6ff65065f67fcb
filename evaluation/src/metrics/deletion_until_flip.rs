use std::num::NonZeroUsize;

use log::{debug, warn};
use ndarray::{Array1, ArrayView4};

use crate::{
    EvalErr, Result,
    masking::{Masker, RankOrder},
    model::{Model, forward_checked, predictions},
};

/// Counts the units that must be removed, most relevant first, before the
/// predicted class changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletionUntilFlip {
    step_size: NonZeroUsize,
}

impl DeletionUntilFlip {
    pub fn new(step_size: NonZeroUsize) -> Self {
        Self { step_size }
    }

    /// Derives the step size from a number of steps over `total` units.
    ///
    /// # Errors
    /// Fails unless `2 <= num_steps <= total`.
    pub fn from_num_steps(num_steps: usize, total: usize) -> Result<Self> {
        if num_steps < 2 || num_steps > total {
            return Err(EvalErr::config(format!(
                "num_steps must be in [2, {total}], got {num_steps}"
            )));
        }

        let step_size = NonZeroUsize::new(total / num_steps)
            .ok_or_else(|| EvalErr::config("derived step size is zero"))?;
        Ok(Self { step_size })
    }

    pub fn step_size(&self) -> usize {
        self.step_size.get()
    }

    /// # Returns
    /// The `[N]` amount of removed units at which each prediction first changed,
    /// or the sample's unit count if it never did.
    pub fn run(
        &self,
        samples: ArrayView4<f32>,
        model: &dyn Model,
        attrs: ArrayView4<f32>,
        masker: &Masker,
    ) -> Result<Array1<f32>> {
        if masker.samples()?.dim() != samples.dim() {
            return Err(EvalErr::config("the masker is bound to a different batch"));
        }

        let ranking = masker.ranking(attrs, RankOrder::MostRelevantFirst)?;
        let totals: Vec<usize> = ranking.iter().map(Vec::len).collect();
        let max_total = totals.iter().copied().max().unwrap_or(0);

        let original = predictions(forward_checked(model, samples)?.view());
        let fully_masked = predictions(forward_checked(model, masker.baseline()?)?.view());
        // Samples that keep their class when fully masked never flip.
        let mut flipped_at: Vec<Option<usize>> = original
            .iter()
            .zip(&fully_masked)
            .zip(&totals)
            .map(|((a, b), &total)| (a == b).then_some(total))
            .collect();

        let never_flip = flipped_at.iter().flatten().count();
        if never_flip > 0 {
            warn!(samples = never_flip;
                "the fully masked prediction equals the original one, those samples can't flip");
        }

        let mut mask_size = self.step_size.get();

        while flipped_at.iter().any(Option::is_none) && mask_size <= max_total {
            let selected: Vec<Vec<usize>> = ranking
                .iter()
                .map(|ranked| ranked[..mask_size.min(ranked.len())].to_vec())
                .collect();

            let masked = masker.mask(&selected)?;
            let current = predictions(forward_checked(model, masked.view())?.view());

            for (i, slot) in flipped_at.iter_mut().enumerate() {
                if slot.is_none() && current[i] != original[i] {
                    *slot = Some(mask_size.min(totals[i]));
                }
            }

            if mask_size == max_total {
                break;
            }
            mask_size = (mask_size + self.step_size.get()).min(max_total);
        }

        debug!(step_size = self.step_size.get(), last_mask_size = mask_size; "deletion until flip done");

        Ok(flipped_at
            .into_iter()
            .zip(totals)
            .map(|(flipped, total)| flipped.unwrap_or(total) as f32)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array2, Array4, array};

    use super::*;
    use crate::masking::{Baseline, Granularity};

    /// Three classes, class 0 scores the first pixel, class 1 the second and
    /// class 2 a constant.
    struct PixelVoter;

    impl Model for PixelVoter {
        fn num_classes(&self) -> usize {
            3
        }

        fn forward(&self, x: ArrayView4<f32>) -> Result<Array2<f32>> {
            Ok(Array2::from_shape_fn((x.dim().0, 3), |(i, k)| match k {
                0 => x[[i, 0, 0, 0]],
                1 => x[[i, 0, 0, 1]],
                _ => 0.5,
            }))
        }
    }

    #[test]
    fn counts_pixels_until_the_prediction_changes() {
        // Sample 0 predicts class 0, flips to 1 once pixel 0 is gone.
        // Sample 1 predicts class 1, flips to 0 once pixel 1 is gone.
        // Sample 2 predicts class 2 and never flips.
        // Sample 3 predicts class 0, needs both pixels gone to fall to class 2.
        let samples = array![
            [[[3.0, 2.0]]],
            [[[2.0, 3.0]]],
            [[[0.1, 0.2]]],
            [[[3.0, 0.0]]]
        ];
        let attrs = array![
            [[[1.0, 0.0]]],
            [[[0.0, 1.0]]],
            [[[1.0, 0.0]]],
            [[[0.0, 1.0]]]
        ];

        let mut masker = Masker::new(Granularity::Pixel, Baseline::Constant(0.0));
        masker.set_batch(samples.view(), None).unwrap();

        let metric = DeletionUntilFlip::new(NonZeroUsize::new(1).unwrap());
        let out = metric
            .run(samples.view(), &PixelVoter, attrs.view(), &masker)
            .unwrap();

        assert_eq!(out, array![1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn step_size_from_num_steps() {
        assert_eq!(DeletionUntilFlip::from_num_steps(4, 10).unwrap().step_size(), 2);
        assert!(DeletionUntilFlip::from_num_steps(1, 10).is_err());
        assert!(DeletionUntilFlip::from_num_steps(11, 10).is_err());
    }

    #[test]
    fn larger_steps_report_the_masked_amount() {
        let samples = Array4::from_shape_fn((1, 1, 1, 4), |(_, _, _, w)| if w == 0 { 3.0 } else { 0.0 });
        let attrs = Array4::from_shape_fn((1, 1, 1, 4), |(_, _, _, w)| w as f32);

        let mut masker = Masker::new(Granularity::Pixel, Baseline::Constant(0.0));
        masker.set_batch(samples.view(), None).unwrap();

        // Pixel 0 ranks last, it is only removed at the final mask size.
        let metric = DeletionUntilFlip::new(NonZeroUsize::new(3).unwrap());
        let out = metric
            .run(samples.view(), &PixelVoter, attrs.view(), &masker)
            .unwrap();
        assert_eq!(out, array![4.0]);
    }

    #[test]
    fn unflippable_samples_get_the_unit_count() {
        // Predicts class 0. Masking pixel 1 alone turns it into class 1, but
        // the fully masked sample ties and is back to class 0.
        let samples = array![[[[1.0, 0.9]]]];
        let attrs = array![[[[0.0, 1.0]]]];

        let mut masker = Masker::new(Granularity::Pixel, Baseline::Constant(2.0));
        masker.set_batch(samples.view(), None).unwrap();

        let metric = DeletionUntilFlip::new(NonZeroUsize::MIN);
        let out = metric
            .run(samples.view(), &PixelVoter, attrs.view(), &masker)
            .unwrap();
        assert_eq!(out, array![2.0]);
    }
}
