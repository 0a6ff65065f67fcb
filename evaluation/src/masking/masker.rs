use log::debug;
use ndarray::{Array2, Array3, Array4, ArrayView3, ArrayView4, Axis};
use rand::{SeedableRng, rngs::StdRng, seq::index};
use rayon::prelude::*;

use super::{Baseline, Granularity, RankOrder};
use crate::{EvalErr, Result, segmentation::segment_ids};

/// Replaces chosen units of a batch with a baseline.
///
/// A masker is bound to one batch at a time through `set_batch`, every other
/// operation works on that batch.
pub struct Masker {
    granularity: Granularity,
    baseline: Baseline,
    rng: StdRng,
    batch: Option<MaskedBatch>,
}

struct MaskedBatch {
    samples: Array4<f32>,
    baseline: Array4<f32>,
    segments: Option<Array3<u32>>,
    /// Valid unit ids per sample, sorted.
    units: Vec<Vec<usize>>,
    /// Every unit id of the batch is below this bound.
    unit_space: usize,
}

impl Masker {
    /// Creates a new `Masker`.
    ///
    /// # Arguments
    /// * `granularity` - What a single unit is.
    /// * `baseline` - How the replacement values are derived.
    pub fn new(granularity: Granularity, baseline: Baseline) -> Self {
        Self {
            granularity,
            baseline,
            rng: StdRng::seed_from_u64(rand::random()),
            batch: None,
        }
    }

    /// Makes the random draws of this masker reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// Binds the masker to a new batch and computes its baseline.
    ///
    /// # Arguments
    /// * `samples` - The `[N, C, H, W]` batch.
    /// * `segments` - An `[N, H, W]` segmentation, required for segment granularity.
    pub fn set_batch(
        &mut self,
        samples: ArrayView4<f32>,
        segments: Option<ArrayView3<u32>>,
    ) -> Result<()> {
        let (n, c, h, w) = samples.dim();

        let (segments, units, unit_space) = match self.granularity {
            Granularity::Pixel => (None, vec![(0..h * w).collect(); n], h * w),
            Granularity::Channel => (None, vec![(0..c).collect(); n], c),
            Granularity::Segment => {
                let Some(segments) = segments else {
                    return Err(EvalErr::config("segment granularity requires a segmentation"));
                };

                if segments.dim() != (n, h, w) {
                    return Err(EvalErr::shape("segmentation", segments.dim(), (n, h, w)));
                }

                let units: Vec<Vec<usize>> = segments.outer_iter().map(segment_ids).collect();
                let unit_space = units
                    .iter()
                    .filter_map(|ids| ids.last())
                    .max()
                    .map_or(0, |&max| max + 1);

                (Some(segments.to_owned()), units, unit_space)
            }
        };

        let baseline = self.baseline.compute(samples, &mut self.rng)?;
        debug!(samples = n, unit_space = unit_space; "masker bound to a new batch");

        self.batch = Some(MaskedBatch {
            samples: samples.to_owned(),
            baseline,
            segments,
            units,
            unit_space,
        });

        Ok(())
    }

    fn batch(&self) -> Result<&MaskedBatch> {
        self.batch
            .as_ref()
            .ok_or_else(|| EvalErr::config("the masker has no batch set"))
    }

    pub fn samples(&self) -> Result<ArrayView4<'_, f32>> {
        Ok(self.batch()?.samples.view())
    }

    /// The baseline of the current batch, equal to masking every unit.
    pub fn baseline(&self) -> Result<ArrayView4<'_, f32>> {
        Ok(self.batch()?.baseline.view())
    }

    pub fn num_samples(&self) -> Result<usize> {
        Ok(self.batch()?.units.len())
    }

    /// The units that exist in `sample`, sorted ascending.
    pub fn units(&self, sample: usize) -> Result<&[usize]> {
        let batch = self.batch()?;
        batch
            .units
            .get(sample)
            .map(Vec::as_slice)
            .ok_or_else(|| EvalErr::shape("sample index", sample, format!("< {}", batch.units.len())))
    }

    /// The smallest amount of units any sample of the batch has.
    pub fn min_units(&self) -> Result<usize> {
        Ok(self.batch()?.units.iter().map(Vec::len).min().unwrap_or(0))
    }

    /// Masks `indices[i]` on sample `i`, leaving everything else untouched.
    ///
    /// Duplicated indices are allowed, an empty list returns the sample as is.
    pub fn mask(&self, indices: &[Vec<usize>]) -> Result<Array4<f32>> {
        let batch = self.batch()?;
        let n = batch.units.len();
        if indices.len() != n {
            return Err(EvalErr::shape("mask indices", indices.len(), n));
        }

        if n == 0 {
            return Ok(batch.samples.clone());
        }

        let granularity = self.granularity;
        let masked = (0..n)
            .into_par_iter()
            .map(|i| batch.mask_sample(granularity, i, &indices[i]))
            .collect::<Result<Vec<_>>>()?;

        let views: Vec<_> = masked.iter().map(|sample| sample.view()).collect();
        Ok(ndarray::stack(Axis(0), &views)?)
    }

    /// Masks the same `units` on every sample.
    pub fn mask_shared(&self, units: &[usize]) -> Result<Array4<f32>> {
        let n = self.num_samples()?;
        self.mask(&vec![units.to_vec(); n])
    }

    /// Masks `k` random distinct units drawn independently for every sample.
    ///
    /// # Returns
    /// The masked batch and the units removed from each sample.
    pub fn mask_rand(&mut self, k: usize) -> Result<(Array4<f32>, Vec<Vec<usize>>)> {
        let batch = self
            .batch
            .as_ref()
            .ok_or_else(|| EvalErr::config("the masker has no batch set"))?;
        let rng = &mut self.rng;

        let drawn = batch
            .units
            .iter()
            .map(|units| draw(rng, units, k))
            .collect::<Result<Vec<_>>>()?;

        Ok((self.mask(&drawn)?, drawn))
    }

    /// Masks the same `k` random distinct units on every sample.
    ///
    /// Only pixel and channel granularities share a unit space between samples.
    pub fn mask_rand_shared(&mut self, k: usize) -> Result<(Array4<f32>, Vec<usize>)> {
        if self.granularity == Granularity::Segment {
            return Err(EvalErr::config(
                "shared random masks are not supported for segment granularity",
            ));
        }

        let batch = self
            .batch
            .as_ref()
            .ok_or_else(|| EvalErr::config("the masker has no batch set"))?;
        let rng = &mut self.rng;

        let all: Vec<usize> = (0..batch.unit_space).collect();
        let drawn = draw(rng, &all, k)?;

        Ok((self.mask_shared(&drawn)?, drawn))
    }

    /// Aggregates attributions into one importance value per unit.
    ///
    /// # Arguments
    /// * `attrs` - `[N, C, H, W]` or `[N, 1, H, W]` attributions for the current batch.
    ///
    /// # Returns
    /// An `[N, U]` array indexed by unit id, segments missing from a sample hold `-inf`.
    pub fn unit_importance(&self, attrs: ArrayView4<f32>) -> Result<Array2<f32>> {
        let batch = self.batch()?;
        let (n, c, h, w) = batch.samples.dim();
        let (an, ac, ah, aw) = attrs.dim();

        if an != n || ah != h || aw != w || (ac != c && ac != 1) {
            return Err(EvalErr::shape("attributions", attrs.dim(), (n, c, h, w)));
        }

        match self.granularity {
            Granularity::Pixel => Ok(attrs.sum_axis(Axis(1)).into_shape_with_order((n, h * w))?),
            Granularity::Channel => {
                if ac != c {
                    return Err(EvalErr::shape("channel attributions", attrs.dim(), (n, c, h, w)));
                }

                Ok(attrs.sum_axis(Axis(3)).sum_axis(Axis(2)) / (h * w) as f32)
            }
            Granularity::Segment => {
                let segments = batch.segments()?;
                let summed = attrs.sum_axis(Axis(1));
                let mut out = Array2::from_elem((n, batch.unit_space), f32::NEG_INFINITY);

                for (i, mut row) in out.outer_iter_mut().enumerate() {
                    let mut sums = vec![0f64; batch.unit_space];
                    let mut counts = vec![0usize; batch.unit_space];

                    for ((r, col), &label) in segments.index_axis(Axis(0), i).indexed_iter() {
                        sums[label as usize] += summed[[i, r, col]] as f64;
                        counts[label as usize] += 1;
                    }

                    for (unit, slot) in row.iter_mut().enumerate() {
                        if counts[unit] > 0 {
                            *slot = (sums[unit] / counts[unit] as f64) as f32;
                        }
                    }
                }

                Ok(out)
            }
        }
    }

    /// Orders every sample's units by importance, absent segments excluded.
    ///
    /// Ties keep ascending unit order.
    pub fn ranking(&self, attrs: ArrayView4<f32>, order: RankOrder) -> Result<Vec<Vec<usize>>> {
        let importance = self.unit_importance(attrs)?;
        let batch = self.batch()?;

        Ok(batch
            .units
            .iter()
            .zip(importance.outer_iter())
            .map(|(units, importance)| {
                let mut ranked = units.clone();
                match order {
                    RankOrder::MostRelevantFirst => {
                        ranked.sort_by(|&a, &b| importance[b].total_cmp(&importance[a]))
                    }
                    RankOrder::LeastRelevantFirst => {
                        ranked.sort_by(|&a, &b| importance[a].total_cmp(&importance[b]))
                    }
                }
                ranked
            })
            .collect())
    }
}

impl MaskedBatch {
    fn segments(&self) -> Result<&Array3<u32>> {
        self.segments
            .as_ref()
            .ok_or_else(|| EvalErr::config("segment granularity requires a segmentation"))
    }

    fn mask_sample(&self, granularity: Granularity, i: usize, units: &[usize]) -> Result<Array3<f32>> {
        let mut out = self.samples.index_axis(Axis(0), i).to_owned();
        let base = self.baseline.index_axis(Axis(0), i);
        let (c, h, w) = out.dim();

        match granularity {
            Granularity::Pixel => {
                for &unit in units {
                    if unit >= h * w {
                        return Err(EvalErr::shape("pixel index", unit, format!("< {}", h * w)));
                    }

                    let (r, col) = (unit / w, unit % w);
                    for ch in 0..c {
                        out[[ch, r, col]] = base[[ch, r, col]];
                    }
                }
            }
            Granularity::Channel => {
                for &unit in units {
                    if unit >= c {
                        return Err(EvalErr::shape("channel index", unit, format!("< {c}")));
                    }

                    out.index_axis_mut(Axis(0), unit)
                        .assign(&base.index_axis(Axis(0), unit));
                }
            }
            Granularity::Segment => {
                let valid = &self.units[i];
                let mut selected = vec![false; self.unit_space];

                for &unit in units {
                    if valid.binary_search(&unit).is_err() {
                        return Err(EvalErr::shape("segment id", unit, valid));
                    }
                    selected[unit] = true;
                }

                let segments = self.segments()?;
                for ((r, col), &label) in segments.index_axis(Axis(0), i).indexed_iter() {
                    if selected[label as usize] {
                        for ch in 0..c {
                            out[[ch, r, col]] = base[[ch, r, col]];
                        }
                    }
                }
            }
        }

        Ok(out)
    }
}

fn draw(rng: &mut StdRng, units: &[usize], k: usize) -> Result<Vec<usize>> {
    if k > units.len() {
        return Err(EvalErr::shape("random mask size", k, format!("<= {}", units.len())));
    }

    Ok(index::sample(rng, units.len(), k)
        .into_iter()
        .map(|at| units[at])
        .collect())
}

#[cfg(test)]
mod tests {
    use ndarray::{Array, array};

    use super::*;

    fn batch() -> Array4<f32> {
        Array::from_shape_fn((2, 3, 2, 2), |(n, c, h, w)| {
            (1 + n * 100 + c * 10 + h * 2 + w) as f32
        })
    }

    fn all_units(masker: &Masker) -> Vec<Vec<usize>> {
        (0..masker.num_samples().unwrap())
            .map(|i| masker.units(i).unwrap().to_vec())
            .collect()
    }

    #[test]
    fn masking_nothing_or_everything() {
        let samples = batch();
        let segments = array![[[0u32, 0], [1, 1]], [[2, 2], [2, 2]]];

        for granularity in [Granularity::Pixel, Granularity::Channel, Granularity::Segment] {
            let mut masker = Masker::new(granularity, Baseline::Constant(-1.0));
            masker
                .set_batch(samples.view(), Some(segments.view()))
                .unwrap();

            let none = masker.mask(&vec![vec![]; 2]).unwrap();
            assert_eq!(none, samples, "{granularity}");

            let all = masker.mask(&all_units(&masker)).unwrap();
            assert_eq!(all.view(), masker.baseline().unwrap(), "{granularity}");
        }
    }

    #[test]
    fn pixel_mask_covers_every_channel() {
        let samples = batch();
        let mut masker = Masker::new(Granularity::Pixel, Baseline::Constant(0.0));
        masker.set_batch(samples.view(), None).unwrap();

        let masked = masker.mask(&[vec![3], vec![]]).unwrap();
        for c in 0..3 {
            assert_eq!(masked[[0, c, 1, 1]], 0.0);
            assert_eq!(masked[[0, c, 0, 0]], samples[[0, c, 0, 0]]);
        }
        assert_eq!(masked.index_axis(Axis(0), 1), samples.index_axis(Axis(0), 1));
    }

    #[test]
    fn random_masks_draw_distinct_units() {
        let samples = batch();
        let mut masker = Masker::new(Granularity::Pixel, Baseline::Constant(0.0)).with_seed(11);
        masker.set_batch(samples.view(), None).unwrap();

        let (masked, drawn) = masker.mask_rand(3).unwrap();
        for (i, units) in drawn.iter().enumerate() {
            let mut unique = units.clone();
            unique.sort_unstable();
            unique.dedup();
            assert_eq!(unique.len(), 3);

            let zeroed = masked
                .index_axis(Axis(0), i)
                .index_axis(Axis(0), 0)
                .iter()
                .filter(|&&v| v == 0.0)
                .count();
            assert_eq!(zeroed, 3);
        }

        assert!(masker.mask_rand(5).is_err());
    }

    #[test]
    fn shared_draws_repeat_across_samples() {
        let samples = batch();
        let mut masker = Masker::new(Granularity::Channel, Baseline::Constant(0.0)).with_seed(5);
        masker.set_batch(samples.view(), None).unwrap();

        let (masked, drawn) = masker.mask_rand_shared(1).unwrap();
        let channel = drawn[0];
        for i in 0..2 {
            assert!(masked.slice(ndarray::s![i, channel, .., ..]).iter().all(|&v| v == 0.0));
        }
    }

    #[test]
    fn absent_segments_rank_nowhere() {
        let samples = batch();
        let segments = array![[[0u32, 0], [3, 3]], [[1, 1], [1, 1]]];
        let mut masker = Masker::new(Granularity::Segment, Baseline::Constant(0.0));
        masker
            .set_batch(samples.view(), Some(segments.view()))
            .unwrap();

        let attrs = array![
            [[[1.0, 1.0], [5.0, 7.0]]],
            [[[2.0, 2.0], [2.0, 2.0]]]
        ];
        let importance = masker.unit_importance(attrs.view()).unwrap();
        assert_eq!(importance.dim(), (2, 4));
        assert_eq!(importance[[0, 0]], 1.0);
        assert_eq!(importance[[0, 3]], 6.0);
        assert_eq!(importance[[0, 1]], f32::NEG_INFINITY);
        assert_eq!(importance[[1, 1]], 2.0);

        let ranking = masker
            .ranking(attrs.view(), RankOrder::LeastRelevantFirst)
            .unwrap();
        assert_eq!(ranking, vec![vec![0, 3], vec![1]]);

        assert!(masker.mask(&[vec![1], vec![]]).is_err());
        assert!(masker.mask_rand_shared(1).is_err());
    }

    #[test]
    fn ranking_breaks_ties_by_unit_id() {
        let samples = Array4::<f32>::zeros((1, 1, 1, 4));
        let mut masker = Masker::new(Granularity::Pixel, Baseline::Constant(0.0));
        masker.set_batch(samples.view(), None).unwrap();

        let attrs = array![[[[0.5, 2.0, 0.5, 2.0]]]];
        let ranking = masker
            .ranking(attrs.view(), RankOrder::MostRelevantFirst)
            .unwrap();
        assert_eq!(ranking, vec![vec![1, 3, 0, 2]]);
    }

    #[test]
    fn operations_need_a_batch() {
        let masker = Masker::new(Granularity::Pixel, Baseline::Constant(0.0));
        assert!(matches!(masker.mask(&[]), Err(EvalErr::Config(_))));
    }

    #[test]
    fn segment_granularity_needs_a_segmentation() {
        let samples = batch();
        let mut masker = Masker::new(Granularity::Segment, Baseline::ChannelMean);
        assert!(masker.set_batch(samples.view(), None).is_err());
    }
}
