use ndarray::{Array1, Array3, Array4, ArrayView3, ArrayView4, Axis, s};

use crate::{
    EvalErr, Result,
    model::{Model, forward_checked, predictions},
};

/// An adversarial patch that pushes a model towards `target`.
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    pub target: usize,
    /// `[C, h, w]` values pasted over the sample.
    pub values: Array3<f32>,
    pub row: usize,
    pub col: usize,
}

impl Patch {
    fn check_fits(&self, sample: (usize, usize, usize)) -> Result<()> {
        let (c, h, w) = sample;
        let (pc, ph, pw) = self.values.dim();

        if pc != c || self.row + ph > h || self.col + pw > w {
            return Err(EvalErr::shape(
                "patch placement",
                (pc, self.row + ph, self.col + pw),
                (c, h, w),
            ));
        }

        Ok(())
    }

    fn area(&self) -> usize {
        let (_, h, w) = self.values.dim();
        h * w
    }

    fn covers(&self, r: usize, c: usize) -> bool {
        let (_, h, w) = self.values.dim();
        (self.row..self.row + h).contains(&r) && (self.col..self.col + w).contains(&c)
    }
}

/// Picks the patch for a sample: the first one whose target differs from its
/// label, starting at a position rotated by the sample's global index.
pub fn select_patch(patches: &[Patch], label: usize, global_index: usize) -> Result<&Patch> {
    let len = patches.len();
    (0..len)
        .map(|offset| &patches[(global_index + offset) % len])
        .find(|patch| patch.target != label)
        .ok_or_else(|| EvalErr::config(format!("no patch targets a class other than {label}")))
}

/// Pastes `patches[i]` onto sample `i`.
pub fn apply_patches(samples: ArrayView4<f32>, patches: &[&Patch]) -> Result<Array4<f32>> {
    let (n, c, h, w) = samples.dim();
    if patches.len() != n {
        return Err(EvalErr::shape("patches", patches.len(), n));
    }

    let mut out = samples.to_owned();
    for (mut sample, patch) in out.outer_iter_mut().zip(patches) {
        patch.check_fits((c, h, w))?;
        let (_, ph, pw) = patch.values.dim();
        sample
            .slice_mut(s![.., patch.row..patch.row + ph, patch.col..patch.col + pw])
            .assign(&patch.values);
    }

    Ok(out)
}

/// `1` where the patched prediction equals the patch target, `0` otherwise.
pub fn flipped(model: &dyn Model, patched: ArrayView4<f32>, patches: &[&Patch]) -> Result<Array1<f32>> {
    let logits = forward_checked(model, patched)?;
    Ok(predictions(logits.view())
        .into_iter()
        .zip(patches)
        .map(|(pred, patch)| if pred == patch.target { 1.0 } else { 0.0 })
        .collect())
}

/// Intersection over union between each patch and the top attributed pixels.
///
/// The top set has as many pixels as the patch covers, ranked by channel
/// summed attribution with ties kept in pixel order.
pub fn coverage_iou(attrs: ArrayView4<f32>, patches: &[&Patch]) -> Result<Array1<f32>> {
    let (n, _, h, w) = attrs.dim();
    if patches.len() != n {
        return Err(EvalErr::shape("patches", patches.len(), n));
    }

    attrs
        .outer_iter()
        .zip(patches)
        .map(|(attrs, patch)| sample_iou(attrs, patch, h, w))
        .collect()
}

fn sample_iou(attrs: ArrayView3<f32>, patch: &Patch, h: usize, w: usize) -> Result<f32> {
    let (_, ph, pw) = patch.values.dim();
    if patch.row + ph > h || patch.col + pw > w {
        return Err(EvalErr::shape("patch placement", (patch.row + ph, patch.col + pw), (h, w)));
    }

    let summed = attrs.sum_axis(Axis(0));
    let mut ranked: Vec<(usize, f32)> = summed.iter().copied().enumerate().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

    let k = patch.area();
    let intersection = ranked
        .iter()
        .take(k)
        .filter(|(pixel, _)| patch.covers(pixel / w, pixel % w))
        .count();
    let union = 2 * k - intersection;

    Ok(if union == 0 {
        0.0
    } else {
        intersection as f32 / union as f32
    })
}

#[cfg(test)]
mod tests {
    use ndarray::{Array2, Array4};

    use super::*;

    fn patch(target: usize) -> Patch {
        Patch {
            target,
            values: Array3::from_elem((1, 2, 2), 9.0),
            row: 1,
            col: 1,
        }
    }

    /// Class 1 wins whenever the image holds a large value.
    struct Detector;

    impl Model for Detector {
        fn num_classes(&self) -> usize {
            2
        }

        fn forward(&self, x: ArrayView4<f32>) -> crate::Result<Array2<f32>> {
            let max: Vec<f32> = x.outer_iter().map(|s| s.fold(0.0f32, |a, &b| a.max(b))).collect();
            Ok(Array2::from_shape_fn((max.len(), 2), |(i, k)| {
                if k == 1 { max[i] - 5.0 } else { 0.0 }
            }))
        }
    }

    #[test]
    fn selection_skips_the_true_label() {
        let patches = vec![patch(0), patch(1), patch(2)];
        assert_eq!(select_patch(&patches, 0, 0).unwrap().target, 1);
        assert_eq!(select_patch(&patches, 1, 1).unwrap().target, 2);
        assert_eq!(select_patch(&patches, 2, 5).unwrap().target, 0);
        assert!(select_patch(&[patch(3)], 3, 0).is_err());
    }

    #[test]
    fn perfect_attribution_covers_the_patch() {
        let samples = Array4::<f32>::zeros((1, 1, 4, 4));
        let p = patch(1);
        let patched = apply_patches(samples.view(), &[&p]).unwrap();

        assert_eq!(flipped(&Detector, patched.view(), &[&p]).unwrap()[0], 1.0);
        assert_eq!(coverage_iou(patched.view(), &[&p]).unwrap()[0], 1.0);

        let mut shifted = Array4::<f32>::zeros((1, 1, 4, 4));
        shifted.slice_mut(s![0, 0, 0..2, 0..2]).fill(1.0);
        assert_eq!(coverage_iou(shifted.view(), &[&p]).unwrap()[0], 1.0 / 7.0);
    }

    #[test]
    fn patch_outside_the_image_is_rejected() {
        let samples = Array4::<f32>::zeros((1, 1, 2, 2));
        assert!(apply_patches(samples.view(), &[&patch(1)]).is_err());
    }
}
