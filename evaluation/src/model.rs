//! The seams between metrics and the things being evaluated.

use ndarray::{Array2, Array3, Array4, ArrayView2, ArrayView4, Axis};

use crate::{EvalErr, Result};

/// A classifier mapping image batches to per class scores.
pub trait Model {
    /// The amount of classes `K` in the output.
    fn num_classes(&self) -> usize;

    /// Runs the model on a `[N, C, H, W]` batch.
    ///
    /// # Returns
    /// The raw `[N, K]` outputs.
    fn forward(&self, x: ArrayView4<f32>) -> Result<Array2<f32>>;
}

/// Produces attribution maps explaining a model's predictions.
pub trait AttributionMethod {
    /// # Arguments
    /// * `model` - The model being explained.
    /// * `x` - A `[N, C, H, W]` batch.
    /// * `labels` - The class each sample is explained for.
    ///
    /// # Returns
    /// Attributions of shape `[N, C, H, W]` or `[N, 1, H, W]`.
    fn attribute(
        &mut self,
        model: &dyn Model,
        x: ArrayView4<f32>,
        labels: &[usize],
    ) -> Result<Array4<f32>>;
}

/// Random access collection of labelled samples.
pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `[C, H, W]` shape every sample shares.
    fn sample_shape(&self) -> [usize; 3];

    fn get(&self, index: usize) -> Result<(Array3<f32>, usize)>;
}

/// Stacks the samples at `indices` into a batch.
///
/// # Returns
/// The `[N, C, H, W]` samples and their labels.
pub fn gather(dataset: &dyn Dataset, indices: &[usize]) -> Result<(Array4<f32>, Vec<usize>)> {
    let [c, h, w] = dataset.sample_shape();
    let mut batch = Array4::zeros((indices.len(), c, h, w));
    let mut labels = Vec::with_capacity(indices.len());

    for (mut row, &index) in batch.axis_iter_mut(Axis(0)).zip(indices) {
        if index >= dataset.len() {
            return Err(EvalErr::shape("dataset index", index, format!("< {}", dataset.len())));
        }

        let (sample, label) = dataset.get(index)?;
        if sample.dim() != (c, h, w) {
            return Err(EvalErr::shape("dataset sample", sample.dim(), (c, h, w)));
        }

        row.assign(&sample);
        labels.push(label);
    }

    Ok((batch, labels))
}

/// The arg max class of every row of `logits`.
pub fn predictions(logits: ArrayView2<f32>) -> Vec<usize> {
    logits
        .axis_iter(Axis(0))
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (class, &score)| {
                    if score > best.1 { (class, score) } else { best }
                })
                .0
        })
        .collect()
}

/// Runs `model` and checks it returned one row of `num_classes` scores per sample.
pub(crate) fn forward_checked(model: &dyn Model, x: ArrayView4<f32>) -> Result<Array2<f32>> {
    let logits = model.forward(x)?;
    let expected = (x.dim().0, model.num_classes());

    if logits.dim() != expected {
        return Err(EvalErr::shape("model output", logits.dim(), expected));
    }

    Ok(logits)
}
