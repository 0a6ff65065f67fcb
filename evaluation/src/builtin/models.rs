use ndarray::{Array1, Array2, ArrayView4};
use ndarray_rand::RandomExt;
use rand::{SeedableRng, rngs::StdRng};
use rand_distr::StandardNormal;

use crate::{EvalErr, Model, Result};

/// A single dense layer over the flattened image.
#[derive(Debug, Clone)]
pub struct LinearClassifier {
    input_shape: [usize; 3],
    /// `[K, C * H * W]`
    weights: Array2<f32>,
    bias: Array1<f32>,
}

impl LinearClassifier {
    /// Creates a new `LinearClassifier`.
    ///
    /// # Errors
    /// Fails when `weights` and `bias` don't agree with `input_shape` and each other.
    pub fn new(input_shape: [usize; 3], weights: Array2<f32>, bias: Array1<f32>) -> Result<Self> {
        let features: usize = input_shape.iter().product();
        let (k, d) = weights.dim();

        if d != features {
            return Err(EvalErr::shape("linear weights", (k, d), (k, features)));
        }

        if bias.len() != k || k == 0 {
            return Err(EvalErr::shape("linear bias", bias.len(), k));
        }

        Ok(Self {
            input_shape,
            weights,
            bias,
        })
    }

    /// Draws standard normal weights and a zero bias.
    pub fn random(input_shape: [usize; 3], num_classes: usize, seed: u64) -> Result<Self> {
        let features = input_shape.iter().product();
        let mut rng = StdRng::seed_from_u64(seed);
        let weights = Array2::random_using((num_classes, features), StandardNormal, &mut rng);
        Self::new(input_shape, weights, Array1::zeros(num_classes))
    }
}

impl Model for LinearClassifier {
    fn num_classes(&self) -> usize {
        self.bias.len()
    }

    fn forward(&self, x: ArrayView4<f32>) -> Result<Array2<f32>> {
        let (n, c, h, w) = x.dim();
        let [ec, eh, ew] = self.input_shape;
        if (c, h, w) != (ec, eh, ew) {
            return Err(EvalErr::shape("model input", (c, h, w), (ec, eh, ew)));
        }

        let flat = x
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((n, c * h * w))?;

        Ok(flat.dot(&self.weights.t()) + &self.bias)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array4, array};

    use super::*;

    #[test]
    fn forward_is_an_affine_map() {
        let model = LinearClassifier::new(
            [1, 1, 2],
            array![[1.0, 0.0], [0.0, 2.0]],
            array![0.5, -0.5],
        )
        .unwrap();

        let x = array![[[[3.0, 4.0]]]];
        assert_eq!(model.forward(x.view()).unwrap(), array![[3.5, 7.5]]);
    }

    #[test]
    fn wrong_input_shape_is_rejected() {
        let model = LinearClassifier::random([1, 2, 2], 3, 0).unwrap();
        let x = Array4::<f32>::zeros((1, 1, 3, 3));
        assert!(model.forward(x.view()).is_err());
    }
}
