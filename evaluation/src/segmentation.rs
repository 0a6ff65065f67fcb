use ndarray::{Array3, ArrayView2, ArrayView4};

use crate::{EvalErr, Result};

/// Assigns a segment label to every pixel of every sample.
pub trait Segmenter {
    /// # Returns
    /// An `[N, H, W]` map of non negative segment labels.
    fn segment(&self, batch: ArrayView4<f32>) -> Result<Array3<u32>>;

    /// The segment count of every `height x width` image, when it does not
    /// depend on the image content.
    fn num_segments(&self, _height: usize, _width: usize) -> Option<usize> {
        None
    }
}

/// Splits every image into a regular grid of `rows x cols` cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridSegmenter {
    rows: usize,
    cols: usize,
}

impl GridSegmenter {
    pub fn new(rows: usize, cols: usize) -> Result<Self> {
        if rows == 0 || cols == 0 {
            return Err(EvalErr::config(format!(
                "grid segmenter needs at least one row and column, got {rows}x{cols}"
            )));
        }

        Ok(Self { rows, cols })
    }
}

impl Segmenter for GridSegmenter {
    fn segment(&self, batch: ArrayView4<f32>) -> Result<Array3<u32>> {
        let (n, _, h, w) = batch.dim();
        if self.rows > h || self.cols > w {
            return Err(EvalErr::config(format!(
                "a {}x{} grid does not fit {h}x{w} images",
                self.rows, self.cols
            )));
        }

        Ok(Array3::from_shape_fn((n, h, w), |(_, r, c)| {
            let cell_row = r * self.rows / h;
            let cell_col = c * self.cols / w;
            (cell_row * self.cols + cell_col) as u32
        }))
    }

    fn num_segments(&self, height: usize, width: usize) -> Option<usize> {
        (self.rows <= height && self.cols <= width).then_some(self.rows * self.cols)
    }
}

/// The sorted distinct labels present in a single `[H, W]` segmentation.
pub fn segment_ids(map: ArrayView2<u32>) -> Vec<usize> {
    let mut ids: Vec<usize> = map.iter().map(|&label| label as usize).collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

#[cfg(test)]
mod tests {
    use ndarray::{Array4, Axis};

    use super::*;

    #[test]
    fn grid_covers_every_cell() {
        let batch = Array4::<f32>::zeros((2, 1, 4, 6));
        let map = GridSegmenter::new(2, 3).unwrap().segment(batch.view()).unwrap();

        assert_eq!(map.dim(), (2, 4, 6));
        assert_eq!(segment_ids(map.index_axis(Axis(0), 0)), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(map[[0, 0, 0]], 0);
        assert_eq!(map[[0, 3, 5]], 5);
    }

    #[test]
    fn grid_segment_count_ignores_the_content() {
        let grid = GridSegmenter::new(2, 3).unwrap();
        assert_eq!(grid.num_segments(4, 6), Some(6));
        assert_eq!(grid.num_segments(5, 3), Some(6));
        assert_eq!(grid.num_segments(1, 6), None);
    }

    #[test]
    fn grid_larger_than_image_is_rejected() {
        let batch = Array4::<f32>::zeros((1, 1, 2, 2));
        assert!(GridSegmenter::new(3, 1).unwrap().segment(batch.view()).is_err());
    }
}
