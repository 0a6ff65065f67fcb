use log::warn;
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};

use crate::{EvalErr, Result};

/// Pearson correlation between `a` and `b`.
///
/// # Errors
/// `DegenerateStatistic` when either side has zero variance or fewer than two values.
pub fn pearson(a: ArrayView1<f32>, b: ArrayView1<f32>) -> Result<f32> {
    if a.len() != b.len() {
        return Err(EvalErr::shape("correlated vectors", b.len(), a.len()));
    }

    if a.len() < 2 {
        return Err(EvalErr::DegenerateStatistic(format!(
            "correlation of {} values",
            a.len()
        )));
    }

    let n = a.len() as f64;
    let mean_a = a.iter().map(|&v| v as f64).sum::<f64>() / n;
    let mean_b = b.iter().map(|&v| v as f64).sum::<f64>() / n;

    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (&x, &y) in a.iter().zip(b) {
        let (dx, dy) = (x as f64 - mean_a, y as f64 - mean_b);
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }

    if var_a == 0.0 || var_b == 0.0 {
        return Err(EvalErr::DegenerateStatistic(
            "correlation with zero variance".into(),
        ));
    }

    Ok((cov / (var_a * var_b).sqrt()).clamp(-1.0, 1.0) as f32)
}

/// Row wise correlation of two `[N, M]` arrays.
///
/// Degenerate rows are reported once as a warning and yield `0`.
pub fn corrcoef(a: ArrayView2<f32>, b: ArrayView2<f32>) -> Result<Array1<f32>> {
    if a.dim() != b.dim() {
        return Err(EvalErr::shape("correlated arrays", b.dim(), a.dim()));
    }

    let mut degenerate = 0;
    let out = a
        .axis_iter(Axis(0))
        .zip(b.axis_iter(Axis(0)))
        .map(|(a, b)| match pearson(a, b) {
            Ok(r) => Ok(r),
            Err(EvalErr::DegenerateStatistic(_)) => {
                degenerate += 1;
                Ok(0.0)
            }
            Err(err) => Err(err),
        })
        .collect::<Result<Array1<f32>>>()?;

    if degenerate > 0 {
        warn!(rows = degenerate; "zero variance in correlation, those rows were set to 0");
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn correlation_stays_in_range() {
        let a = array![1.0, 2.0, 3.0, 4.0];
        assert!((pearson(a.view(), a.view()).unwrap() - 1.0).abs() < 1e-6);

        let b = array![4.0, 3.0, 2.0, 1.0];
        assert!((pearson(a.view(), b.view()).unwrap() + 1.0).abs() < 1e-6);

        let c = array![0.3, -7.0, 2.5, 0.0];
        let r = pearson(a.view(), c.view()).unwrap();
        assert!((-1.0..=1.0).contains(&r));
    }

    #[test]
    fn zero_variance_is_degenerate() {
        let a = array![1.0, 2.0, 3.0];
        let flat = array![5.0, 5.0, 5.0];
        assert!(matches!(
            pearson(a.view(), flat.view()),
            Err(EvalErr::DegenerateStatistic(_))
        ));
    }

    #[test]
    fn corrcoef_zeroes_degenerate_rows() {
        let a = array![[1.0, 2.0, 3.0], [1.0, 2.0, 3.0]];
        let b = array![[2.0, 4.0, 6.0], [9.0, 9.0, 9.0]];
        let r = corrcoef(a.view(), b.view()).unwrap();

        assert!((r[0] - 1.0).abs() < 1e-6);
        assert_eq!(r[1], 0.0);
    }
}
