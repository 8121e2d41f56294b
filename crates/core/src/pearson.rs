use std::ops::Range;

use ndarray::{s, Array2, ArrayView2, Axis};

use crate::error::{RdmError, RdmResult};

/// Relative sum-of-squares below which a row is treated as constant.
const DEGENERATE_REL_TOL: f64 = 1e-12;

/// Per-row mean and inverse centred norm, computed once in f64 for the whole matrix.
///
/// With these, the Pearson correlation of rows `i` and `j` is the dot product
/// of their normalised versions, so any block of rows can be prepared on its
/// own without touching the rest of the matrix.
#[derive(Clone, Debug)]
pub struct RowStats {
    means: Vec<f64>,
    inv_norms: Vec<f64>,
}

impl RowStats {
    /// Fails with [`RdmError::DegenerateRow`] on the first zero-variance row.
    pub fn compute(data: ArrayView2<'_, f32>) -> RdmResult<Self> {
        let n_rows = data.nrows();
        let n_cols = data.ncols() as f64;
        let mut means = Vec::with_capacity(n_rows);
        let mut inv_norms = Vec::with_capacity(n_rows);

        for (i, row) in data.outer_iter().enumerate() {
            let mut sum = 0.0;
            let mut sum_sq = 0.0;
            for &v in row.iter() {
                let v = v as f64;
                sum += v;
                sum_sq += v * v;
            }
            let mean = sum / n_cols;
            let mut ss = 0.0;
            for &v in row.iter() {
                let d = v as f64 - mean;
                ss += d * d;
            }
            if !ss.is_finite() || ss <= DEGENERATE_REL_TOL * sum_sq {
                return Err(RdmError::DegenerateRow { row: i });
            }
            means.push(mean);
            inv_norms.push(1.0 / ss.sqrt());
        }

        Ok(Self { means, inv_norms })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.means.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.means.is_empty()
    }

    /// Centre and scale `rows` of `data` to unit norm, in f64.
    pub fn normalized_block(&self, data: ArrayView2<'_, f32>, rows: Range<usize>) -> Array2<f64> {
        let start = rows.start;
        let mut block = data.slice(s![rows, ..]).mapv(|v| v as f64);
        for (offset, mut row) in block.axis_iter_mut(Axis(0)).enumerate() {
            let mean = self.means[start + offset];
            let scale = self.inv_norms[start + offset];
            row.mapv_inplace(|v| (v - mean) * scale);
        }
        block
    }
}

/// Correlation distance `1 - r` between every row of `lhs` and every row of
/// `rhs`, both already normalised by [`RowStats::normalized_block`].
pub fn distance_block(lhs: &Array2<f64>, rhs: &Array2<f64>) -> Array2<f32> {
    let corr = lhs.dot(&rhs.t());
    corr.mapv(|r| (1.0 - r).clamp(0.0, 2.0) as f32)
}

/// Pearson correlation of two equal-length sequences.
///
/// Fails with [`RdmError::DegenerateComparison`] when either sequence is
/// constant or shorter than two entries.
pub fn pearson(x: &[f64], y: &[f64]) -> RdmResult<f64> {
    if x.len() != y.len() {
        return Err(RdmError::ShapeMismatch {
            context: "pearson sequences",
            expected: (x.len(), 1),
            actual: (y.len(), 1),
        });
    }
    let n = x.len();
    if n < 2 {
        return Err(RdmError::DegenerateComparison { len: n });
    }
    let mean_x = x.iter().sum::<f64>() / n as f64;
    let mean_y = y.iter().sum::<f64>() / n as f64;

    let mut cov = 0.0;
    let mut ss_x = 0.0;
    let mut ss_y = 0.0;
    for (&a, &b) in x.iter().zip(y) {
        let dx = a - mean_x;
        let dy = b - mean_y;
        cov += dx * dy;
        ss_x += dx * dx;
        ss_y += dy * dy;
    }
    let scale = (ss_x * ss_y).sqrt();
    if scale == 0.0 || !scale.is_finite() {
        return Err(RdmError::DegenerateComparison { len: n });
    }
    Ok((cov / scale).clamp(-1.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol
    }

    #[test]
    fn pearson_detects_perfect_relationships() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [4.0, 3.0, 2.0, 1.0];
        assert!(approx_eq(pearson(&x, &x).expect("defined"), 1.0, 1e-12));
        assert!(approx_eq(pearson(&x, &y).expect("defined"), -1.0, 1e-12));
        assert!(matches!(
            pearson(&x, &[2.0; 4]),
            Err(RdmError::DegenerateComparison { len: 4 })
        ));
        assert!(matches!(
            pearson(&x, &[1.0, 2.0]),
            Err(RdmError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn constant_row_is_degenerate() {
        let data = array![[1.0f32, 2.0, 3.0], [0.1, 0.1, 0.1]];
        let err = RowStats::compute(data.view()).unwrap_err();
        assert!(matches!(err, RdmError::DegenerateRow { row: 1 }));
    }

    #[test]
    fn single_feature_is_degenerate() {
        let data = array![[5.0f32], [6.0]];
        assert!(matches!(
            RowStats::compute(data.view()),
            Err(RdmError::DegenerateRow { row: 0 })
        ));
    }

    #[test]
    fn normalized_rows_give_correlation_distance() {
        let data = array![[1.0f32, 2.0, 3.0, 4.0], [4.0, 3.0, 2.0, 1.0], [1.0, 3.0, 2.0, 4.0]];
        let stats = RowStats::compute(data.view()).expect("stats");
        let block = stats.normalized_block(data.view(), 0..3);
        let d = distance_block(&block, &block);

        assert!(approx_eq(d[[0, 0]] as f64, 0.0, 1e-6));
        assert!(approx_eq(d[[0, 1]] as f64, 2.0, 1e-6));
        // r(row0, row2) = 0.8
        assert!(approx_eq(d[[0, 2]] as f64, 0.2, 1e-6));
        assert!(approx_eq(d[[0, 2]] as f64, d[[2, 0]] as f64, 1e-7));
    }
}
