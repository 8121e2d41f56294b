use ndarray::{Array2, ArrayBase, ArrayView2, Data, Ix2, Zip};
use rayon::prelude::*;
use tracing::info;

use crate::error::{RdmError, RdmResult};

/// Sequences longer than this are sorted with rayon.
const PAR_SORT_THRESHOLD: usize = 1 << 16;

/// Average ranks (1-based) of `data`; tied values share the mean of the ranks they span.
pub fn rank_data(data: &[f64]) -> Vec<f64> {
    let mut ranks = vec![0.0; data.len()];
    fill_ranks(data, &mut ranks);
    ranks
}

/// Like [`rank_data`], writing into a caller-provided buffer of equal length.
pub fn rank_into(data: &[f64], ranks: &mut [f64]) -> RdmResult<()> {
    if data.len() != ranks.len() {
        return Err(RdmError::ShapeMismatch {
            context: "rank buffer",
            expected: (data.len(), 1),
            actual: (ranks.len(), 1),
        });
    }
    fill_ranks(data, ranks);
    Ok(())
}

fn fill_ranks(data: &[f64], ranks: &mut [f64]) {
    let n = data.len();

    let mut order: Vec<usize> = (0..n).collect();
    if n > PAR_SORT_THRESHOLD {
        order.par_sort_unstable_by(|&a, &b| data[a].total_cmp(&data[b]));
    } else {
        order.sort_unstable_by(|&a, &b| data[a].total_cmp(&data[b]));
    }

    let mut i = 0;
    while i < n {
        let mut j = i;
        while j + 1 < n && data[order[j + 1]] == data[order[i]] {
            j += 1;
        }
        // positions i..=j hold ranks i+1..=j+1
        let rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = rank;
        }
        i = j + 1;
    }
}

/// Row-wise rank transform of a `samples x features` response matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct RankedMatrix {
    ranks: Array2<f32>,
}

impl RankedMatrix {
    /// Rank each row independently. Rows are processed in parallel.
    pub fn from_responses<S>(data: &ArrayBase<S, Ix2>) -> RdmResult<Self>
    where
        S: Data<Elem = f32> + Sync,
    {
        let (n_rows, n_cols) = data.dim();
        if n_rows == 0 || n_cols == 0 {
            return Err(RdmError::EmptyMatrix {
                rows: n_rows,
                cols: n_cols,
            });
        }
        if let Some(((row, col), _)) = data.indexed_iter().find(|(_, v)| !v.is_finite()) {
            return Err(RdmError::NonFinite { row, col });
        }

        info!(rows = n_rows, features = n_cols, "rank-transforming response matrix");

        let mut ranks = Array2::<f32>::zeros((n_rows, n_cols));
        Zip::from(ranks.rows_mut())
            .and(data.rows())
            .par_for_each(|mut out, row| {
                let values: Vec<f64> = row.iter().map(|&v| v as f64).collect();
                let row_ranks = rank_data(&values);
                for (dst, r) in out.iter_mut().zip(row_ranks) {
                    *dst = r as f32;
                }
            });

        Ok(Self { ranks })
    }

    /// Wrap a matrix whose rows already hold ranks (or any values to be
    /// correlated as-is).
    pub fn from_ranks(ranks: Array2<f32>) -> RdmResult<Self> {
        let (rows, cols) = ranks.dim();
        if rows == 0 || cols == 0 {
            return Err(RdmError::EmptyMatrix { rows, cols });
        }
        if let Some(((row, col), _)) = ranks.indexed_iter().find(|(_, v)| !v.is_finite()) {
            return Err(RdmError::NonFinite { row, col });
        }
        Ok(Self { ranks })
    }

    #[inline]
    pub fn nrows(&self) -> usize {
        self.ranks.nrows()
    }

    #[inline]
    pub fn ncols(&self) -> usize {
        self.ranks.ncols()
    }

    pub fn view(&self) -> ArrayView2<'_, f32> {
        self.ranks.view()
    }

    pub fn into_inner(self) -> Array2<f32> {
        self.ranks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn ties_receive_average_rank() {
        assert_eq!(rank_data(&[10.0, 20.0, 10.0, 30.0]), vec![1.5, 3.0, 1.5, 4.0]);
        assert_eq!(rank_data(&[3.0, 1.0, 2.0]), vec![3.0, 1.0, 2.0]);
    }

    #[test]
    fn constant_row_gets_middle_rank() {
        let ranks = rank_data(&[7.0; 5]);
        assert!(ranks.iter().all(|&r| r == 3.0));
    }

    #[test]
    fn mostly_duplicated_row_keeps_rank_sum() {
        let data = [1.0, 1.0, 1.0, 1.0, 2.0, 0.5];
        let ranks = rank_data(&data);
        let n = data.len() as f64;
        assert_eq!(ranks.iter().sum::<f64>(), n * (n + 1.0) / 2.0);
        assert_eq!(ranks[5], 1.0);
        assert_eq!(ranks[4], 6.0);
        assert_eq!(ranks[0], 3.5);
    }

    #[test]
    fn ranking_ranks_is_identity_without_ties() {
        let ranks = rank_data(&[0.3, -2.0, 9.5, 4.0]);
        assert_eq!(rank_data(&ranks), ranks);
    }

    #[test]
    fn large_sequences_use_parallel_sort_consistently() {
        let n = PAR_SORT_THRESHOLD + 10;
        let data: Vec<f64> = (0..n).map(|i| ((i * 7919) % n) as f64).collect();
        let ranks = rank_data(&data);
        for (v, r) in data.iter().zip(&ranks) {
            assert_eq!(*r, v + 1.0);
        }
    }

    #[test]
    fn ranked_matrix_preserves_shape() {
        let data = array![[1.0f32, 5.0, 3.0], [2.0, 2.0, 1.0]];
        let ranked = RankedMatrix::from_responses(&data).expect("rank");
        assert_eq!(ranked.view(), array![[1.0f32, 3.0, 2.0], [2.5, 2.5, 1.0]]);
    }

    #[test]
    fn non_finite_input_is_rejected() {
        let data = array![[1.0f32, 2.0], [f32::NAN, 0.0]];
        let err = RankedMatrix::from_responses(&data).unwrap_err();
        assert!(matches!(err, RdmError::NonFinite { row: 1, col: 0 }));
    }

    #[test]
    fn empty_input_is_rejected() {
        let data = Array2::<f32>::zeros((0, 4));
        assert!(matches!(
            RankedMatrix::from_responses(&data),
            Err(RdmError::EmptyMatrix { rows: 0, cols: 4 })
        ));
    }

    #[test]
    fn rank_into_reuses_buffer_and_rejects_wrong_length() {
        let mut buf = vec![0.0; 3];
        rank_into(&[3.0, 1.0, 2.0], &mut buf).expect("ranks");
        assert_eq!(buf, vec![3.0, 1.0, 2.0]);
        assert!(matches!(
            rank_into(&[1.0, 2.0], &mut buf),
            Err(RdmError::ShapeMismatch { .. })
        ));
    }
}
