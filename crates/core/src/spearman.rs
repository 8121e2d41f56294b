use ndarray::{ArrayBase, Data, Ix2};

use crate::config::EngineConfig;
use crate::engine::RdmEngine;
use crate::error::{RdmError, RdmResult};
use crate::pearson::pearson;
use crate::rank::{rank_data, RankedMatrix};
use crate::rdm::Rdm;

/// Spearman rank correlation of two equal-length sequences.
///
/// Fails with [`RdmError::DegenerateComparison`] when either sequence is
/// constant or shorter than two entries.
pub fn spearman(x: &[f64], y: &[f64]) -> RdmResult<f64> {
    if x.len() != y.len() {
        return Err(RdmError::ShapeMismatch {
            context: "spearman sequences",
            expected: (x.len(), 1),
            actual: (y.len(), 1),
        });
    }
    let (rank_x, rank_y) = rayon::join(|| rank_data(x), || rank_data(y));
    pearson(&rank_x, &rank_y)
}

/// Spearman correlation-distance RDM of a `samples x features` response matrix.
pub fn distance_matrix<S>(data: &ArrayBase<S, Ix2>, config: &EngineConfig) -> RdmResult<Rdm>
where
    S: Data<Elem = f32> + Sync,
{
    let ranked = RankedMatrix::from_responses(data)?;
    RdmEngine::new(config.clone())?.compute(&ranked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol
    }

    #[test]
    fn monotone_transform_keeps_perfect_correlation() {
        let x = [0.1, 0.5, 0.2, 0.9, 0.3];
        let y: Vec<f64> = x.iter().map(|v| v * v * v + 4.0).collect();
        assert!(approx_eq(spearman(&x, &y).expect("defined"), 1.0, 1e-12));
    }

    #[test]
    fn constant_sequence_is_degenerate() {
        let err = spearman(&[1.0, 2.0, 3.0], &[0.5, 0.5, 0.5]).unwrap_err();
        assert!(matches!(err, RdmError::DegenerateComparison { len: 3 }));
    }

    #[test]
    fn length_mismatch_is_shape_error() {
        let err = spearman(&[1.0, 2.0, 3.0], &[0.5, 0.6]).unwrap_err();
        assert!(matches!(err, RdmError::ShapeMismatch { .. }));
    }

    #[test]
    fn distance_matrix_matches_rank_distances() {
        let data = array![[1.0f32, 2.0, 3.0, 4.0], [10.0, 20.0, 30.0, 40.0], [4.0, 3.0, 2.0, 1.0]];
        let rdm = distance_matrix(&data, &EngineConfig::default()).expect("rdm");
        assert!(approx_eq(rdm.get(0, 1) as f64, 0.0, 1e-6));
        assert!(approx_eq(rdm.get(0, 2) as f64, 2.0, 1e-6));
    }
}
