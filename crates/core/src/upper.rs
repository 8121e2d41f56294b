use ndarray::{ArrayBase, Data, Ix2};

/// Number of strictly-upper-triangular entries of an `n x n` matrix.
#[inline]
pub fn upper_triangular_len(n: usize) -> usize {
    n * n.saturating_sub(1) / 2
}

/// Strictly-upper-triangular entries (row < col), row-major, widened to f64.
pub fn upper_triangle_of<S>(matrix: &ArrayBase<S, Ix2>) -> Vec<f64>
where
    S: Data<Elem = f32>,
{
    let n = matrix.nrows();
    let mut packed = Vec::with_capacity(upper_triangular_len(n));
    for (i, row) in matrix.outer_iter().enumerate() {
        packed.extend(row.iter().skip(i + 1).map(|&v| v as f64));
    }
    packed
}
