use std::io::Write;

use ndarray::{s, Array2, ArrayView2};

use crate::error::{RdmError, RdmResult};
use crate::upper::upper_triangle_of;

const SYMMETRY_TOL: f32 = 1e-6;

/// Representational dissimilarity matrix: square, finite and symmetric.
/// Immutable once built.
///
/// Matrices produced by the engine also have a zero diagonal and entries in
/// `[0, 2]`. [`Rdm::from_array`] does not enforce those two properties, so
/// externally built dissimilarities on another scale can be compared too.
#[derive(Clone, Debug, PartialEq)]
pub struct Rdm {
    data: Array2<f32>,
}

/// One thresholded upper-triangle entry.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Edge {
    pub i: usize,
    pub j: usize,
    pub distance: f32,
}

impl Rdm {
    /// Wrap an externally produced dissimilarity matrix after checking that it
    /// is non-empty, square, finite and symmetric within `1e-6`.
    pub fn from_array(data: Array2<f32>) -> RdmResult<Self> {
        let (rows, cols) = data.dim();
        if rows != cols {
            return Err(RdmError::NotSquare { rows, cols });
        }
        if rows == 0 {
            return Err(RdmError::EmptyMatrix { rows, cols });
        }
        if let Some(((row, col), _)) = data.indexed_iter().find(|(_, v)| !v.is_finite()) {
            return Err(RdmError::NonFinite { row, col });
        }
        for i in 0..rows {
            for j in i + 1..rows {
                if (data[[i, j]] - data[[j, i]]).abs() > SYMMETRY_TOL {
                    return Err(RdmError::Asymmetric { row: i, col: j });
                }
            }
        }
        Ok(Self { data })
    }

    /// Engine output is symmetric by construction.
    pub(crate) fn from_computed(data: Array2<f32>) -> Self {
        Self { data }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.data.nrows()
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f32 {
        self.data[[i, j]]
    }

    pub fn view(&self) -> ArrayView2<'_, f32> {
        self.data.view()
    }

    pub fn into_inner(self) -> Array2<f32> {
        self.data
    }

    pub fn upper_triangle(&self) -> Vec<f64> {
        upper_triangle_of(&self.data)
    }

    /// Top-left `size x size` corner, clamped to the matrix size.
    pub fn preview(&self, size: usize) -> Array2<f32> {
        let k = size.min(self.size());
        self.data.slice(s![..k, ..k]).to_owned()
    }

    /// Principal submatrix selecting `indices` on both axes.
    pub fn select(&self, indices: &[usize]) -> RdmResult<Array2<f32>> {
        let n = self.size();
        if let Some(&index) = indices.iter().find(|&&i| i >= n) {
            return Err(RdmError::IndexOutOfBounds { index, len: n });
        }
        let k = indices.len();
        Ok(Array2::from_shape_fn((k, k), |(a, b)| {
            self.data[[indices[a], indices[b]]]
        }))
    }

    /// Smallest per-row maximum distance.
    pub fn enclosing_radius(&self) -> f32 {
        self.data
            .outer_iter()
            .map(|row| row.iter().cloned().fold(f32::MIN, f32::max))
            .fold(f32::MAX, f32::min)
    }

    /// Upper-triangle entries with distance `<= cutoff`, in row-major order.
    pub fn edges_within(&self, cutoff: f32) -> impl Iterator<Item = Edge> + '_ {
        self.data.outer_iter().enumerate().flat_map(move |(i, row)| {
            row.into_iter()
                .enumerate()
                .skip(i + 1)
                .filter(move |&(_, &d)| d <= cutoff)
                .map(move |(j, &distance)| Edge { i, j, distance })
        })
    }

    /// Stream the thresholded edge list as headerless `i,j,distance` CSV,
    /// flushing after every block of `chunk_rows` rows. Returns the edge count.
    pub fn write_edge_list<W: Write>(
        &self,
        writer: W,
        cutoff: f32,
        chunk_rows: usize,
    ) -> RdmResult<usize> {
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(writer);
        let chunk_rows = chunk_rows.max(1);
        let mut count = 0;
        let mut last_flushed_row = 0;

        for edge in self.edges_within(cutoff) {
            if edge.i >= last_flushed_row + chunk_rows {
                wtr.flush()?;
                last_flushed_row = edge.i;
            }
            wtr.write_record(&[
                edge.i.to_string(),
                edge.j.to_string(),
                edge.distance.to_string(),
            ])?;
            count += 1;
        }
        wtr.flush()?;
        Ok(count)
    }
}
