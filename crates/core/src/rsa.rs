//! Second-order comparison of RDMs (representational similarity analysis).

use std::fs::File;
use std::io::{Cursor, Write};
use std::path::Path;

use csv::WriterBuilder;
use flate2::{write::GzEncoder, Compression};
use ndarray::{Array2, ArrayView2};
use rand::{rngs::StdRng, seq::index, SeedableRng};
use tar::{Builder, Header};
use tracing::{debug, info};

use crate::config::RsaConfig;
use crate::error::{RdmError, RdmResult};
use crate::spearman::spearman;
use crate::store::RdmSource;
use crate::upper::upper_triangle_of;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareMode {
    /// Rank-correlate the full strict upper triangles.
    Exact,
    /// Compare the principal submatrices on a shared random index subset.
    Subsampled { max_samples: usize, seed: u64 },
}

impl From<&RsaConfig> for CompareMode {
    fn from(config: &RsaConfig) -> Self {
        match config.max_samples {
            Some(max_samples) => CompareMode::Subsampled {
                max_samples,
                seed: config.seed,
            },
            None => CompareMode::Exact,
        }
    }
}

/// `min(k, n)` distinct indices from `0..n`, sorted, reproducible for a given seed.
pub fn sample_indices(n: usize, k: usize, seed: u64) -> Vec<usize> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut picked = index::sample(&mut rng, n, k.min(n)).into_vec();
    picked.sort_unstable();
    picked
}

pub fn compare<A, B>(a: &A, b: &B, mode: CompareMode) -> RdmResult<f64>
where
    A: RdmSource + ?Sized,
    B: RdmSource + ?Sized,
{
    match mode {
        CompareMode::Exact => compare_exact(a, b),
        CompareMode::Subsampled { max_samples, seed } => compare_subsampled(a, b, max_samples, seed),
    }
}

/// Spearman correlation between the strict upper triangles of two equally sized RDMs.
pub fn compare_exact<A, B>(a: &A, b: &B) -> RdmResult<f64>
where
    A: RdmSource + ?Sized,
    B: RdmSource + ?Sized,
{
    check_same_size(a, b)?;
    let upper_a = a.upper_triangle()?;
    let upper_b = b.upper_triangle()?;
    spearman(&upper_a, &upper_b)
}

/// Exact comparison restricted to one random subset of rows/columns shared
/// by both RDMs. `max_samples >= n` compares the full matrices.
pub fn compare_subsampled<A, B>(a: &A, b: &B, max_samples: usize, seed: u64) -> RdmResult<f64>
where
    A: RdmSource + ?Sized,
    B: RdmSource + ?Sized,
{
    let n = check_same_size(a, b)?;
    let picked = sample_indices(n, max_samples, seed);
    debug!(size = n, samples = picked.len(), seed, "subsampled RSA");

    let sub_a = a.principal_submatrix(&picked)?;
    let sub_b = b.principal_submatrix(&picked)?;
    spearman(&upper_triangle_of(&sub_a), &upper_triangle_of(&sub_b))
}

fn check_same_size<A, B>(a: &A, b: &B) -> RdmResult<usize>
where
    A: RdmSource + ?Sized,
    B: RdmSource + ?Sized,
{
    let (n, m) = (a.size(), b.size());
    if n != m {
        return Err(RdmError::ShapeMismatch {
            context: "RSA comparison",
            expected: (n, n),
            actual: (m, m),
        });
    }
    Ok(n)
}

/// Square matrix of pairwise RSA scores, indexed by group name.
///
/// The order of `names` is part of the result: row/column `i` belongs to `names[i]`.
#[derive(Clone, Debug, PartialEq)]
pub struct RsaMatrix {
    names: Vec<String>,
    values: Array2<f64>,
}

impl RsaMatrix {
    /// Compare every pair of `sources` once; the diagonal is 1.0 by definition.
    pub fn build<S: RdmSource>(names: &[String], sources: &[S], mode: CompareMode) -> RdmResult<Self> {
        if names.len() != sources.len() {
            return Err(RdmError::ShapeMismatch {
                context: "RSA group names",
                expected: (sources.len(), 1),
                actual: (names.len(), 1),
            });
        }
        let k = names.len();
        let total = k * k.saturating_sub(1) / 2;
        info!(groups = k, comparisons = total, ?mode, "building RSA matrix");

        let mut values = Array2::<f64>::eye(k);
        let mut done = 0;
        for i in 0..k {
            for j in i + 1..k {
                let score = compare(&sources[i], &sources[j], mode)
                    .map_err(|e| e.in_group(format!("{} vs {}", names[i], names[j])))?;
                values[[i, j]] = score;
                values[[j, i]] = score;
                done += 1;
                info!(a = %names[i], b = %names[j], score, done, total, "RSA pair");
            }
        }

        Ok(Self {
            names: names.to_vec(),
            values,
        })
    }

    /// Element-wise mean of matrices that share the same group order.
    pub fn mean(matrices: &[RsaMatrix]) -> RdmResult<Self> {
        let first = matrices
            .first()
            .ok_or(RdmError::EmptyMatrix { rows: 0, cols: 0 })?;
        let mut sum = Array2::<f64>::zeros(first.values.dim());
        for m in matrices {
            if m.names != first.names {
                return Err(RdmError::GroupMismatch {
                    expected: first.names.clone(),
                    actual: m.names.clone(),
                });
            }
            sum += &m.values;
        }
        sum /= matrices.len() as f64;
        Ok(Self {
            names: first.names.clone(),
            values: sum,
        })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn get(&self, a: &str, b: &str) -> Option<f64> {
        let i = self.names.iter().position(|n| n == a)?;
        let j = self.names.iter().position(|n| n == b)?;
        Some(self.values[[i, j]])
    }

    /// Tab-separated table: header of group names, one labelled row per group.
    pub fn write_tsv<W: Write>(&self, writer: W) -> RdmResult<()> {
        let mut wtr = WriterBuilder::new().delimiter(b'\t').from_writer(writer);
        wtr.write_record(std::iter::once("").chain(self.names.iter().map(String::as_str)))?;
        for (i, name) in self.names.iter().enumerate() {
            let row_vals: Vec<String> = self.values.row(i).iter().map(|v| v.to_string()).collect();
            wtr.write_record(std::iter::once(name.as_str()).chain(row_vals.iter().map(String::as_str)))?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Write the TSV table as the single entry `<stem>_rsa.tsv` of a gzipped tarball.
    pub fn write_tar_gz(&self, path: &Path, stem: &str) -> RdmResult<()> {
        let mut tsv = Vec::<u8>::new();
        self.write_tsv(&mut tsv)?;

        let enc = GzEncoder::new(File::create(path)?, Compression::default());
        let mut tar_builder = Builder::new(enc);
        let mut header = Header::new_gnu();
        header.set_size(tsv.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar_builder.append_data(&mut header, format!("{stem}_rsa.tsv"), &mut Cursor::new(tsv))?;
        tar_builder.into_inner()?.finish()?;

        info!(path = %path.display(), "wrote RSA matrix");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdm::Rdm;
    use ndarray::array;

    fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol
    }

    fn rdm_a() -> Rdm {
        Rdm::from_array(array![
            [0.0f32, 0.2, 0.8, 0.5],
            [0.2, 0.0, 0.4, 0.9],
            [0.8, 0.4, 0.0, 0.3],
            [0.5, 0.9, 0.3, 0.0]
        ])
        .expect("valid")
    }

    #[test]
    fn sampled_indices_are_distinct_sorted_and_clamped() {
        let idx = sample_indices(50, 10, 42);
        assert_eq!(idx.len(), 10);
        assert!(idx.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(idx, sample_indices(50, 10, 42));
        assert_eq!(sample_indices(5, 100, 1), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn shifted_rdm_compares_perfectly() {
        let a = rdm_a();
        let shifted = a.view().mapv(|v| if v == 0.0 { 0.0 } else { v + 0.5 });
        let b = Rdm::from_array(shifted).expect("valid");
        assert!(approx_eq(compare_exact(&a, &b).expect("score"), 1.0, 1e-12));
        assert!(approx_eq(compare_exact(&b, &a).expect("score"), 1.0, 1e-12));
    }

    #[test]
    fn size_mismatch_is_contract_error() {
        let small = Rdm::from_array(array![[0.0f32, 1.0], [1.0, 0.0]]).expect("valid");
        assert!(matches!(
            compare_exact(&rdm_a(), &small),
            Err(RdmError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn oversized_subsample_equals_exact() {
        let a = rdm_a();
        let b = Rdm::from_array(array![
            [0.0f32, 0.1, 0.7, 0.6],
            [0.1, 0.0, 0.2, 0.8],
            [0.7, 0.2, 0.0, 0.5],
            [0.6, 0.8, 0.5, 0.0]
        ])
        .expect("valid");
        let exact = compare_exact(&a, &b).expect("exact");
        let sub = compare_subsampled(&a, &b, 100, 9).expect("subsampled");
        assert!(approx_eq(exact, sub, 1e-12));
    }

    #[test]
    fn matrix_has_unit_diagonal_and_named_lookup() {
        let names = vec!["V1".to_string(), "V2".to_string()];
        let rsa = RsaMatrix::build(&names, &[rdm_a(), rdm_a()], CompareMode::Exact).expect("rsa");
        assert_eq!(rsa.values()[[0, 0]], 1.0);
        assert!(approx_eq(rsa.get("V1", "V2").expect("pair"), 1.0, 1e-12));
        assert_eq!(rsa.get("V1", "V9"), None);
    }

    #[test]
    fn mean_requires_matching_names() {
        let names = vec!["V1".to_string(), "V2".to_string()];
        let rsa = RsaMatrix::build(&names, &[rdm_a(), rdm_a()], CompareMode::Exact).expect("rsa");
        let mean = RsaMatrix::mean(&[rsa.clone(), rsa.clone()]).expect("mean");
        assert_eq!(mean.names(), rsa.names());

        let other = RsaMatrix {
            names: vec!["V2".to_string(), "V1".to_string()],
            values: Array2::eye(2),
        };
        assert!(matches!(
            RsaMatrix::mean(&[rsa, other]),
            Err(RdmError::GroupMismatch { .. })
        ));
        assert!(RsaMatrix::mean(&[]).is_err());
    }

    #[test]
    fn tsv_keeps_group_order() {
        let rsa = RsaMatrix {
            names: vec!["V2".to_string(), "V1".to_string()],
            values: array![[1.0, 0.5], [0.5, 1.0]],
        };
        let mut buf = Vec::new();
        rsa.write_tsv(&mut buf).expect("tsv");
        assert_eq!(
            String::from_utf8(buf).expect("utf8"),
            "\tV2\tV1\nV2\t1\t0.5\nV1\t0.5\t1\n"
        );
    }
}
