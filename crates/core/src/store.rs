//! Directory-backed persistence for RDMs with lazy random access.
//!
//! Each RDM lives in `<root>/<key>.rdm`:
//!
//! ```text
//! magic  8 bytes   "RDMF32\0\x01"
//! n      u64 LE    dimension
//! data   n*n f32 LE, row-major
//! ```
//!
//! Files are immutable once renamed into place. [`LazyRdm`] opens its own
//! read-only handle per call, so any number of readers can slice the same
//! matrix concurrently without locking.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use ndarray::Array2;
use tracing::{debug, info};

use crate::error::{RdmError, RdmResult};
use crate::rdm::Rdm;
use crate::upper::upper_triangular_len;

pub const RDM_MAGIC: [u8; 8] = *b"RDMF32\0\x01";
const HEADER_LEN: u64 = 16;
const EXTENSION: &str = "rdm";

/// Square dissimilarity matrix that can be sliced without being fully resident.
pub trait RdmSource {
    fn size(&self) -> usize;

    /// Strictly-upper-triangular entries, row-major.
    fn upper_triangle(&self) -> RdmResult<Vec<f64>>;

    /// `indices.len() x indices.len()` submatrix selecting `indices` on both axes.
    fn principal_submatrix(&self, indices: &[usize]) -> RdmResult<Array2<f32>>;
}

impl RdmSource for Rdm {
    fn size(&self) -> usize {
        Rdm::size(self)
    }

    fn upper_triangle(&self) -> RdmResult<Vec<f64>> {
        Ok(Rdm::upper_triangle(self))
    }

    fn principal_submatrix(&self, indices: &[usize]) -> RdmResult<Array2<f32>> {
        self.select(indices)
    }
}

#[derive(Clone, Debug)]
pub struct RdmStore {
    root: PathBuf,
}

impl RdmStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> RdmResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn contains(&self, key: &str) -> bool {
        self.path_for(key).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Persist `rdm` under `key`, replacing any previous matrix with that key.
    pub fn save(&self, key: &str, rdm: &Rdm) -> RdmResult<PathBuf> {
        let path = self.path_for(key)?;
        let tmp = path.with_extension("rdm.tmp");
        let n = rdm.size();

        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            out.write_all(&RDM_MAGIC)?;
            out.write_all(&(n as u64).to_le_bytes())?;
            let mut row_bytes = Vec::with_capacity(n * 4);
            for row in rdm.view().outer_iter() {
                row_bytes.clear();
                for &v in row.iter() {
                    row_bytes.extend_from_slice(&v.to_le_bytes());
                }
                out.write_all(&row_bytes)?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        info!(key, size = n, path = %path.display(), "stored RDM");
        Ok(path)
    }

    /// Load the full matrix into memory.
    pub fn load(&self, key: &str) -> RdmResult<Rdm> {
        let lazy = self.open_lazy(key)?;
        let n = lazy.size();
        let mut file = lazy.open_at_row(0)?;
        let values = read_f32s(&mut file, n * n)?;
        let data = Array2::from_shape_vec((n, n), values).map_err(|e| RdmError::CorruptStore {
            path: lazy.path.clone(),
            reason: e.to_string(),
        })?;
        debug!(key, size = n, "loaded RDM");
        Ok(Rdm::from_computed(data))
    }

    /// Validate the file header and return a handle that reads on demand.
    pub fn open_lazy(&self, key: &str) -> RdmResult<LazyRdm> {
        let path = self.path_for(key)?;
        if !path.is_file() {
            return Err(RdmError::StoreNotFound {
                key: key.to_string(),
            });
        }
        LazyRdm::open(path)
    }

    /// Keys of all stored matrices, sorted.
    pub fn keys(&self) -> RdmResult<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(stem.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    pub fn remove(&self, key: &str) -> RdmResult<()> {
        let path = self.path_for(key)?;
        if !path.is_file() {
            return Err(RdmError::StoreNotFound {
                key: key.to_string(),
            });
        }
        fs::remove_file(path)?;
        Ok(())
    }

    fn path_for(&self, key: &str) -> RdmResult<PathBuf> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '+'));
        if !valid {
            return Err(RdmError::InvalidKey {
                key: key.to_string(),
            });
        }
        Ok(self.root.join(format!("{key}.{EXTENSION}")))
    }
}

/// On-demand view of a stored RDM. Holds only the path and dimension.
#[derive(Clone, Debug)]
pub struct LazyRdm {
    path: PathBuf,
    n: usize,
}

impl LazyRdm {
    pub fn open(path: PathBuf) -> RdmResult<Self> {
        let mut file = File::open(&path)?;
        let corrupt = |reason: String| RdmError::CorruptStore {
            path: path.clone(),
            reason,
        };

        let mut header = [0u8; HEADER_LEN as usize];
        file.read_exact(&mut header)
            .map_err(|e| corrupt(format!("short header: {e}")))?;
        if header[..8] != RDM_MAGIC {
            return Err(corrupt("bad magic".into()));
        }
        let mut dim = [0u8; 8];
        dim.copy_from_slice(&header[8..]);
        let n = u64::from_le_bytes(dim);

        let expected = n
            .checked_mul(n)
            .and_then(|cells| cells.checked_mul(4))
            .and_then(|bytes| bytes.checked_add(HEADER_LEN))
            .ok_or_else(|| corrupt(format!("dimension {n} overflows")))?;
        let actual = file.metadata()?.len();
        if actual != expected {
            return Err(corrupt(format!(
                "expected {expected} bytes for dimension {n}, found {actual}"
            )));
        }

        Ok(Self {
            path,
            n: n as usize,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn row(&self, i: usize) -> RdmResult<Vec<f32>> {
        self.check_index(i)?;
        let mut file = self.open_at_row(i)?;
        read_f32s(&mut file, self.n)
    }

    /// Rectangular block `rows x cols`.
    pub fn block(&self, rows: Range<usize>, cols: Range<usize>) -> RdmResult<Array2<f32>> {
        if rows.end > self.n || cols.end > self.n {
            return Err(RdmError::IndexOutOfBounds {
                index: rows.end.max(cols.end),
                len: self.n,
            });
        }
        let width = cols.len();
        let mut file = File::open(&self.path)?;
        let mut values = Vec::with_capacity(rows.len() * width);
        for i in rows.clone() {
            file.seek(SeekFrom::Start(self.offset(i, cols.start)))?;
            values.extend(read_f32s(&mut file, width)?);
        }
        Array2::from_shape_vec((rows.len(), width), values).map_err(|e| RdmError::CorruptStore {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    /// Top-left corner, reading only the rows it needs.
    pub fn preview(&self, size: usize) -> RdmResult<Array2<f32>> {
        let k = size.min(self.n);
        self.block(0..k, 0..k)
    }

    pub fn load(&self) -> RdmResult<Rdm> {
        Ok(Rdm::from_computed(self.block(0..self.n, 0..self.n)?))
    }

    fn open_at_row(&self, i: usize) -> RdmResult<File> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset(i, 0)))?;
        Ok(file)
    }

    #[inline]
    fn offset(&self, i: usize, j: usize) -> u64 {
        HEADER_LEN + ((i * self.n + j) as u64) * 4
    }

    fn check_index(&self, i: usize) -> RdmResult<()> {
        if i >= self.n {
            return Err(RdmError::IndexOutOfBounds {
                index: i,
                len: self.n,
            });
        }
        Ok(())
    }
}

impl RdmSource for LazyRdm {
    fn size(&self) -> usize {
        self.n
    }

    fn upper_triangle(&self) -> RdmResult<Vec<f64>> {
        let mut packed = Vec::with_capacity(upper_triangular_len(self.n));
        let mut file = self.open_at_row(0)?;
        for i in 0..self.n {
            let row = read_f32s(&mut file, self.n)?;
            packed.extend(row[i + 1..].iter().map(|&v| v as f64));
        }
        Ok(packed)
    }

    fn principal_submatrix(&self, indices: &[usize]) -> RdmResult<Array2<f32>> {
        if let Some(&index) = indices.iter().find(|&&i| i >= self.n) {
            return Err(RdmError::IndexOutOfBounds { index, len: self.n });
        }
        let k = indices.len();
        let mut file = File::open(&self.path)?;
        let mut sub = Array2::<f32>::zeros((k, k));
        for (a, &i) in indices.iter().enumerate() {
            file.seek(SeekFrom::Start(self.offset(i, 0)))?;
            let row = read_f32s(&mut file, self.n)?;
            for (b, &j) in indices.iter().enumerate() {
                sub[[a, b]] = row[j];
            }
        }
        Ok(sub)
    }
}

/// Read `count` little-endian f32 values from the current position.
fn read_f32s<R: Read>(reader: &mut R, count: usize) -> RdmResult<Vec<f32>> {
    let mut bytes = vec![0u8; count * 4];
    reader.read_exact(&mut bytes)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
