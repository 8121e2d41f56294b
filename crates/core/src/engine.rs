//! Chunked Spearman correlation-distance engine.
//!
//! Rows are split into blocks of at most `chunk_size`. Only block pairs on or
//! above the block diagonal are computed; each off-diagonal sub-block is
//! mirrored into the lower triangle. Peak scratch memory per step is
//! `O(chunk_size * features + chunk_size^2)` on top of the output matrix.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use ndarray::{s, Array2, ArrayBase, ArrayView2, ArrayViewMut2, Axis, Data, Ix2};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::chunk::{BlockPair, ChunkSpec};
use crate::config::{EngineConfig, Execution};
use crate::error::{RdmError, RdmResult};
use crate::pearson::{distance_block, RowStats};
use crate::rank::RankedMatrix;
use crate::rdm::Rdm;

/// Progress snapshot handed to the observer after each finished block pair.
#[derive(Clone, Debug)]
pub struct BlockProgress {
    pub completed: usize,
    pub total: usize,
    pub pair: BlockPair,
}

type ProgressFn = Arc<dyn Fn(&BlockProgress) + Send + Sync>;

pub struct RdmEngine {
    config: EngineConfig,
    chunk: ChunkSpec,
    cancel: Option<Arc<AtomicBool>>,
    progress: Option<ProgressFn>,
}

impl RdmEngine {
    pub fn new(config: EngineConfig) -> RdmResult<Self> {
        let chunk = ChunkSpec::new(config.chunk_size)?;
        Ok(Self {
            config,
            chunk,
            cancel: None,
            progress: None,
        })
    }

    /// Abort with [`RdmError::Aborted`] once `flag` is set; checked between block pairs.
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn with_progress<F>(mut self, observer: F) -> Self
    where
        F: Fn(&BlockProgress) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(observer));
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Rank-transform `data` and compute its RDM.
    pub fn compute_from_responses<S>(&self, data: &ArrayBase<S, Ix2>) -> RdmResult<Rdm>
    where
        S: Data<Elem = f32> + Sync,
    {
        let ranked = RankedMatrix::from_responses(data)?;
        self.compute(&ranked)
    }

    /// Full `n x n` correlation-distance matrix of the ranked rows.
    pub fn compute(&self, ranked: &RankedMatrix) -> RdmResult<Rdm> {
        let view = ranked.view();
        let n = view.nrows();
        let stats = RowStats::compute(view)?;
        let total = self.chunk.pair_count(n);

        info!(
            samples = n,
            features = view.ncols(),
            chunk_size = self.chunk.size(),
            block_pairs = total,
            execution = %self.config.execution,
            "computing chunked RDM"
        );

        let mut out = Array2::<f32>::zeros((n, n));
        match self.config.execution {
            Execution::Sequential => self.fill_sequential(view, &stats, out.view_mut(), total)?,
            Execution::Parallel => {
                self.fill_upper_parallel(view, &stats, out.view_mut(), total)?;
                self.mirror_upper(out.view_mut());
            }
        }
        out.diag_mut().fill(0.0);

        info!(samples = n, "finished chunked RDM");
        Ok(Rdm::from_computed(out))
    }

    fn fill_sequential(
        &self,
        data: ArrayView2<'_, f32>,
        stats: &RowStats,
        mut out: ArrayViewMut2<'_, f32>,
        total: usize,
    ) -> RdmResult<()> {
        let n = data.nrows();
        let mut completed = 0;

        for rows in self.chunk.blocks(n) {
            let lhs = stats.normalized_block(data, rows.clone());
            for cols in self.chunk.blocks(n).filter(|c| c.start >= rows.start) {
                self.check_cancel(completed, total)?;
                let pair = BlockPair {
                    rows: rows.clone(),
                    cols,
                };
                let block = self.pair_block(data, stats, &lhs, &pair);

                out.slice_mut(s![pair.rows.clone(), pair.cols.clone()])
                    .assign(&block);
                if !pair.is_diagonal() {
                    out.slice_mut(s![pair.cols.clone(), pair.rows.clone()])
                        .assign(&block.t());
                }

                completed += 1;
                self.report(pair, completed, total);
            }
        }
        Ok(())
    }

    /// Each rayon task owns one row band and fills its blocks at or right of the diagonal.
    fn fill_upper_parallel(
        &self,
        data: ArrayView2<'_, f32>,
        stats: &RowStats,
        mut out: ArrayViewMut2<'_, f32>,
        total: usize,
    ) -> RdmResult<()> {
        let n = data.nrows();
        let size = self.chunk.size();
        let completed = AtomicUsize::new(0);

        out.axis_chunks_iter_mut(Axis(0), size)
            .into_par_iter()
            .enumerate()
            .try_for_each(|(band_idx, mut band)| -> RdmResult<()> {
                let start = band_idx * size;
                let rows = start..start + band.nrows();
                let lhs = stats.normalized_block(data, rows.clone());

                for cols in self.chunk.blocks(n).filter(|c| c.start >= start) {
                    self.check_cancel(completed.load(Ordering::Relaxed), total)?;
                    let pair = BlockPair {
                        rows: rows.clone(),
                        cols,
                    };
                    let block = self.pair_block(data, stats, &lhs, &pair);
                    band.slice_mut(s![.., pair.cols.clone()]).assign(&block);

                    let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                    self.report(pair, done, total);
                }
                Ok(())
            })
    }

    /// Copy every off-diagonal upper block into its transposed lower position.
    fn mirror_upper(&self, mut out: ArrayViewMut2<'_, f32>) {
        let n = out.nrows();
        for pair in self.chunk.block_pairs(n).filter(|p| !p.is_diagonal()) {
            let upper = out
                .slice(s![pair.rows.clone(), pair.cols.clone()])
                .t()
                .to_owned();
            out.slice_mut(s![pair.cols, pair.rows]).assign(&upper);
        }
    }

    fn pair_block(
        &self,
        data: ArrayView2<'_, f32>,
        stats: &RowStats,
        lhs: &Array2<f64>,
        pair: &BlockPair,
    ) -> Array2<f32> {
        if pair.is_diagonal() {
            let mut block = distance_block(lhs, lhs);
            symmetrize_from_upper(&mut block);
            block
        } else {
            let rhs = stats.normalized_block(data, pair.cols.clone());
            distance_block(lhs, &rhs)
        }
    }

    fn check_cancel(&self, completed: usize, total: usize) -> RdmResult<()> {
        match &self.cancel {
            Some(flag) if flag.load(Ordering::Relaxed) => {
                Err(RdmError::Aborted { completed, total })
            }
            _ => Ok(()),
        }
    }

    fn report(&self, pair: BlockPair, completed: usize, total: usize) {
        debug!(
            rows = ?pair.rows,
            cols = ?pair.cols,
            completed,
            total,
            "block pair done"
        );
        let every = self.config.progress_every.max(1);
        if completed % every == 0 || completed == total {
            info!(completed, total, "RDM progress");
        }
        if let Some(observer) = &self.progress {
            observer(&BlockProgress {
                completed,
                total,
                pair,
            });
        }
    }
}

/// Overwrite the strict lower triangle of a square block with its upper triangle.
fn symmetrize_from_upper(block: &mut Array2<f32>) {
    let n = block.nrows();
    for i in 0..n {
        for j in i + 1..n {
            block[[j, i]] = block[[i, j]];
        }
    }
}
