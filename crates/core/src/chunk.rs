use std::ops::Range;

use crate::error::{RdmError, RdmResult};

/// Row block size for the distance engine.
///
/// Changing it trades peak memory for wall-clock time; it never changes the
/// intended numeric result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkSpec {
    size: usize,
}

/// Two row blocks whose cross distances form one sub-block of the RDM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockPair {
    pub rows: Range<usize>,
    pub cols: Range<usize>,
}

impl BlockPair {
    #[inline]
    pub fn is_diagonal(&self) -> bool {
        self.rows == self.cols
    }
}

impl ChunkSpec {
    pub fn new(size: usize) -> RdmResult<Self> {
        if size == 0 {
            return Err(RdmError::InvalidConfig("chunk size must be greater than 0".into()));
        }
        Ok(Self { size })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Contiguous row ranges covering `0..n`, each at most `size` long.
    pub fn blocks(self, n: usize) -> impl Iterator<Item = Range<usize>> {
        let size = self.size;
        (0..n).step_by(size).map(move |start| start..(start + size).min(n))
    }

    pub fn block_count(&self, n: usize) -> usize {
        (n + self.size - 1) / self.size
    }

    /// Block pairs on and above the block diagonal, in row-major order.
    pub fn block_pairs(self, n: usize) -> impl Iterator<Item = BlockPair> {
        self.blocks(n).flat_map(move |rows| {
            let first = rows.start;
            self.blocks(n)
                .filter(move |cols| cols.start >= first)
                .map(move |cols| BlockPair {
                    rows: rows.clone(),
                    cols,
                })
        })
    }

    pub fn pair_count(&self, n: usize) -> usize {
        let b = self.block_count(n);
        b * (b + 1) / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_cover_range_with_short_tail() {
        let chunks = ChunkSpec::new(4).expect("spec");
        let blocks: Vec<_> = chunks.blocks(10).collect();
        assert_eq!(blocks, vec![0..4, 4..8, 8..10]);
        assert_eq!(chunks.block_count(10), 3);
        assert_eq!(chunks.blocks(0).count(), 0);
    }

    #[test]
    fn pairs_form_block_upper_triangle() {
        let chunks = ChunkSpec::new(4).expect("spec");
        let pairs: Vec<_> = chunks.block_pairs(10).collect();
        assert_eq!(pairs.len(), chunks.pair_count(10));
        assert_eq!(pairs.len(), 6);
        assert!(pairs.iter().all(|p| p.rows.start <= p.cols.start));
        assert_eq!(pairs.iter().filter(|p| p.is_diagonal()).count(), 3);
        assert_eq!(pairs[1], BlockPair { rows: 0..4, cols: 4..8 });
    }

    #[test]
    fn chunk_larger_than_input_is_single_block() {
        let chunks = ChunkSpec::new(100).expect("spec");
        assert_eq!(chunks.blocks(7).collect::<Vec<_>>(), vec![0..7]);
        assert_eq!(chunks.pair_count(7), 1);
    }

    #[test]
    fn zero_size_is_rejected() {
        assert!(ChunkSpec::new(0).is_err());
    }
}
