use crate::{BlockId, BlockPlan, TransferError, TransferResult, MAX_BLOCK_COUNT};

/// Splits `len` bytes into consecutive blocks of `block_size`.
///
/// The last block holds the remainder. Planning is pure, so calling
/// [`blocks`](Self::blocks) again replays the same sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlanner {
    len: u64,
    block_size: u64,
}

impl ChunkPlanner {
    /// Plan `len` bytes; fails on a zero block size or too many blocks
    pub fn new(len: u64, block_size: u64) -> TransferResult<Self> {
        if block_size == 0 {
            return Err(TransferError::invalid("block_size must be greater than zero"));
        }
        let planner = Self { len, block_size };
        if planner.block_count() > MAX_BLOCK_COUNT {
            return Err(TransferError::invalid(format!(
                "{} bytes in blocks of {} exceeds the block index range",
                len, block_size
            )));
        }
        Ok(planner)
    }

    /// Source length in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True for a zero-length source
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of every block but the last
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Number of planned blocks
    pub fn block_count(&self) -> u64 {
        self.len.div_ceil(self.block_size)
    }

    /// Iterate the plan from the first block
    pub fn blocks(&self) -> Blocks {
        Blocks {
            planner: *self,
            next: 0,
        }
    }
}

impl IntoIterator for &ChunkPlanner {
    type Item = BlockPlan;
    type IntoIter = Blocks;

    fn into_iter(self) -> Blocks {
        self.blocks()
    }
}

/// Lazy iterator over a [`ChunkPlanner`]'s blocks
#[derive(Debug, Clone)]
pub struct Blocks {
    planner: ChunkPlanner,
    next: u64,
}

impl Iterator for Blocks {
    type Item = BlockPlan;

    fn next(&mut self) -> Option<BlockPlan> {
        let start = self.next.checked_mul(self.planner.block_size)?;
        if start >= self.planner.len {
            return None;
        }
        let end = start.saturating_add(self.planner.block_size).min(self.planner.len);
        // block_count() is bounded by MAX_BLOCK_COUNT
        let index = self.next as u32;
        self.next += 1;
        Some(BlockPlan {
            index,
            id: BlockId::from_index(index),
            range: start..end,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.planner.block_count().saturating_sub(self.next) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Blocks {}
