// SPDX-License-Identifier: MPL-2.0

use crate::prelude::*;

/// The pointers to blocks for an inode.
///
/// Every pointer is either a block owned by the inode or `INVALID_BID`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod)]
pub struct BlockPtrs {
    inner: [u32; BLOCK_PTR_CNT],
}

impl BlockPtrs {
    /// Creates pointers with nothing allocated.
    pub fn new() -> Self {
        Self {
            inner: [INVALID_BID; BLOCK_PTR_CNT],
        }
    }

    /// Returns the direct block ID.
    ///
    /// # Panic
    ///
    /// If the `idx` is out of bounds, this method will panic.
    pub fn direct(&self, idx: usize) -> Bid {
        assert!(DIRECT_RANGE.contains(&idx));
        self.inner[idx]
    }

    /// Sets the direct block ID.
    ///
    /// # Panic
    ///
    /// If the `idx` is out of bounds, this method will panic.
    pub fn set_direct(&mut self, idx: usize, bid: Bid) {
        assert!(DIRECT_RANGE.contains(&idx));
        self.inner[idx] = bid;
    }

    /// Returns the block ID of single indirect block pointer.
    pub fn indirect(&self) -> Bid {
        self.inner[INDIRECT]
    }

    /// Sets the block ID of single indirect block pointer.
    pub fn set_indirect(&mut self, bid: Bid) {
        self.inner[INDIRECT] = bid;
    }

    /// Returns the block ID of double indirect block pointer.
    pub fn db_indirect(&self) -> Bid {
        self.inner[DB_INDIRECT]
    }

    /// Sets the block ID of double indirect block pointer.
    pub fn set_db_indirect(&mut self, bid: Bid) {
        self.inner[DB_INDIRECT] = bid;
    }

    /// Returns the direct pointers.
    pub fn directs(&self) -> &[Bid] {
        &self.inner[DIRECT_RANGE]
    }
}

impl Default for BlockPtrs {
    fn default() -> Self {
        Self::new()
    }
}

/// Where the pointer to one data block of a file is stored.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BidPath {
    /// The pointer is the given direct slot of the inode.
    Direct(usize),
    /// The pointer is the given entry of the single indirect block.
    Indirect(usize),
    /// The first `usize` is the entry of the double indirect block naming an
    /// indirect block, the second is the entry within that indirect block.
    DbIndirect(usize, usize),
}

impl TryFrom<usize> for BidPath {
    type Error = FsError;

    /// Locates the pointer of the `idx`-th block of a file.
    fn try_from(idx: usize) -> Result<Self> {
        if idx < DIRECT_CNT {
            Ok(Self::Direct(idx))
        } else if idx < DIRECT_CNT + INDIRECT_CNT {
            Ok(Self::Indirect(idx - DIRECT_CNT))
        } else if idx < MAX_BLOCKS {
            let db_indirect_idx = idx - (DIRECT_CNT + INDIRECT_CNT);
            let lvl1_idx = db_indirect_idx / INDIRECT_CNT;
            let lvl2_idx = db_indirect_idx % INDIRECT_CNT;
            Ok(Self::DbIndirect(lvl1_idx, lvl2_idx))
        } else {
            Err(FsError::InvalidParam)
        }
    }
}

impl BidPath {
    /// Returns the last level index.
    ///
    /// This is the position of the pointer within the most deeply nested
    /// block holding it, or the direct slot if no indirection is involved.
    pub fn last_lvl_idx(&self) -> usize {
        match self {
            Self::Direct(idx) | Self::Indirect(idx) | Self::DbIndirect(_, idx) => *idx,
        }
    }
}

/// Direct pointers to blocks.
pub const DIRECT_RANGE: core::ops::Range<usize> = 0..123;
/// The number of direct blocks.
pub const DIRECT_CNT: usize = DIRECT_RANGE.end;

/// Indirect pointer to blocks.
pub const INDIRECT: usize = DIRECT_RANGE.end;
/// The number of block IDs held by one indirect block.
pub const INDIRECT_CNT: usize = BLOCK_SIZE / BID_SIZE;

/// Doubly indirect pointer to blocks.
pub const DB_INDIRECT: usize = INDIRECT + 1;
/// The number of doubly indirect blocks.
pub const DB_INDIRECT_CNT: usize = INDIRECT_CNT * INDIRECT_CNT;

/// The number of block pointers.
pub const BLOCK_PTR_CNT: usize = DB_INDIRECT + 1;

/// The most data blocks one inode can address.
pub const MAX_BLOCKS: usize = DIRECT_CNT + INDIRECT_CNT + DB_INDIRECT_CNT;
/// The largest file size in bytes.
pub const MAX_FILE_SIZE: usize = MAX_BLOCKS * BLOCK_SIZE;

/// The size of of the block id.
pub const BID_SIZE: usize = size_of::<u32>();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locates_tier_boundaries() {
        assert_eq!(BidPath::try_from(0), Ok(BidPath::Direct(0)));
        assert_eq!(BidPath::try_from(122), Ok(BidPath::Direct(122)));
        assert_eq!(BidPath::try_from(123), Ok(BidPath::Indirect(0)));
        assert_eq!(BidPath::try_from(250), Ok(BidPath::Indirect(127)));
        assert_eq!(BidPath::try_from(251), Ok(BidPath::DbIndirect(0, 0)));
        assert_eq!(BidPath::try_from(251 + 129), Ok(BidPath::DbIndirect(1, 1)));
        assert_eq!(
            BidPath::try_from(MAX_BLOCKS - 1),
            Ok(BidPath::DbIndirect(127, 127))
        );
        assert_eq!(BidPath::try_from(MAX_BLOCKS), Err(FsError::InvalidParam));
    }

    #[test]
    fn new_pointers_are_invalid() {
        let ptrs = BlockPtrs::new();
        assert!(ptrs.directs().iter().all(|&bid| bid == INVALID_BID));
        assert_eq!(ptrs.indirect(), INVALID_BID);
        assert_eq!(ptrs.db_indirect(), INVALID_BID);
        assert_eq!(MAX_FILE_SIZE, 8_517_120);
    }
}
