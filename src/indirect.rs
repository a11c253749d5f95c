// SPDX-License-Identifier: MPL-2.0

use crate::{
    block_ptr::{BID_SIZE, INDIRECT_CNT},
    prelude::*,
};

/// An index block: a block holding `INDIRECT_CNT` block IDs.
///
/// All accesses go through the block cache, so index blocks share its
/// capacity and write-back policy with data blocks.
pub(crate) struct IndirectBlock<'a> {
    bid: Bid,
    cache: &'a BlockCache,
}

impl<'a> IndirectBlock<'a> {
    pub fn new(bid: Bid, cache: &'a BlockCache) -> Self {
        debug_assert_ne!(bid, INVALID_BID);
        Self { bid, cache }
    }

    /// Allocates a new index block with every entry set to `INVALID_BID`.
    pub fn alloc(cache: &'a BlockCache, alloc: &dyn BlockAlloc) -> Result<Self> {
        let bid = alloc.alloc_block().ok_or(FsError::NoDeviceSpace)?;
        let block = BlockBuf::new_filled(INVALID_BID);
        if let Err(e) = cache.write(bid, 0, block.as_slice()) {
            alloc.free_block(bid);
            return Err(e);
        }
        Ok(Self::new(bid, cache))
    }

    pub fn bid(&self) -> Bid {
        self.bid
    }

    /// Reads a bid at a specified `idx`.
    pub fn read_bid(&self, idx: usize) -> Result<Bid> {
        assert!(idx < INDIRECT_CNT);
        self.cache.read_val(self.bid, idx * BID_SIZE)
    }

    /// Writes a value of bid at a specified `idx`.
    pub fn write_bid(&self, idx: usize, bid: Bid) -> Result<()> {
        assert!(idx < INDIRECT_CNT);
        self.cache.write_val(self.bid, idx * BID_SIZE, &bid)
    }

    /// Reads all entries at once.
    pub fn read_all(&self) -> Result<[Bid; INDIRECT_CNT]> {
        self.cache.read_val(self.bid, 0)
    }
}
