// SPDX-License-Identifier: MPL-2.0

use crate::{prelude::*, utils::IdAlloc};

/// The free-space service handing out device blocks.
pub trait BlockAlloc: Send + Sync {
    /// Allocates `count` consecutive blocks, or returns `None` if no such
    /// range is free.
    fn alloc_blocks(&self, count: u32) -> Option<Range<Bid>>;

    /// Releases a range of blocks previously handed out by `alloc_blocks`.
    fn free_blocks(&self, range: Range<Bid>);

    /// Returns the number of blocks still free.
    fn free_count(&self) -> u32;

    /// Allocates a single block.
    fn alloc_block(&self) -> Option<Bid> {
        self.alloc_blocks(1).map(|range| range.start)
    }

    /// Releases a single block.
    fn free_block(&self, bid: Bid) {
        self.free_blocks(bid..bid + 1)
    }
}

/// A bitmap allocator managing a contiguous range of device blocks.
///
/// The bitmap itself lives in memory only.
pub struct BitmapAlloc {
    bids: Range<Bid>,
    bitmap: Mutex<IdAlloc>,
}

impl BitmapAlloc {
    pub fn new(bids: Range<Bid>) -> Self {
        assert!(bids.end <= INVALID_BID);
        Self {
            bitmap: Mutex::new(IdAlloc::with_capacity(bids.len())),
            bids,
        }
    }

    /// Returns true if the block is handed out.
    pub fn is_allocated(&self, bid: Bid) -> bool {
        self.bids.contains(&bid) && self.bitmap.lock().is_allocated((bid - self.bids.start) as usize)
    }
}

impl BlockAlloc for BitmapAlloc {
    fn alloc_blocks(&self, count: u32) -> Option<Range<Bid>> {
        let ids = self.bitmap.lock().alloc_consecutive(count as usize)?;
        let range = (self.bids.start + ids.start as Bid)..(self.bids.start + ids.end as Bid);
        trace!("allocated blocks {:?}", range);
        Some(range)
    }

    fn free_blocks(&self, range: Range<Bid>) {
        assert!(
            self.bids.start <= range.start && range.end <= self.bids.end,
            "blocks {:?} are not managed by this allocator",
            range
        );
        trace!("freed blocks {:?}", range);
        let mut bitmap = self.bitmap.lock();
        for bid in range {
            bitmap.free((bid - self.bids.start) as usize);
        }
    }

    fn free_count(&self) -> u32 {
        self.bitmap.lock().free_count() as u32
    }
}

impl Debug for BitmapAlloc {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("BitmapAlloc")
            .field("bids", &self.bids)
            .field("bitmap", &*self.bitmap.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hands_out_blocks_of_its_range() {
        let alloc: Arc<dyn BlockAlloc> = Arc::new(BitmapAlloc::new(10..14));
        assert_eq!(alloc.alloc_block(), Some(10));
        assert_eq!(alloc.alloc_blocks(3), Some(11..14));
        assert_eq!(alloc.alloc_block(), None);
        assert_eq!(alloc.free_count(), 0);

        alloc.free_block(12);
        assert_eq!(alloc.free_count(), 1);
        assert_eq!(alloc.alloc_block(), Some(12));
    }

    #[test]
    #[should_panic]
    fn rejects_foreign_blocks() {
        let alloc = BitmapAlloc::new(10..14);
        alloc.free_blocks(2..3);
    }
}
