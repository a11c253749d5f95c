// SPDX-License-Identifier: MPL-2.0

use crate::prelude::*;

/// A raw device addressed in fixed-size blocks.
///
/// Every call moves exactly one block of `BLOCK_SIZE` bytes.
pub trait BlockDevice: Send + Sync {
    /// Returns the total number of blocks in the device.
    fn total_blocks(&self) -> usize;

    /// Reads the block indicated by the `bid`.
    fn read_block(&self, bid: Bid, block: &mut [u8]) -> Result<()>;

    /// Writes the block indicated by the `bid`.
    fn write_block(&self, bid: Bid, block: &[u8]) -> Result<()>;

    /// Synchronizes the blocks in the device.
    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
