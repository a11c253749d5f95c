// SPDX-License-Identifier: MPL-2.0

use crate::prelude::*;

/// An owned buffer of exactly one block.
#[derive(Clone, Debug)]
pub struct BlockBuf(Box<[u8]>);

impl BlockBuf {
    pub fn new_zeroed() -> Self {
        Self(vec![0u8; BLOCK_SIZE].into_boxed_slice())
    }

    /// Creates a block with every 32-bit word set to `word`.
    pub fn new_filled(word: u32) -> Self {
        let mut buf = Self::new_zeroed();
        for chunk in buf.as_mut_slice().chunks_exact_mut(size_of::<u32>()) {
            chunk.copy_from_slice(&word.to_ne_bytes());
        }
        buf
    }

    pub fn as_slice(&self) -> &[u8] {
        self.0.as_ref()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.0.as_mut()
    }

    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let max_offset = offset.checked_add(buf.len()).ok_or(FsError::InvalidParam)?;
        if max_offset > BLOCK_SIZE {
            return Err(FsError::InvalidParam);
        }
        buf.copy_from_slice(&self.as_slice()[offset..max_offset]);
        Ok(())
    }

    pub fn write_bytes(&mut self, offset: usize, buf: &[u8]) -> Result<()> {
        let max_offset = offset.checked_add(buf.len()).ok_or(FsError::InvalidParam)?;
        if max_offset > BLOCK_SIZE {
            return Err(FsError::InvalidParam);
        }
        self.as_mut_slice()[offset..max_offset].copy_from_slice(buf);
        Ok(())
    }
}
