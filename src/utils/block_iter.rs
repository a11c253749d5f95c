// SPDX-License-Identifier: MPL-2.0

use crate::prelude::*;

/// Splits a byte range into the per-block pieces it covers.
pub struct BlockIter {
    pub begin: usize,
    pub end: usize,
    pub block_size_log2: u8,
}

/// The part of one block touched by a byte range.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockRange {
    /// Index of the block within the file.
    pub block: usize,
    /// Begin offset within the block.
    pub begin: usize,
    /// End offset within the block.
    pub end: usize,
}

impl BlockRange {
    pub fn len(&self) -> usize {
        self.end - self.begin
    }
}

impl Iterator for BlockIter {
    type Item = BlockRange;

    fn next(&mut self) -> Option<Self::Item> {
        if self.begin >= self.end {
            return None;
        }
        let block_size = 1usize << self.block_size_log2;
        let block = self.begin >> self.block_size_log2;
        let begin = self.begin % block_size;
        let end = if block == (self.end - 1) >> self.block_size_log2 {
            (self.end - 1) % block_size + 1
        } else {
            block_size
        };
        self.begin += end - begin;
        Some(BlockRange { block, begin, end })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_unaligned_range() {
        let ranges: Vec<_> = BlockIter {
            begin: BLOCK_SIZE - 10,
            end: 2 * BLOCK_SIZE + 5,
            block_size_log2: BLOCK_SIZE_LOG2,
        }
        .map(|range| (range.block, range.begin, range.end, range.len()))
        .collect();
        assert_eq!(
            ranges,
            vec![
                (0, BLOCK_SIZE - 10, BLOCK_SIZE, 10),
                (1, 0, BLOCK_SIZE, BLOCK_SIZE),
                (2, 0, 5, 5),
            ]
        );
    }

    #[test]
    fn empty_range_yields_nothing() {
        let mut iter = BlockIter {
            begin: 100,
            end: 100,
            block_size_log2: BLOCK_SIZE_LOG2,
        };
        assert_eq!(iter.next(), None);
    }
}
