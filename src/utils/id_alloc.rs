// SPDX-License-Identifier: MPL-2.0

use bitvec::prelude::*;

use crate::prelude::*;

/// An id allocator implemented by the bitmap.
///
/// The true bit implies that the id is allocated, and vice versa.
#[derive(Clone)]
pub struct IdAlloc {
    bitset: BitVec<u8>,
    first_available_id: usize,
    free_count: usize,
}

impl IdAlloc {
    /// Constructs a new id allocator with a maximum capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bitset: BitVec::repeat(false, capacity),
            first_available_id: 0,
            free_count: capacity,
        }
    }

    /// Allocates `count` consecutive ids, returning the lowest fitting range.
    pub fn alloc_consecutive(&mut self, count: usize) -> Option<Range<usize>> {
        if count == 0 || count > self.free_count {
            return None;
        }

        let mut start = self.first_available_id;
        while start + count <= self.bitset.len() {
            match self.bitset[start..start + count].last_one() {
                Some(pos) => start += pos + 1,
                None => {
                    self.bitset[start..start + count].fill(true);
                    self.free_count -= count;
                    if start == self.first_available_id {
                        self.first_available_id = self.bitset[start + count..]
                            .first_zero()
                            .map_or(self.bitset.len(), |pos| start + count + pos);
                    }
                    return Some(start..start + count);
                }
            }
        }
        None
    }

    /// Frees the allocated id.
    ///
    /// # Panic
    ///
    /// If the `id` is not allocated, this method will panic.
    pub fn free(&mut self, id: usize) {
        assert!(self.is_allocated(id), "id {} is not allocated", id);
        self.bitset.set(id, false);
        self.free_count += 1;
        if id < self.first_available_id {
            self.first_available_id = id;
        }
    }

    /// Returns true if the `id` is allocated.
    pub fn is_allocated(&self, id: usize) -> bool {
        self.bitset.get(id).map_or(false, |bit| *bit)
    }

    /// Returns the number of ids not yet allocated.
    pub fn free_count(&self) -> usize {
        self.free_count
    }
}

impl Debug for IdAlloc {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("IdAlloc")
            .field("len", &self.bitset.len())
            .field("first_available_id", &self.first_available_id)
            .field("free_count", &self.free_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_lowest_freed_id() {
        let mut ids = IdAlloc::with_capacity(8);
        assert_eq!(ids.alloc_consecutive(3), Some(0..3));
        ids.free(1);
        assert_eq!(ids.alloc_consecutive(1), Some(1..2));
        assert_eq!(ids.alloc_consecutive(1), Some(3..4));
        assert_eq!(ids.free_count(), 4);
    }

    #[test]
    fn skips_fragmented_holes() {
        let mut ids = IdAlloc::with_capacity(8);
        assert_eq!(ids.alloc_consecutive(4), Some(0..4));
        ids.free(1);
        assert_eq!(ids.alloc_consecutive(2), Some(4..6));
        assert_eq!(ids.alloc_consecutive(3), None);
        assert_eq!(ids.alloc_consecutive(1), Some(1..2));
    }

    #[test]
    #[should_panic]
    fn double_free_panics() {
        let mut ids = IdAlloc::with_capacity(4);
        ids.alloc_consecutive(1);
        ids.free(0);
        ids.free(0);
    }
}
