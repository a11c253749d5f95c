// SPDX-License-Identifier: MPL-2.0

//! A write-back cache layer for a block device.
//!
//! The cache owns a fixed number of block-sized slots. Valid slots are tracked
//! by an LRU list keyed by block number; a miss takes the lowest free slot or,
//! when none is left, evicts the least recently used block, writing it back
//! first if it is dirty.
//!
//! # Locking
//!
//! Two levels of locks are used: the cache-wide `state` lock guards the
//! block-to-slot mapping, the free set and the recency order, while every slot
//! has its own lock guarding its bytes. The order is always `state` then slot.
//! A lookup promotes the block and locks its slot while still holding `state`,
//! then releases `state` before copying, so copies to different blocks never
//! contend. A slot lock is never held while waiting for `state`.

use core::num::NonZeroUsize;

use lru::LruCache;

use crate::prelude::*;

/// The number of slots used when no capacity is configured.
pub const DEFAULT_CACHE_CAP: NonZeroUsize = match NonZeroUsize::new(64) {
    Some(cap) => cap,
    None => unreachable!(),
};

/// Fixed-capacity LRU write-back cache upon a block device.
pub struct BlockCache {
    disk: Arc<dyn BlockDevice>,
    state: Mutex<CacheState>,
    slots: Box<[Mutex<CacheSlot>]>,
}

struct CacheState {
    /// Valid slots keyed by the block they hold.
    lru: LruCache<Bid, usize>,
    /// Slots holding no block, reused lowest index first.
    free: BTreeSet<usize>,
}

struct CacheSlot {
    bid: Bid,
    valid: bool,
    dirty: bool,
    buf: BlockBuf,
}

impl BlockCache {
    pub fn new(disk: Arc<dyn BlockDevice>, capacity: NonZeroUsize) -> Self {
        let slots = (0..capacity.get())
            .map(|_| {
                Mutex::new(CacheSlot {
                    bid: INVALID_BID,
                    valid: false,
                    dirty: false,
                    buf: BlockBuf::new_zeroed(),
                })
            })
            .collect();
        Self {
            disk,
            state: Mutex::new(CacheState {
                lru: LruCache::new(capacity),
                free: (0..capacity.get()).collect(),
            }),
            slots,
        }
    }

    /// Returns the underlying block device.
    pub fn disk(&self) -> &Arc<dyn BlockDevice> {
        &self.disk
    }

    /// Returns the number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` if the block is currently cached.
    ///
    /// The recency order is left untouched.
    pub fn contains(&self, bid: Bid) -> bool {
        self.state.lock().lru.contains(&bid)
    }

    /// Returns the slot currently holding the block, if any.
    pub fn slot_of(&self, bid: Bid) -> Option<usize> {
        self.state.lock().lru.peek(&bid).copied()
    }

    /// Copies `buf.len()` bytes at `offset` within block `bid` into `buf`.
    pub fn read(&self, bid: Bid, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_request(bid, offset, buf.len())?;
        let slot = self.lock_slot(bid, true)?;
        slot.buf.read_bytes(offset, buf)
    }

    /// Copies `buf` into block `bid` at `offset` and marks the block dirty.
    ///
    /// The block is fetched from the device first unless `buf` covers all of it.
    pub fn write(&self, bid: Bid, offset: usize, buf: &[u8]) -> Result<()> {
        self.check_request(bid, offset, buf.len())?;
        let covers_block = offset == 0 && buf.len() == BLOCK_SIZE;
        let mut slot = self.lock_slot(bid, !covers_block)?;
        slot.buf.write_bytes(offset, buf)?;
        slot.dirty = true;
        Ok(())
    }

    /// Reads a value of a specified type at `offset` within block `bid`.
    pub fn read_val<T: Pod>(&self, bid: Bid, offset: usize) -> Result<T> {
        let mut val = T::new_uninit();
        self.read(bid, offset, val.as_bytes_mut())?;
        Ok(val)
    }

    /// Writes a value of a specified type at `offset` within block `bid`.
    pub fn write_val<T: Pod>(&self, bid: Bid, offset: usize, new_val: &T) -> Result<()> {
        self.write(bid, offset, new_val.as_bytes())
    }

    /// Writes the slot back if it is dirty, then invalidates it.
    pub fn flush(&self, slot_idx: usize) -> Result<()> {
        if slot_idx >= self.slots.len() {
            return Err(FsError::InvalidParam);
        }
        let mut state = self.state.lock();
        self.invalidate(&mut state, slot_idx)
    }

    /// Flushes every slot. After it returns the cache holds no block.
    pub fn flush_all(&self) -> Result<()> {
        let mut state = self.state.lock();
        for slot_idx in 0..self.slots.len() {
            self.invalidate(&mut state, slot_idx)?;
        }
        debug!("block cache flushed");
        Ok(())
    }

    /// Writes back every dirty slot while keeping the blocks cached.
    pub fn sync(&self) -> Result<()> {
        let _state = self.state.lock();
        for slot in self.slots.iter() {
            self.write_back(&mut slot.lock())?;
        }
        Ok(())
    }

    /// Returns the locked slot holding `bid`, loading it on a miss.
    fn lock_slot(&self, bid: Bid, fetch: bool) -> Result<MutexGuard<'_, CacheSlot>> {
        let mut state = self.state.lock();
        if let Some(&slot_idx) = state.lru.get(&bid) {
            trace!("block cache hit: bid = {}, slot = {}", bid, slot_idx);
            return Ok(self.slots[slot_idx].lock());
        }

        let slot_idx = match state.free.pop_first() {
            Some(slot_idx) => slot_idx,
            None => self.evict_lru(&mut state)?,
        };
        let mut slot = self.slots[slot_idx].lock();
        if fetch {
            if let Err(e) = self.disk.read_block(bid, slot.buf.as_mut_slice()) {
                error!("failed to fetch block {}: {}", bid, e);
                state.free.insert(slot_idx);
                return Err(e);
            }
        }
        slot.bid = bid;
        slot.valid = true;
        slot.dirty = false;
        state.lru.put(bid, slot_idx);
        trace!("block cache miss: bid = {}, slot = {}", bid, slot_idx);
        Ok(slot)
    }

    /// Reclaims the slot of the least recently used block.
    fn evict_lru(&self, state: &mut CacheState) -> Result<usize> {
        let Some((victim, slot_idx)) = state.lru.pop_lru() else {
            unreachable!("a cache without free slots must hold a block");
        };
        let mut slot = self.slots[slot_idx].lock();
        if let Err(e) = self.write_back(&mut slot) {
            error!("failed to write back block {} on eviction: {}", victim, e);
            state.lru.put(victim, slot_idx);
            state.lru.demote(&victim);
            return Err(e);
        }
        slot.valid = false;
        debug!("block cache evicted: bid = {}, slot = {}", victim, slot_idx);
        Ok(slot_idx)
    }

    fn invalidate(&self, state: &mut CacheState, slot_idx: usize) -> Result<()> {
        let mut slot = self.slots[slot_idx].lock();
        if !slot.valid {
            return Ok(());
        }
        self.write_back(&mut slot)?;
        slot.valid = false;
        state.lru.pop(&slot.bid);
        state.free.insert(slot_idx);
        Ok(())
    }

    fn write_back(&self, slot: &mut CacheSlot) -> Result<()> {
        if slot.valid && slot.dirty {
            self.disk.write_block(slot.bid, slot.buf.as_slice())?;
            slot.dirty = false;
        }
        Ok(())
    }

    fn check_request(&self, bid: Bid, offset: usize, len: usize) -> Result<()> {
        let in_block = offset
            .checked_add(len)
            .map_or(false, |end| end <= BLOCK_SIZE);
        if bid >= INVALID_BID || bid as usize >= self.disk.total_blocks() || !in_block {
            warn!(
                "block cache rejected request: bid = {}, offset = {}, len = {}",
                bid, offset, len
            );
            return Err(FsError::InvalidParam);
        }
        Ok(())
    }
}

impl Debug for BlockCache {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BlockCache")
            .field("capacity", &self.slots.len())
            .field("cached", &state.lru.len())
            .finish()
    }
}
