// SPDX-License-Identifier: MPL-2.0

use inherit_methods_macro::inherit_methods;

use crate::{
    block_ptr::{BidPath, BlockPtrs, MAX_FILE_SIZE},
    indirect::IndirectBlock,
    prelude::*,
    utils::BlockIter,
};

/// The magic number identifying an inode record.
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// An open inode.
///
/// The handle is shared by every opener of the same record, see
/// [`SectorFs::open`](crate::SectorFs::open).
pub struct Inode {
    ino: Bid,
    /// Held shared while file data is copied, exclusively while the index is
    /// edited by `resize` or `free_all`. Taken before `inner`.
    index_lock: RwLock<()>,
    inner: Mutex<InodeInner>,
    block_cache: Arc<BlockCache>,
    block_alloc: Arc<dyn BlockAlloc>,
}

impl Inode {
    pub(super) fn new(
        ino: Bid,
        block_cache: Arc<BlockCache>,
        block_alloc: Arc<dyn BlockAlloc>,
    ) -> Self {
        Self {
            ino,
            index_lock: RwLock::new(()),
            inner: Mutex::new(InodeInner::new()),
            block_cache,
            block_alloc,
        }
    }

    /// Returns the block holding the inode record, which also names the inode.
    pub fn ino(&self) -> Bid {
        self.ino
    }

    pub fn file_size(&self) -> Result<usize> {
        Ok(self.desc()?.size)
    }

    pub fn is_dir(&self) -> Result<bool> {
        Ok(self.desc()?.is_dir)
    }

    /// Returns the device block holding the byte at `offset`, or `None` if no
    /// block is allocated there.
    ///
    /// The lookup ignores the file size: it reports whatever the block index holds.
    pub fn resolve(&self, offset: usize) -> Result<Option<Bid>> {
        self.desc()?
            .device_bid(offset >> BLOCK_SIZE_LOG2, &self.block_cache)
    }

    /// Sets the file size, allocating or releasing blocks as needed.
    ///
    /// New bytes read back as zero. A failed allocation changes nothing. If
    /// the device fails midway, the record is stored as far as the index was
    /// edited, so it never names a released block. Blocks it still links past
    /// the end of file are reused by the next expansion.
    pub fn resize(&self, new_size: usize) -> Result<()> {
        let _index_guard = self.index_lock.write();
        let inner = self.inner.lock();
        if inner.deny_write_count() > 0 {
            return Err(FsError::WriteDenied);
        }

        let mut desc = self.desc()?;
        if new_size == desc.size {
            return Ok(());
        }
        self.resize_desc(&mut desc, new_size)
    }

    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let _index_guard = self.index_lock.read();
        let desc = self.desc()?;
        let (offset, read_len) = {
            let file_size = desc.size;
            let start = file_size.min(offset);
            let end = file_size.min(offset.saturating_add(buf.len()));
            (start, end - start)
        };

        let iter = BlockIter {
            begin: offset,
            end: offset + read_len,
            block_size_log2: BLOCK_SIZE_LOG2,
        };
        let mut buf_offset = 0;
        for range in iter {
            let Some(bid) = desc.device_bid(range.block, &self.block_cache)? else {
                break;
            };
            let buf_end = buf_offset + range.len();
            self.block_cache
                .read(bid, range.begin, &mut buf[buf_offset..buf_end])?;
            buf_offset = buf_end;
        }
        Ok(buf_offset)
    }

    /// Writes `buf` at `offset`, extending the file if the write ends past it.
    ///
    /// Bytes between the old end of file and `offset` read back as zero. Bytes
    /// beyond `MAX_FILE_SIZE` are not written, so a write starting there
    /// returns 0.
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize> {
        let _index_guard = self.index_lock.read();
        let inner = self.inner.lock();
        if inner.deny_write_count() > 0 {
            return Err(FsError::WriteDenied);
        }
        let new_size = offset.saturating_add(buf.len()).min(MAX_FILE_SIZE);
        if new_size <= offset {
            return Ok(0);
        }
        let buf = &buf[..new_size - offset];

        let mut desc = self.desc()?;
        if new_size > desc.size {
            self.resize_desc(&mut desc, new_size)?;
        }
        drop(inner);

        let iter = BlockIter {
            begin: offset,
            end: new_size,
            block_size_log2: BLOCK_SIZE_LOG2,
        };
        let mut buf_offset = 0;
        for range in iter {
            let Some(bid) = desc.device_bid(range.block, &self.block_cache)? else {
                break;
            };
            let buf_end = buf_offset + range.len();
            self.block_cache
                .write(bid, range.begin, &buf[buf_offset..buf_end])?;
            buf_offset = buf_end;
        }
        Ok(buf_offset)
    }

    /// Drops one opener and returns how many are left.
    pub(super) fn dec_open_count(&self) -> u32 {
        let mut inner = self.inner.lock();
        assert!(inner.open_count > 0, "inode {} closed too often", self.ino);
        inner.open_count -= 1;
        debug_assert!(inner.deny_write_count <= inner.open_count);
        inner.open_count
    }

    /// Adds an opener. Only the registry calls it, under its lock.
    pub(super) fn reopen(&self) {
        self.inner.lock().reopen()
    }

    /// Releases every block of the inode, then the record block itself.
    ///
    /// The record is zeroed first, so the block no longer opens as an inode.
    pub(super) fn free_all(&self) -> Result<()> {
        let _index_guard = self.index_lock.write();
        let _inner = self.inner.lock();
        let bids = self.desc()?.owned_bids(&self.block_cache)?;
        self.block_cache
            .write(self.ino, 0, BlockBuf::new_zeroed().as_slice())?;
        for bid in bids {
            self.block_alloc.free_block(bid);
        }
        self.block_alloc.free_block(self.ino);
        debug!("inode {} freed", self.ino);
        Ok(())
    }

    /// Resizes `desc` and stores it, also when the resize stopped midway.
    fn resize_desc(&self, desc: &mut InodeDesc, new_size: usize) -> Result<()> {
        let resized = self.block_map(desc).resize(new_size);
        self.sync_desc(desc)?;
        resized
    }

    fn desc(&self) -> Result<InodeDesc> {
        let raw_inode = self.block_cache.read_val::<RawInode>(self.ino, 0)?;
        InodeDesc::try_from(raw_inode)
    }

    fn sync_desc(&self, desc: &InodeDesc) -> Result<()> {
        self.block_cache
            .write_val(self.ino, 0, &RawInode::from(desc))
            .inspect_err(|e| error!("failed to store inode {}: {}", self.ino, e))
    }

    fn block_map<'a>(&'a self, desc: &'a mut InodeDesc) -> BlockMap<'a> {
        BlockMap::new(desc, &self.block_cache, self.block_alloc.as_ref())
    }
}

#[inherit_methods(from = "self.inner.lock()")]
impl Inode {
    pub fn open_count(&self) -> u32;
    pub fn is_removed(&self) -> bool;
    pub fn deny_write_count(&self) -> u32;
    pub fn remove(&self);
    pub fn deny_write(&self);
    pub fn allow_write(&self);
}

impl Debug for Inode {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Inode")
            .field("ino", &self.ino)
            .field("inner", &*self.inner.lock())
            .finish()
    }
}

#[derive(Debug)]
pub(crate) struct InodeInner {
    open_count: u32,
    is_removed: bool,
    deny_write_count: u32,
}

impl InodeInner {
    pub fn new() -> Self {
        Self {
            open_count: 1,
            is_removed: false,
            deny_write_count: 0,
        }
    }

    /// Returns the number of openers sharing the handle.
    pub fn open_count(&self) -> u32 {
        self.open_count
    }

    pub fn is_removed(&self) -> bool {
        self.is_removed
    }

    pub fn deny_write_count(&self) -> u32 {
        self.deny_write_count
    }

    /// Adds an opener to an already open handle.
    pub fn reopen(&mut self) {
        assert!(self.open_count > 0);
        self.open_count += 1;
    }

    /// Marks the inode for deletion once the last opener closes it.
    pub fn remove(&mut self) {
        self.is_removed = true;
    }

    /// Makes writes fail until a matching `allow_write`.
    ///
    /// Each opener may deny at most once.
    pub fn deny_write(&mut self) {
        assert!(self.deny_write_count < self.open_count);
        self.deny_write_count += 1;
    }

    pub fn allow_write(&mut self) {
        assert!(self.deny_write_count > 0);
        self.deny_write_count -= 1;
    }
}

/// The block index of an inode being edited.
///
/// The index is dense: the `i`-th slot holds a block exactly when
/// `i < size.div_ceil(BLOCK_SIZE)`, and index blocks exist exactly when some
/// slot below them is in use. Unused entries hold `INVALID_BID`.
pub(super) struct BlockMap<'a> {
    desc: &'a mut InodeDesc,
    block_cache: &'a BlockCache,
    block_alloc: &'a dyn BlockAlloc,
}

impl<'a> BlockMap<'a> {
    pub fn new(
        desc: &'a mut InodeDesc,
        block_cache: &'a BlockCache,
        block_alloc: &'a dyn BlockAlloc,
    ) -> Self {
        Self {
            desc,
            block_cache,
            block_alloc,
        }
    }

    /// Sets the size, allocating or freeing the blocks it takes.
    ///
    /// On failure the index and the size are left as they were.
    pub fn resize(&mut self, new_size: usize) -> Result<()> {
        if new_size > MAX_FILE_SIZE {
            return Err(FsError::InvalidParam);
        }
        if new_size > self.desc.size {
            self.expand(new_size)
        } else {
            self.shrink(new_size)
        }
    }

    /// Releases every block reachable from the index, used or not.
    pub fn free_all(&mut self) -> Result<()> {
        for bid in self.desc.owned_bids(self.block_cache)? {
            self.block_alloc.free_block(bid);
        }
        self.desc.block_ptrs = BlockPtrs::new();
        self.desc.size = 0;
        Ok(())
    }

    fn expand(&mut self, new_size: usize) -> Result<()> {
        let new_blocks = size_to_blocks(new_size);
        let old_blocks = self.desc.blocks_count();
        if new_blocks > old_blocks {
            self.expand_blocks(old_blocks..new_blocks)?;
        }
        self.desc.size = new_size;
        Ok(())
    }

    /// Allocates the blocks in `range`, undoing all of them if one fails.
    fn expand_blocks(&mut self, range: Range<usize>) -> Result<()> {
        for idx in range.clone() {
            if let Err(e) = self.expand_block(idx) {
                debug!(
                    "expansion to {} blocks failed at block {}: {}",
                    range.end, idx, e
                );
                // Block `idx` may already own the index blocks leading to it.
                // If the undo fails too, the blocks it kept stay linked.
                if let Err(undo_err) = self.shrink_blocks(range.start..idx + 1) {
                    error!("failed to undo a partial expansion: {}", undo_err);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Gives the `idx`-th slot a zeroed data block.
    ///
    /// A block still linked there by an interrupted shrink is reused.
    fn expand_block(&mut self, idx: usize) -> Result<()> {
        let block_cache = self.block_cache;
        match BidPath::try_from(idx)? {
            BidPath::Direct(direct_idx) => match self.desc.block_ptrs.direct(direct_idx) {
                INVALID_BID => {
                    let bid = self.alloc_data_block()?;
                    self.desc.block_ptrs.set_direct(direct_idx, bid);
                }
                bid => self.zero_block(bid)?,
            },
            BidPath::Indirect(lvl1_idx) => {
                let indirect_bid = match self.desc.block_ptrs.indirect() {
                    INVALID_BID => {
                        let block = IndirectBlock::alloc(block_cache, self.block_alloc)?;
                        self.desc.block_ptrs.set_indirect(block.bid());
                        block.bid()
                    }
                    bid => bid,
                };
                self.fill_entry(&IndirectBlock::new(indirect_bid, block_cache), lvl1_idx)?;
            }
            BidPath::DbIndirect(lvl1_idx, lvl2_idx) => {
                let db_indirect_bid = match self.desc.block_ptrs.db_indirect() {
                    INVALID_BID => {
                        let block = IndirectBlock::alloc(block_cache, self.block_alloc)?;
                        self.desc.block_ptrs.set_db_indirect(block.bid());
                        block.bid()
                    }
                    bid => bid,
                };
                let db_indirect_block = IndirectBlock::new(db_indirect_bid, block_cache);
                let lvl1_bid = match db_indirect_block.read_bid(lvl1_idx)? {
                    INVALID_BID => {
                        let block = IndirectBlock::alloc(block_cache, self.block_alloc)?;
                        self.link_block(&db_indirect_block, lvl1_idx, block.bid())?;
                        block.bid()
                    }
                    bid => bid,
                };
                self.fill_entry(&IndirectBlock::new(lvl1_bid, block_cache), lvl2_idx)?;
            }
        }
        Ok(())
    }

    fn fill_entry(&self, block: &IndirectBlock, idx: usize) -> Result<()> {
        match block.read_bid(idx)? {
            INVALID_BID => {
                let bid = self.alloc_data_block()?;
                self.link_block(block, idx, bid)
            }
            bid => self.zero_block(bid),
        }
    }

    /// Allocates a data block and zeroes it.
    fn alloc_data_block(&self) -> Result<Bid> {
        let bid = self
            .block_alloc
            .alloc_block()
            .ok_or(FsError::NoDeviceSpace)?;
        if let Err(e) = self.zero_block(bid) {
            self.block_alloc.free_block(bid);
            return Err(e);
        }
        Ok(bid)
    }

    fn zero_block(&self, bid: Bid) -> Result<()> {
        self.block_cache
            .write(bid, 0, BlockBuf::new_zeroed().as_slice())
    }

    /// Stores `bid` in an index block entry, releasing it if that fails.
    fn link_block(&self, block: &IndirectBlock, idx: usize, bid: Bid) -> Result<()> {
        block
            .write_bid(idx, bid)
            .inspect_err(|_| self.block_alloc.free_block(bid))
    }

    fn shrink(&mut self, new_size: usize) -> Result<()> {
        let new_blocks = size_to_blocks(new_size);
        let old_blocks = self.desc.blocks_count();
        if new_blocks < old_blocks {
            self.shrink_blocks(new_blocks..old_blocks)?;
        }
        self.desc.size = new_size;
        Ok(())
    }

    /// Frees the blocks in `range` from the last one down, along with the
    /// index blocks no longer needed.
    ///
    /// Slots already holding `INVALID_BID` are skipped. If the `idx`-th block
    /// fails, the size is cut to end before it, and the blocks from `idx` on
    /// that were not released yet stay linked.
    fn shrink_blocks(&mut self, range: Range<usize>) -> Result<()> {
        for idx in range.rev() {
            if let Err(e) = self.shrink_block(idx) {
                self.desc.size = self.desc.size.min(idx * BLOCK_SIZE);
                return Err(e);
            }
        }
        Ok(())
    }

    fn shrink_block(&mut self, idx: usize) -> Result<()> {
        let block_cache = self.block_cache;
        match BidPath::try_from(idx)? {
            BidPath::Direct(direct_idx) => {
                let bid = self.desc.block_ptrs.direct(direct_idx);
                if bid != INVALID_BID {
                    self.desc.block_ptrs.set_direct(direct_idx, INVALID_BID);
                    self.block_alloc.free_block(bid);
                }
            }
            BidPath::Indirect(lvl1_idx) => {
                let indirect_bid = self.desc.block_ptrs.indirect();
                if indirect_bid != INVALID_BID {
                    self.unlink_block(&IndirectBlock::new(indirect_bid, block_cache), lvl1_idx)?;
                }
            }
            BidPath::DbIndirect(lvl1_idx, lvl2_idx) => {
                let db_indirect_bid = self.desc.block_ptrs.db_indirect();
                if db_indirect_bid != INVALID_BID {
                    let lvl1_bid =
                        IndirectBlock::new(db_indirect_bid, block_cache).read_bid(lvl1_idx)?;
                    if lvl1_bid != INVALID_BID {
                        self.unlink_block(&IndirectBlock::new(lvl1_bid, block_cache), lvl2_idx)?;
                    }
                }
            }
        }
        self.free_indirect_blocks_required_by(idx)
    }

    /// Clears an index block entry and frees the block it named.
    fn unlink_block(&self, block: &IndirectBlock, idx: usize) -> Result<()> {
        let bid = block.read_bid(idx)?;
        if bid != INVALID_BID {
            block.write_bid(idx, INVALID_BID)?;
            self.block_alloc.free_block(bid);
        }
        Ok(())
    }

    /// Frees the index blocks that only the `idx`-th block and those after it
    /// require.
    fn free_indirect_blocks_required_by(&mut self, idx: usize) -> Result<()> {
        let bid_path = BidPath::try_from(idx)?;
        if bid_path.last_lvl_idx() != 0 {
            return Ok(());
        }

        match bid_path {
            BidPath::Direct(_) => {}
            BidPath::Indirect(_) => {
                let indirect_bid = self.desc.block_ptrs.indirect();
                if indirect_bid != INVALID_BID {
                    self.desc.block_ptrs.set_indirect(INVALID_BID);
                    self.block_alloc.free_block(indirect_bid);
                }
            }
            BidPath::DbIndirect(lvl1_idx, _) => {
                let db_indirect_bid = self.desc.block_ptrs.db_indirect();
                if db_indirect_bid == INVALID_BID {
                    return Ok(());
                }

                self.unlink_block(
                    &IndirectBlock::new(db_indirect_bid, self.block_cache),
                    lvl1_idx,
                )?;
                if lvl1_idx == 0 {
                    self.desc.block_ptrs.set_db_indirect(INVALID_BID);
                    self.block_alloc.free_block(db_indirect_bid);
                }
            }
        }
        Ok(())
    }
}

/// The decoded inode record.
#[derive(Clone, Copy, Debug)]
pub(super) struct InodeDesc {
    /// Size in bytes.
    size: usize,
    is_dir: bool,
    /// Pointers to blocks.
    block_ptrs: BlockPtrs,
}

impl TryFrom<RawInode> for InodeDesc {
    type Error = FsError;

    fn try_from(inode: RawInode) -> Result<Self> {
        if inode.magic != INODE_MAGIC {
            return Err(FsError::WrongFs);
        }
        Ok(Self {
            size: inode.size as usize,
            is_dir: inode.is_dir != 0,
            block_ptrs: inode.block_ptrs,
        })
    }
}

impl InodeDesc {
    pub fn new(is_dir: bool) -> Self {
        Self {
            size: 0,
            is_dir,
            block_ptrs: BlockPtrs::new(),
        }
    }

    /// Returns the number of data blocks in use.
    pub fn blocks_count(&self) -> usize {
        size_to_blocks(self.size)
    }

    /// Returns the device block of the `idx`-th block of the file.
    pub fn device_bid(&self, idx: usize, block_cache: &BlockCache) -> Result<Option<Bid>> {
        let Ok(bid_path) = BidPath::try_from(idx) else {
            return Ok(None);
        };
        let bid = match bid_path {
            BidPath::Direct(direct_idx) => self.block_ptrs.direct(direct_idx),
            BidPath::Indirect(lvl1_idx) => match self.block_ptrs.indirect() {
                INVALID_BID => INVALID_BID,
                bid => IndirectBlock::new(bid, block_cache).read_bid(lvl1_idx)?,
            },
            BidPath::DbIndirect(lvl1_idx, lvl2_idx) => match self.block_ptrs.db_indirect() {
                INVALID_BID => INVALID_BID,
                bid => match IndirectBlock::new(bid, block_cache).read_bid(lvl1_idx)? {
                    INVALID_BID => INVALID_BID,
                    lvl1_bid => IndirectBlock::new(lvl1_bid, block_cache).read_bid(lvl2_idx)?,
                },
            },
        };
        Ok((bid != INVALID_BID).then_some(bid))
    }

    /// Collects every block reachable from the index, index blocks included.
    ///
    /// All slots are walked regardless of the size.
    pub fn owned_bids(&self, block_cache: &BlockCache) -> Result<Vec<Bid>> {
        let is_valid = |bid: &Bid| *bid != INVALID_BID;
        let mut bids: Vec<Bid> = self
            .block_ptrs
            .directs()
            .iter()
            .copied()
            .filter(is_valid)
            .collect();

        let indirect_bid = self.block_ptrs.indirect();
        if is_valid(&indirect_bid) {
            let entries = IndirectBlock::new(indirect_bid, block_cache).read_all()?;
            bids.extend(entries.into_iter().filter(is_valid));
            bids.push(indirect_bid);
        }

        let db_indirect_bid = self.block_ptrs.db_indirect();
        if is_valid(&db_indirect_bid) {
            let lvl1_bids = IndirectBlock::new(db_indirect_bid, block_cache).read_all()?;
            for lvl1_bid in lvl1_bids.into_iter().filter(is_valid) {
                let entries = IndirectBlock::new(lvl1_bid, block_cache).read_all()?;
                bids.extend(entries.into_iter().filter(is_valid));
                bids.push(lvl1_bid);
            }
            bids.push(db_indirect_bid);
        }
        Ok(bids)
    }
}

#[inline]
fn size_to_blocks(size: usize) -> usize {
    size.div_ceil(BLOCK_SIZE)
}

const_assert!(size_of::<RawInode>() == BLOCK_SIZE);

/// The raw inode on device. It fills exactly one block.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod)]
pub(super) struct RawInode {
    /// Pointers to blocks.
    pub block_ptrs: BlockPtrs,
    /// Nonzero for a directory.
    pub is_dir: u32,
    /// Size in bytes.
    pub size: u32,
    pub magic: u32,
}

impl From<&InodeDesc> for RawInode {
    fn from(inode: &InodeDesc) -> Self {
        Self {
            block_ptrs: inode.block_ptrs,
            is_dir: inode.is_dir as u32,
            size: inode.size as u32,
            magic: INODE_MAGIC,
        }
    }
}
