// SPDX-License-Identifier: MPL-2.0

use core::num::NonZeroUsize;

use crate::{
    bio::DEFAULT_CACHE_CAP,
    inode::{BlockMap, Inode, InodeDesc, RawInode},
    prelude::*,
};

/// Tunables of a [`SectorFs`].
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// The number of blocks kept by the block cache.
    pub cache_capacity: NonZeroUsize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAP,
        }
    }
}

/// Inode storage on a block device.
///
/// Every inode lives in a record block chosen by the caller; the block number
/// of the record is the inode number. Opening the same inode twice yields the
/// same handle.
pub struct SectorFs {
    block_cache: Arc<BlockCache>,
    block_alloc: Arc<dyn BlockAlloc>,
    /// Lock order: `open_inodes` first, then the lock of any inode.
    open_inodes: Mutex<BTreeMap<Bid, Arc<Inode>>>,
}

impl SectorFs {
    /// Creates the storage upon `block_device`, taking blocks from `block_alloc`.
    pub fn new(
        block_device: Arc<dyn BlockDevice>,
        block_alloc: Arc<dyn BlockAlloc>,
        config: Config,
    ) -> Self {
        info!(
            "sector fs on {} blocks, cache capacity {}",
            block_device.total_blocks(),
            config.cache_capacity
        );
        Self {
            block_cache: Arc::new(BlockCache::new(block_device, config.cache_capacity)),
            block_alloc,
            open_inodes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns the block cache.
    pub fn block_cache(&self) -> &Arc<BlockCache> {
        &self.block_cache
    }

    /// Returns the block allocator.
    pub fn block_alloc(&self) -> &Arc<dyn BlockAlloc> {
        &self.block_alloc
    }

    /// Writes a new inode record of `size` zero bytes into block `ino`.
    ///
    /// The record block itself must already be reserved by the caller. On
    /// failure no block is left allocated.
    pub fn create(&self, ino: Bid, size: usize, is_dir: bool) -> Result<()> {
        let mut desc = InodeDesc::new(is_dir);
        let resized =
            BlockMap::new(&mut desc, &self.block_cache, self.block_alloc.as_ref()).resize(size);
        let stored =
            resized.and_then(|()| self.block_cache.write_val(ino, 0, &RawInode::from(&desc)));
        if let Err(e) = stored {
            let mut block_map =
                BlockMap::new(&mut desc, &self.block_cache, self.block_alloc.as_ref());
            if let Err(undo_err) = block_map.free_all() {
                error!("failed to release the blocks of inode {}: {}", ino, undo_err);
            }
            return Err(e);
        }
        debug!("inode {} created: size = {}, is_dir = {}", ino, size, is_dir);
        Ok(())
    }

    /// Opens the inode stored in block `ino`.
    ///
    /// If the inode is already open its handle is shared and its open count
    /// bumped.
    pub fn open(&self, ino: Bid) -> Result<Arc<Inode>> {
        let mut open_inodes = self.open_inodes.lock();
        if let Some(inode) = open_inodes.get(&ino) {
            inode.reopen();
            return Ok(inode.clone());
        }

        let raw_inode = self.block_cache.read_val::<RawInode>(ino, 0)?;
        if let Err(e) = InodeDesc::try_from(raw_inode) {
            error!("block {} holds no inode record", ino);
            return Err(e);
        }
        let inode = Arc::new(Inode::new(
            ino,
            self.block_cache.clone(),
            self.block_alloc.clone(),
        ));
        open_inodes.insert(ino, inode.clone());
        trace!("inode {} opened", ino);
        Ok(inode)
    }

    /// Adds an opener to the already open `inode` and returns its handle.
    pub fn reopen(&self, inode: &Arc<Inode>) -> Arc<Inode> {
        let _open_inodes = self.open_inodes.lock();
        inode.reopen();
        inode.clone()
    }

    /// Closes one opener of `inode`.
    ///
    /// When the last opener closes a removed inode, all of its blocks and its
    /// record block are released.
    pub fn close(&self, inode: Arc<Inode>) -> Result<()> {
        let mut open_inodes = self.open_inodes.lock();
        if inode.dec_open_count() > 0 {
            return Ok(());
        }
        open_inodes.remove(&inode.ino());
        drop(open_inodes);
        trace!("inode {} closed", inode.ino());

        if inode.is_removed() {
            inode.free_all()?;
        }
        Ok(())
    }

    /// Returns the number of distinct open inodes.
    pub fn open_inodes(&self) -> usize {
        self.open_inodes.lock().len()
    }

    /// Writes every dirty block to the device, keeping them cached.
    pub fn sync(&self) -> Result<()> {
        self.block_cache.sync()?;
        self.block_cache.disk().sync()
    }

    /// Writes every dirty block to the device and empties the cache.
    pub fn unmount(&self) -> Result<()> {
        let open_inodes = self.open_inodes();
        if open_inodes > 0 {
            warn!("unmounting with {} inodes still open", open_inodes);
        }
        self.block_cache.flush_all()?;
        self.block_cache.disk().sync()?;
        info!("sector fs unmounted");
        Ok(())
    }
}

impl Debug for SectorFs {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("SectorFs")
            .field("block_cache", &self.block_cache)
            .field("open_inodes", &self.open_inodes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::{
        block_alloc::BitmapAlloc,
        block_ptr::{DIRECT_CNT, INDIRECT_CNT},
        inode::INODE_MAGIC,
        test::MemDisk,
    };

    const TOTAL_BLOCKS: usize = 1024;

    fn new_fs(cache_capacity: usize) -> (Arc<MemDisk>, Arc<BitmapAlloc>, SectorFs) {
        let disk = Arc::new(MemDisk::new(TOTAL_BLOCKS));
        let block_alloc = Arc::new(BitmapAlloc::new(1..TOTAL_BLOCKS as Bid));
        let config = Config {
            cache_capacity: NonZeroUsize::new(cache_capacity).unwrap(),
        };
        let fs = SectorFs::new(disk.clone(), block_alloc.clone(), config);
        (disk, block_alloc, fs)
    }

    fn create_inode(fs: &SectorFs, size: usize) -> Bid {
        let ino = fs.block_alloc().alloc_block().unwrap();
        fs.create(ino, size, false).unwrap();
        ino
    }

    #[test]
    fn opening_twice_shares_the_handle() {
        let (_, _, fs) = new_fs(16);
        let ino = create_inode(&fs, 10);

        let first = fs.open(ino).unwrap();
        let second = fs.open(ino).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.open_count(), 2);
        assert_eq!(fs.open_inodes(), 1);

        fs.close(second).unwrap();
        assert_eq!(first.open_count(), 1);
        assert_eq!(fs.open_inodes(), 1);
        fs.close(first).unwrap();
        assert_eq!(fs.open_inodes(), 0);

        // A fresh handle after the last close.
        let third = fs.open(ino).unwrap();
        assert_eq!(third.open_count(), 1);
        let fourth = fs.reopen(&third);
        assert!(Arc::ptr_eq(&third, &fourth));
        assert_eq!(third.open_count(), 2);
    }

    #[test]
    fn created_inode_reads_as_zeros() {
        let (_, _, fs) = new_fs(16);
        let ino = fs.block_alloc().alloc_block().unwrap();
        fs.create(ino, 3 * BLOCK_SIZE + 5, true).unwrap();

        let inode = fs.open(ino).unwrap();
        assert!(inode.is_dir().unwrap());
        assert_eq!(inode.file_size().unwrap(), 3 * BLOCK_SIZE + 5);
        let mut buf = vec![0xAAu8; 4 * BLOCK_SIZE];
        assert_eq!(inode.read_at(0, &mut buf).unwrap(), 3 * BLOCK_SIZE + 5);
        assert!(buf[..3 * BLOCK_SIZE + 5].iter().all(|&b| b == 0));
    }

    #[test]
    fn failed_create_releases_its_blocks() {
        let (_, block_alloc, fs) = new_fs(16);
        let ino = fs.block_alloc().alloc_block().unwrap();
        let free = block_alloc.free_count();
        assert_eq!(
            fs.create(ino, (free as usize + 1) * BLOCK_SIZE, false),
            Err(FsError::NoDeviceSpace)
        );
        assert_eq!(block_alloc.free_count(), free);
    }

    #[test]
    fn open_rejects_a_non_inode_block() {
        let (disk, _, fs) = new_fs(16);
        let bid = fs.block_alloc().alloc_block().unwrap();
        disk.set_block(bid, &[0x42; BLOCK_SIZE]);
        assert_eq!(fs.open(bid).err(), Some(FsError::WrongFs));
        assert_eq!(fs.open_inodes(), 0);
        assert_eq!(fs.open(INVALID_BID).err(), Some(FsError::InvalidParam));
    }

    #[test]
    fn removed_inode_is_freed_on_last_close() {
        let (_, block_alloc, fs) = new_fs(16);
        let free = block_alloc.free_count();
        let ino = create_inode(&fs, (DIRECT_CNT + INDIRECT_CNT + 5) * BLOCK_SIZE);

        let first = fs.open(ino).unwrap();
        let second = fs.open(ino).unwrap();
        first.remove();
        fs.close(first).unwrap();
        assert!(block_alloc.is_allocated(ino));

        // Still usable by the remaining opener.
        assert!(second.is_removed());
        second.write_at(0, b"still here").unwrap();
        fs.close(second).unwrap();

        assert_eq!(block_alloc.free_count(), free);
        assert!(!block_alloc.is_allocated(ino));
    }

    #[test]
    fn freed_record_no_longer_opens() {
        let (disk, _, fs) = new_fs(16);
        let ino = create_inode(&fs, 2 * BLOCK_SIZE);
        let inode = fs.open(ino).unwrap();
        inode.remove();
        fs.close(inode).unwrap();

        assert_eq!(fs.open(ino).err(), Some(FsError::WrongFs));
        assert_eq!(fs.open_inodes(), 0);
        fs.sync().unwrap();
        assert!(disk.block(ino).iter().all(|&b| b == 0));
    }

    #[test]
    fn closing_without_remove_keeps_the_blocks() {
        let (_, block_alloc, fs) = new_fs(16);
        let ino = create_inode(&fs, 20 * BLOCK_SIZE);
        let free = block_alloc.free_count();

        let inode = fs.open(ino).unwrap();
        inode.write_at(0, b"persist").unwrap();
        fs.close(inode).unwrap();
        assert_eq!(block_alloc.free_count(), free);

        let inode = fs.open(ino).unwrap();
        let mut buf = [0u8; 7];
        inode.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"persist");
    }

    #[test]
    fn deny_write_blocks_every_opener() {
        let (_, _, fs) = new_fs(16);
        let ino = create_inode(&fs, 0);
        let writer = fs.open(ino).unwrap();
        let executor = fs.open(ino).unwrap();

        executor.deny_write();
        assert_eq!(writer.deny_write_count(), 1);
        assert_eq!(writer.write_at(0, b"patch"), Err(FsError::WriteDenied));
        assert_eq!(writer.file_size().unwrap(), 0);

        executor.allow_write();
        assert_eq!(writer.write_at(0, b"patch").unwrap(), 5);
        fs.close(executor).unwrap();
        fs.close(writer).unwrap();
    }

    #[test]
    fn unmount_persists_every_inode() {
        let (disk, _, fs) = new_fs(8);
        let ino = create_inode(&fs, 0);
        let inode = fs.open(ino).unwrap();
        inode.write_at(BLOCK_SIZE - 2, b"span").unwrap();
        fs.close(inode).unwrap();
        fs.unmount().unwrap();
        assert_eq!(fs.block_cache().slot_of(ino), None);

        let raw_inode = disk.block(ino);
        assert_eq!(&raw_inode[BLOCK_SIZE - 4..], &INODE_MAGIC.to_ne_bytes());
        let first = u32::from_ne_bytes(raw_inode[..4].try_into().unwrap());
        let second = u32::from_ne_bytes(raw_inode[4..8].try_into().unwrap());
        assert_eq!(&disk.block(first)[BLOCK_SIZE - 2..], b"sp");
        assert_eq!(&disk.block(second)[..2], b"an");

        // The same device mounted again sees the data.
        let block_alloc = Arc::new(BitmapAlloc::new(1..TOTAL_BLOCKS as Bid));
        let fs = SectorFs::new(disk, block_alloc, Config::default());
        let mut buf = [0u8; 4];
        fs.open(ino).unwrap().read_at(BLOCK_SIZE - 2, &mut buf).unwrap();
        assert_eq!(&buf, b"span");
    }

    #[test]
    fn sync_writes_back_without_evicting() {
        let (disk, _, fs) = new_fs(16);
        let ino = create_inode(&fs, 0);
        let inode = fs.open(ino).unwrap();
        inode.write_at(0, b"synced").unwrap();
        fs.sync().unwrap();
        assert!(fs.block_cache().contains(ino));
        let bid = inode.resolve(0).unwrap().unwrap();
        assert_eq!(&disk.block(bid)[..6], b"synced");
    }

    #[test]
    fn concurrent_opens_and_closes() {
        let (_, block_alloc, fs) = new_fs(16);
        let fs = Arc::new(fs);
        let ino = create_inode(&fs, 3 * BLOCK_SIZE);
        let free = block_alloc.free_count();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let fs = fs.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        let inode = fs.open(ino).unwrap();
                        assert_eq!(inode.file_size().unwrap(), 3 * BLOCK_SIZE);
                        fs.close(inode).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(fs.open_inodes(), 0);
        assert_eq!(block_alloc.free_count(), free);
    }
}
