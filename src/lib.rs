// SPDX-License-Identifier: MPL-2.0

//! Persistent inode storage on a fixed-block device.
//!
//! Files are described by inode records of exactly one block. A record maps
//! the file's blocks through direct pointers, one indirect block and one
//! doubly indirect block. All device traffic goes through a shared write-back
//! block cache with LRU eviction.
//!
//! # Example
//!
//! ```no_run
//! // Builds the storage upon a block device and a free-block allocator.
//! let fs = SectorFs::new(block_device, block_alloc, Config::default());
//! // Creates an empty file whose record lives in block `ino`.
//! fs.create(ino, 0, false)?;
//! // Writes data into the file, growing it as needed.
//! let file = fs.open(ino)?;
//! const WRITE_DATA: &[u8] = b"Hello, World";
//! let len = file.write_at(0, WRITE_DATA)?;
//! assert!(len == WRITE_DATA.len());
//! fs.close(file)?;
//! fs.unmount()?;
//! ```

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate log;

extern crate alloc;
extern crate lru;

pub use bio::{Bid, BlockBuf, BlockCache, BlockDevice, BLOCK_SIZE, INVALID_BID};
pub use block_alloc::{BitmapAlloc, BlockAlloc};
pub use block_ptr::MAX_FILE_SIZE;
pub use error::{FsError, Result};
pub use fs::{Config, SectorFs};
pub use inode::{Inode, INODE_MAGIC};

mod bio;
mod block_alloc;
mod block_ptr;
mod error;
mod fs;
mod indirect;
mod inode;
mod prelude;
mod utils;
