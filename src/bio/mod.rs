// SPDX-License-Identifier: MPL-2.0

pub use self::block_buf::BlockBuf;
pub use self::block_cache::{BlockCache, DEFAULT_CACHE_CAP};
pub use self::block_device::BlockDevice;

pub type Bid = u32;
pub const BLOCK_SIZE: usize = 512;
pub const BLOCK_SIZE_LOG2: u8 = 9;

/// The reserved block number meaning "no block".
///
/// Every block number at or beyond it is treated as unallocated.
pub const INVALID_BID: Bid = 0xFFFF_FFFA;

mod block_buf;
mod block_cache;
mod block_device;
