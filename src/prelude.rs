// SPDX-License-Identifier: MPL-2.0

pub(crate) use ostd::Pod;
pub(crate) use static_assertions::const_assert;

pub(crate) use crate::bio::{
    Bid, BlockBuf, BlockCache, BlockDevice, BLOCK_SIZE, BLOCK_SIZE_LOG2, INVALID_BID,
};
pub(crate) use crate::block_alloc::BlockAlloc;
pub(crate) use crate::error::{FsError, Result};

pub(crate) use core::{fmt::Debug, mem::size_of, ops::Range};

pub(crate) use alloc::{
    boxed::Box,
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    vec,
    vec::Vec,
};
pub(crate) use spin::{Mutex, MutexGuard, RwLock};
