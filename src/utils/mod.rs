// SPDX-License-Identifier: MPL-2.0

pub use self::block_iter::BlockIter;
pub use self::id_alloc::IdAlloc;

mod block_iter;
mod id_alloc;
