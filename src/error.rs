// SPDX-License-Identifier: MPL-2.0

use core::fmt;

/// The error type of every fallible storage operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FsError {
    /// A block number, offset or length is out of range.
    InvalidParam,
    /// The allocator has run out of free blocks.
    NoDeviceSpace,
    /// The underlying block device failed to read or write.
    DeviceError,
    /// The block does not hold a valid inode record.
    WrongFs,
    /// Writes to the inode are currently denied.
    WriteDenied,
}

pub type Result<T> = core::result::Result<T, FsError>;

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::InvalidParam => "invalid parameter",
            Self::NoDeviceSpace => "no space left on device",
            Self::DeviceError => "block device error",
            Self::WrongFs => "not a valid inode record",
            Self::WriteDenied => "writes to the inode are denied",
        };
        f.write_str(msg)
    }
}
