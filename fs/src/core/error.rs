//! Error type shared by the disk, cache, journal and VFS layers.
//!
//! Variant names follow the POSIX-style error kinds the interface is
//! specified against (`EINVAL`, `ENOSPC`, ...) alongside a few
//! lower-level disk/superblock failures that never cross the VFS
//! boundary as-is but are useful while debugging mkfs/mount.

use core::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HfsError {
    /// Invalid argument.
    Inval,
    /// Out of memory.
    NoMem,
    /// No space left on device.
    NoSpc,
    /// Bad address (copy to/from userspace failed).
    Fault,
    /// Name already exists.
    Exist,
    /// No such file or directory.
    NoEnt,
    /// Not a directory.
    NotDir,
    /// Is a directory.
    IsDir,
    /// Directory not empty.
    NotEmpty,
    /// Cross-device link.
    Xdev,
    /// Resource busy.
    Busy,
    /// Too many symlinks.
    Loop,
    /// Read-only filesystem.
    ReadOnlyFilesystem,
    /// Function not implemented.
    NoSys,

    /// Superblock magic did not match.
    BadMagic,
    /// On-disk superblock checksum mismatch.
    ChecksumMismatch,
    /// On-disk version newer than this implementation understands.
    IncompatibleVersion,
    /// Superblock fields failed a sanity check.
    SuperblockCorruption,
    /// Block number outside the device's valid range.
    InvalidBlockNumber,
    /// Device is not open / not ready for I/O.
    DeviceNotReady,
    /// Underlying device read failed.
    IoReadError,
    /// Underlying device write failed.
    IoWriteError,
}

impl fmt::Display for HfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Inval => "invalid argument",
            Self::NoMem => "out of memory",
            Self::NoSpc => "no space left on device",
            Self::Fault => "bad address",
            Self::Exist => "file exists",
            Self::NoEnt => "no such file or directory",
            Self::NotDir => "not a directory",
            Self::IsDir => "is a directory",
            Self::NotEmpty => "directory not empty",
            Self::Xdev => "cross-device link",
            Self::Busy => "resource busy",
            Self::Loop => "too many levels of symbolic links",
            Self::ReadOnlyFilesystem => "read-only filesystem",
            Self::NoSys => "function not implemented",
            Self::BadMagic => "bad superblock magic",
            Self::ChecksumMismatch => "superblock checksum mismatch",
            Self::IncompatibleVersion => "incompatible on-disk version",
            Self::SuperblockCorruption => "superblock sanity check failed",
            Self::InvalidBlockNumber => "invalid block number",
            Self::DeviceNotReady => "device not ready",
            Self::IoReadError => "device read error",
            Self::IoWriteError => "device write error",
        };
        f.write_str(msg)
    }
}

pub type HfsResult<T> = Result<T, HfsError>;
