//! On-disk structures and block device abstractions.

pub mod device;
pub mod inode;
pub mod layout;
pub mod superblock;

pub use device::*;
pub use inode::*;
pub use layout::*;
pub use superblock::*;
