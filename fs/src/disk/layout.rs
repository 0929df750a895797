//! Static on-disk layout: where the superblock, allocation bitmap, log
//! region and inode table sit relative to each other.
//!
//! ```text
//! block 0:              superblock
//! [bitmap_start, ..):   free-block bitmap (one bit per data/inode block)
//! [inode_table_start,..): inode table (INODES_PER_BLOCK inodes/block)
//! [log_start, ..):      write-ahead log: header block + LOGSIZE data blocks
//! [data_start, total):  data blocks, managed by the block allocator
//! ```

use crate::alloc::BITS_PER_BLOCK;
use crate::disk::inode::INODES_PER_BLOCK;
use crate::journal::wal::LOGSIZE;

/// Minimum filesystem size for [`DiskLayout::calculate`] to produce a
/// usable layout (enough blocks for superblock + one bitmap block + one
/// inode block + a full log + at least a few data blocks).
pub const MIN_FS_SIZE_BLOCKS: u64 = 64;

/// Computed block-level layout of a freshly formatted filesystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiskLayout {
    pub total_blocks: u64,
    pub bitmap_start: u64,
    pub bitmap_blocks: u64,
    pub inode_table_start: u64,
    pub inode_table_blocks: u64,
    pub num_inodes: u64,
    pub log_start: u64,
    pub log_blocks: u64,
    pub data_start: u64,
}

impl DiskLayout {
    /// Lay out `total_blocks` blocks, reserving `num_inodes` inodes.
    pub fn calculate(total_blocks: u64, num_inodes: u64) -> Self {
        let inode_table_blocks =
            (num_inodes + INODES_PER_BLOCK as u64 - 1) / INODES_PER_BLOCK as u64;
        let data_region_guess = total_blocks.saturating_sub(1 + inode_table_blocks + 1 + LOGSIZE as u64);
        let bitmap_blocks =
            (data_region_guess + BITS_PER_BLOCK as u64 - 1) / BITS_PER_BLOCK as u64 + 1;

        let bitmap_start = 1;
        let inode_table_start = bitmap_start + bitmap_blocks;
        let log_start = inode_table_start + inode_table_blocks;
        let log_blocks = 1 + LOGSIZE as u64; // header block + data slots
        let data_start = log_start + log_blocks;

        Self {
            total_blocks,
            bitmap_start,
            bitmap_blocks,
            inode_table_start,
            inode_table_blocks,
            num_inodes,
            log_start,
            log_blocks,
            data_start,
        }
    }

    /// Number of blocks available to the data allocator.
    pub fn data_blocks(&self) -> u64 {
        self.total_blocks.saturating_sub(self.data_start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_regions_are_disjoint_and_ordered() {
        let l = DiskLayout::calculate(4096, 256);
        assert_eq!(l.bitmap_start, 1);
        assert!(l.inode_table_start > l.bitmap_start);
        assert!(l.log_start > l.inode_table_start);
        assert!(l.data_start > l.log_start);
        assert!(l.data_start < l.total_blocks);
        assert_eq!(l.log_blocks, 1 + LOGSIZE as u64);
    }

    #[test]
    fn larger_filesystem_gets_larger_bitmap() {
        let small = DiskLayout::calculate(4096, 256);
        let big = DiskLayout::calculate(4_000_000, 65536);
        assert!(big.bitmap_blocks > small.bitmap_blocks);
        assert!(big.data_blocks() > small.data_blocks());
    }
}
