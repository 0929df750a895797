//! Adapter from a mounted filesystem's inode to `helix-memory`'s
//! [`FileBacking`] trait, so [`vm_manager::VmManager::mmap`] can page a
//! file's contents in and out through the same `read_at`/`write_at`
//! path [`super::OpenFile`] uses.
//!
//! [`vm_manager::VmManager::mmap`]: helix_memory::virtual_memory::vm_manager::VmManager::mmap

use alloc_crate::sync::Arc;

use helix_memory::virtual_memory::FileBacking;
use helix_memory::{MemError, MemResult};

use crate::core::error::HfsError;
use super::{with_txn, Inode, SuperBlock};

fn to_mem_err(e: HfsError) -> MemError {
    match e {
        HfsError::NoSpc | HfsError::NoMem => MemError::OutOfMemory,
        HfsError::Inval => MemError::InvalidSize,
        HfsError::Fault => MemError::Fault,
        HfsError::Busy => MemError::Busy,
        HfsError::NoSys => MemError::NoSys,
        _ => MemError::Internal,
    }
}

/// One mmap'd file: a mounted filesystem plus the inode whose bytes a
/// region's pages are demand-paged from and written back to.
pub struct InodeBacking {
    sb: Arc<SuperBlock>,
    inode: Arc<Inode>,
    shared: bool,
}

impl InodeBacking {
    /// `shared` mirrors the mmap caller's `MAP_SHARED`/`MAP_PRIVATE`
    /// choice; see [`FileBacking::shared`].
    pub fn new(sb: Arc<SuperBlock>, inode: Arc<Inode>, shared: bool) -> Arc<Self> {
        Arc::new(Self { sb, inode, shared })
    }
}

impl FileBacking for InodeBacking {
    fn read_page(&self, offset: u64, buf: &mut [u8]) -> MemResult<usize> {
        self.sb.ops().read_at(&self.sb, self.inode.ino, offset, buf).map_err(to_mem_err)
    }

    /// Writeback runs in its own transaction, same as any other
    /// mutating back-end call; a dirty mmap'd page isn't otherwise
    /// covered by a caller-held transaction bracket.
    fn write_page(&self, offset: u64, buf: &[u8]) -> MemResult<()> {
        with_txn(&self.sb, || self.sb.ops().write_at(&self.sb, self.inode.ino, offset, buf))
            .map(|_| ())
            .map_err(to_mem_err)
    }

    fn len(&self) -> u64 {
        self.inode.attr().size
    }

    fn shared(&self) -> bool {
        self.shared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::OpenFlags;
    use crate::core::types::InodeNum;
    use crate::vfs;

    fn make_sb() -> (Arc<SuperBlock>, Arc<Inode>, alloc_crate::vec::Vec<u8>) {
        // Exercised against `simplefs`, the real back end this adapter
        // sits in front of (the in-memory stub in `vfs::tests` is
        // private to that module).
        use crate::backend::simplefs::SimpleFs;
        use crate::disk::device::MemoryBlockDevice;
        use alloc_crate::vec;

        let total_blocks = 512u64;
        let size = total_blocks as usize * crate::BLOCK_SIZE;
        let mut storage = vec![0u8; size];
        let dev: Arc<dyn crate::disk::device::BlockDevice> =
            unsafe { Arc::new(MemoryBlockDevice::from_buffer(storage.as_mut_ptr(), size, crate::BLOCK_SIZE as u32)) };
        let sb = SimpleFs::format(dev, total_blocks, 64).unwrap();
        let root = sb.get_inode(InodeNum::ROOT).unwrap();
        (sb, root, storage)
    }

    #[test]
    fn read_page_sees_file_contents_written_through_vfs() {
        let (sb, root, _storage) = make_sb();
        let file = vfs::open(&sb, &root, &root, b"/mmapped", OpenFlags(OpenFlags::O_RDWR | OpenFlags::O_CREAT), 0o644).unwrap();
        file.write(&sb, b"paged in").unwrap();
        let inode = file.inode().clone();

        let backing = InodeBacking::new(sb.clone(), inode, true);
        assert_eq!(backing.len(), 8);
        let mut buf = [0u8; 8];
        assert_eq!(backing.read_page(0, &mut buf).unwrap(), 8);
        assert_eq!(&buf, b"paged in");

        vfs::close(&sb, file).unwrap();
        sb.put_inode(root).unwrap();
    }

    #[test]
    fn write_page_persists_through_its_own_transaction() {
        let (sb, root, _storage) = make_sb();
        let file = vfs::open(&sb, &root, &root, b"/dirty", OpenFlags(OpenFlags::O_RDWR | OpenFlags::O_CREAT), 0o644).unwrap();
        let inode = file.inode().clone();
        vfs::close(&sb, file).unwrap();

        let backing = InodeBacking::new(sb.clone(), inode.clone(), false);
        backing.write_page(0, b"writeback").unwrap();

        let mut buf = [0u8; 9];
        let n = sb.ops().read_at(&sb, inode.ino, 0, &mut buf).unwrap();
        assert_eq!(n, 9);
        assert_eq!(&buf, b"writeback");
        assert!(!backing.shared());

        sb.put_inode(root).unwrap();
    }
}
