//! Superblock: one mounted filesystem instance and its inode cache.
//!
//! Lookup follows the read-lock/upgrade protocol from spec.md §4.F: a
//! hit is served under the read lock, a miss upgrades to the write
//! lock, re-checks (another hart may have raced in and won), and
//! otherwise calls the back end's [`FsOps::get_inode`].

use alloc_crate::boxed::Box;
use alloc_crate::sync::Arc;
use alloc_crate::vec::Vec;
use spin::RwLock;

use crate::api::{FileType, FsStats};
use crate::core::error::HfsResult;
use crate::core::types::{DevNum, FsTypeId, InodeNum};

use super::inode::{Inode, InodeAttr};

/// Bucket count for the inode hash table, per spec.md §4.F ("fixed,
/// e.g. 61").
const HASH_BUCKETS: usize = 61;

/// The back end a [`SuperBlock`] delegates every on-disk operation to.
///
/// One implementation per registered [`super::FsType`]; see
/// `backend::simplefs` for the concrete filesystem this workspace
/// ships to exercise this trait end to end.
pub trait FsOps: Send + Sync {
    fn get_inode(&self, sb: &SuperBlock, ino: InodeNum) -> HfsResult<InodeAttr>;
    fn write_inode(&self, sb: &SuperBlock, ino: InodeNum, attr: &InodeAttr) -> HfsResult<()>;
    fn destroy_inode(&self, sb: &SuperBlock, ino: InodeNum) -> HfsResult<()>;

    fn lookup(&self, sb: &SuperBlock, dir: InodeNum, name: &[u8]) -> HfsResult<InodeNum>;
    fn create(&self, sb: &SuperBlock, dir: InodeNum, name: &[u8], mode: u32, ftype: FileType) -> HfsResult<InodeNum>;
    fn unlink(&self, sb: &SuperBlock, dir: InodeNum, name: &[u8]) -> HfsResult<()>;
    fn link(&self, sb: &SuperBlock, dir: InodeNum, name: &[u8], target: InodeNum) -> HfsResult<()>;
    fn mkdir(&self, sb: &SuperBlock, dir: InodeNum, name: &[u8], mode: u32) -> HfsResult<InodeNum>;
    fn rmdir(&self, sb: &SuperBlock, dir: InodeNum, name: &[u8]) -> HfsResult<()>;
    fn rename(&self, sb: &SuperBlock, old_dir: InodeNum, old_name: &[u8], new_dir: InodeNum, new_name: &[u8]) -> HfsResult<()>;
    fn symlink(&self, sb: &SuperBlock, dir: InodeNum, name: &[u8], target: &[u8]) -> HfsResult<InodeNum>;
    fn readlink(&self, sb: &SuperBlock, ino: InodeNum, buf: &mut [u8]) -> HfsResult<usize>;
    fn truncate(&self, sb: &SuperBlock, ino: InodeNum, size: u64) -> HfsResult<()>;

    fn read_at(&self, sb: &SuperBlock, ino: InodeNum, offset: u64, buf: &mut [u8]) -> HfsResult<usize>;
    fn write_at(&self, sb: &SuperBlock, ino: InodeNum, offset: u64, buf: &[u8]) -> HfsResult<usize>;
    fn readdir(
        &self,
        sb: &SuperBlock,
        ino: InodeNum,
        cursor: u64,
        visit: &mut dyn FnMut(&[u8], InodeNum, FileType) -> bool,
    ) -> HfsResult<u64>;

    fn statfs(&self, sb: &SuperBlock) -> HfsResult<FsStats>;
    fn sync_fs(&self, sb: &SuperBlock) -> HfsResult<()>;

    /// Open a log transaction around a mutation sequence. Either a
    /// direct call into `helix-fs::journal::Log`, or a no-op for a
    /// back end with no log of its own.
    fn begin_txn(&self, sb: &SuperBlock) -> HfsResult<()>;
    fn end_txn(&self, sb: &SuperBlock) -> HfsResult<()>;
}

struct SuperBlockInner {
    buckets: [Vec<Arc<Inode>>; HASH_BUCKETS],
}

/// One mounted filesystem: the device it lives on, the back end that
/// implements its operations, and the inode cache every lookup goes
/// through.
pub struct SuperBlock {
    pub fs_type: FsTypeId,
    pub dev: DevNum,
    pub root_ino: InodeNum,
    ops: Box<dyn FsOps>,
    inner: RwLock<SuperBlockInner>,
}

impl SuperBlock {
    pub fn new(fs_type: FsTypeId, dev: DevNum, root_ino: InodeNum, ops: Box<dyn FsOps>) -> Arc<Self> {
        Arc::new(Self {
            fs_type,
            dev,
            root_ino,
            ops,
            inner: RwLock::new(SuperBlockInner { buckets: core::array::from_fn(|_| Vec::new()) }),
        })
    }

    pub fn ops(&self) -> &dyn FsOps {
        &*self.ops
    }

    fn bucket_index(ino: InodeNum) -> usize {
        (ino.get() as usize) % HASH_BUCKETS
    }

    /// Look up `ino`, serving a cache hit under the read lock and
    /// falling back to the back end on a miss.
    pub fn get_inode(self: &Arc<Self>, ino: InodeNum) -> HfsResult<Arc<Inode>> {
        let idx = Self::bucket_index(ino);

        {
            let inner = self.inner.read();
            if let Some(found) = inner.buckets[idx].iter().find(|i| i.ino == ino) {
                return Ok(found.clone());
            }
        }

        let mut inner = self.inner.write();
        if let Some(found) = inner.buckets[idx].iter().find(|i| i.ino == ino) {
            return Ok(found.clone());
        }
        let attr = self.ops.get_inode(self, ino)?;
        let inode = Inode::new(ino, attr);
        inner.buckets[idx].push(inode.clone());
        Ok(inode)
    }

    /// Release a reference obtained from [`Self::get_inode`]. On the
    /// last external reference, writes back a dirty inode and — if
    /// its hard-link count has dropped to zero — destroys it and
    /// drops it from the cache, per spec.md §4.F.
    pub fn put_inode(self: &Arc<Self>, inode: Arc<Inode>) -> HfsResult<()> {
        let mut inner = self.inner.write();
        if Arc::strong_count(&inode) > 2 {
            return Ok(());
        }

        if inode.is_dirty() {
            self.ops.write_inode(self, inode.ino, &inode.attr())?;
            inode.clear_dirty();
        }

        if inode.attr().nlink == 0 {
            self.ops.destroy_inode(self, inode.ino)?;
            let idx = Self::bucket_index(inode.ino);
            inner.buckets[idx].retain(|i| i.ino != inode.ino);
        }
        Ok(())
    }

    pub fn sync(self: &Arc<Self>) -> HfsResult<()> {
        let inner = self.inner.read();
        for bucket in inner.buckets.iter() {
            for inode in bucket {
                if inode.is_dirty() {
                    self.ops.write_inode(self, inode.ino, &inode.attr())?;
                    inode.clear_dirty();
                }
            }
        }
        self.ops.sync_fs(self)
    }

    pub fn cached_inode_count(&self) -> usize {
        self.inner.read().buckets.iter().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::HfsError;
    use alloc_crate::collections::BTreeMap;
    use spin::Mutex;

    /// Back end stub: a flat table of inode attributes with no
    /// directory structure, enough to exercise the cache protocol.
    struct StubOps {
        table: Mutex<BTreeMap<u64, InodeAttr>>,
    }

    impl StubOps {
        fn new() -> Self {
            Self { table: Mutex::new(BTreeMap::new()) }
        }

        fn insert(&self, ino: u64, attr: InodeAttr) {
            self.table.lock().insert(ino, attr);
        }
    }

    impl FsOps for StubOps {
        fn get_inode(&self, _sb: &SuperBlock, ino: InodeNum) -> HfsResult<InodeAttr> {
            self.table.lock().get(&ino.get()).copied().ok_or(HfsError::NoEnt)
        }
        fn write_inode(&self, _sb: &SuperBlock, ino: InodeNum, attr: &InodeAttr) -> HfsResult<()> {
            self.table.lock().insert(ino.get(), *attr);
            Ok(())
        }
        fn destroy_inode(&self, _sb: &SuperBlock, ino: InodeNum) -> HfsResult<()> {
            self.table.lock().remove(&ino.get());
            Ok(())
        }
        fn lookup(&self, _sb: &SuperBlock, _dir: InodeNum, _name: &[u8]) -> HfsResult<InodeNum> {
            Err(HfsError::NoEnt)
        }
        fn create(&self, _sb: &SuperBlock, _dir: InodeNum, _name: &[u8], _mode: u32, _ftype: FileType) -> HfsResult<InodeNum> {
            Err(HfsError::NoSys)
        }
        fn unlink(&self, _sb: &SuperBlock, _dir: InodeNum, _name: &[u8]) -> HfsResult<()> {
            Err(HfsError::NoSys)
        }
        fn link(&self, _sb: &SuperBlock, _dir: InodeNum, _name: &[u8], _target: InodeNum) -> HfsResult<()> {
            Err(HfsError::NoSys)
        }
        fn mkdir(&self, _sb: &SuperBlock, _dir: InodeNum, _name: &[u8], _mode: u32) -> HfsResult<InodeNum> {
            Err(HfsError::NoSys)
        }
        fn rmdir(&self, _sb: &SuperBlock, _dir: InodeNum, _name: &[u8]) -> HfsResult<()> {
            Err(HfsError::NoSys)
        }
        fn rename(&self, _sb: &SuperBlock, _od: InodeNum, _on: &[u8], _nd: InodeNum, _nn: &[u8]) -> HfsResult<()> {
            Err(HfsError::NoSys)
        }
        fn symlink(&self, _sb: &SuperBlock, _dir: InodeNum, _name: &[u8], _target: &[u8]) -> HfsResult<InodeNum> {
            Err(HfsError::NoSys)
        }
        fn readlink(&self, _sb: &SuperBlock, _ino: InodeNum, _buf: &mut [u8]) -> HfsResult<usize> {
            Err(HfsError::NoSys)
        }
        fn truncate(&self, _sb: &SuperBlock, _ino: InodeNum, _size: u64) -> HfsResult<()> {
            Err(HfsError::NoSys)
        }
        fn read_at(&self, _sb: &SuperBlock, _ino: InodeNum, _offset: u64, _buf: &mut [u8]) -> HfsResult<usize> {
            Err(HfsError::NoSys)
        }
        fn write_at(&self, _sb: &SuperBlock, _ino: InodeNum, _offset: u64, _buf: &[u8]) -> HfsResult<usize> {
            Err(HfsError::NoSys)
        }
        fn readdir(&self, _sb: &SuperBlock, _ino: InodeNum, _cursor: u64, _visit: &mut dyn FnMut(&[u8], InodeNum, FileType) -> bool) -> HfsResult<u64> {
            Err(HfsError::NoSys)
        }
        fn statfs(&self, _sb: &SuperBlock) -> HfsResult<FsStats> {
            Ok(FsStats::new())
        }
        fn sync_fs(&self, _sb: &SuperBlock) -> HfsResult<()> {
            Ok(())
        }
        fn begin_txn(&self, _sb: &SuperBlock) -> HfsResult<()> {
            Ok(())
        }
        fn end_txn(&self, _sb: &SuperBlock) -> HfsResult<()> {
            Ok(())
        }
    }

    fn make_sb() -> Arc<SuperBlock> {
        let ops = StubOps::new();
        ops.insert(2, InodeAttr::new(FileType::Regular, 0o644));
        SuperBlock::new(FsTypeId::new(1), DevNum::new(0), InodeNum::new(1), Box::new(ops))
    }

    #[test]
    fn miss_then_hit_returns_same_inode() {
        let sb = make_sb();
        let a = sb.get_inode(InodeNum::new(2)).unwrap();
        let b = sb.get_inode(InodeNum::new(2)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(sb.cached_inode_count(), 1);
    }

    #[test]
    fn unknown_inode_propagates_back_end_error() {
        let sb = make_sb();
        assert_eq!(sb.get_inode(InodeNum::new(99)).unwrap_err(), HfsError::NoEnt);
    }

    #[test]
    fn put_inode_with_live_links_keeps_entry_cached() {
        let sb = make_sb();
        let inode = sb.get_inode(InodeNum::new(2)).unwrap();
        sb.put_inode(inode).unwrap();
        assert_eq!(sb.cached_inode_count(), 1);
    }

    #[test]
    fn put_inode_at_zero_links_destroys_and_evicts() {
        let sb = make_sb();
        let inode = sb.get_inode(InodeNum::new(2)).unwrap();
        inode.with_attr_mut(|a| a.nlink = 0);
        sb.put_inode(inode).unwrap();
        assert_eq!(sb.cached_inode_count(), 0);
    }

    #[test]
    fn extra_holder_blocks_eviction() {
        let sb = make_sb();
        let a = sb.get_inode(InodeNum::new(2)).unwrap();
        let b = a.clone();
        a.with_attr_mut(|attr| attr.nlink = 0);
        sb.put_inode(a).unwrap();
        // `b` still holds a reference, so the entry survives.
        assert_eq!(sb.cached_inode_count(), 1);
        sb.put_inode(b).unwrap();
        assert_eq!(sb.cached_inode_count(), 0);
    }
}
