//! In-memory inode: the VFS's own view of a file, independent of
//! whatever a particular back end persists on disk.
//!
//! An [`Inode`] is always reached through an [`super::SuperBlock`]'s hash
//! table and is never constructed directly by a caller; see
//! [`super::SuperBlock::get_inode`]. Its attribute fields live behind a
//! single mutex, matching the inode mutex spec.md §5's lock order
//! places directly under the superblock rwlock.

use alloc_crate::sync::Arc;
use spin::Mutex;

use crate::api::{FileStat, FileType};
use crate::core::types::InodeNum;

use super::Timespec;

/// Everything a back end knows about one inode: the fields a
/// `get_inode`/`write_inode` round trip carries.
#[derive(Clone, Copy, Debug)]
pub struct InodeAttr {
    pub ftype: FileType,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
}

impl InodeAttr {
    pub fn new(ftype: FileType, mode: u32) -> Self {
        Self {
            ftype,
            mode: mode & 0o7777,
            nlink: if ftype == FileType::Directory { 2 } else { 1 },
            uid: 0,
            gid: 0,
            rdev: 0,
            size: 0,
            blocks: 0,
            atime: Timespec::zero(),
            mtime: Timespec::zero(),
            ctime: Timespec::zero(),
        }
    }

    pub fn to_stat(&self, dev: u32, ino: InodeNum) -> FileStat {
        FileStat {
            st_dev: dev as u64,
            st_ino: ino.get(),
            st_mode: self.ftype.to_mode() | self.mode,
            st_nlink: self.nlink,
            st_uid: self.uid,
            st_gid: self.gid,
            st_rdev: self.rdev,
            st_size: self.size,
            st_blksize: crate::BLOCK_SIZE as u32,
            st_blocks: self.blocks,
            st_atime: self.atime.sec as u64,
            st_atime_nsec: self.atime.nsec,
            st_mtime: self.mtime.sec as u64,
            st_mtime_nsec: self.mtime.nsec,
            st_ctime: self.ctime.sec as u64,
            st_ctime_nsec: self.ctime.nsec,
        }
    }
}

struct InodeState {
    attr: InodeAttr,
    dirty: bool,
}

/// One inode held live in a superblock's hash table.
///
/// Reference counting reuses `Arc::strong_count`, the same choice made
/// for [`crate::cache::Page`]: the hash table's own clone is the
/// "cache reference", and `Arc::strong_count(&inode) == 2` in
/// [`super::SuperBlock::put_inode`] means the caller giving up its
/// handle is the last external holder.
pub struct Inode {
    pub ino: InodeNum,
    state: Mutex<InodeState>,
}

impl Inode {
    pub(super) fn new(ino: InodeNum, attr: InodeAttr) -> Arc<Self> {
        Arc::new(Self { ino, state: Mutex::new(InodeState { attr, dirty: false }) })
    }

    pub fn attr(&self) -> InodeAttr {
        self.state.lock().attr
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    pub(super) fn clear_dirty(&self) {
        self.state.lock().dirty = false;
    }

    pub fn mark_dirty(&self) {
        self.state.lock().dirty = true;
    }

    /// Mutate the cached attributes under the inode mutex, marking the
    /// inode dirty as a side effect.
    pub fn with_attr_mut<R>(&self, f: impl FnOnce(&mut InodeAttr) -> R) -> R {
        let mut g = self.state.lock();
        let r = f(&mut g.attr);
        g.dirty = true;
        r
    }

    pub fn touch(&self, now: Timespec) {
        let mut g = self.state.lock();
        g.attr.atime = now;
        g.attr.mtime = now;
        g.attr.ctime = now;
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        self.attr().ftype == FileType::Directory
    }

    #[inline]
    pub fn is_file(&self) -> bool {
        self.attr().ftype == FileType::Regular
    }

    #[inline]
    pub fn is_symlink(&self) -> bool {
        self.attr().ftype == FileType::Symlink
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_mutation_marks_dirty() {
        let inode = Inode::new(InodeNum::new(5), InodeAttr::new(FileType::Regular, 0o644));
        assert!(!inode.is_dirty());
        inode.with_attr_mut(|a| a.size = 4096);
        assert!(inode.is_dirty());
        assert_eq!(inode.attr().size, 4096);
        inode.clear_dirty();
        assert!(!inode.is_dirty());
    }

    #[test]
    fn new_directory_starts_with_two_links() {
        let inode = Inode::new(InodeNum::new(1), InodeAttr::new(FileType::Directory, 0o755));
        assert!(inode.is_dir());
        assert_eq!(inode.attr().nlink, 2);
    }
}
