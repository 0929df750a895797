//! Virtual filesystem dispatch: filesystem-type registration, the
//! inode/superblock cache, path resolution and the open-file object,
//! per spec.md §4.F.
//!
//! A concrete filesystem plugs in by implementing [`superblock::FsOps`]
//! and registering a [`FsType`] that knows how to build a [`SuperBlock`]
//! from a block device. Everything in this module is back-end agnostic.

pub mod file_backing;
pub mod inode;
pub mod superblock;

pub use file_backing::InodeBacking;
pub use inode::{Inode, InodeAttr};
pub use superblock::{FsOps, SuperBlock};

use alloc_crate::sync::Arc;
use alloc_crate::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::Mutex;

use crate::api::{FileStat, FileType, FsStats, OpenFlags, SeekWhence};
use crate::core::error::{HfsError, HfsResult};
use crate::core::types::{DevNum, FsTypeId, InodeNum};
use crate::disk::device::BlockDevice;

/// Bound on symbolic link indirection during path resolution
/// (spec.md §4.F: "bounded depth, e.g. 10").
pub const MAX_SYMLINK_DEPTH: u8 = 10;

// ============================================================================
// Timespec
// ============================================================================

/// A POSIX-style timestamp; no wall-clock source lives in this crate,
/// so callers supply `now` explicitly (see [`Inode::touch`]).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: u32,
}

impl Timespec {
    pub const fn zero() -> Self {
        Self { sec: 0, nsec: 0 }
    }

    pub const fn new(sec: i64, nsec: u32) -> Self {
        Self { sec, nsec }
    }

    pub fn add(&self, sec: i64, nsec: u32) -> Self {
        let mut result = *self;
        result.nsec += nsec;
        result.sec += sec + (result.nsec / 1_000_000_000) as i64;
        result.nsec %= 1_000_000_000;
        result
    }
}

// ============================================================================
// Attribute updates (setattr)
// ============================================================================

#[derive(Clone, Copy, Debug, Default)]
pub struct SetAttr {
    pub valid: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: Timespec,
    pub mtime: Timespec,
}

impl SetAttr {
    pub const ATTR_MODE: u32 = 1 << 0;
    pub const ATTR_UID: u32 = 1 << 1;
    pub const ATTR_GID: u32 = 1 << 2;
    pub const ATTR_SIZE: u32 = 1 << 3;
    pub const ATTR_ATIME: u32 = 1 << 4;
    pub const ATTR_MTIME: u32 = 1 << 5;

    pub fn has(&self, flag: u32) -> bool {
        self.valid & flag != 0
    }
}

// ============================================================================
// Filesystem type registration
// ============================================================================

/// Everything a filesystem type needs to be mountable: a human name, a
/// stable numeric id, and the ability to build (and tear down) a
/// [`SuperBlock`] over a block device.
pub trait FsType: Send + Sync {
    fn name(&self) -> &'static str;
    fn id(&self) -> FsTypeId;
    fn mount(&self, dev: Arc<dyn BlockDevice>) -> HfsResult<Arc<SuperBlock>>;
    fn free(&self, sb: Arc<SuperBlock>) -> HfsResult<()>;
}

struct RegisteredType {
    ty: Arc<dyn FsType>,
    frozen: AtomicBool,
    live_mounts: AtomicU32,
}

/// Global filesystem-type list, behind the "global VFS lock" at the
/// top of spec.md §5's lock order.
static REGISTRY: Mutex<Vec<RegisteredType>> = Mutex::new(Vec::new());

pub fn register_fs_type(ty: Arc<dyn FsType>) -> HfsResult<()> {
    let mut reg = REGISTRY.lock();
    if reg.iter().any(|r| r.ty.id() == ty.id()) {
        return Err(HfsError::Exist);
    }
    reg.push(RegisteredType { ty, frozen: AtomicBool::new(false), live_mounts: AtomicU32::new(0) });
    Ok(())
}

/// Mark a type frozen: a precondition for [`unregister_fs_type`], per
/// spec.md §4.F ("Unregistration requires the type to be frozen").
pub fn freeze_fs_type(id: FsTypeId) -> HfsResult<()> {
    let reg = REGISTRY.lock();
    let entry = reg.iter().find(|r| r.ty.id() == id).ok_or(HfsError::NoEnt)?;
    entry.frozen.store(true, Ordering::Release);
    Ok(())
}

pub fn unregister_fs_type(id: FsTypeId) -> HfsResult<()> {
    let mut reg = REGISTRY.lock();
    let idx = reg.iter().position(|r| r.ty.id() == id).ok_or(HfsError::NoEnt)?;
    if !reg[idx].frozen.load(Ordering::Acquire) || reg[idx].live_mounts.load(Ordering::Acquire) != 0 {
        return Err(HfsError::Busy);
    }
    reg.remove(idx);
    Ok(())
}

pub fn mount(id: FsTypeId, dev: Arc<dyn BlockDevice>) -> HfsResult<Arc<SuperBlock>> {
    let reg = REGISTRY.lock();
    let entry = reg.iter().find(|r| r.ty.id() == id).ok_or(HfsError::NoEnt)?;
    let sb = entry.ty.mount(dev)?;
    entry.live_mounts.fetch_add(1, Ordering::AcqRel);
    Ok(sb)
}

pub fn unmount(id: FsTypeId, sb: Arc<SuperBlock>) -> HfsResult<()> {
    let reg = REGISTRY.lock();
    let entry = reg.iter().find(|r| r.ty.id() == id).ok_or(HfsError::NoEnt)?;
    entry.ty.free(sb)?;
    entry.live_mounts.fetch_sub(1, Ordering::AcqRel);
    Ok(())
}

// ============================================================================
// Transaction wrapper
// ============================================================================

/// Wrap a mutation sequence in the back end's log transaction, per
/// spec.md §4.F: "the VFS opens a log transaction ... around the
/// whole sequence so either all metadata touches commit together or
/// none do."
fn with_txn<R>(sb: &SuperBlock, f: impl FnOnce() -> HfsResult<R>) -> HfsResult<R> {
    sb.ops().begin_txn(sb)?;
    let result = f();
    match (result, sb.ops().end_txn(sb)) {
        (Ok(v), Ok(())) => Ok(v),
        (Err(e), _) => Err(e),
        (Ok(_), Err(e)) => Err(e),
    }
}

// ============================================================================
// Path resolution
// ============================================================================

fn split_parent(path: &[u8]) -> HfsResult<(&[u8], &[u8])> {
    if path.is_empty() {
        return Err(HfsError::Inval);
    }
    match path.iter().rposition(|&b| b == b'/') {
        Some(i) => {
            let name = &path[i + 1..];
            if name.is_empty() {
                return Err(HfsError::Inval);
            }
            let dir: &[u8] = if i == 0 { b"/" } else { &path[..i] };
            Ok((dir, name))
        }
        None => Ok((b".", path)),
    }
}

/// Resolve `path` against `root`/`cwd`, calling the back end's
/// `lookup` for each component. Intermediate inode references are
/// acquired and released in strict LIFO order (spec.md §4.F).
pub fn resolve_path(
    sb: &Arc<SuperBlock>,
    root: &Arc<Inode>,
    cwd: &Arc<Inode>,
    path: &[u8],
) -> HfsResult<Arc<Inode>> {
    resolve_path_at_depth(sb, root, cwd, path, 0)
}

fn resolve_path_at_depth(
    sb: &Arc<SuperBlock>,
    root: &Arc<Inode>,
    cwd: &Arc<Inode>,
    path: &[u8],
    depth: u8,
) -> HfsResult<Arc<Inode>> {
    if depth > MAX_SYMLINK_DEPTH {
        return Err(HfsError::Loop);
    }

    let mut current = if path.first() == Some(&b'/') { root.clone() } else { cwd.clone() };
    let mut held: Vec<Arc<Inode>> = Vec::new();

    for comp in path.split(|&b| b == b'/').filter(|c| !c.is_empty()) {
        if comp == b"." {
            continue;
        }
        if comp == b".." {
            if Arc::ptr_eq(&current, root) {
                continue; // reject '..' across the chroot/root boundary
            }
            if let Some(parent) = held.pop() {
                let old = core::mem::replace(&mut current, parent);
                sb.put_inode(old)?;
            }
            continue;
        }

        if !current.is_dir() {
            while let Some(i) = held.pop() {
                sb.put_inode(i)?;
            }
            return Err(HfsError::NotDir);
        }

        let lookup_result = sb.ops().lookup(sb, current.ino, comp);
        let child_ino = match lookup_result {
            Ok(ino) => ino,
            Err(e) => {
                while let Some(i) = held.pop() {
                    sb.put_inode(i)?;
                }
                return Err(e);
            }
        };

        let mut child = match sb.get_inode(child_ino) {
            Ok(c) => c,
            Err(e) => {
                while let Some(i) = held.pop() {
                    sb.put_inode(i)?;
                }
                return Err(e);
            }
        };

        if child.is_symlink() {
            let mut buf = [0u8; crate::MAX_PATH_LEN];
            let n = sb.ops().readlink(sb, child.ino, &mut buf)?;
            sb.put_inode(child)?;
            let target = &buf[..n];
            let base = if target.first() == Some(&b'/') { root.clone() } else { current.clone() };
            child = resolve_path_at_depth(sb, root, &base, target, depth + 1)?;
        }

        held.push(current);
        current = child;
    }

    while let Some(i) = held.pop() {
        sb.put_inode(i)?;
    }
    Ok(current)
}

// ============================================================================
// Mutation operations
// ============================================================================

pub fn create(sb: &Arc<SuperBlock>, dir: &Arc<Inode>, name: &[u8], mode: u32, ftype: FileType) -> HfsResult<Arc<Inode>> {
    if !dir.is_dir() {
        return Err(HfsError::NotDir);
    }
    with_txn(sb, || {
        let ino = sb.ops().create(sb, dir.ino, name, mode, ftype)?;
        sb.get_inode(ino)
    })
}

pub fn mkdir(sb: &Arc<SuperBlock>, dir: &Arc<Inode>, name: &[u8], mode: u32) -> HfsResult<Arc<Inode>> {
    if !dir.is_dir() {
        return Err(HfsError::NotDir);
    }
    with_txn(sb, || {
        let ino = sb.ops().mkdir(sb, dir.ino, name, mode)?;
        dir.with_attr_mut(|a| a.nlink += 1);
        sb.get_inode(ino)
    })
}

pub fn symlink(sb: &Arc<SuperBlock>, dir: &Arc<Inode>, name: &[u8], target: &[u8]) -> HfsResult<Arc<Inode>> {
    if !dir.is_dir() {
        return Err(HfsError::NotDir);
    }
    with_txn(sb, || {
        let ino = sb.ops().symlink(sb, dir.ino, name, target)?;
        sb.get_inode(ino)
    })
}

pub fn link(sb: &Arc<SuperBlock>, dir: &Arc<Inode>, name: &[u8], target: &Arc<Inode>) -> HfsResult<()> {
    if !dir.is_dir() {
        return Err(HfsError::NotDir);
    }
    if target.is_dir() {
        return Err(HfsError::IsDir);
    }
    with_txn(sb, || {
        sb.ops().link(sb, dir.ino, name, target.ino)?;
        target.with_attr_mut(|a| a.nlink += 1);
        Ok(())
    })
}

/// Remove one name from `dir`. If this was the last reference to the
/// target inode (no open handles, zero hard links), the inode is
/// destroyed immediately; otherwise it survives until the last open
/// handle closes, per spec.md §4.F's reference-counting law.
pub fn unlink(sb: &Arc<SuperBlock>, dir: &Arc<Inode>, name: &[u8]) -> HfsResult<()> {
    if !dir.is_dir() {
        return Err(HfsError::NotDir);
    }
    with_txn(sb, || {
        let child_ino = sb.ops().lookup(sb, dir.ino, name)?;
        let child = sb.get_inode(child_ino)?;
        if child.is_dir() {
            sb.put_inode(child)?;
            return Err(HfsError::IsDir);
        }
        sb.ops().unlink(sb, dir.ino, name)?;
        child.with_attr_mut(|a| a.nlink = a.nlink.saturating_sub(1));
        sb.put_inode(child)
    })
}

pub fn rmdir(sb: &Arc<SuperBlock>, dir: &Arc<Inode>, name: &[u8]) -> HfsResult<()> {
    if !dir.is_dir() {
        return Err(HfsError::NotDir);
    }
    with_txn(sb, || {
        let child_ino = sb.ops().lookup(sb, dir.ino, name)?;
        let child = sb.get_inode(child_ino)?;
        if !child.is_dir() {
            sb.put_inode(child)?;
            return Err(HfsError::NotDir);
        }
        sb.ops().rmdir(sb, dir.ino, name)?;
        child.with_attr_mut(|a| a.nlink = 0);
        dir.with_attr_mut(|a| a.nlink = a.nlink.saturating_sub(1));
        sb.put_inode(child)
    })
}

pub fn rename(
    sb: &Arc<SuperBlock>,
    old_dir: &Arc<Inode>,
    old_name: &[u8],
    new_dir: &Arc<Inode>,
    new_name: &[u8],
) -> HfsResult<()> {
    if !old_dir.is_dir() || !new_dir.is_dir() {
        return Err(HfsError::NotDir);
    }
    with_txn(sb, || sb.ops().rename(sb, old_dir.ino, old_name, new_dir.ino, new_name))
}

pub fn truncate(sb: &Arc<SuperBlock>, inode: &Arc<Inode>, size: u64) -> HfsResult<()> {
    with_txn(sb, || {
        sb.ops().truncate(sb, inode.ino, size)?;
        inode.with_attr_mut(|a| a.size = size);
        Ok(())
    })
}

pub fn setattr(sb: &Arc<SuperBlock>, inode: &Arc<Inode>, attr: &SetAttr) -> HfsResult<()> {
    with_txn(sb, || {
        if attr.has(SetAttr::ATTR_SIZE) {
            sb.ops().truncate(sb, inode.ino, attr.size)?;
        }
        inode.with_attr_mut(|a| {
            if attr.has(SetAttr::ATTR_MODE) {
                a.mode = attr.mode & 0o7777;
            }
            if attr.has(SetAttr::ATTR_UID) {
                a.uid = attr.uid;
            }
            if attr.has(SetAttr::ATTR_GID) {
                a.gid = attr.gid;
            }
            if attr.has(SetAttr::ATTR_SIZE) {
                a.size = attr.size;
            }
            if attr.has(SetAttr::ATTR_ATIME) {
                a.atime = attr.atime;
            }
            if attr.has(SetAttr::ATTR_MTIME) {
                a.mtime = attr.mtime;
            }
        });
        Ok(())
    })
}

// ============================================================================
// Open files
// ============================================================================

/// One open-file object: an inode reference plus the per-open cursor
/// and flags. Reference-counted the same way every other open handle
/// in this crate is — one [`OpenFile`] per file descriptor, released
/// through [`close`].
pub struct OpenFile {
    inode: Arc<Inode>,
    pos: Mutex<u64>,
    flags: OpenFlags,
}

impl OpenFile {
    fn new(inode: Arc<Inode>, flags: OpenFlags) -> Self {
        Self { inode, pos: Mutex::new(0), flags }
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    pub fn read(&self, sb: &SuperBlock, buf: &mut [u8]) -> HfsResult<usize> {
        if !self.flags.is_read() {
            return Err(HfsError::Inval);
        }
        let mut pos = self.pos.lock();
        let n = sb.ops().read_at(sb, self.inode.ino, *pos, buf)?;
        *pos += n as u64;
        Ok(n)
    }

    pub fn write(&self, sb: &SuperBlock, buf: &[u8]) -> HfsResult<usize> {
        if !self.flags.is_write() {
            return Err(HfsError::Inval);
        }
        let mut pos = self.pos.lock();
        if self.flags.is_append() {
            *pos = self.inode.attr().size;
        }
        let n = with_txn(sb, || sb.ops().write_at(sb, self.inode.ino, *pos, buf))?;
        *pos += n as u64;
        let end = *pos;
        self.inode.with_attr_mut(|a| {
            if end > a.size {
                a.size = end;
            }
        });
        Ok(n)
    }

    pub fn llseek(&self, whence: SeekWhence, offset: i64) -> HfsResult<u64> {
        let mut pos = self.pos.lock();
        let base: u64 = match whence {
            SeekWhence::Set => 0,
            SeekWhence::Cur => *pos,
            SeekWhence::End => self.inode.attr().size,
            _ => return Err(HfsError::NoSys),
        };
        let new_pos = base.saturating_add_signed(offset);
        *pos = new_pos;
        Ok(new_pos)
    }

    pub fn fsync(&self, sb: &SuperBlock) -> HfsResult<()> {
        if self.inode.is_dirty() {
            sb.ops().write_inode(sb, self.inode.ino, &self.inode.attr())?;
            self.inode.clear_dirty();
        }
        Ok(())
    }

    pub fn readdir(
        &self,
        sb: &SuperBlock,
        cursor: u64,
        visit: &mut dyn FnMut(&[u8], InodeNum, FileType) -> bool,
    ) -> HfsResult<u64> {
        sb.ops().readdir(sb, self.inode.ino, cursor, visit)
    }

    pub fn stat(&self, sb: &SuperBlock) -> FileStat {
        self.inode.attr().to_stat(sb.dev.get(), self.inode.ino)
    }
}

/// Locate (or, with `O_CREAT`, create) the target of `path` and open
/// it, per spec.md §4.F's "File operations" clause.
pub fn open(
    sb: &Arc<SuperBlock>,
    root: &Arc<Inode>,
    cwd: &Arc<Inode>,
    path: &[u8],
    flags: OpenFlags,
    mode: u32,
) -> HfsResult<OpenFile> {
    match resolve_path(sb, root, cwd, path) {
        Ok(inode) => {
            if flags.is_create() && flags.has(OpenFlags::O_EXCL) {
                sb.put_inode(inode)?;
                return Err(HfsError::Exist);
            }
            if flags.is_truncate() && inode.is_file() {
                truncate(sb, &inode, 0)?;
            }
            Ok(OpenFile::new(inode, flags))
        }
        Err(HfsError::NoEnt) if flags.is_create() => {
            let (dir_path, name) = split_parent(path)?;
            let dir = resolve_path(sb, root, cwd, dir_path)?;
            let created = create(sb, &dir, name, mode, FileType::Regular);
            sb.put_inode(dir)?;
            Ok(OpenFile::new(created?, flags))
        }
        Err(e) => Err(e),
    }
}

pub fn close(sb: &Arc<SuperBlock>, file: OpenFile) -> HfsResult<()> {
    sb.put_inode(file.inode)
}

pub fn statfs(sb: &Arc<SuperBlock>) -> HfsResult<FsStats> {
    sb.ops().statfs(sb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::HfsError;
    use alloc_crate::collections::BTreeMap;
    use alloc_crate::vec;

    enum Data {
        Dir(Vec<(Vec<u8>, u64)>),
        File(Vec<u8>),
    }

    struct Entry {
        attr: InodeAttr,
        data: Data,
    }

    /// A minimal in-memory directory filesystem, enough to drive path
    /// resolution, create/open/close and the unlink-of-an-open-file
    /// law end to end.
    struct TestFs {
        table: Mutex<BTreeMap<u64, Entry>>,
        next_ino: Mutex<u64>,
    }

    impl TestFs {
        fn new() -> Arc<Self> {
            let mut table = BTreeMap::new();
            table.insert(1, Entry { attr: InodeAttr::new(FileType::Directory, 0o755), data: Data::Dir(Vec::new()) });
            Arc::new(Self { table: Mutex::new(table), next_ino: Mutex::new(2) })
        }

        fn alloc_ino(&self) -> u64 {
            let mut n = self.next_ino.lock();
            let ino = *n;
            *n += 1;
            ino
        }
    }

    impl FsOps for TestFs {
        fn get_inode(&self, _sb: &SuperBlock, ino: InodeNum) -> HfsResult<InodeAttr> {
            self.table.lock().get(&ino.get()).map(|e| e.attr).ok_or(HfsError::NoEnt)
        }
        fn write_inode(&self, _sb: &SuperBlock, ino: InodeNum, attr: &InodeAttr) -> HfsResult<()> {
            if let Some(e) = self.table.lock().get_mut(&ino.get()) {
                e.attr = *attr;
            }
            Ok(())
        }
        fn destroy_inode(&self, _sb: &SuperBlock, ino: InodeNum) -> HfsResult<()> {
            self.table.lock().remove(&ino.get());
            Ok(())
        }
        fn lookup(&self, _sb: &SuperBlock, dir: InodeNum, name: &[u8]) -> HfsResult<InodeNum> {
            let table = self.table.lock();
            let entry = table.get(&dir.get()).ok_or(HfsError::NoEnt)?;
            match &entry.data {
                Data::Dir(entries) => entries
                    .iter()
                    .find(|(n, _)| n == name)
                    .map(|(_, ino)| InodeNum::new(*ino))
                    .ok_or(HfsError::NoEnt),
                Data::File(_) => Err(HfsError::NotDir),
            }
        }
        fn create(&self, _sb: &SuperBlock, dir: InodeNum, name: &[u8], mode: u32, ftype: FileType) -> HfsResult<InodeNum> {
            let mut table = self.table.lock();
            if let Some(Entry { data: Data::Dir(entries), .. }) = table.get(&dir.get()) {
                if entries.iter().any(|(n, _)| n == name) {
                    return Err(HfsError::Exist);
                }
            } else {
                return Err(HfsError::NotDir);
            }
            let ino = self.alloc_ino();
            table.insert(ino, Entry { attr: InodeAttr::new(ftype, mode), data: Data::File(Vec::new()) });
            if let Some(Entry { data: Data::Dir(entries), .. }) = table.get_mut(&dir.get()) {
                entries.push((name.to_vec(), ino));
            }
            Ok(InodeNum::new(ino))
        }
        fn unlink(&self, _sb: &SuperBlock, dir: InodeNum, name: &[u8]) -> HfsResult<()> {
            let mut table = self.table.lock();
            let entry = table.get_mut(&dir.get()).ok_or(HfsError::NoEnt)?;
            match &mut entry.data {
                Data::Dir(entries) => {
                    let before = entries.len();
                    entries.retain(|(n, _)| n != name);
                    if entries.len() == before {
                        return Err(HfsError::NoEnt);
                    }
                    Ok(())
                }
                Data::File(_) => Err(HfsError::NotDir),
            }
        }
        fn link(&self, _sb: &SuperBlock, dir: InodeNum, name: &[u8], target: InodeNum) -> HfsResult<()> {
            let mut table = self.table.lock();
            if let Some(Entry { data: Data::Dir(entries), .. }) = table.get_mut(&dir.get()) {
                entries.push((name.to_vec(), target.get()));
                Ok(())
            } else {
                Err(HfsError::NotDir)
            }
        }
        fn mkdir(&self, _sb: &SuperBlock, dir: InodeNum, name: &[u8], mode: u32) -> HfsResult<InodeNum> {
            let mut table = self.table.lock();
            if !matches!(table.get(&dir.get()), Some(Entry { data: Data::Dir(_), .. })) {
                return Err(HfsError::NotDir);
            }
            let ino = self.alloc_ino();
            table.insert(ino, Entry { attr: InodeAttr::new(FileType::Directory, mode), data: Data::Dir(Vec::new()) });
            if let Some(Entry { data: Data::Dir(entries), .. }) = table.get_mut(&dir.get()) {
                entries.push((name.to_vec(), ino));
            }
            Ok(InodeNum::new(ino))
        }
        fn rmdir(&self, _sb: &SuperBlock, dir: InodeNum, name: &[u8]) -> HfsResult<()> {
            self.unlink(_sb, dir, name)
        }
        fn rename(&self, _sb: &SuperBlock, old_dir: InodeNum, old_name: &[u8], new_dir: InodeNum, new_name: &[u8]) -> HfsResult<()> {
            let target = self.lookup(_sb, old_dir, old_name)?;
            self.unlink(_sb, old_dir, old_name)?;
            self.link(_sb, new_dir, new_name, target)
        }
        fn symlink(&self, _sb: &SuperBlock, _dir: InodeNum, _name: &[u8], _target: &[u8]) -> HfsResult<InodeNum> {
            Err(HfsError::NoSys)
        }
        fn readlink(&self, _sb: &SuperBlock, _ino: InodeNum, _buf: &mut [u8]) -> HfsResult<usize> {
            Err(HfsError::NoSys)
        }
        fn truncate(&self, _sb: &SuperBlock, ino: InodeNum, size: u64) -> HfsResult<()> {
            let mut table = self.table.lock();
            if let Some(Entry { data: Data::File(bytes), attr }) = table.get_mut(&ino.get()) {
                bytes.resize(size as usize, 0);
                attr.size = size;
                Ok(())
            } else {
                Err(HfsError::IsDir)
            }
        }
        fn read_at(&self, _sb: &SuperBlock, ino: InodeNum, offset: u64, buf: &mut [u8]) -> HfsResult<usize> {
            let table = self.table.lock();
            let Entry { data: Data::File(bytes), .. } = table.get(&ino.get()).ok_or(HfsError::NoEnt)? else {
                return Err(HfsError::IsDir);
            };
            let offset = offset as usize;
            if offset >= bytes.len() {
                return Ok(0);
            }
            let n = core::cmp::min(buf.len(), bytes.len() - offset);
            buf[..n].copy_from_slice(&bytes[offset..offset + n]);
            Ok(n)
        }
        fn write_at(&self, _sb: &SuperBlock, ino: InodeNum, offset: u64, buf: &[u8]) -> HfsResult<usize> {
            let mut table = self.table.lock();
            let Entry { data: Data::File(bytes), .. } = table.get_mut(&ino.get()).ok_or(HfsError::NoEnt)? else {
                return Err(HfsError::IsDir);
            };
            let offset = offset as usize;
            if bytes.len() < offset + buf.len() {
                bytes.resize(offset + buf.len(), 0);
            }
            bytes[offset..offset + buf.len()].copy_from_slice(buf);
            Ok(buf.len())
        }
        fn readdir(&self, _sb: &SuperBlock, ino: InodeNum, cursor: u64, visit: &mut dyn FnMut(&[u8], InodeNum, FileType) -> bool) -> HfsResult<u64> {
            let table = self.table.lock();
            let Entry { data: Data::Dir(entries), .. } = table.get(&ino.get()).ok_or(HfsError::NoEnt)? else {
                return Err(HfsError::NotDir);
            };
            let mut i = cursor as usize;
            while i < entries.len() {
                let (name, child) = &entries[i];
                let ftype = table.get(child).map(|e| e.attr.ftype).unwrap_or(FileType::Unknown);
                if !visit(name, InodeNum::new(*child), ftype) {
                    break;
                }
                i += 1;
            }
            Ok(i as u64)
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

    fn make_sb() -> (Arc<SuperBlock>, Arc<Inode>) {
        let fs = TestFs::new();
        let sb = SuperBlock::new(FsTypeId::new(1), DevNum::new(0), InodeNum::new(1), alloc_crate::boxed::Box::new(fs));
        let root = sb.get_inode(InodeNum::new(1)).unwrap();
        (sb, root)
    }

    #[test]
    fn create_lookup_and_read_write_round_trip() {
        let (sb, root) = make_sb();
        let file = open(&sb, &root, &root, b"/hello.txt", OpenFlags(OpenFlags::O_RDWR | OpenFlags::O_CREAT), 0o644).unwrap();
        assert_eq!(file.write(&sb, b"hi there").unwrap(), 8);
        file.llseek(SeekWhence::Set, 0).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(file.read(&sb, &mut buf).unwrap(), 8);
        assert_eq!(&buf, b"hi there");
        close(&sb, file).unwrap();
        sb.put_inode(root).unwrap();
    }

    #[test]
    fn exclusive_create_rejects_existing_name() {
        let (sb, root) = make_sb();
        let f = open(&sb, &root, &root, b"/a", OpenFlags(OpenFlags::O_RDWR | OpenFlags::O_CREAT), 0o644).unwrap();
        close(&sb, f).unwrap();
        let err = open(&sb, &root, &root, b"/a", OpenFlags(OpenFlags::O_RDWR | OpenFlags::O_CREAT | OpenFlags::O_EXCL), 0o644)
            .unwrap_err();
        assert_eq!(err, HfsError::Exist);
        sb.put_inode(root).unwrap();
    }

    #[test]
    fn mkdir_then_resolve_nested_path() {
        let (sb, root) = make_sb();
        let dir = mkdir(&sb, &root, b"sub", 0o755).unwrap();
        let f = create(&sb, &dir, b"inner.txt", 0o644, FileType::Regular).unwrap();
        sb.put_inode(f).unwrap();
        sb.put_inode(dir).unwrap();

        let resolved = resolve_path(&sb, &root, &root, b"/sub/inner.txt").unwrap();
        assert!(resolved.is_file());
        sb.put_inode(resolved).unwrap();
        sb.put_inode(root).unwrap();
    }

    #[test]
    fn dotdot_at_root_is_a_no_op() {
        let (sb, root) = make_sb();
        let resolved = resolve_path(&sb, &root, &root, b"/../../.").unwrap();
        assert!(Arc::ptr_eq(&resolved, &root));
        sb.put_inode(resolved).unwrap();
        sb.put_inode(root).unwrap();
    }

    #[test]
    fn unlink_of_open_file_keeps_data_until_last_close() {
        let (sb, root) = make_sb();
        let file = open(&sb, &root, &root, b"/doomed", OpenFlags(OpenFlags::O_RDWR | OpenFlags::O_CREAT), 0o644).unwrap();
        file.write(&sb, b"still here").unwrap();

        unlink(&sb, &root, b"doomed").unwrap();
        assert_eq!(sb.cached_inode_count(), 2); // root + the unlinked-but-open inode

        // The data is still reachable through the already-open handle.
        file.llseek(SeekWhence::Set, 0).unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(file.read(&sb, &mut buf).unwrap(), 10);
        assert_eq!(&buf, b"still here");

        close(&sb, file).unwrap();
        assert_eq!(sb.cached_inode_count(), 1); // only root remains

        sb.put_inode(root).unwrap();
    }

    #[test]
    fn rmdir_rejects_non_directory() {
        let (sb, root) = make_sb();
        let f = open(&sb, &root, &root, b"/plain", OpenFlags(OpenFlags::O_RDWR | OpenFlags::O_CREAT), 0o644).unwrap();
        close(&sb, f).unwrap();
        assert_eq!(rmdir(&sb, &root, b"plain").unwrap_err(), HfsError::NotDir);
        sb.put_inode(root).unwrap();
    }

    #[test]
    fn too_many_symlink_hops_reports_loop() {
        // This back end never returns a symlink, so this exercises
        // the depth bound purely through repeated self-resolution:
        // we rely on `resolve_path_at_depth`'s own bound instead by
        // calling it directly at an already-exhausted depth.
        let (sb, root) = make_sb();
        let err = resolve_path_at_depth(&sb, &root, &root, b"/x", MAX_SYMLINK_DEPTH + 1).unwrap_err();
        assert_eq!(err, HfsError::Loop);
        sb.put_inode(root).unwrap();
    }
}
