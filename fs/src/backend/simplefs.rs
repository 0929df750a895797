//! `simplefs`: a minimal xv6-style flat inode-table filesystem over a
//! [`BlockDevice`], giving `helix-fs::vfs`'s dispatch machinery a real
//! back end to exercise.
//!
//! Layout follows [`DiskLayout`] exactly: one superblock, a data-region
//! bitmap, a fixed inode table, the write-ahead log, then data blocks.
//! Every inode (files and directories alike) is the same
//! direct-plus-single-indirect block structure from [`InodeRaw`];
//! directory content is just an array of fixed-size directory entries
//! read and written through the same block-mapping path as file data,
//! the same trick xv6 uses to avoid a second data structure.

use alloc_crate::boxed::Box;
use alloc_crate::sync::Arc;
use spin::Mutex;

use crate::alloc::BlockAllocator;
use crate::api::{FileType, FsStats};
use crate::core::error::{HfsError, HfsResult};
use crate::core::types::{BlockNum, DevNum, FsTypeId, InodeNum};
use crate::disk::device::BlockDevice;
use crate::disk::inode::{
    inode_offset_in_block, inode_table_block, FileType as DiskFileType, InodeRaw, INODE_SIZE,
    NUM_DIRECT, NUM_INDIRECT,
};
use crate::disk::layout::DiskLayout;
use crate::disk::superblock::SuperblockRaw;
use crate::journal::recovery::recover;
use crate::journal::wal::Log;
use crate::vfs::{FsOps, FsType, InodeAttr, SuperBlock, Timespec};
use crate::BLOCK_SIZE;

/// Numeric id this back end registers under.
pub const SIMPLEFS_TYPE_ID: u32 = 1;

const DIRENT_NAME_LEN: usize = 56;
const DIRENT_SIZE: usize = 8 + DIRENT_NAME_LEN;

const _: () = assert!(core::mem::size_of::<DirEntryRaw>() == DIRENT_SIZE);
const _: () = assert!(BLOCK_SIZE % DIRENT_SIZE == 0);

/// One fixed-size directory entry: a child inode number and a name.
/// `ino == 0` marks a free (tombstoned) slot.
#[derive(Clone, Copy)]
#[repr(C, packed)]
struct DirEntryRaw {
    ino: u64,
    name: [u8; DIRENT_NAME_LEN],
}

impl DirEntryRaw {
    fn empty() -> Self {
        Self { ino: 0, name: [0; DIRENT_NAME_LEN] }
    }

    fn new(ino: u64, name: &[u8]) -> Self {
        let mut n = [0u8; DIRENT_NAME_LEN];
        let len = name.len().min(DIRENT_NAME_LEN);
        n[..len].copy_from_slice(&name[..len]);
        Self { ino, name: n }
    }

    fn name_bytes(&self) -> &[u8] {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(DIRENT_NAME_LEN);
        &self.name[..len]
    }

    fn to_bytes(self) -> [u8; DIRENT_SIZE] {
        // SAFETY: plain integers/bytes, exactly `DIRENT_SIZE` long.
        unsafe { core::mem::transmute_copy(&self) }
    }

    fn from_bytes(bytes: &[u8; DIRENT_SIZE]) -> Self {
        // SAFETY: every bit pattern is a valid `DirEntryRaw`.
        unsafe { core::ptr::read_unaligned(bytes.as_ptr().cast()) }
    }
}

fn to_disk_ftype(f: FileType) -> DiskFileType {
    match f {
        FileType::Regular => DiskFileType::Regular,
        FileType::Directory => DiskFileType::Directory,
        FileType::Symlink => DiskFileType::Symlink,
        FileType::BlockDevice | FileType::CharDevice => DiskFileType::Device,
        _ => DiskFileType::Free,
    }
}

fn to_api_ftype(f: DiskFileType) -> FileType {
    match f {
        DiskFileType::Regular => FileType::Regular,
        DiskFileType::Directory => FileType::Directory,
        DiskFileType::Symlink => FileType::Symlink,
        DiskFileType::Device => FileType::CharDevice,
        DiskFileType::Free => FileType::Unknown,
    }
}

/// A mounted `simplefs` instance: the block device plus everything
/// needed to translate inode/path operations into logged block writes.
pub struct SimpleFs {
    dev: Arc<dyn BlockDevice>,
    layout: DiskLayout,
    log: Log,
    alloc: Mutex<BlockAllocator>,
    /// Serializes the inode-table free-slot scan in [`Self::alloc_inode`].
    itable_lock: Mutex<()>,
}

impl SimpleFs {
    /// Format a fresh filesystem over `dev` and return its mounted
    /// superblock. Not itself logged: mkfs runs once, before the log
    /// region has meaning, the same way `mkfs.img` tools write
    /// straight to the device.
    pub fn format(dev: Arc<dyn BlockDevice>, total_blocks: u64, num_inodes: u64) -> HfsResult<Arc<SuperBlock>> {
        let (sb_raw, layout) = SuperblockRaw::format(total_blocks, num_inodes);

        let zero = [0u8; BLOCK_SIZE];
        for b in 0..layout.inode_table_blocks {
            dev.write_block(BlockNum::new(layout.inode_table_start).offset(b), &zero)?;
        }
        for b in 0..layout.bitmap_blocks {
            dev.write_block(BlockNum::new(layout.bitmap_start).offset(b), &zero)?;
        }
        dev.write_block(BlockNum::new(layout.log_start), &zero)?;

        let allocator = BlockAllocator::new(BlockNum::new(layout.data_start), layout.data_blocks());
        let log = Log::new(dev.clone(), BlockNum::new(layout.log_start), layout.log_blocks - 1);
        let fs = Self { dev: dev.clone(), layout, log, alloc: Mutex::new(allocator), itable_lock: Mutex::new(()) };

        fs.log.begin_op()?;
        let mut root_raw = InodeRaw::empty();
        root_raw.file_type = DiskFileType::Directory as u16;
        root_raw.mode = 0o755;
        root_raw.links = 2;
        fs.write_inode_raw(InodeNum::ROOT, &root_raw)?;
        fs.dir_add_entry(InodeNum::ROOT, b".", InodeNum::ROOT)?;
        fs.dir_add_entry(InodeNum::ROOT, b"..", InodeNum::ROOT)?;
        fs.log.end_op()?;

        let mut blk0 = [0u8; BLOCK_SIZE];
        blk0[..core::mem::size_of::<SuperblockRaw>()].copy_from_slice(&sb_raw.to_bytes());
        dev.write_block(BlockNum::new(0), &blk0)?;
        dev.sync()?;

        Ok(SuperBlock::new(FsTypeId::new(SIMPLEFS_TYPE_ID), DevNum::new(0), InodeNum::ROOT, Box::new(fs)))
    }

    /// Mount an already-formatted device: read and validate the
    /// superblock, replay the log if the last mount didn't shut down
    /// cleanly, then rebuild the in-memory allocator from the
    /// persisted bitmap.
    pub fn mount(dev: Arc<dyn BlockDevice>) -> HfsResult<Arc<SuperBlock>> {
        let mut blk0 = [0u8; BLOCK_SIZE];
        dev.read_block(BlockNum::new(0), &mut blk0)?;
        let mut sb_bytes = [0u8; core::mem::size_of::<SuperblockRaw>()];
        sb_bytes.copy_from_slice(&blk0[..sb_bytes.len()]);
        let sb_raw = SuperblockRaw::from_bytes(&sb_bytes);
        sb_raw.validate()?;

        let layout = DiskLayout {
            total_blocks: sb_raw.total_blocks,
            bitmap_start: sb_raw.bitmap_start,
            bitmap_blocks: sb_raw.bitmap_blocks,
            inode_table_start: sb_raw.inode_table_start,
            inode_table_blocks: sb_raw.inode_table_blocks,
            num_inodes: sb_raw.num_inodes,
            log_start: sb_raw.log_start,
            log_blocks: sb_raw.log_blocks,
            data_start: sb_raw.data_start,
        };

        let log = Log::new(dev.clone(), BlockNum::new(layout.log_start), layout.log_blocks - 1);
        recover(&log)?;

        let mut allocator = BlockAllocator::new(BlockNum::new(layout.data_start), layout.data_blocks());
        for idx in 0..layout.bitmap_blocks as usize {
            let mut bytes = [0u8; BLOCK_SIZE];
            dev.read_block(BlockNum::new(layout.bitmap_start).offset(idx as u64), &mut bytes)?;
            allocator.load_bitmap_block(idx, &bytes);
        }

        let fs = Self { dev: dev.clone(), layout, log, alloc: Mutex::new(allocator), itable_lock: Mutex::new(()) };
        Ok(SuperBlock::new(
            FsTypeId::new(SIMPLEFS_TYPE_ID),
            DevNum::new(0),
            InodeNum::new(sb_raw.root_inode),
            Box::new(fs),
        ))
    }

    fn read_block(&self, blk: BlockNum) -> HfsResult<[u8; BLOCK_SIZE]> {
        let mut buf = [0u8; BLOCK_SIZE];
        self.dev.read_block(blk, &mut buf)?;
        Ok(buf)
    }

    fn log_write_block(&self, blk: BlockNum, buf: &[u8; BLOCK_SIZE]) -> HfsResult<()> {
        self.log.log_write(blk, buf)
    }

    fn alloc_block(&self) -> HfsResult<BlockNum> {
        let (blk, idx, bytes) = {
            let mut alloc = self.alloc.lock();
            let blk = alloc.alloc()?;
            let idx = alloc.index_for_block(blk);
            (blk, idx, alloc.bitmap_bytes(idx))
        };
        let bitmap_blk = BlockNum::new(self.layout.bitmap_start).offset(idx as u64);
        self.log_write_block(bitmap_blk, &bytes)?;
        self.log_write_block(blk, &[0u8; BLOCK_SIZE])?;
        Ok(blk)
    }

    fn free_block(&self, blk: BlockNum) -> HfsResult<()> {
        let (idx, bytes) = {
            let mut alloc = self.alloc.lock();
            alloc.free(blk);
            let idx = alloc.index_for_block(blk);
            (idx, alloc.bitmap_bytes(idx))
        };
        let bitmap_blk = BlockNum::new(self.layout.bitmap_start).offset(idx as u64);
        self.log_write_block(bitmap_blk, &bytes)
    }

    fn read_inode_raw(&self, ino: InodeNum) -> HfsResult<InodeRaw> {
        let blk = inode_table_block(BlockNum::new(self.layout.inode_table_start), ino.get());
        let buf = self.read_block(blk)?;
        let off = inode_offset_in_block(ino.get());
        let mut bytes = [0u8; INODE_SIZE];
        bytes.copy_from_slice(&buf[off..off + INODE_SIZE]);
        Ok(InodeRaw::from_bytes(&bytes))
    }

    fn write_inode_raw(&self, ino: InodeNum, raw: &InodeRaw) -> HfsResult<()> {
        let blk = inode_table_block(BlockNum::new(self.layout.inode_table_start), ino.get());
        let mut buf = self.read_block(blk)?;
        let off = inode_offset_in_block(ino.get());
        buf[off..off + INODE_SIZE].copy_from_slice(&raw.to_bytes());
        self.log_write_block(blk, &buf)
    }

    fn alloc_inode(&self, ftype: DiskFileType, mode: u32) -> HfsResult<InodeNum> {
        let _guard = self.itable_lock.lock();
        for i in 2..self.layout.num_inodes {
            let ino = InodeNum::new(i);
            let raw = self.read_inode_raw(ino)?;
            if raw.is_free() {
                let mut new_raw = InodeRaw::empty();
                new_raw.file_type = ftype as u16;
                new_raw.mode = mode & 0o7777;
                new_raw.links = if ftype == DiskFileType::Directory { 2 } else { 1 };
                self.write_inode_raw(ino, &new_raw)?;
                return Ok(ino);
            }
        }
        Err(HfsError::NoSpc)
    }

    fn raw_to_attr(&self, raw: InodeRaw) -> InodeAttr {
        InodeAttr {
            ftype: to_api_ftype(raw.file_type()),
            mode: raw.mode,
            nlink: raw.links as u32,
            uid: raw.uid,
            gid: raw.gid,
            rdev: raw.dev as u64,
            size: raw.size,
            blocks: (raw.size + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64,
            atime: Timespec::new(raw.atime as i64, 0),
            mtime: Timespec::new(raw.mtime as i64, 0),
            ctime: Timespec::new(raw.ctime as i64, 0),
        }
    }

    fn free_all_blocks(&self, raw: &InodeRaw) -> HfsResult<()> {
        let direct = raw.direct;
        for p in direct {
            if p != 0 {
                self.free_block(BlockNum::new(p))?;
            }
        }
        if raw.indirect != 0 {
            let ind = self.read_block(BlockNum::new(raw.indirect))?;
            for chunk in ind.chunks_exact(8) {
                let p = u64::from_le_bytes(chunk.try_into().unwrap());
                if p != 0 {
                    self.free_block(BlockNum::new(p))?;
                }
            }
            self.free_block(BlockNum::new(raw.indirect))?;
        }
        Ok(())
    }

    fn bmap_peek(&self, raw: &InodeRaw, idx: u64) -> HfsResult<Option<BlockNum>> {
        if idx < NUM_DIRECT as u64 {
            let p = raw.direct[idx as usize];
            return Ok(if p == 0 { None } else { Some(BlockNum::new(p)) });
        }
        let rel = idx - NUM_DIRECT as u64;
        if raw.indirect == 0 || rel >= NUM_INDIRECT as u64 {
            return Ok(None);
        }
        let block = self.read_block(BlockNum::new(raw.indirect))?;
        let off = rel as usize * 8;
        let p = u64::from_le_bytes(block[off..off + 8].try_into().unwrap());
        Ok(if p == 0 { None } else { Some(BlockNum::new(p)) })
    }

    fn bmap_alloc(&self, raw: &mut InodeRaw, idx: u64) -> HfsResult<BlockNum> {
        if idx < NUM_DIRECT as u64 {
            let i = idx as usize;
            if raw.direct[i] == 0 {
                raw.direct[i] = self.alloc_block()?.get();
            }
            return Ok(BlockNum::new(raw.direct[i]));
        }
        let rel = idx - NUM_DIRECT as u64;
        if rel >= NUM_INDIRECT as u64 {
            return Err(HfsError::NoSpc);
        }
        if raw.indirect == 0 {
            raw.indirect = self.alloc_block()?.get();
        }
        let ind_blk = BlockNum::new(raw.indirect);
        let mut block = self.read_block(ind_blk)?;
        let off = rel as usize * 8;
        let existing = u64::from_le_bytes(block[off..off + 8].try_into().unwrap());
        if existing != 0 {
            return Ok(BlockNum::new(existing));
        }
        let data_blk = self.alloc_block()?;
        block[off..off + 8].copy_from_slice(&data_blk.get().to_le_bytes());
        self.log_write_block(ind_blk, &block)?;
        Ok(data_blk)
    }

    fn bmap_clear(&self, raw: &InodeRaw, idx: u64) -> HfsResult<()> {
        if idx >= NUM_DIRECT as u64 && raw.indirect != 0 {
            let rel = idx - NUM_DIRECT as u64;
            let ind_blk = BlockNum::new(raw.indirect);
            let mut block = self.read_block(ind_blk)?;
            let off = rel as usize * 8;
            block[off..off + 8].copy_from_slice(&0u64.to_le_bytes());
            self.log_write_block(ind_blk, &block)?;
        }
        Ok(())
    }

    fn dir_lookup(&self, dir: InodeNum, name: &[u8]) -> HfsResult<InodeNum> {
        let raw = self.read_inode_raw(dir)?;
        let nblocks = (raw.size + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64;
        for blk_idx in 0..nblocks {
            let Some(blk) = self.bmap_peek(&raw, blk_idx)? else { continue };
            let data = self.read_block(blk)?;
            for entry_bytes in data.chunks_exact(DIRENT_SIZE) {
                let entry = DirEntryRaw::from_bytes(entry_bytes.try_into().unwrap());
                if entry.ino != 0 && entry.name_bytes() == name {
                    return Ok(InodeNum::new(entry.ino));
                }
            }
        }
        Err(HfsError::NoEnt)
    }

    fn dir_add_entry(&self, dir: InodeNum, name: &[u8], child: InodeNum) -> HfsResult<()> {
        if name.len() > DIRENT_NAME_LEN {
            return Err(HfsError::Inval);
        }
        let mut raw = self.read_inode_raw(dir)?;
        let nblocks = (raw.size + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64;
        for blk_idx in 0..nblocks {
            if let Some(blk) = self.bmap_peek(&raw, blk_idx)? {
                let mut data = self.read_block(blk)?;
                for (i, entry_bytes) in data.chunks_exact(DIRENT_SIZE).enumerate() {
                    let entry = DirEntryRaw::from_bytes(entry_bytes.try_into().unwrap());
                    if entry.ino == 0 {
                        let off = i * DIRENT_SIZE;
                        data[off..off + DIRENT_SIZE].copy_from_slice(&DirEntryRaw::new(child.get(), name).to_bytes());
                        return self.log_write_block(blk, &data);
                    }
                }
            }
        }
        let blk = self.bmap_alloc(&mut raw, nblocks)?;
        let mut data = [0u8; BLOCK_SIZE];
        data[..DIRENT_SIZE].copy_from_slice(&DirEntryRaw::new(child.get(), name).to_bytes());
        self.log_write_block(blk, &data)?;
        raw.size = (nblocks + 1) * BLOCK_SIZE as u64;
        self.write_inode_raw(dir, &raw)
    }

    fn dir_remove_entry(&self, dir: InodeNum, name: &[u8]) -> HfsResult<()> {
        let raw = self.read_inode_raw(dir)?;
        let nblocks = (raw.size + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64;
        for blk_idx in 0..nblocks {
            if let Some(blk) = self.bmap_peek(&raw, blk_idx)? {
                let mut data = self.read_block(blk)?;
                for (i, entry_bytes) in data.chunks_exact(DIRENT_SIZE).enumerate() {
                    let entry = DirEntryRaw::from_bytes(entry_bytes.try_into().unwrap());
                    if entry.ino != 0 && entry.name_bytes() == name {
                        let off = i * DIRENT_SIZE;
                        data[off..off + DIRENT_SIZE].copy_from_slice(&DirEntryRaw::empty().to_bytes());
                        return self.log_write_block(blk, &data);
                    }
                }
            }
        }
        Err(HfsError::NoEnt)
    }

    fn dir_is_empty(&self, dir: InodeNum) -> HfsResult<bool> {
        let raw = self.read_inode_raw(dir)?;
        let nblocks = (raw.size + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64;
        for blk_idx in 0..nblocks {
            let Some(blk) = self.bmap_peek(&raw, blk_idx)? else { continue };
            let data = self.read_block(blk)?;
            for entry_bytes in data.chunks_exact(DIRENT_SIZE) {
                let entry = DirEntryRaw::from_bytes(entry_bytes.try_into().unwrap());
                if entry.ino != 0 && entry.name_bytes() != b"." && entry.name_bytes() != b".." {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

impl FsOps for SimpleFs {
    fn get_inode(&self, _sb: &SuperBlock, ino: InodeNum) -> HfsResult<InodeAttr> {
        let raw = self.read_inode_raw(ino)?;
        if raw.is_free() {
            return Err(HfsError::NoEnt);
        }
        Ok(self.raw_to_attr(raw))
    }

    fn write_inode(&self, _sb: &SuperBlock, ino: InodeNum, attr: &InodeAttr) -> HfsResult<()> {
        let mut raw = self.read_inode_raw(ino)?;
        raw.file_type = to_disk_ftype(attr.ftype) as u16;
        raw.mode = attr.mode & 0o7777;
        raw.links = attr.nlink as u16;
        raw.uid = attr.uid;
        raw.gid = attr.gid;
        raw.dev = attr.rdev as u32;
        raw.size = attr.size;
        raw.atime = attr.atime.sec as u64;
        raw.mtime = attr.mtime.sec as u64;
        raw.ctime = attr.ctime.sec as u64;
        self.write_inode_raw(ino, &raw)
    }

    fn destroy_inode(&self, _sb: &SuperBlock, ino: InodeNum) -> HfsResult<()> {
        let raw = self.read_inode_raw(ino)?;
        self.free_all_blocks(&raw)?;
        self.write_inode_raw(ino, &InodeRaw::empty())
    }

    fn lookup(&self, _sb: &SuperBlock, dir: InodeNum, name: &[u8]) -> HfsResult<InodeNum> {
        self.dir_lookup(dir, name)
    }

    fn create(&self, _sb: &SuperBlock, dir: InodeNum, name: &[u8], mode: u32, ftype: FileType) -> HfsResult<InodeNum> {
        if self.dir_lookup(dir, name).is_ok() {
            return Err(HfsError::Exist);
        }
        let ino = self.alloc_inode(to_disk_ftype(ftype), mode)?;
        self.dir_add_entry(dir, name, ino)?;
        Ok(ino)
    }

    fn unlink(&self, _sb: &SuperBlock, dir: InodeNum, name: &[u8]) -> HfsResult<()> {
        self.dir_remove_entry(dir, name)
    }

    fn link(&self, _sb: &SuperBlock, dir: InodeNum, name: &[u8], target: InodeNum) -> HfsResult<()> {
        if self.dir_lookup(dir, name).is_ok() {
            return Err(HfsError::Exist);
        }
        self.dir_add_entry(dir, name, target)
    }

    fn mkdir(&self, _sb: &SuperBlock, dir: InodeNum, name: &[u8], mode: u32) -> HfsResult<InodeNum> {
        if self.dir_lookup(dir, name).is_ok() {
            return Err(HfsError::Exist);
        }
        let ino = self.alloc_inode(DiskFileType::Directory, mode)?;
        self.dir_add_entry(ino, b".", ino)?;
        self.dir_add_entry(ino, b"..", dir)?;
        self.dir_add_entry(dir, name, ino)?;
        Ok(ino)
    }

    fn rmdir(&self, _sb: &SuperBlock, dir: InodeNum, name: &[u8]) -> HfsResult<()> {
        let child = self.dir_lookup(dir, name)?;
        if !self.dir_is_empty(child)? {
            return Err(HfsError::NotEmpty);
        }
        self.dir_remove_entry(dir, name)
    }

    fn rename(&self, _sb: &SuperBlock, old_dir: InodeNum, old_name: &[u8], new_dir: InodeNum, new_name: &[u8]) -> HfsResult<()> {
        let target = self.dir_lookup(old_dir, old_name)?;
        if self.dir_lookup(new_dir, new_name).is_ok() {
            return Err(HfsError::Exist);
        }
        self.dir_remove_entry(old_dir, old_name)?;
        self.dir_add_entry(new_dir, new_name, target)
    }

    fn symlink(&self, sb: &SuperBlock, dir: InodeNum, name: &[u8], target: &[u8]) -> HfsResult<InodeNum> {
        if target.len() > crate::MAX_PATH_LEN {
            return Err(HfsError::Inval);
        }
        if self.dir_lookup(dir, name).is_ok() {
            return Err(HfsError::Exist);
        }
        let ino = self.alloc_inode(DiskFileType::Symlink, 0o777)?;
        self.write_at(sb, ino, 0, target)?;
        self.dir_add_entry(dir, name, ino)?;
        Ok(ino)
    }

    fn readlink(&self, sb: &SuperBlock, ino: InodeNum, buf: &mut [u8]) -> HfsResult<usize> {
        self.read_at(sb, ino, 0, buf)
    }

    fn truncate(&self, _sb: &SuperBlock, ino: InodeNum, size: u64) -> HfsResult<()> {
        let mut raw = self.read_inode_raw(ino)?;
        let old_blocks = (raw.size + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64;
        let new_blocks = (size + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64;
        for idx in new_blocks..old_blocks {
            if let Some(blk) = self.bmap_peek(&raw, idx)? {
                self.free_block(blk)?;
                self.bmap_clear(&raw, idx)?;
            }
        }
        raw.size = size;
        self.write_inode_raw(ino, &raw)
    }

    fn read_at(&self, _sb: &SuperBlock, ino: InodeNum, offset: u64, buf: &mut [u8]) -> HfsResult<usize> {
        let raw = self.read_inode_raw(ino)?;
        if offset >= raw.size {
            return Ok(0);
        }
        let want = buf.len().min((raw.size - offset) as usize);
        let mut done = 0;
        while done < want {
            let file_off = offset + done as u64;
            let blk_idx = file_off / BLOCK_SIZE as u64;
            let blk_off = (file_off % BLOCK_SIZE as u64) as usize;
            let n = (BLOCK_SIZE - blk_off).min(want - done);
            match self.bmap_peek(&raw, blk_idx)? {
                Some(blk) => {
                    let data = self.read_block(blk)?;
                    buf[done..done + n].copy_from_slice(&data[blk_off..blk_off + n]);
                }
                None => buf[done..done + n].fill(0),
            }
            done += n;
        }
        Ok(done)
    }

    fn write_at(&self, _sb: &SuperBlock, ino: InodeNum, offset: u64, buf: &[u8]) -> HfsResult<usize> {
        let mut raw = self.read_inode_raw(ino)?;
        let mut done = 0;
        while done < buf.len() {
            let file_off = offset + done as u64;
            let blk_idx = file_off / BLOCK_SIZE as u64;
            let blk_off = (file_off % BLOCK_SIZE as u64) as usize;
            let n = (BLOCK_SIZE - blk_off).min(buf.len() - done);
            let blk = self.bmap_alloc(&mut raw, blk_idx)?;
            let mut data = self.read_block(blk)?;
            data[blk_off..blk_off + n].copy_from_slice(&buf[done..done + n]);
            self.log_write_block(blk, &data)?;
            done += n;
        }
        let end = offset + buf.len() as u64;
        if end > raw.size {
            raw.size = end;
        }
        self.write_inode_raw(ino, &raw)?;
        Ok(done)
    }

    fn readdir(
        &self,
        _sb: &SuperBlock,
        ino: InodeNum,
        cursor: u64,
        visit: &mut dyn FnMut(&[u8], InodeNum, FileType) -> bool,
    ) -> HfsResult<u64> {
        let raw = self.read_inode_raw(ino)?;
        let total = raw.size / DIRENT_SIZE as u64;
        let mut i = cursor;
        while i < total {
            let blk_idx = (i * DIRENT_SIZE as u64) / BLOCK_SIZE as u64;
            let in_block_off = ((i * DIRENT_SIZE as u64) % BLOCK_SIZE as u64) as usize;
            if let Some(blk) = self.bmap_peek(&raw, blk_idx)? {
                let data = self.read_block(blk)?;
                let entry = DirEntryRaw::from_bytes(data[in_block_off..in_block_off + DIRENT_SIZE].try_into().unwrap());
                if entry.ino != 0 {
                    let child_raw = self.read_inode_raw(InodeNum::new(entry.ino))?;
                    if !visit(entry.name_bytes(), InodeNum::new(entry.ino), to_api_ftype(child_raw.file_type())) {
                        return Ok(i);
                    }
                }
            }
            i += 1;
        }
        Ok(i)
    }

    fn statfs(&self, _sb: &SuperBlock) -> HfsResult<FsStats> {
        let alloc = self.alloc.lock();
        let mut stats = FsStats::new();
        stats.f_blocks = alloc.total_blocks();
        stats.f_bfree = alloc.free_blocks();
        stats.f_bavail = alloc.free_blocks();
        stats.f_files = self.layout.num_inodes;
        Ok(stats)
    }

    fn sync_fs(&self, _sb: &SuperBlock) -> HfsResult<()> {
        self.dev.sync()
    }

    fn begin_txn(&self, _sb: &SuperBlock) -> HfsResult<()> {
        self.log.begin_op()
    }

    fn end_txn(&self, _sb: &SuperBlock) -> HfsResult<()> {
        self.log.end_op()
    }
}

/// Registerable [`FsType`] wrapping [`SimpleFs::mount`]/unmount.
pub struct SimpleFsType;

impl FsType for SimpleFsType {
    fn name(&self) -> &'static str {
        "simplefs"
    }

    fn id(&self) -> FsTypeId {
        FsTypeId::new(SIMPLEFS_TYPE_ID)
    }

    fn mount(&self, dev: Arc<dyn BlockDevice>) -> HfsResult<Arc<SuperBlock>> {
        SimpleFs::mount(dev)
    }

    fn free(&self, sb: Arc<SuperBlock>) -> HfsResult<()> {
        sb.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::device::MemoryBlockDevice;
    use alloc_crate::vec;

    const TOTAL_BLOCKS: u64 = 512;
    const NUM_INODES: u64 = 64;

    fn make_device(total_blocks: u64) -> (Arc<dyn BlockDevice>, alloc_crate::vec::Vec<u8>) {
        let size = total_blocks as usize * BLOCK_SIZE;
        let mut storage = vec![0u8; size];
        let dev: Arc<dyn BlockDevice> =
            unsafe { Arc::new(MemoryBlockDevice::from_buffer(storage.as_mut_ptr(), size, BLOCK_SIZE as u32)) };
        (dev, storage)
    }

    #[test]
    fn format_creates_root_directory() {
        let (dev, _storage) = make_device(TOTAL_BLOCKS);
        let sb = SimpleFs::format(dev, TOTAL_BLOCKS, NUM_INODES).unwrap();
        let root = sb.get_inode(InodeNum::ROOT).unwrap();
        assert!(root.is_dir());
        assert_eq!(root.attr().nlink, 2);
    }

    #[test]
    fn create_lookup_read_write_round_trip() {
        let (dev, _storage) = make_device(TOTAL_BLOCKS);
        let sb = SimpleFs::format(dev, TOTAL_BLOCKS, NUM_INODES).unwrap();

        sb.ops().begin_txn(&sb).unwrap();
        let ino = sb.ops().create(&sb, InodeNum::ROOT, b"hello.txt", 0o644, FileType::Regular).unwrap();
        sb.ops().write_at(&sb, ino, 0, b"hi there").unwrap();
        sb.ops().end_txn(&sb).unwrap();

        let found = sb.ops().lookup(&sb, InodeNum::ROOT, b"hello.txt").unwrap();
        assert_eq!(found, ino);

        let mut buf = [0u8; 8];
        assert_eq!(sb.ops().read_at(&sb, ino, 0, &mut buf).unwrap(), 8);
        assert_eq!(&buf, b"hi there");
    }

    #[test]
    fn large_file_spans_indirect_block() {
        let (dev, _storage) = make_device(4096);
        let sb = SimpleFs::format(dev, 4096, NUM_INODES).unwrap();

        sb.ops().begin_txn(&sb).unwrap();
        let ino = sb.ops().create(&sb, InodeNum::ROOT, b"big", 0o644, FileType::Regular).unwrap();
        // Past NUM_DIRECT blocks, forcing the indirect pointer to be used.
        let offset = (NUM_DIRECT as u64 + 2) * BLOCK_SIZE as u64;
        sb.ops().write_at(&sb, ino, offset, b"past the direct blocks").unwrap();
        sb.ops().end_txn(&sb).unwrap();

        let mut buf = [0u8; 23];
        assert_eq!(sb.ops().read_at(&sb, ino, offset, &mut buf).unwrap(), 23);
        assert_eq!(&buf, b"past the direct blocks");
    }

    #[test]
    fn mkdir_rmdir_requires_empty() {
        let (dev, _storage) = make_device(TOTAL_BLOCKS);
        let sb = SimpleFs::format(dev, TOTAL_BLOCKS, NUM_INODES).unwrap();

        sb.ops().begin_txn(&sb).unwrap();
        let dir = sb.ops().mkdir(&sb, InodeNum::ROOT, b"sub", 0o755).unwrap();
        let file = sb.ops().create(&sb, dir, b"a", 0o644, FileType::Regular).unwrap();
        sb.ops().end_txn(&sb).unwrap();
        let _ = file;

        sb.ops().begin_txn(&sb).unwrap();
        assert_eq!(sb.ops().rmdir(&sb, InodeNum::ROOT, b"sub"), Err(HfsError::NotEmpty));
        sb.ops().unlink(&sb, dir, b"a").unwrap();
        sb.ops().end_txn(&sb).unwrap();

        sb.ops().begin_txn(&sb).unwrap();
        sb.ops().rmdir(&sb, InodeNum::ROOT, b"sub").unwrap();
        sb.ops().end_txn(&sb).unwrap();

        assert_eq!(sb.ops().lookup(&sb, InodeNum::ROOT, b"sub"), Err(HfsError::NoEnt));
    }

    #[test]
    fn remount_preserves_data_and_free_space() {
        let (dev, storage) = make_device(TOTAL_BLOCKS);
        {
            let sb = SimpleFs::format(dev.clone(), TOTAL_BLOCKS, NUM_INODES).unwrap();
            sb.ops().begin_txn(&sb).unwrap();
            let ino = sb.ops().create(&sb, InodeNum::ROOT, b"persisted", 0o644, FileType::Regular).unwrap();
            sb.ops().write_at(&sb, ino, 0, b"durable").unwrap();
            sb.ops().end_txn(&sb).unwrap();
        }
        let _ = &storage;

        let sb2 = SimpleFs::mount(dev).unwrap();
        let ino = sb2.ops().lookup(&sb2, InodeNum::ROOT, b"persisted").unwrap();
        let mut buf = [0u8; 7];
        assert_eq!(sb2.ops().read_at(&sb2, ino, 0, &mut buf).unwrap(), 7);
        assert_eq!(&buf, b"durable");
    }

    #[test]
    fn mount_recovers_a_commit_interrupted_after_the_header_write() {
        let (dev, storage) = make_device(TOTAL_BLOCKS);
        let layout = DiskLayout::calculate(TOTAL_BLOCKS, NUM_INODES);
        SimpleFs::format(dev.clone(), TOTAL_BLOCKS, NUM_INODES).unwrap();
        let _ = &storage;

        // Forge the on-disk state a crash right after `Log::commit`'s
        // header write would leave: the data slot holds the new
        // contents, the header names the home block, but home still
        // holds what `format` left there.
        let target = BlockNum::new(layout.data_start);
        let mut before = [0u8; BLOCK_SIZE];
        dev.read_block(target, &mut before).unwrap();
        assert_ne!(before, [0x5Au8; BLOCK_SIZE]);

        dev.write_block(BlockNum::new(layout.log_start + 1), &[0x5Au8; BLOCK_SIZE]).unwrap();
        let mut header = [0u8; BLOCK_SIZE];
        header[0..4].copy_from_slice(&1u32.to_ne_bytes());
        header[4..8].copy_from_slice(&(target.get() as u32).to_ne_bytes());
        dev.write_block(BlockNum::new(layout.log_start), &header).unwrap();

        // Mounting runs recovery before the filesystem is usable.
        let sb = SimpleFs::mount(dev.clone()).unwrap();
        let mut after = [0u8; BLOCK_SIZE];
        dev.read_block(target, &mut after).unwrap();
        assert_eq!(after, [0x5Au8; BLOCK_SIZE]);
        drop(sb);

        // Header is cleared, so mounting again is a no-op.
        let sb2 = SimpleFs::mount(dev.clone()).unwrap();
        drop(sb2);
        let mut still = [0u8; BLOCK_SIZE];
        dev.read_block(target, &mut still).unwrap();
        assert_eq!(still, [0x5Au8; BLOCK_SIZE]);
    }
}
