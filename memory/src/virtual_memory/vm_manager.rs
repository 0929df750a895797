//! # Virtual Memory Manager
//!
//! Ties the region allocator ([`super::address_space::AddressSpace`]) and
//! the page-table layer (any [`super::VirtualMapper`]) together into the
//! operations user-process lifecycle actually needs: loading an ELF image,
//! forking with copy-on-write, resolving page faults (demand paging, COW,
//! stack growth), safely moving bytes across the kernel/user boundary, and
//! the `mmap` family of syscalls.

use super::cow::COW_TABLE;
use super::elf::{self, PF_W, PF_X};
use super::{address_space::AddressSpace, AddressSpaceId, FileBacking, PageFlags, RegionBacking, VmRegion, VmRegionType};
use crate::physical::PhysicalAllocator;
use crate::{Frame, MemError, MemResult, Page};
use alloc::sync::Arc;
use alloc::vec::Vec;
use helix_hal::{PageSize, PhysAddr, VirtAddr};

/// Default and maximum size of the auto-growing user stack.
pub const INITIAL_STACK_SIZE: u64 = 4096;
/// Upper bound the stack is allowed to grow to before faults turn into
/// `FAULT` instead of silently extending the region.
pub const MAX_STACK_SIZE: u64 = 8 * 1024 * 1024;

const PAGE_SIZE: u64 = 4096;

fn page_align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

fn page_align_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Gives the VM manager raw read/write/zero access to physical frames
/// through the kernel's direct map, without depending on any one HAL
/// arch's page-table types. Implemented by
/// [`super::sv39_mapper::KernelDirectMap`] in this workspace; a test
/// harness below supplies a host-memory stand-in.
pub trait PhysAccess: Send + Sync {
    /// Zero an entire 4 KiB frame.
    fn zero(&self, frame: PhysAddr);
    /// Write `data` at `offset` within the frame.
    fn write(&self, frame: PhysAddr, offset: usize, data: &[u8]);
    /// Read `buf.len()` bytes at `offset` within the frame.
    fn read(&self, frame: PhysAddr, offset: usize, buf: &mut [u8]);
}

/// Why a page fault happened, as reported by the trap handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCause {
    /// Load access fault.
    Read,
    /// Store/AMO access fault.
    Write,
    /// Instruction access fault.
    Exec,
}

/// `mmap` sharing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    /// Changes are private to this address space (copy-on-write if the
    /// backing is a file).
    Private,
    /// Changes are visible to every mapper and written back to the file.
    Shared,
}

/// `madvise` hints this VM manager understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advice {
    /// No-op hint; a real kernel might prefetch.
    WillNeed,
    /// Discard the pages' contents; anonymous pages re-zero on next fault,
    /// clean file pages are simply dropped.
    DontNeed,
}

/// A process address space plus everything the VM manager needs to fault
/// pages into it: a frame source and raw access to physical memory.
pub struct VmManager {
    pub(crate) space: Arc<AddressSpace>,
    frames: Arc<dyn PhysicalAllocator>,
    phys: Arc<dyn PhysAccess>,
}

impl VmManager {
    /// Wrap an already-constructed address space.
    pub fn new(space: Arc<AddressSpace>, frames: Arc<dyn PhysicalAllocator>, phys: Arc<dyn PhysAccess>) -> Self {
        Self { space, frames, phys }
    }

    /// The underlying address space (region tree + page-table mapper).
    pub fn address_space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    fn alloc_zero_frame(&self) -> MemResult<PhysAddr> {
        let frame = self.frames.allocate(PageSize::Size4KiB)?;
        self.phys.zero(frame.address());
        Ok(frame.address())
    }

    /// Load an ELF64 image into a freshly created address space, reading
    /// it through `image` rather than requiring the whole file resident in
    /// memory. Each `PT_LOAD` segment is carved into up to three regions:
    /// a file-backed region covering whole pages within `filesz` (demand
    /// paged through `image` as they're touched), a single eagerly
    /// populated boundary page when the file content ends mid-page (its
    /// tail holds file bytes, its head zero-fill), and a lazily
    /// demand-zeroed anonymous region for the rest of `memsz` (BSS). A
    /// guard-backed, auto-growing stack is added at the top of user space.
    /// Returns the entry point.
    pub fn exec(&self, image: Arc<dyn FileBacking>) -> MemResult<VirtAddr> {
        let elf = elf::parse_file(image.as_ref())?;

        for seg in &elf.segments {
            let mut flags = PageFlags::PRESENT | PageFlags::USER;
            if seg.flags & PF_W != 0 {
                flags |= PageFlags::WRITABLE;
            }
            if seg.flags & PF_X == 0 {
                flags |= PageFlags::NO_EXECUTE;
            }

            // Segment virtual addresses are page-aligned by construction,
            // so the file-backed region starts exactly at `seg.vaddr`.
            let seg_start = page_align_down(seg.vaddr);
            let seg_file_end = seg.vaddr + seg.filesz;
            let file_pg_end = page_align_down(seg_file_end);
            let mem_end = page_align_up(seg.vaddr + seg.memsz);

            if file_pg_end > seg_start {
                self.space.add_region(VmRegion {
                    start: VirtAddr::new(seg_start),
                    size: file_pg_end - seg_start,
                    flags,
                    region_type: VmRegionType::File,
                    backing: RegionBacking::File {
                        source: image.clone(),
                        offset: seg.file_offset,
                    },
                })?;
            }

            let mut anon_start = file_pg_end;
            if seg_file_end > file_pg_end && file_pg_end < mem_end {
                // File content ends mid-page: that page can't be purely
                // file-backed (its tail is zero-fill, not file content),
                // so populate it once up front instead of demand-loading.
                let frame = self.alloc_zero_frame()?;
                let tail_len = (seg_file_end - file_pg_end) as usize;
                let mut buf = alloc::vec![0u8; tail_len];
                let file_off = seg.file_offset + (file_pg_end - seg.vaddr);
                let n = image.read_page(file_off, &mut buf)?;
                self.phys.write(frame, 0, &buf[..n]);

                self.space.add_region(VmRegion {
                    start: VirtAddr::new(file_pg_end),
                    size: PAGE_SIZE,
                    flags,
                    region_type: VmRegionType::Anonymous,
                    backing: RegionBacking::Anonymous,
                })?;
                self.space.mapper().map(
                    Page::new(VirtAddr::new(file_pg_end), PageSize::Size4KiB),
                    Frame::new(frame, PageSize::Size4KiB),
                    flags,
                )?;
                anon_start = file_pg_end + PAGE_SIZE;
            }

            if mem_end > anon_start {
                self.space.add_region(VmRegion {
                    start: VirtAddr::new(anon_start),
                    size: mem_end - anon_start,
                    flags,
                    region_type: VmRegionType::Anonymous,
                    backing: RegionBacking::Anonymous,
                })?;
            }
        }

        let (_, user_end) = self.space.user_range();
        let stack_top = page_align_down(user_end.as_u64());
        let stack_start = stack_top - INITIAL_STACK_SIZE;
        self.space.add_region(VmRegion {
            start: VirtAddr::new(stack_start),
            size: INITIAL_STACK_SIZE,
            flags: PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER | PageFlags::NO_EXECUTE,
            region_type: VmRegionType::Stack,
            backing: RegionBacking::Anonymous,
        })?;
        let top_page = stack_top - PAGE_SIZE;
        let frame = self.alloc_zero_frame()?;
        self.space.mapper().map(
            Page::new(VirtAddr::new(top_page), PageSize::Size4KiB),
            Frame::new(frame, PageSize::Size4KiB),
            PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER | PageFlags::NO_EXECUTE,
        )?;

        Ok(VirtAddr::new(elf.entry))
    }

    /// Duplicate `self`'s region tree and every currently-mapped page into
    /// `child`, sharing writable frames copy-on-write (both copies are
    /// write-protected and registered in the global COW refcount table)
    /// and sharing read-only frames outright.
    pub fn fork_into(&self, child: &VmManager) -> MemResult<()> {
        let regions = self.space.snapshot_regions();
        child.space.install_regions(regions.clone());

        for region in &regions {
            let mut addr = region.start.as_u64();
            let end = region.end().as_u64();
            while addr < end {
                let va = VirtAddr::new(addr);
                if let Some(phys) = self.space.mapper().translate(va) {
                    let page = Page::new(va, PageSize::Size4KiB);
                    let writable = region.flags.contains(PageFlags::WRITABLE);
                    let share_flags = if writable {
                        (region.flags - PageFlags::WRITABLE) | PageFlags::COW
                    } else {
                        region.flags
                    };

                    if writable {
                        self.space.mapper().update_flags(page, share_flags)?;
                        COW_TABLE.mark_shared(phys);
                    } else if COW_TABLE.refcount(phys) > 1 {
                        COW_TABLE.share(phys);
                    }

                    child.space.mapper().map(page, Frame::new(phys, PageSize::Size4KiB), share_flags)?;
                }
                addr += PAGE_SIZE;
            }
        }
        Ok(())
    }

    /// Resolve a page fault. Handles three cases: demand paging of a
    /// not-yet-backed anonymous page, copy-on-write duplication of a
    /// shared writable page, and downward stack growth.
    pub fn handle_fault(&self, fault_addr: VirtAddr, cause: FaultCause) -> MemResult<()> {
        let page_addr = VirtAddr::new(page_align_down(fault_addr.as_u64()));

        let region = match self.space.find_region(fault_addr) {
            Some(r) => r,
            None => return self.try_grow_stack(fault_addr, cause),
        };

        if cause == FaultCause::Exec && region.flags.contains(PageFlags::NO_EXECUTE) {
            return Err(MemError::Fault);
        }

        let page = Page::new(page_addr, PageSize::Size4KiB);
        match self.space.mapper().translate_flags(page_addr) {
            None => {
                if cause == FaultCause::Write && !region.flags.contains(PageFlags::WRITABLE) {
                    return Err(MemError::Fault);
                }
                self.demand_page(&region, page_addr)
            }
            Some((phys, pte_flags)) => {
                if cause != FaultCause::Write {
                    return Ok(());
                }
                // The COW bit lives on the PTE, not the region: a forked
                // region still reports itself writable, but individual
                // pages are write-protected pending duplication until a
                // write fault resolves them one at a time.
                if pte_flags.contains(PageFlags::COW) {
                    self.resolve_cow(&region, page, phys)
                } else if region.flags.contains(PageFlags::WRITABLE) {
                    Ok(())
                } else {
                    Err(MemError::Fault)
                }
            }
        }
    }

    fn try_grow_stack(&self, fault_addr: VirtAddr, cause: FaultCause) -> MemResult<()> {
        if cause == FaultCause::Exec {
            return Err(MemError::Fault);
        }
        let regions = self.space.snapshot_regions();
        let stack = regions
            .iter()
            .find(|r| r.region_type == VmRegionType::Stack)
            .ok_or(MemError::Fault)?;

        let new_start = VirtAddr::new(page_align_down(fault_addr.as_u64()));
        if new_start >= stack.start {
            return Err(MemError::Fault);
        }
        let stack_top = stack.end();
        if stack_top.as_u64() - new_start.as_u64() > MAX_STACK_SIZE {
            return Err(MemError::Fault);
        }
        let floor = VirtAddr::new(stack_top.as_u64() - MAX_STACK_SIZE);
        self.space.grow_region_down(stack.start, new_start, floor)?;

        let frame = self.alloc_zero_frame()?;
        self.space.mapper().map(
            Page::new(new_start, PageSize::Size4KiB),
            Frame::new(frame, PageSize::Size4KiB),
            stack.flags,
        )
    }

    fn demand_page(&self, region: &VmRegion, page_addr: VirtAddr) -> MemResult<()> {
        let frame = self.alloc_zero_frame()?;
        if let RegionBacking::File { source, offset } = &region.backing {
            let file_off = offset + (page_addr.as_u64() - region.start.as_u64());
            let mut buf = [0u8; PAGE_SIZE as usize];
            let n = source.read_page(file_off, &mut buf)?;
            self.phys.write(frame, 0, &buf[..n]);
        }
        self.space.mapper().map(
            Page::new(page_addr, PageSize::Size4KiB),
            Frame::new(frame, PageSize::Size4KiB),
            region.flags,
        )
    }

    fn resolve_cow(&self, region: &VmRegion, page: Page, phys: PhysAddr) -> MemResult<()> {
        let restored = (region.flags - PageFlags::COW) | PageFlags::WRITABLE;
        if COW_TABLE.refcount(phys) <= 1 {
            // Sole owner left: just restore write access to the same frame.
            return self.space.mapper().update_flags(page, restored);
        }

        let new_frame = self.alloc_zero_frame()?;
        let mut buf = [0u8; PAGE_SIZE as usize];
        self.phys.read(phys, 0, &mut buf);
        self.phys.write(new_frame, 0, &buf);

        self.space.mapper().unmap(page)?;
        COW_TABLE.unshare(phys);
        self.space
            .mapper()
            .map(page, Frame::new(new_frame, PageSize::Size4KiB), restored)
    }

    /// Copy `src` into user memory starting at `dst`, faulting pages in as
    /// needed (so a process can receive bytes into not-yet-touched stack
    /// or heap space).
    pub fn copyout(&self, dst: VirtAddr, src: &[u8]) -> MemResult<()> {
        let mut va = dst.as_u64();
        let mut remaining = src;
        while !remaining.is_empty() {
            let page_addr = VirtAddr::new(page_align_down(va));
            // Always validate for write, even when the page is already
            // mapped: a mapped page may still be a shared COW frame, which
            // must be duplicated before we write through the direct map.
            self.handle_fault(page_addr, FaultCause::Write)?;
            let phys = self.space.mapper().translate(page_addr).ok_or(MemError::Fault)?;
            let page_off = (va - page_addr.as_u64()) as usize;
            let n = remaining.len().min(PAGE_SIZE as usize - page_off);
            self.phys.write(phys, page_off, &remaining[..n]);
            remaining = &remaining[n..];
            va += n as u64;
        }
        Ok(())
    }

    /// Copy from user memory at `src` into `dst`.
    pub fn copyin(&self, dst: &mut [u8], src: VirtAddr) -> MemResult<()> {
        let mut va = src.as_u64();
        let mut remaining = dst;
        while !remaining.is_empty() {
            let page_addr = VirtAddr::new(page_align_down(va));
            let phys = self.space.mapper().translate(page_addr).ok_or(MemError::Fault)?;
            let page_off = (va - page_addr.as_u64()) as usize;
            let n = remaining.len().min(PAGE_SIZE as usize - page_off);
            let (chunk, rest) = remaining.split_at_mut(n);
            self.phys.read(phys, page_off, chunk);
            remaining = rest;
            va += n as u64;
        }
        Ok(())
    }

    /// Copy a NUL-terminated string from user memory, stopping at the
    /// terminator or `max` bytes (whichever comes first). Returns the
    /// number of bytes copied, not including the terminator.
    pub fn copyinstr(&self, dst: &mut [u8], src: VirtAddr, max: usize) -> MemResult<usize> {
        let limit = max.min(dst.len());
        let mut va = src.as_u64();
        let mut copied = 0usize;
        while copied < limit {
            let page_addr = VirtAddr::new(page_align_down(va));
            let phys = self.space.mapper().translate(page_addr).ok_or(MemError::Fault)?;
            let page_off = (va - page_addr.as_u64()) as usize;
            let mut byte = [0u8; 1];
            self.phys.read(phys, page_off, &mut byte);
            if byte[0] == 0 {
                return Ok(copied);
            }
            dst[copied] = byte[0];
            copied += 1;
            va += 1;
        }
        Err(MemError::InvalidSize)
    }

    /// Map anonymous or file-backed memory. `hint` is honored as a fixed
    /// address only when `fixed` is set; otherwise it is advisory (and
    /// ignored in this implementation, which always finds fresh space).
    pub fn mmap(
        &self,
        hint: Option<VirtAddr>,
        len: u64,
        prot: PageFlags,
        kind: MapKind,
        backing: Option<(Arc<dyn FileBacking>, u64)>,
        fixed: bool,
    ) -> MemResult<VirtAddr> {
        let size = page_align_up(len);
        let addr = if fixed {
            let addr = hint.ok_or(MemError::InvalidAddress)?;
            if !self.space.range_is_free(addr, size) {
                self.space.munmap(addr, size)?;
            }
            addr
        } else {
            self.space.find_free(size)?
        };

        let region_backing = match backing {
            Some((source, offset)) => RegionBacking::File { source, offset },
            None => RegionBacking::Anonymous,
        };
        let region_type = if matches!(region_backing, RegionBacking::File { .. }) {
            VmRegionType::File
        } else {
            VmRegionType::Anonymous
        };
        // MAP_PRIVATE vs MAP_SHARED only matters once a write triggers COW
        // duplication against a file backing, which `msync`/`resolve_cow`
        // gate on `FileBacking::shared()` rather than on `kind` directly.
        let _ = kind;
        let flags = prot | PageFlags::PRESENT | PageFlags::USER;

        self.space.add_region(VmRegion {
            start: addr,
            size,
            flags,
            region_type,
            backing: region_backing,
        })?;
        Ok(addr)
    }

    /// Unmap `[addr, addr+len)`, freeing anonymous frames that drop to
    /// zero references.
    pub fn munmap(&self, addr: VirtAddr, len: u64) -> MemResult<()> {
        let size = page_align_up(len);
        let mut page_addr = addr.as_u64();
        let end = page_addr + size;
        while page_addr < end {
            if let Some(phys) = self.space.mapper().translate(VirtAddr::new(page_addr)) {
                let _ = self.space.mapper().unmap(Page::new(VirtAddr::new(page_addr), PageSize::Size4KiB));
                if COW_TABLE.unshare(phys) <= 1 && COW_TABLE.refcount(phys) <= 1 {
                    self.frames.deallocate(Frame::new(phys, PageSize::Size4KiB))?;
                }
            }
            page_addr += PAGE_SIZE;
        }
        self.space.munmap(addr, size)
    }

    /// Change protection over `[addr, addr+len)`.
    pub fn mprotect(&self, addr: VirtAddr, len: u64, prot: PageFlags) -> MemResult<()> {
        self.space.mprotect(addr, page_align_up(len), prot | PageFlags::PRESENT | PageFlags::USER)
    }

    /// Resize a mapping. Grows in place when the following address space
    /// is free; otherwise relocates (copying mapped pages) when `can_move`
    /// is set.
    pub fn mremap(&self, old_addr: VirtAddr, old_len: u64, new_len: u64, can_move: bool) -> MemResult<VirtAddr> {
        let new_size = page_align_up(new_len);
        if self.space.grow_region(old_addr, new_size).is_ok() {
            return Ok(old_addr);
        }
        if !can_move {
            return Err(MemError::OutOfMemory);
        }

        let region = self.space.find_region(old_addr).ok_or(MemError::NotMapped)?;
        let new_addr = self.mmap(None, new_size, region.flags, MapKind::Private, None, false)?;

        let mut src = old_addr.as_u64();
        let mut dst = new_addr.as_u64();
        let copy_len = page_align_up(old_len).min(new_size);
        let end = old_addr.as_u64() + copy_len;
        while src < end {
            if let Some(phys) = self.space.mapper().translate(VirtAddr::new(src)) {
                let mut buf = [0u8; PAGE_SIZE as usize];
                self.phys.read(phys, 0, &mut buf);
                let dst_phys = self
                    .space
                    .mapper()
                    .translate(VirtAddr::new(dst))
                    .ok_or(MemError::Internal)?;
                self.phys.write(dst_phys, 0, &buf);
            }
            src += PAGE_SIZE;
            dst += PAGE_SIZE;
        }

        self.munmap(old_addr, old_len)?;
        Ok(new_addr)
    }

    /// Flush dirty file-backed pages in `[addr, addr+len)` back to their
    /// source.
    pub fn msync(&self, addr: VirtAddr, len: u64) -> MemResult<()> {
        let region = self.space.find_region(addr).ok_or(MemError::NotMapped)?;
        let RegionBacking::File { source, offset } = &region.backing else {
            return Ok(());
        };
        if !source.shared() {
            return Ok(());
        }

        let mut page_addr = page_align_down(addr.as_u64());
        let end = page_addr + page_align_up(len);
        while page_addr < end {
            if let Some(phys) = self.space.mapper().translate(VirtAddr::new(page_addr)) {
                let mut buf = [0u8; PAGE_SIZE as usize];
                self.phys.read(phys, 0, &mut buf);
                let file_off = offset + (page_addr - region.start.as_u64());
                source.write_page(file_off, &buf)?;
            }
            page_addr += PAGE_SIZE;
        }
        Ok(())
    }

    /// Report, per page, whether `[addr, addr+len)` is currently resident.
    pub fn mincore(&self, addr: VirtAddr, len: u64) -> Vec<bool> {
        let mut out = Vec::new();
        let mut page_addr = page_align_down(addr.as_u64());
        let end = page_addr + page_align_up(len);
        while page_addr < end {
            out.push(self.space.mapper().translate(VirtAddr::new(page_addr)).is_some());
            page_addr += PAGE_SIZE;
        }
        out
    }

    /// Apply an access-pattern hint to `[addr, addr+len)`.
    pub fn madvise(&self, addr: VirtAddr, len: u64, advice: Advice) -> MemResult<()> {
        match advice {
            Advice::WillNeed => Ok(()),
            Advice::DontNeed => {
                let mut page_addr = page_align_down(addr.as_u64());
                let end = page_addr + page_align_up(len);
                while page_addr < end {
                    if let Some(phys) = self.space.mapper().translate(VirtAddr::new(page_addr)) {
                        let _ = self.space.mapper().unmap(Page::new(VirtAddr::new(page_addr), PageSize::Size4KiB));
                        if COW_TABLE.unshare(phys) <= 1 && COW_TABLE.refcount(phys) <= 1 {
                            self.frames.deallocate(Frame::new(phys, PageSize::Size4KiB))?;
                        }
                    }
                    page_addr += PAGE_SIZE;
                }
                Ok(())
            }
        }
    }

    /// Grow or shrink the heap break, demand-paging the newly exposed
    /// range lazily (no eager mapping happens here).
    pub fn sbrk(&self, increment: i64) -> MemResult<VirtAddr> {
        let current = self.space.brk(None);
        if increment == 0 {
            return Ok(current);
        }
        let new_brk = if increment > 0 {
            VirtAddr::new(current.as_u64() + increment as u64)
        } else {
            VirtAddr::new(current.as_u64().saturating_sub((-increment) as u64))
        };
        Ok(self.space.brk(Some(new_brk)))
    }
}

/// Allocate a fresh address space ID plus an empty `VmManager` wired to
/// the given mapper and frame source. Splitting this out keeps process
/// creation (which also needs an ASID and a page table) out of
/// `VmManager` itself.
pub fn new_user_space(
    mapper: Arc<dyn super::VirtualMapper>,
    frames: Arc<dyn PhysicalAllocator>,
    phys: Arc<dyn PhysAccess>,
    user_start: VirtAddr,
    user_end: VirtAddr,
) -> VmManager {
    let space = Arc::new(AddressSpace::new(AddressSpaceId::new(), mapper, user_start, user_end));
    VmManager::new(space, frames, phys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physical::bitmap::BitmapAllocator;
    use crate::physical::{PhysicalRegion, PhysicalRegionType};
    use crate::virtual_memory::elf::tests::build_two_segment_elf;
    use crate::virtual_memory::sv39_mapper::{KernelDirectMap, Sv39Mapper};
    use core::cell::UnsafeCell;

    struct HostRam {
        buf: UnsafeCell<alloc::vec::Vec<u8>>,
        base: u64,
    }

    // SAFETY: tests are single-threaded; all access is serialized by the
    // harness calling into the VM manager sequentially.
    unsafe impl Sync for HostRam {}

    impl HostRam {
        fn new(frames: usize) -> Self {
            Self {
                buf: UnsafeCell::new(alloc::vec![0u8; frames * PAGE_SIZE as usize]),
                base: 0x8000_0000,
            }
        }

        fn offset(&self, phys: PhysAddr) -> usize {
            (phys.as_u64() - self.base) as usize
        }
    }

    impl PhysAccess for HostRam {
        fn zero(&self, frame: PhysAddr) {
            let off = self.offset(frame);
            let buf = unsafe { &mut *self.buf.get() };
            buf[off..off + PAGE_SIZE as usize].fill(0);
        }

        fn write(&self, frame: PhysAddr, offset: usize, data: &[u8]) {
            let base = self.offset(frame) + offset;
            let buf = unsafe { &mut *self.buf.get() };
            buf[base..base + data.len()].copy_from_slice(data);
        }

        fn read(&self, frame: PhysAddr, offset: usize, out: &mut [u8]) {
            let base = self.offset(frame) + offset;
            let buf = unsafe { &*self.buf.get() };
            out.copy_from_slice(&buf[base..base + out.len()]);
        }
    }

    /// Physical memory and its allocator are process-independent in a real
    /// kernel, so a forked child must share both with its parent rather
    /// than getting a fresh simulated RAM of its own (a page shared
    /// copy-on-write has to resolve to the same bytes from either address
    /// space until one of them writes it).
    fn shared_ram(frame_count: usize) -> (Arc<HostRam>, Arc<dyn PhysicalAllocator>) {
        let ram = Arc::new(HostRam::new(frame_count));
        let allocator: Arc<dyn PhysicalAllocator> = {
            let mut a = BitmapAllocator::new();
            a.init(&[PhysicalRegion::new(
                PhysAddr::new(ram.base),
                (frame_count as u64) * PAGE_SIZE,
                PhysicalRegionType::Usable,
            )])
            .unwrap();
            Arc::new(a)
        };
        (ram, allocator)
    }

    fn vm_on(ram: &Arc<HostRam>, allocator: &Arc<dyn PhysicalAllocator>, user_end: u64) -> VmManager {
        let direct = KernelDirectMap {
            offset: unsafe { (*ram.buf.get()).as_ptr() as u64 } - ram.base,
        };
        let mapper: Arc<dyn super::super::VirtualMapper> =
            Arc::new(Sv39Mapper::new(allocator.clone(), direct).unwrap());
        new_user_space(
            mapper,
            allocator.clone(),
            ram.clone() as Arc<dyn PhysAccess>,
            VirtAddr::new(0x1000),
            VirtAddr::new(user_end),
        )
    }

    fn make_vm(frame_count: usize) -> (VmManager, Arc<HostRam>) {
        let (ram, allocator) = shared_ram(frame_count);
        let vm = vm_on(&ram, &allocator, 0x0010_0000_0000);
        (vm, ram)
    }

    /// In-memory stand-in for the executable file `exec` loads through the
    /// page cache in a real kernel.
    struct VecFile(alloc::vec::Vec<u8>);

    impl FileBacking for VecFile {
        fn read_page(&self, offset: u64, buf: &mut [u8]) -> MemResult<usize> {
            let off = offset as usize;
            if off >= self.0.len() {
                return Ok(0);
            }
            let n = buf.len().min(self.0.len() - off);
            buf[..n].copy_from_slice(&self.0[off..off + n]);
            Ok(n)
        }

        fn write_page(&self, _offset: u64, _buf: &[u8]) -> MemResult<()> {
            Err(MemError::PermissionDenied)
        }

        fn len(&self) -> u64 {
            self.0.len() as u64
        }

        fn shared(&self) -> bool {
            false
        }
    }

    fn elf_file(image: alloc::vec::Vec<u8>) -> Arc<dyn FileBacking> {
        Arc::new(VecFile(image))
    }

    #[test]
    fn exec_maps_two_segments_with_correct_contents() {
        let (vm, _ram) = make_vm(64);
        let text = [0x13u8, 0x05, 0x00, 0x00];
        let data = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let image = build_two_segment_elf(&text, &data, 4096);

        let entry = vm.exec(elf_file(image)).unwrap();
        assert_eq!(entry.as_u64(), 0x1000);

        let mut read_back = [0u8; 4];
        vm.copyin(&mut read_back, VirtAddr::new(0x1000)).unwrap();
        assert_eq!(read_back, text);

        let mut data_back = [0u8; 8];
        vm.copyin(&mut data_back, VirtAddr::new(0x2000)).unwrap();
        assert_eq!(data_back, data);

        // BSS past filesz is zero.
        let mut bss = [0xFFu8; 8];
        vm.copyin(&mut bss, VirtAddr::new(0x2000 + data.len() as u64)).unwrap();
        assert_eq!(bss, [0u8; 8]);
    }

    #[test]
    fn fork_shares_frames_cow_then_diverges_on_write() {
        let (ram, allocator) = shared_ram(64);
        let parent = vm_on(&ram, &allocator, 0x0010_0000_0000);
        let text = [0x13u8; 4];
        let data = [7u8; 8];
        let image = build_two_segment_elf(&text, &data, 0);
        parent.exec(elf_file(image)).unwrap();

        // Child gets its own page table (and its own root/intermediate
        // table frames) but shares the parent's physical frames and
        // allocator, matching how a real fork shares memory pages.
        let child = vm_on(&ram, &allocator, 0x0010_0000_0000);
        parent.fork_into(&child).unwrap();

        let data_va = VirtAddr::new(0x2000);
        let parent_phys_before = parent.space.mapper().translate(data_va).unwrap();
        let child_phys = child.space.mapper().translate(data_va).unwrap();
        assert_eq!(parent_phys_before, child_phys);

        // Parent writes -> triggers COW duplication, child's mapping must
        // still show the old contents afterward.
        parent.copyout(data_va, &[9u8; 8]).unwrap();
        let parent_phys_after = parent.space.mapper().translate(data_va).unwrap();
        assert_ne!(parent_phys_after, child_phys);

        let mut child_read = [0u8; 8];
        child.copyin(&mut child_read, data_va).unwrap();
        assert_eq!(child_read, data);

        let mut parent_read = [0u8; 8];
        parent.copyin(&mut parent_read, data_va).unwrap();
        assert_eq!(parent_read, [9u8; 8]);
    }

    #[test]
    fn stack_grows_downward_on_fault_below_it() {
        let (vm, _ram) = make_vm(64);
        let text = [0x13u8; 4];
        let data = [0u8; 4];
        let image = build_two_segment_elf(&text, &data, 0);
        vm.exec(elf_file(image)).unwrap();

        let (_, user_end) = vm.space.user_range();
        let stack_top_page = page_align_down(user_end.as_u64()) - PAGE_SIZE;
        let grow_target = VirtAddr::new(stack_top_page - PAGE_SIZE);

        assert!(vm.space.mapper().translate(grow_target).is_none());
        vm.handle_fault(grow_target, FaultCause::Write).unwrap();
        assert!(vm.space.mapper().translate(grow_target).is_some());
    }

    #[test]
    fn stack_growth_past_max_size_faults() {
        let (vm, _ram) = make_vm(64);
        let text = [0x13u8; 4];
        let data = [0u8; 4];
        let image = build_two_segment_elf(&text, &data, 0);
        vm.exec(elf_file(image)).unwrap();

        let (_, user_end) = vm.space.user_range();
        let stack_top = page_align_down(user_end.as_u64());
        let too_far = VirtAddr::new(stack_top - MAX_STACK_SIZE - PAGE_SIZE);
        assert_eq!(vm.handle_fault(too_far, FaultCause::Write), Err(MemError::Fault));
    }
}
