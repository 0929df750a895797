//! # Sv39-Backed Virtual Mapper
//!
//! Wires [`crate::physical::PhysicalAllocator`] and a kernel direct-map
//! offset into hal's mechanical [`Sv39PageTable`] walker, producing a
//! [`VirtualMapper`] the VM manager can hand to an [`super::address_space::AddressSpace`].

use super::{PageFlags, VirtualMapper};
use crate::physical::PhysicalAllocator;
use crate::{Frame, MemError, MemResult, Page};
use alloc::sync::Arc;
use helix_hal::arch::riscv64::{DirectMap, PageFrameSource, PteFlags, Sv39PageTable};
use helix_hal::{HalError, PageSize as HalPageSize, PhysAddr, VirtAddr};
use spin::Mutex;

/// Physical-RAM-wide offset at which the kernel has identity-mapped all of
/// physical memory, so page-table walks can dereference intermediate
/// tables by address arithmetic alone.
#[derive(Clone, Copy)]
pub struct KernelDirectMap {
    /// `virt = phys + offset`.
    pub offset: u64,
}

impl DirectMap for KernelDirectMap {
    fn phys_to_virt(&self, phys: PhysAddr) -> VirtAddr {
        VirtAddr::new(phys.as_u64().wrapping_add(self.offset))
    }
}

fn hal_err(err: MemError) -> HalError {
    match err {
        MemError::OutOfMemory => HalError::OutOfMemory,
        MemError::InvalidAddress | MemError::NotAligned | MemError::InvalidRegion => {
            HalError::InvalidAddress
        }
        MemError::InvalidSize => HalError::InvalidParameter,
        MemError::PermissionDenied => HalError::PermissionDenied,
        MemError::NotInitialized => HalError::NotInitialized,
        _ => HalError::HardwareError,
    }
}

fn mem_err(err: HalError) -> MemError {
    match err {
        HalError::OutOfMemory => MemError::OutOfMemory,
        HalError::InvalidAddress | HalError::InvalidParameter => MemError::InvalidAddress,
        HalError::PermissionDenied => MemError::PermissionDenied,
        HalError::NotInitialized => MemError::NotInitialized,
        HalError::ResourceBusy => MemError::Busy,
        _ => MemError::Internal,
    }
}

/// Converts VM-layer protection/state flags into Sv39 PTE bits.
pub fn to_pte_flags(flags: PageFlags) -> PteFlags {
    let mut out = PteFlags::empty();
    if flags.contains(PageFlags::PRESENT) {
        out |= PteFlags::READ;
    }
    if flags.contains(PageFlags::WRITABLE) {
        out |= PteFlags::WRITE;
    }
    if flags.contains(PageFlags::USER) {
        out |= PteFlags::USER;
    }
    if flags.contains(PageFlags::GLOBAL) {
        out |= PteFlags::GLOBAL;
    }
    if flags.contains(PageFlags::ACCESSED) {
        out |= PteFlags::ACCESSED;
    }
    if flags.contains(PageFlags::DIRTY) {
        out |= PteFlags::DIRTY;
    }
    if !flags.contains(PageFlags::NO_EXECUTE) {
        out |= PteFlags::EXEC;
    }
    if flags.contains(PageFlags::COW) {
        out |= PteFlags::COW;
    }
    out
}

/// Converts Sv39 PTE bits back into VM-layer flags, the inverse of
/// [`to_pte_flags`]. Used to recover a page's current COW/permission
/// state for fault dispatch.
fn from_pte_flags(flags: PteFlags) -> PageFlags {
    let mut out = PageFlags::empty();
    if flags.contains(PteFlags::READ) {
        out |= PageFlags::PRESENT;
    }
    if flags.contains(PteFlags::WRITE) {
        out |= PageFlags::WRITABLE;
    }
    if flags.contains(PteFlags::USER) {
        out |= PageFlags::USER;
    }
    if flags.contains(PteFlags::GLOBAL) {
        out |= PageFlags::GLOBAL;
    }
    if flags.contains(PteFlags::ACCESSED) {
        out |= PageFlags::ACCESSED;
    }
    if flags.contains(PteFlags::DIRTY) {
        out |= PageFlags::DIRTY;
    }
    if flags.contains(PteFlags::COW) {
        out |= PageFlags::COW;
    }
    if !flags.contains(PteFlags::EXEC) {
        out |= PageFlags::NO_EXECUTE;
    }
    out
}

/// Adapts the kernel's generic [`PhysicalAllocator`] into hal's minimal
/// frame-source trait, zero-filling every frame it hands out (page-table
/// levels must start zeroed so unused PTEs read as invalid).
struct FrameSourceAdapter<'a> {
    allocator: &'a dyn PhysicalAllocator,
    direct: KernelDirectMap,
}

impl PageFrameSource for FrameSourceAdapter<'_> {
    fn alloc_zeroed(&self) -> Result<PhysAddr, HalError> {
        let frame = self
            .allocator
            .allocate(HalPageSize::Size4KiB)
            .map_err(hal_err)?;
        let virt = self.direct.phys_to_virt(frame.address());
        // SAFETY: the frame was just allocated exclusively for us and the
        // direct map covers all usable physical memory.
        unsafe {
            core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0, HalPageSize::Size4KiB.size() as usize);
        }
        Ok(frame.address())
    }

    fn dealloc(&self, frame: PhysAddr) {
        let _ = self
            .allocator
            .deallocate(Frame::new(frame, HalPageSize::Size4KiB));
    }
}

/// A [`VirtualMapper`] backed by a real Sv39 three-level page table.
pub struct Sv39Mapper {
    table: Mutex<Sv39PageTable>,
    allocator: Arc<dyn PhysicalAllocator>,
    direct: KernelDirectMap,
}

impl Sv39Mapper {
    /// Create a mapper with a freshly allocated, empty root table.
    pub fn new(allocator: Arc<dyn PhysicalAllocator>, direct: KernelDirectMap) -> MemResult<Self> {
        let source = FrameSourceAdapter {
            allocator: allocator.as_ref(),
            direct,
        };
        let table = Sv39PageTable::create(&source).map_err(mem_err)?;
        Ok(Self {
            table: Mutex::new(table),
            allocator,
            direct,
        })
    }

    /// Physical address of the root table, for loading into `satp`.
    pub fn root(&self) -> PhysAddr {
        self.table.lock().root()
    }

    fn source(&self) -> FrameSourceAdapter<'_> {
        FrameSourceAdapter {
            allocator: self.allocator.as_ref(),
            direct: self.direct,
        }
    }
}

impl VirtualMapper for Sv39Mapper {
    fn map(&self, page: Page, frame: Frame, flags: PageFlags) -> MemResult<()> {
        let source = self.source();
        self.table
            .lock()
            .map_page(&source, &self.direct, page.address(), frame.address(), to_pte_flags(flags))
            .map_err(mem_err)
    }

    fn unmap(&self, page: Page) -> MemResult<Frame> {
        let source = self.source();
        let phys = self
            .table
            .lock()
            .unmap_page(&source, &self.direct, page.address())
            .map_err(mem_err)?;
        Ok(Frame::new(phys, page.size()))
    }

    fn update_flags(&self, page: Page, flags: PageFlags) -> MemResult<()> {
        let source = self.source();
        self.table
            .lock()
            .set_flags(&source, &self.direct, page.address(), to_pte_flags(flags))
            .map_err(mem_err)
    }

    fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let source = self.source();
        self.table
            .lock()
            .lookup(&source, &self.direct, virt)
            .map(|pte| pte.phys_addr())
    }

    fn translate_flags(&self, virt: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
        let source = self.source();
        self.table
            .lock()
            .lookup(&source, &self.direct, virt)
            .map(|pte| (pte.phys_addr(), from_pte_flags(pte.flags())))
    }

    fn flush(&self, _page: Page) {
        #[cfg(target_arch = "riscv64")]
        unsafe {
            core::arch::asm!("sfence.vma {}, zero", in(reg) _page.address().as_u64());
        }
    }

    fn flush_all(&self) {
        #[cfg(target_arch = "riscv64")]
        unsafe {
            core::arch::asm!("sfence.vma zero, zero");
        }
    }
}
