//! # RISC-V Sv39 Page Tables
//!
//! Three-level, 9-bit-per-level hardware page tables for the Sv39 virtual
//! memory scheme (39-bit virtual addresses, 4 KiB pages). This module is
//! purely mechanical: it walks and mutates page-table entries. Policy
//! (what to map where, COW bookkeeping, fault handling) lives above it.

use crate::{HalError, HalResult, PhysAddr, VirtAddr};
use bitflags::bitflags;

/// Page size used throughout Sv39 (no huge-page support here).
pub const PGSIZE: u64 = 4096;
const PGSHIFT: u32 = 12;
const PXMASK: u64 = 0x1FF; // 9 bits per level
const PTE_PPN_SHIFT: u32 = 10;

/// Number of levels in an Sv39 page table (L2 -> L1 -> L0).
pub const LEVELS: usize = 3;

/// Highest valid Sv39 user virtual address (exclusive), matching the
/// canonical xv6-riscv `MAXVA` minus one guard page: 2^38 leaves room below
/// the non-canonical hole at the top of the 39-bit window.
pub const MAXVA: u64 = 1u64 << (9 + 9 + 9 + 12 - 1);

bitflags! {
    /// Sv39 page-table entry permission/status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        /// Entry is valid.
        const VALID = 1 << 0;
        /// Readable.
        const READ = 1 << 1;
        /// Writable.
        const WRITE = 1 << 2;
        /// Executable.
        const EXEC = 1 << 3;
        /// Accessible from user mode.
        const USER = 1 << 4;
        /// Global mapping (present in every address space).
        const GLOBAL = 1 << 5;
        /// Accessed bit.
        const ACCESSED = 1 << 6;
        /// Dirty bit.
        const DIRTY = 1 << 7;
        /// Software bit reserved for copy-on-write bookkeeping. When set on
        /// a writable region's PTE, the mapping has been forced read-only
        /// by a COW fork and a write fault must duplicate the frame before
        /// restoring `WRITE`.
        const COW = 1 << 8;
    }
}

impl PteFlags {
    /// Permission bits a leaf PTE must carry to be considered mapped at all.
    pub const fn leaf_perm() -> Self {
        Self::READ.union(Self::WRITE).union(Self::EXEC)
    }

    /// True if this is a valid leaf entry (has at least one of R/W/X).
    pub const fn is_leaf(self) -> bool {
        self.contains(Self::VALID) && self.intersects(Self::leaf_perm())
    }
}

/// Raw 64-bit Sv39 PTE with PPN in bits [53:10].
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct RawPte(u64);

impl RawPte {
    /// The zero/invalid PTE.
    pub const INVALID: Self = Self(0);

    /// Build a PTE pointing at `phys`, page-aligned, with the given flags.
    pub fn new(phys: PhysAddr, flags: PteFlags) -> Self {
        debug_assert!(phys.is_aligned(PGSIZE));
        Self(((phys.as_u64() >> PGSHIFT) << PTE_PPN_SHIFT) | flags.bits())
    }

    /// Physical address this entry points to (next-level table or leaf frame).
    pub fn phys_addr(self) -> PhysAddr {
        PhysAddr::new((self.0 >> PTE_PPN_SHIFT) << PGSHIFT)
    }

    /// Flag bits of this entry.
    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Whether the valid bit is set.
    pub fn is_valid(self) -> bool {
        self.0 & PteFlags::VALID.bits() != 0
    }

    /// Whether this entry points at a next-level table (valid, no R/W/X).
    pub fn is_branch(self) -> bool {
        self.is_valid() && !self.flags().intersects(PteFlags::leaf_perm())
    }

    fn with_flags(self, flags: PteFlags) -> Self {
        Self(((self.0 >> PTE_PPN_SHIFT) << PTE_PPN_SHIFT) | flags.bits())
    }
}

/// Virtual-address index at a given page-table level (0 = leaf level).
fn px(level: usize, va: VirtAddr) -> usize {
    let shift = PGSHIFT + 9 * level as u32;
    ((va.as_u64() >> shift) & PXMASK) as usize
}

/// Source of zeroed physical frames for intermediate page-table levels,
/// and a sink for freeing them. Kept architecture-independent on the
/// physical side so tests can back it with a simulated RAM buffer instead
/// of real hardware.
pub trait PageFrameSource {
    /// Allocate one zero-filled physical frame.
    fn alloc_zeroed(&self) -> HalResult<PhysAddr>;

    /// Return a previously allocated frame.
    fn dealloc(&self, frame: PhysAddr);
}

/// Maps a physical address to a virtual address the walker can dereference
/// to read/write page-table contents. On real hardware this is the
/// kernel's direct/physical map; in tests it is a pointer into a host
/// buffer standing in for physical RAM.
pub trait DirectMap {
    /// Translate a physical frame address into a dereferenceable virtual one.
    fn phys_to_virt(&self, phys: PhysAddr) -> VirtAddr;
}

const PTES_PER_PAGE: usize = 512;

/// An Sv39 page table rooted at a physical frame.
///
/// `alloc` supplies frames for intermediate levels; `map_ops` translates
/// physical frame addresses into something dereferenceable. Both are
/// borrowed for the lifetime of any walk so callers control when/if the
/// kernel's direct map or a test harness's simulated RAM backs accesses.
pub struct Sv39PageTable {
    root: PhysAddr,
}

impl Sv39PageTable {
    /// Wrap an already-allocated, zeroed root frame as a page table.
    pub fn from_root(root: PhysAddr) -> Self {
        debug_assert!(root.is_aligned(PGSIZE));
        Self { root }
    }

    /// Allocate a fresh, empty root table.
    pub fn create<A: PageFrameSource>(alloc: &A) -> HalResult<Self> {
        let root = alloc.alloc_zeroed()?;
        Ok(Self::from_root(root))
    }

    /// Physical address of the root table (the value destined for `satp`).
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    fn table_ptr<M: DirectMap>(&self, map_ops: &M, table: PhysAddr) -> *mut RawPte {
        map_ops.phys_to_virt(table).as_mut_ptr::<RawPte>()
    }

    /// Walk to the leaf-level PTE slot for `va`, allocating intermediate
    /// tables along the way when `alloc_missing` is set. Returns a pointer
    /// to the level-0 entry slot; the caller reads/writes through it.
    ///
    /// # Safety
    /// `map_ops` must resolve every intermediate table's physical address
    /// to memory that is actually backed and exclusively owned by this
    /// page table's intermediate levels.
    pub unsafe fn walk<A: PageFrameSource, M: DirectMap>(
        &self,
        alloc: &A,
        map_ops: &M,
        va: VirtAddr,
        alloc_missing: bool,
    ) -> HalResult<*mut RawPte> {
        if va.as_u64() >= MAXVA {
            return Err(HalError::InvalidAddress);
        }

        let mut table = self.root;
        for level in (1..LEVELS).rev() {
            let idx = px(level, va);
            let entry_ptr = unsafe { self.table_ptr(map_ops, table).add(idx) };
            let entry = unsafe { entry_ptr.read_volatile() };

            if entry.is_valid() {
                if !entry.is_branch() {
                    // A leaf at a non-terminal level would mean a huge
                    // page; unsupported in this layout.
                    return Err(HalError::InvalidAddress);
                }
                table = entry.phys_addr();
            } else {
                if !alloc_missing {
                    return Err(HalError::InvalidAddress);
                }
                let frame = alloc.alloc_zeroed()?;
                let new_entry = RawPte::new(frame, PteFlags::VALID);
                unsafe { entry_ptr.write_volatile(new_entry) };
                table = frame;
            }
        }

        let idx = px(0, va);
        Ok(unsafe { self.table_ptr(map_ops, table).add(idx) })
    }

    /// Map a single 4 KiB page. Fails with [`HalError::ResourceBusy`] if the
    /// slot is already valid (mirrors xv6's `mappages` panic-on-remap,
    /// turned into a recoverable error for a kernel library).
    pub fn map_page<A: PageFrameSource, M: DirectMap>(
        &self,
        alloc: &A,
        map_ops: &M,
        va: VirtAddr,
        pa: PhysAddr,
        perm: PteFlags,
    ) -> HalResult<()> {
        if !va.is_aligned(PGSIZE) || !pa.is_aligned(PGSIZE) {
            return Err(HalError::InvalidAddress);
        }
        let pte_ptr = unsafe { self.walk(alloc, map_ops, va, true)? };
        let existing = unsafe { pte_ptr.read_volatile() };
        if existing.is_valid() {
            return Err(HalError::ResourceBusy);
        }
        let entry = RawPte::new(pa, perm | PteFlags::VALID);
        unsafe { pte_ptr.write_volatile(entry) };
        Ok(())
    }

    /// Look up the PTE backing `va`, if mapped.
    pub fn lookup<A: PageFrameSource, M: DirectMap>(
        &self,
        alloc: &A,
        map_ops: &M,
        va: VirtAddr,
    ) -> Option<RawPte> {
        let pte_ptr = unsafe { self.walk(alloc, map_ops, va, false).ok()? };
        let entry = unsafe { pte_ptr.read_volatile() };
        entry.is_valid().then_some(entry)
    }

    /// Overwrite the flags on an already-mapped PTE without touching its
    /// physical address (used for COW write-protect and `mprotect`).
    pub fn set_flags<A: PageFrameSource, M: DirectMap>(
        &self,
        alloc: &A,
        map_ops: &M,
        va: VirtAddr,
        flags: PteFlags,
    ) -> HalResult<()> {
        let pte_ptr = unsafe { self.walk(alloc, map_ops, va, false)? };
        let existing = unsafe { pte_ptr.read_volatile() };
        if !existing.is_valid() {
            return Err(HalError::InvalidAddress);
        }
        unsafe { pte_ptr.write_volatile(existing.with_flags(flags)) };
        Ok(())
    }

    /// Unmap a single page, returning the physical frame it pointed to.
    /// Does not free the frame itself — callers decide frame lifetime
    /// (shared COW frames must not be freed on every unmapping address
    /// space's teardown).
    pub fn unmap_page<A: PageFrameSource, M: DirectMap>(
        &self,
        alloc: &A,
        map_ops: &M,
        va: VirtAddr,
    ) -> HalResult<PhysAddr> {
        let pte_ptr = unsafe { self.walk(alloc, map_ops, va, false)? };
        let entry = unsafe { pte_ptr.read_volatile() };
        if !entry.is_valid() {
            return Err(HalError::InvalidAddress);
        }
        unsafe { pte_ptr.write_volatile(RawPte::INVALID) };
        Ok(entry.phys_addr())
    }

    /// Recursively free every intermediate page-table page belonging to
    /// this table (not leaf data frames, which the VM layer owns). Mirrors
    /// xv6's `freewalk`.
    pub fn free_tables<A: PageFrameSource, M: DirectMap>(self, alloc: &A, map_ops: &M) {
        unsafe { Self::free_level(alloc, map_ops, self.root, LEVELS - 1) };
    }

    unsafe fn free_level<A: PageFrameSource, M: DirectMap>(
        alloc: &A,
        map_ops: &M,
        table: PhysAddr,
        level: usize,
    ) {
        let base = map_ops.phys_to_virt(table).as_ptr::<RawPte>();
        for i in 0..PTES_PER_PAGE {
            let entry = unsafe { base.add(i).read_volatile() };
            if entry.is_branch() {
                if level > 0 {
                    unsafe { Self::free_level(alloc, map_ops, entry.phys_addr(), level - 1) };
                }
            } else if entry.is_valid() {
                // Leaf entries at intermediate levels should never occur
                // in this layout; ignore defensively rather than leak the
                // walk.
                continue;
            }
        }
        alloc.dealloc(table);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;
    use core::cell::RefCell;

    /// Simulated physical RAM plus a bump frame allocator, used so the
    /// walker can be exercised without real hardware. `DirectMap` here is
    /// just "subtract the simulated base" since the backing `Vec` is host
    /// memory, not a real physical range.
    struct FakeRam {
        bytes: RefCell<Vec<u8>>,
        base: u64,
        next_free: RefCell<u64>,
    }

    impl FakeRam {
        fn new(frames: usize) -> Self {
            let bytes = vec![0u8; frames * PGSIZE as usize];
            Self {
                bytes: RefCell::new(bytes),
                base: 0x8000_0000,
                next_free: RefCell::new(0x8000_0000),
            }
        }
    }

    impl PageFrameSource for FakeRam {
        fn alloc_zeroed(&self) -> HalResult<PhysAddr> {
            let mut next = self.next_free.borrow_mut();
            let frame = *next;
            let len = self.bytes.borrow().len() as u64;
            if frame - self.base + PGSIZE > len {
                return Err(HalError::OutOfMemory);
            }
            *next += PGSIZE;
            Ok(PhysAddr::new(frame))
        }

        fn dealloc(&self, _frame: PhysAddr) {
            // Bump allocator: never reclaimed, fine for tests.
        }
    }

    impl DirectMap for FakeRam {
        fn phys_to_virt(&self, phys: PhysAddr) -> VirtAddr {
            let offset = phys.as_u64() - self.base;
            let ptr = self.bytes.borrow().as_ptr() as u64 + offset;
            VirtAddr::new(ptr)
        }
    }

    #[test]
    fn map_then_lookup_round_trips() {
        let ram = FakeRam::new(16);
        let table = Sv39PageTable::create(&ram).unwrap();
        let va = VirtAddr::new(0x1000);
        let pa = ram.alloc_zeroed().unwrap();

        table
            .map_page(&ram, &ram, va, pa, PteFlags::READ | PteFlags::WRITE | PteFlags::USER)
            .unwrap();

        let pte = table.lookup(&ram, &ram, va).unwrap();
        assert_eq!(pte.phys_addr(), pa);
        assert!(pte.flags().contains(PteFlags::WRITE));
    }

    #[test]
    fn remap_same_page_fails() {
        let ram = FakeRam::new(16);
        let table = Sv39PageTable::create(&ram).unwrap();
        let va = VirtAddr::new(0x2000);
        let pa1 = ram.alloc_zeroed().unwrap();
        let pa2 = ram.alloc_zeroed().unwrap();

        table.map_page(&ram, &ram, va, pa1, PteFlags::READ).unwrap();
        let err = table.map_page(&ram, &ram, va, pa2, PteFlags::READ).unwrap_err();
        assert_eq!(err, HalError::ResourceBusy);
    }

    #[test]
    fn unmap_clears_entry_without_freeing_frame() {
        let ram = FakeRam::new(16);
        let table = Sv39PageTable::create(&ram).unwrap();
        let va = VirtAddr::new(0x3000);
        let pa = ram.alloc_zeroed().unwrap();

        table.map_page(&ram, &ram, va, pa, PteFlags::READ | PteFlags::WRITE).unwrap();
        let freed = table.unmap_page(&ram, &ram, va).unwrap();
        assert_eq!(freed, pa);
        assert!(table.lookup(&ram, &ram, va).is_none());
    }

    #[test]
    fn set_flags_preserves_physical_address() {
        let ram = FakeRam::new(16);
        let table = Sv39PageTable::create(&ram).unwrap();
        let va = VirtAddr::new(0x4000);
        let pa = ram.alloc_zeroed().unwrap();

        table
            .map_page(&ram, &ram, va, pa, PteFlags::READ | PteFlags::WRITE | PteFlags::USER)
            .unwrap();
        table
            .set_flags(&ram, &ram, va, PteFlags::READ | PteFlags::USER | PteFlags::COW)
            .unwrap();

        let pte = table.lookup(&ram, &ram, va).unwrap();
        assert_eq!(pte.phys_addr(), pa);
        assert!(!pte.flags().contains(PteFlags::WRITE));
        assert!(pte.flags().contains(PteFlags::COW));
    }

    #[test]
    fn unaligned_addresses_rejected() {
        let ram = FakeRam::new(16);
        let table = Sv39PageTable::create(&ram).unwrap();
        let pa = ram.alloc_zeroed().unwrap();
        let err = table
            .map_page(&ram, &ram, VirtAddr::new(0x1001), pa, PteFlags::READ)
            .unwrap_err();
        assert_eq!(err, HalError::InvalidAddress);
    }

    #[test]
    fn addresses_above_maxva_rejected() {
        let ram = FakeRam::new(16);
        let table = Sv39PageTable::create(&ram).unwrap();
        let pa = ram.alloc_zeroed().unwrap();
        let err = table
            .map_page(&ram, &ram, VirtAddr::new(MAXVA), pa, PteFlags::READ)
            .unwrap_err();
        assert_eq!(err, HalError::InvalidAddress);
    }
}
