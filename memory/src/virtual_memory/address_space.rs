//! # Address Space Management
//!
//! The region allocator: an ordered set of non-overlapping virtual memory
//! areas (VMAs) per address space, kept as a `BTreeMap` keyed by start
//! address so neighbor lookups for split/merge are a simple predecessor/
//! successor walk. All mutation goes through the single `regions` write
//! lock, which is the "VM-write-lock" the rest of the VM manager serializes
//! on: callers must hold it for the full duration of a logical operation
//! (e.g. munmap's find-then-split-then-unmap) rather than re-acquiring it
//! between steps, or a concurrent mmap could observe a torn region set.

use super::{AddressSpaceId, RegionBacking, VmRegion, VmRegionType, PageFlags, VirtualMapper};
use crate::{Page, MemResult, MemError};
use helix_hal::{VirtAddr, PageSize};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::RwLock;

/// Address space
pub struct AddressSpace {
    /// Address space ID
    id: AddressSpaceId,
    /// Regions
    regions: RwLock<BTreeMap<u64, VmRegion>>,
    /// Page table mapper
    mapper: Arc<dyn VirtualMapper>,
    /// Start of user space
    user_start: VirtAddr,
    /// End of user space
    user_end: VirtAddr,
    /// Heap break
    brk: RwLock<VirtAddr>,
}

impl AddressSpace {
    /// Create a new address space
    pub fn new(
        id: AddressSpaceId,
        mapper: Arc<dyn VirtualMapper>,
        user_start: VirtAddr,
        user_end: VirtAddr,
    ) -> Self {
        Self {
            id,
            regions: RwLock::new(BTreeMap::new()),
            mapper,
            user_start,
            user_end,
            brk: RwLock::new(user_start),
        }
    }

    /// Get address space ID
    pub fn id(&self) -> AddressSpaceId {
        self.id
    }

    /// Get the page table mapper backing this address space.
    pub fn mapper(&self) -> &Arc<dyn VirtualMapper> {
        &self.mapper
    }

    /// User address space bounds `[start, end)`.
    pub fn user_range(&self) -> (VirtAddr, VirtAddr) {
        (self.user_start, self.user_end)
    }

    /// Snapshot of all regions, ordered by start address. Used by fork to
    /// duplicate the region tree and by introspection syscalls like
    /// `mincore`.
    pub fn snapshot_regions(&self) -> Vec<VmRegion> {
        self.regions.read().values().cloned().collect()
    }

    /// Replace the whole region tree (fork's copy-on-write duplication
    /// installs the parent's regions into the child verbatim, then
    /// remaps pages separately).
    pub fn install_regions(&self, regions: Vec<VmRegion>) {
        let mut table = self.regions.write();
        table.clear();
        for region in regions {
            table.insert(region.start.as_u64(), region);
        }
    }

    /// Add a region
    pub fn add_region(&self, region: VmRegion) -> MemResult<()> {
        let mut regions = self.regions.write();
        
        // Check for overlaps
        for (_, existing) in regions.iter() {
            if existing.overlaps(&region) {
                return Err(MemError::AlreadyMapped);
            }
        }
        
        regions.insert(region.start.as_u64(), region);
        Ok(())
    }

    /// Remove a region
    pub fn remove_region(&self, start: VirtAddr) -> MemResult<VmRegion> {
        self.regions.write()
            .remove(&start.as_u64())
            .ok_or(MemError::NotMapped)
    }

    /// Find region containing address
    pub fn find_region(&self, addr: VirtAddr) -> Option<VmRegion> {
        let regions = self.regions.read();
        for (_, region) in regions.iter() {
            if region.contains(addr) {
                return Some(region.clone());
            }
        }
        None
    }

    /// Allocate anonymous memory
    pub fn mmap_anonymous(
        &self,
        hint: Option<VirtAddr>,
        size: u64,
        flags: PageFlags,
    ) -> MemResult<VirtAddr> {
        let aligned_size = (size + 0xFFF) & !0xFFF; // Page align
        
        let addr = if let Some(h) = hint {
            // Try to use hint
            if self.is_range_free(h, aligned_size) {
                h
            } else {
                self.find_free_range(aligned_size)?
            }
        } else {
            self.find_free_range(aligned_size)?
        };
        
        let region = VmRegion {
            start: addr,
            size: aligned_size,
            flags,
            region_type: VmRegionType::Anonymous,
            backing: RegionBacking::Anonymous,
        };

        self.add_region(region)?;
        Ok(addr)
    }

    /// Unmap memory. `addr`/`size` need not align to a region's own bounds:
    /// a munmap that lands in the middle of a larger region splits it,
    /// unmapping only the requested sub-range (a real `munmap(2)` can carve
    /// a hole out of one mapping without disturbing the rest).
    pub fn munmap(&self, addr: VirtAddr, size: u64) -> MemResult<()> {
        let size = (size + 0xFFF) & !0xFFF;
        let end = VirtAddr::new(addr.as_u64() + size);

        let mut regions = self.regions.write();
        let affected: Vec<u64> = regions
            .iter()
            .filter(|(_, r)| r.start < end && addr < r.end())
            .map(|(k, _)| *k)
            .collect();

        for key in affected {
            let region = regions.remove(&key).expect("key came from this map");
            for leftover in Self::carve(region, addr, end) {
                regions.insert(leftover.start.as_u64(), leftover);
            }
        }
        drop(regions);

        let page_size = PageSize::Size4KiB.size() as u64;
        let mut current = addr.as_u64();
        while current < end.as_u64() {
            let page = Page::new(VirtAddr::new(current), PageSize::Size4KiB);
            let _ = self.mapper.unmap(page); // Ignore errors for unmapped pages
            current += page_size;
        }

        debug_assert!(self.validate());
        Ok(())
    }

    /// Split `region` around `[cut_start, cut_end)`, returning the pieces
    /// of it that survive outside the cut (0, 1, or 2 pieces).
    fn carve(region: VmRegion, cut_start: VirtAddr, cut_end: VirtAddr) -> Vec<VmRegion> {
        let mut out = Vec::new();
        if region.start < cut_start {
            out.push(VmRegion {
                start: region.start,
                size: cut_start.as_u64() - region.start.as_u64(),
                flags: region.flags,
                region_type: region.region_type,
                backing: region.backing.clone(),
            });
        }
        if region.end() > cut_end {
            let new_start = cut_end;
            let offset_delta = new_start.as_u64() - region.start.as_u64();
            let backing = match &region.backing {
                RegionBacking::Anonymous => RegionBacking::Anonymous,
                RegionBacking::File { source, offset } => RegionBacking::File {
                    source: source.clone(),
                    offset: offset + offset_delta,
                },
            };
            out.push(VmRegion {
                start: new_start,
                size: region.end().as_u64() - new_start.as_u64(),
                flags: region.flags,
                region_type: region.region_type,
                backing,
            });
        }
        out
    }

    /// Change memory protection over `[addr, addr+size)`, splitting any
    /// region whose bounds don't align to the requested range.
    pub fn mprotect(&self, addr: VirtAddr, size: u64, flags: PageFlags) -> MemResult<()> {
        let size = (size + 0xFFF) & !0xFFF;
        let end = VirtAddr::new(addr.as_u64() + size);

        {
            let mut regions = self.regions.write();
            let affected: Vec<u64> = regions
                .iter()
                .filter(|(_, r)| r.start < end && addr < r.end())
                .map(|(k, _)| *k)
                .collect();

            for key in affected {
                let region = regions.remove(&key).expect("key came from this map");
                let mid_start = region.start.max(addr);
                let mid_end = region.end().min(end);

                for outer in Self::carve(region.clone(), mid_start, mid_end) {
                    regions.insert(outer.start.as_u64(), outer);
                }

                let backing = match &region.backing {
                    RegionBacking::Anonymous => RegionBacking::Anonymous,
                    RegionBacking::File { source, offset } => RegionBacking::File {
                        source: source.clone(),
                        offset: offset + (mid_start.as_u64() - region.start.as_u64()),
                    },
                };
                let mid = VmRegion {
                    start: mid_start,
                    size: mid_end.as_u64() - mid_start.as_u64(),
                    flags,
                    region_type: region.region_type,
                    backing,
                };
                regions.insert(mid.start.as_u64(), mid);
            }
        }

        let page_size = PageSize::Size4KiB.size() as u64;
        let mut current = addr.as_u64();
        while current < end.as_u64() {
            let page = Page::new(VirtAddr::new(current), PageSize::Size4KiB);
            // Pages not yet demand-paged simply aren't mapped; the new
            // flags take effect the next time they fault in, since the
            // region table (consulted by the fault handler) is already
            // updated above.
            let _ = self.mapper.update_flags(page, flags);
            current += page_size;
        }

        debug_assert!(self.validate());
        Ok(())
    }

    /// Debug-only invariant check: regions are sorted by start address (the
    /// `BTreeMap` guarantees this) and pairwise non-overlapping.
    pub fn validate(&self) -> bool {
        let regions = self.regions.read();
        let mut prev_end: Option<VirtAddr> = None;
        for (_, region) in regions.iter() {
            if let Some(end) = prev_end {
                if region.start < end {
                    return false;
                }
            }
            prev_end = Some(region.end());
        }
        true
    }

    /// Adjust heap break
    pub fn brk(&self, new_brk: Option<VirtAddr>) -> VirtAddr {
        let mut brk = self.brk.write();
        
        if let Some(new) = new_brk {
            if new >= self.user_start && new < self.user_end {
                *brk = new;
            }
        }
        
        *brk
    }

    /// Check if a range is free
    fn is_range_free(&self, start: VirtAddr, size: u64) -> bool {
        let end = VirtAddr::new(start.as_u64() + size);
        
        if start < self.user_start || end > self.user_end {
            return false;
        }
        
        let regions = self.regions.read();
        for (_, region) in regions.iter() {
            if region.start < end && start < region.end() {
                return false;
            }
        }
        
        true
    }

    /// Find a free range of given size
    fn find_free_range(&self, size: u64) -> MemResult<VirtAddr> {
        let regions = self.regions.read();
        
        let mut current = self.user_start.as_u64();
        
        for (_, region) in regions.iter() {
            if region.start.as_u64() - current >= size {
                return Ok(VirtAddr::new(current));
            }
            current = region.end().as_u64();
        }
        
        // Check space after last region
        if self.user_end.as_u64() - current >= size {
            return Ok(VirtAddr::new(current));
        }

        Err(MemError::OutOfMemory)
    }

    /// Public entry point for the VM manager to locate free room before
    /// inserting a region directly (used by `mmap` with a file backing and
    /// by `exec`, neither of which goes through `mmap_anonymous`).
    pub fn find_free(&self, size: u64) -> MemResult<VirtAddr> {
        self.find_free_range(size)
    }

    /// Whether `[start, start+size)` is entirely free and in-bounds.
    pub fn range_is_free(&self, start: VirtAddr, size: u64) -> bool {
        self.is_range_free(start, size)
    }

    /// Grow a region's size in place without moving its start address.
    /// Fails if the extra space collides with the next region or user
    /// space's end (used by `mremap` and heap growth).
    pub fn grow_region(&self, start: VirtAddr, new_size: u64) -> MemResult<()> {
        let mut regions = self.regions.write();
        let current_size = regions
            .get(&start.as_u64())
            .ok_or(MemError::NotMapped)?
            .size;
        if new_size <= current_size {
            return Err(MemError::InvalidSize);
        }
        let new_end = VirtAddr::new(start.as_u64() + new_size);
        if new_end > self.user_end {
            return Err(MemError::OutOfMemory);
        }
        if let Some((_, next)) = regions.range((start.as_u64() + 1)..).next() {
            if next.start < new_end {
                return Err(MemError::OutOfMemory);
            }
        }
        regions.get_mut(&start.as_u64()).expect("checked above").size = new_size;
        Ok(())
    }

    /// Extend a downward-growing region (the user stack) by moving its
    /// start address lower while keeping the same end, failing if that
    /// collides with whatever lies below or exceeds `floor`.
    pub fn grow_region_down(&self, start: VirtAddr, new_start: VirtAddr, floor: VirtAddr) -> MemResult<()> {
        if new_start >= start || new_start < floor {
            return Err(MemError::InvalidAddress);
        }
        let mut regions = self.regions.write();
        let region = regions.get(&start.as_u64()).ok_or(MemError::NotMapped)?.clone();
        if let Some((_, prev)) = regions.range(..start.as_u64()).next_back() {
            if prev.end() > new_start {
                return Err(MemError::OutOfMemory);
            }
        }
        let grown = VmRegion {
            start: new_start,
            size: region.end().as_u64() - new_start.as_u64(),
            flags: region.flags,
            region_type: region.region_type,
            backing: region.backing.clone(),
        };
        regions.remove(&start.as_u64());
        regions.insert(new_start.as_u64(), grown);
        Ok(())
    }
}
