//! # Copy-on-Write Frame Accounting
//!
//! A shared, global table of reference counts for physical frames that are
//! mapped copy-on-write into more than one address space after `fork`.
//! Frames not present here are assumed to have an implicit refcount of one
//! (owned outright by whichever single address space maps them), which
//! keeps the common non-forked case free of bookkeeping.

use alloc::collections::BTreeMap;
use helix_hal::PhysAddr;
use spin::Mutex;

/// Tracks COW sharers per physical frame, keyed by frame number
/// (`addr / PGSIZE`) rather than raw address so the map stays small.
pub struct CowTable {
    counts: Mutex<BTreeMap<u64, usize>>,
}

impl CowTable {
    /// Create an empty table.
    pub const fn new() -> Self {
        Self {
            counts: Mutex::new(BTreeMap::new()),
        }
    }

    fn key(frame: PhysAddr) -> u64 {
        frame.as_u64() / helix_hal::arch::riscv64::PGSIZE
    }

    /// Mark a frame as shared by exactly two mappers (the state right
    /// after `fork` duplicates a writable page into COW). Subsequent
    /// `fork`s of the same frame call [`Self::share`] again to bump it.
    pub fn mark_shared(&self, frame: PhysAddr) {
        let mut counts = self.counts.lock();
        let entry = counts.entry(Self::key(frame)).or_insert(1);
        *entry += 1;
    }

    /// Increment the sharer count for an already-shared frame.
    pub fn share(&self, frame: PhysAddr) {
        let mut counts = self.counts.lock();
        *counts.entry(Self::key(frame)).or_insert(1) += 1;
    }

    /// Current sharer count; 1 if the frame isn't tracked (sole owner).
    pub fn refcount(&self, frame: PhysAddr) -> usize {
        *self.counts.lock().get(&Self::key(frame)).unwrap_or(&1)
    }

    /// Drop one reference, returning the count after the decrement. Once
    /// it reaches 1 the tracking entry is removed so the table doesn't
    /// grow unboundedly with frames that have returned to sole ownership.
    pub fn unshare(&self, frame: PhysAddr) -> usize {
        let mut counts = self.counts.lock();
        let key = Self::key(frame);
        match counts.get_mut(&key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                let remaining = *count;
                if remaining <= 1 {
                    counts.remove(&key);
                }
                remaining
            }
            Some(_) => {
                counts.remove(&key);
                1
            }
            None => 1,
        }
    }
}

impl Default for CowTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Global COW refcount table, shared by every address space's fork/fault
/// handling (frames can be shared across unrelated address spaces after
/// repeated forks, so a per-address-space table would miss sharers).
pub static COW_TABLE: CowTable = CowTable::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_frame_has_refcount_one() {
        let table = CowTable::new();
        assert_eq!(table.refcount(PhysAddr::new(0x1000)), 1);
    }

    #[test]
    fn mark_shared_then_unshare_round_trips() {
        let table = CowTable::new();
        let frame = PhysAddr::new(0x2000);
        table.mark_shared(frame);
        assert_eq!(table.refcount(frame), 2);
        assert_eq!(table.unshare(frame), 1);
        assert_eq!(table.refcount(frame), 1);
    }

    #[test]
    fn three_way_share_decrements_one_at_a_time() {
        let table = CowTable::new();
        let frame = PhysAddr::new(0x3000);
        table.mark_shared(frame); // 2
        table.share(frame); // 3
        assert_eq!(table.refcount(frame), 3);
        assert_eq!(table.unshare(frame), 2);
        assert_eq!(table.refcount(frame), 2);
        assert_eq!(table.unshare(frame), 1);
        assert_eq!(table.refcount(frame), 1);
    }
}
