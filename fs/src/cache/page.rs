//! The page cache proper: `get_page`/`read_page`/`mark_dirty`/`put_page`/
//! `invalidate_page`/`flush`, the per-page state machine and the
//! recency/dirty lists that drive eviction and writeback.
//!
//! ```text
//! clean  --mark_dirty-->  dirty
//! dirty  --writeback start-->  in-flight
//! in-flight --writeback end, success--> clean (UP_TO_DATE, !DIRTY)
//! in-flight --writeback end, failure--> dirty (remain)
//! ```
//!
//! A page sits on the recency list (clean, referenced only by the
//! cache), on the dirty list (dirty, not in flight), or on neither
//! (busy, or held by a reference beyond the cache's own).

use super::CacheKey;
use crate::core::error::{HfsError, HfsResult};
use crate::BLOCK_SIZE;
use alloc_crate::boxed::Box;
use alloc_crate::sync::Arc;
use alloc_crate::vec::Vec;
use bitflags::bitflags;
use hashbrown::HashMap;
use spin::{Mutex, RwLock};

bitflags! {
    /// Per-page state bits. `IO_IN_PROGRESS` is the "in-flight" state from
    /// the state machine; `DIRTY`/`UP_TO_DATE` combine to give clean vs.
    /// dirty vs. not-yet-populated.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct PageState: u8 {
        const UP_TO_DATE     = 1 << 0;
        const DIRTY          = 1 << 1;
        const IO_IN_PROGRESS = 1 << 2;
    }
}

/// Backing store a page cache reads from and writes back to: one block
/// in, one block out, no knowledge of files or inodes.
pub trait BackEnd: Send + Sync {
    fn read_page(&self, key: CacheKey, buf: &mut [u8; BLOCK_SIZE]) -> HfsResult<()>;
    fn write_page(&self, key: CacheKey, buf: &[u8; BLOCK_SIZE]) -> HfsResult<()>;
}

struct PageInner {
    data: Box<[u8; BLOCK_SIZE]>,
    state: PageState,
}

/// One cached block. Holds its own short lock over data and state, as
/// the serialization section of the page-cache contract requires.
pub struct Page {
    key: CacheKey,
    inner: Mutex<PageInner>,
}

impl Page {
    fn new(key: CacheKey) -> Self {
        Self {
            key,
            inner: Mutex::new(PageInner { data: Box::new([0u8; BLOCK_SIZE]), state: PageState::empty() }),
        }
    }

    pub fn key(&self) -> CacheKey {
        self.key
    }

    pub fn is_up_to_date(&self) -> bool {
        self.inner.lock().state.contains(PageState::UP_TO_DATE)
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.lock().state.contains(PageState::DIRTY)
    }

    /// Run `f` over the page's data under its short lock. Callers that
    /// mutate data through this must follow up with [`PageCache::mark_dirty`].
    pub fn with_data<R>(&self, f: impl FnOnce(&mut [u8; BLOCK_SIZE]) -> R) -> R {
        let mut inner = self.inner.lock();
        f(&mut inner.data)
    }
}

#[derive(Default)]
struct Lists {
    recency: Vec<CacheKey>,
    dirty: Vec<CacheKey>,
}

impl Lists {
    fn remove_from_recency(&mut self, key: CacheKey) {
        if let Some(pos) = self.recency.iter().position(|k| *k == key) {
            self.recency.remove(pos);
        }
    }

    fn remove_from_dirty(&mut self, key: CacheKey) {
        if let Some(pos) = self.dirty.iter().position(|k| *k == key) {
            self.dirty.remove(pos);
        }
    }

    fn push_recency(&mut self, key: CacheKey) {
        self.remove_from_dirty(key);
        if !self.recency.contains(&key) {
            self.recency.push(key);
        }
    }

    fn push_dirty(&mut self, key: CacheKey) {
        self.remove_from_recency(key);
        if !self.dirty.contains(&key) {
            self.dirty.push(key);
        }
    }

    fn pop_oldest_clean(&mut self) -> Option<CacheKey> {
        if self.recency.is_empty() {
            None
        } else {
            Some(self.recency.remove(0))
        }
    }
}

/// A block-keyed page cache bounded at `max_pages` resident pages.
pub struct PageCache {
    map: RwLock<HashMap<CacheKey, Arc<Page>>>,
    lists: Mutex<Lists>,
    max_pages: usize,
    backend: Arc<dyn BackEnd>,
    stats: Mutex<super::CacheStats>,
}

impl PageCache {
    pub fn new(backend: Arc<dyn BackEnd>, max_pages: usize) -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            lists: Mutex::new(Lists::default()),
            max_pages,
            backend,
            stats: Mutex::new(super::CacheStats::new()),
        }
    }

    pub fn stats(&self) -> super::CacheStats {
        *self.stats.lock()
    }

    pub fn page_count(&self) -> usize {
        self.map.read().len()
    }

    /// Return a referenced page mapping `key`, allocating or evicting as
    /// necessary. Performs no I/O.
    pub fn get_page(&self, key: CacheKey) -> HfsResult<Arc<Page>> {
        {
            let map = self.map.read();
            if let Some(page) = map.get(&key) {
                let page = page.clone();
                drop(map);
                self.detach_from_lists(key);
                self.record_lookup(true);
                return Ok(page);
            }
        }

        let mut map = self.map.write();
        if let Some(page) = map.get(&key) {
            let page = page.clone();
            drop(map);
            self.detach_from_lists(key);
            self.record_lookup(true);
            return Ok(page);
        }

        if map.len() >= self.max_pages {
            let evicted = self.lists.lock().pop_oldest_clean();
            match evicted {
                Some(victim) => {
                    map.remove(&victim);
                    self.stats.lock().evictions += 1;
                }
                None => {
                    self.record_lookup(false);
                    return Err(HfsError::Busy);
                }
            }
        }

        let page = Arc::new(Page::new(key));
        map.insert(key, page.clone());
        self.record_lookup(false);
        Ok(page)
    }

    fn detach_from_lists(&self, key: CacheKey) {
        let mut lists = self.lists.lock();
        lists.remove_from_recency(key);
        lists.remove_from_dirty(key);
    }

    fn record_lookup(&self, hit: bool) {
        let mut stats = self.stats.lock();
        stats.lookups += 1;
        if hit {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
    }

    /// Populate `page` from the back end if it is not already
    /// up-to-date. Drops no lock the caller is holding; acquires and
    /// releases the page's own lock internally.
    pub fn read_page(&self, page: &Page) -> HfsResult<()> {
        {
            let mut inner = page.inner.lock();
            if inner.state.contains(PageState::UP_TO_DATE) {
                return Ok(());
            }
            if inner.state.contains(PageState::IO_IN_PROGRESS) {
                return self.wait_for_inflight(page);
            }
            inner.state.insert(PageState::IO_IN_PROGRESS);
        }

        let mut buf = [0u8; BLOCK_SIZE];
        let result = self.backend.read_page(page.key, &mut buf);

        let mut inner = page.inner.lock();
        inner.state.remove(PageState::IO_IN_PROGRESS);
        if result.is_ok() {
            *inner.data = buf;
            inner.state.insert(PageState::UP_TO_DATE);
        }
        result
    }

    /// Busy-wait for an in-flight I/O to finish. A scheduler-backed
    /// implementation would instead sleep on the page's wait channel
    /// and be woken by `io_end`.
    fn wait_for_inflight(&self, page: &Page) -> HfsResult<()> {
        const MAX_SPINS: u32 = 1_000_000;
        for _ in 0..MAX_SPINS {
            let inner = page.inner.lock();
            if !inner.state.contains(PageState::IO_IN_PROGRESS) {
                return if inner.state.contains(PageState::UP_TO_DATE) { Ok(()) } else { Err(HfsError::Busy) };
            }
            drop(inner);
            core::hint::spin_loop();
        }
        Err(HfsError::Busy)
    }

    /// Mark `page` dirty. Forbidden while an I/O is in flight against it.
    pub fn mark_dirty(&self, page: &Page) -> HfsResult<()> {
        let mut inner = page.inner.lock();
        if inner.state.contains(PageState::IO_IN_PROGRESS) {
            return Err(HfsError::Busy);
        }
        inner.state.insert(PageState::DIRTY);
        Ok(())
    }

    /// Drop the caller's reference. When the cache's own reference is
    /// all that remains, the page rejoins the recency or dirty list.
    pub fn put_page(&self, page: Arc<Page>) {
        let key = page.key;
        let cache_is_sole_owner = Arc::strong_count(&page) == 2;
        if cache_is_sole_owner {
            let dirty = page.inner.lock().state.contains(PageState::DIRTY);
            let mut lists = self.lists.lock();
            if dirty {
                lists.push_dirty(key);
            } else {
                lists.push_recency(key);
            }
        }
    }

    /// Clear `DIRTY`/`UP_TO_DATE` if the page is not busy and not held
    /// by any reference beyond the cache's own and this call's.
    pub fn invalidate_page(&self, page: &Arc<Page>) -> HfsResult<()> {
        if Arc::strong_count(page) > 2 {
            return Err(HfsError::Busy);
        }
        let mut inner = page.inner.lock();
        if inner.state.contains(PageState::IO_IN_PROGRESS) {
            return Err(HfsError::Busy);
        }
        inner.state.remove(PageState::DIRTY | PageState::UP_TO_DATE);
        self.detach_from_lists(page.key);
        Ok(())
    }

    /// Walk a snapshot of the dirty list, writing each page back to the
    /// device one at a time. Returns an error if any writeback failed,
    /// after attempting all of them.
    pub fn flush(&self) -> HfsResult<()> {
        let batch = core::mem::take(&mut self.lists.lock().dirty);
        let mut saw_error = false;

        for key in batch {
            let page = {
                let map = self.map.read();
                match map.get(&key) {
                    Some(p) => p.clone(),
                    None => continue,
                }
            };

            let snapshot = {
                let mut inner = page.inner.lock();
                if inner.state.contains(PageState::IO_IN_PROGRESS) {
                    continue;
                }
                inner.state.insert(PageState::IO_IN_PROGRESS);
                *inner.data
            };

            let result = self.backend.write_page(key, &snapshot);

            let mut inner = page.inner.lock();
            inner.state.remove(PageState::IO_IN_PROGRESS);
            let mut stats = self.stats.lock();
            match result {
                Ok(()) => {
                    inner.state.remove(PageState::DIRTY);
                    stats.writebacks += 1;
                }
                Err(_) => {
                    inner.state.insert(PageState::DIRTY);
                    stats.writeback_errors += 1;
                    saw_error = true;
                }
            }
            drop(stats);
            drop(inner);

            if Arc::strong_count(&page) == 1 {
                let mut lists = self.lists.lock();
                if page.is_dirty() {
                    lists.push_dirty(key);
                } else {
                    lists.push_recency(key);
                }
            }
        }

        if saw_error {
            Err(HfsError::IoWriteError)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{BlockNum, DevNum};

    struct MemBackEnd {
        blocks: Mutex<HashMap<CacheKey, [u8; BLOCK_SIZE]>>,
        fail_writes: core::sync::atomic::AtomicBool,
    }

    impl MemBackEnd {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                blocks: Mutex::new(HashMap::new()),
                fail_writes: core::sync::atomic::AtomicBool::new(false),
            })
        }
    }

    impl BackEnd for MemBackEnd {
        fn read_page(&self, key: CacheKey, buf: &mut [u8; BLOCK_SIZE]) -> HfsResult<()> {
            if let Some(data) = self.blocks.lock().get(&key) {
                *buf = *data;
            }
            Ok(())
        }

        fn write_page(&self, key: CacheKey, buf: &[u8; BLOCK_SIZE]) -> HfsResult<()> {
            if self.fail_writes.load(core::sync::atomic::Ordering::Relaxed) {
                return Err(HfsError::IoWriteError);
            }
            self.blocks.lock().insert(key, *buf);
            Ok(())
        }
    }

    fn key(n: u64) -> CacheKey {
        CacheKey::new(DevNum::new(0), BlockNum::new(n))
    }

    #[test]
    fn get_read_mark_dirty_put_round_trip() {
        let backend = MemBackEnd::new();
        let cache = PageCache::new(backend, 4);

        let page = cache.get_page(key(1)).unwrap();
        cache.read_page(&page).unwrap();
        assert!(page.is_up_to_date());

        page.with_data(|buf| buf[0] = 0xAB);
        cache.mark_dirty(&page).unwrap();
        assert!(page.is_dirty());

        cache.put_page(page);
        assert_eq!(cache.stats().lookups, 1);
    }

    #[test]
    fn flush_writes_back_dirty_pages_and_clears_dirty() {
        let backend = MemBackEnd::new();
        let cache = PageCache::new(backend.clone(), 4);

        let page = cache.get_page(key(5)).unwrap();
        page.with_data(|buf| buf[0] = 0x42);
        cache.mark_dirty(&page).unwrap();
        cache.put_page(page);

        cache.flush().unwrap();
        assert_eq!(cache.stats().writebacks, 1);
        assert_eq!(backend.blocks.lock().get(&key(5)).unwrap()[0], 0x42);
    }

    #[test]
    fn eviction_picks_oldest_clean_page_when_full() {
        let backend = MemBackEnd::new();
        let cache = PageCache::new(backend, 2);

        for i in 0..2 {
            let page = cache.get_page(key(i)).unwrap();
            cache.put_page(page);
        }
        assert_eq!(cache.page_count(), 2);

        let page = cache.get_page(key(99)).unwrap();
        cache.put_page(page);
        assert_eq!(cache.page_count(), 2, "eviction must keep the cache at max_pages");
        assert!(cache.get_page(key(0)).is_ok(), "evicted key reloads as a fresh page");
    }

    #[test]
    fn dirty_pages_are_never_evicted() {
        let backend = MemBackEnd::new();
        let cache = PageCache::new(backend, 1);

        let page = cache.get_page(key(1)).unwrap();
        cache.mark_dirty(&page).unwrap();
        cache.put_page(page);

        assert_eq!(cache.get_page(key(2)), Err(HfsError::Busy));
    }

    #[test]
    fn failed_writeback_leaves_page_dirty() {
        let backend = MemBackEnd::new();
        backend.fail_writes.store(true, core::sync::atomic::Ordering::Relaxed);
        let cache = PageCache::new(backend, 4);

        let page = cache.get_page(key(3)).unwrap();
        cache.mark_dirty(&page).unwrap();
        cache.put_page(page);

        assert_eq!(cache.flush(), Err(HfsError::IoWriteError));
        let page = cache.get_page(key(3)).unwrap();
        assert!(page.is_dirty(), "a failed writeback must not clear DIRTY");
    }
}
