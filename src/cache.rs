//! Fixed-capacity page buffer cache with pin-counted LRU eviction.
//!
//! Generalizes the inline `VecDeque<(PageId, Arc<Mutex<Page>>)>` the pager
//! used to keep to itself into its own type, so pin-count bookkeeping and
//! eviction order are testable without a real file behind them.
//!
//! Readers going through [`crate::pager::Pager::read_through_mmap`] never
//! touch this cache; it only holds buffers a writer has pinned for
//! mutation (freshly allocated pages, or CoW copies) until they are
//! flushed to disk at commit.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::page::PageId;

#[derive(Debug, Default)]
pub struct PageCache {
    capacity: usize,
    lru: VecDeque<PageId>,
    buffers: HashMap<PageId, Arc<Mutex<Vec<u8>>>>,
    pins: HashMap<PageId, u32>,
}

impl PageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lru: VecDeque::new(),
            buffers: HashMap::new(),
            pins: HashMap::new(),
        }
    }

    pub fn get(&self, id: PageId) -> Option<Arc<Mutex<Vec<u8>>>> {
        self.buffers.get(&id).cloned()
    }

    pub fn contains(&self, id: PageId) -> bool {
        self.buffers.contains_key(&id)
    }

    /// Inserts or replaces a page's buffer, evicting unpinned entries if
    /// the cache is over capacity. Returns any evicted `(id, bytes)` pairs
    /// so the caller can write them back to disk before they are lost —
    /// this cache only tracks buffers, it has no file to write back to.
    #[must_use = "evicted buffers must be written back or they are lost"]
    pub fn put(&mut self, id: PageId, buf: Vec<u8>) -> Vec<(PageId, Vec<u8>)> {
        if self.buffers.insert(id, Arc::new(Mutex::new(buf))).is_none() {
            self.lru.push_back(id);
        }
        self.evict_if_needed()
    }

    pub fn pin(&mut self, id: PageId) {
        *self.pins.entry(id).or_insert(0) += 1;
    }

    pub fn unpin(&mut self, id: PageId) {
        if let Some(count) = self.pins.get_mut(&id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.pins.remove(&id);
            }
        }
    }

    fn is_pinned(&self, id: PageId) -> bool {
        self.pins.get(&id).is_some_and(|&c| c > 0)
    }

    /// Evicts unpinned entries down to capacity, returning the bytes of
    /// each one evicted. A dirty buffer that falls out of the cache still
    /// needs to reach the file — it is not yet reflected there.
    fn evict_if_needed(&mut self) -> Vec<(PageId, Vec<u8>)> {
        let mut evicted = Vec::new();
        while self.buffers.len() > self.capacity.max(1) {
            let Some(pos) = self.lru.iter().position(|id| !self.is_pinned(*id)) else {
                break; // everything pinned; let the cache grow past capacity
            };
            let id = self.lru.remove(pos).expect("position came from this deque");
            if let Some(buf) = self.buffers.remove(&id) {
                let bytes = Arc::try_unwrap(buf).map(|m| m.into_inner().unwrap()).unwrap_or_default();
                evicted.push((id, bytes));
            }
        }
        evicted
    }

    /// Drains every cached buffer (used when flushing a transaction's dirty
    /// set to disk at commit; the caller writes each page out then clears
    /// the cache for the next transaction).
    pub fn drain(&mut self) -> Vec<(PageId, Vec<u8>)> {
        let out = self
            .lru
            .drain(..)
            .filter_map(|id| self.buffers.remove(&id).map(|buf| (id, buf)))
            .map(|(id, buf)| (id, Arc::try_unwrap(buf).map(|m| m.into_inner().unwrap()).unwrap_or_default()))
            .collect();
        self.pins.clear();
        out
    }

    /// Discards every buffered page without returning it; used to abandon
    /// a rolled-back transaction's dirty pages rather than flush them.
    pub fn clear(&mut self) {
        self.buffers.clear();
        self.lru.clear();
        self.pins.clear();
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_and_get() {
        let mut cache = PageCache::new(4);
        let _ = cache.put(1, vec![1, 2, 3]);
        assert!(cache.contains(1));
        assert_eq!(*cache.get(1).unwrap().lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn evicts_unpinned_over_capacity() {
        let mut cache = PageCache::new(1);
        let evicted = cache.put(1, vec![]);
        assert!(evicted.is_empty());
        let evicted = cache.put(2, vec![]);
        assert!(!cache.contains(1));
        assert!(cache.contains(2));
        assert_eq!(evicted, vec![(1, vec![])]);
    }

    #[test]
    fn evicted_buffer_bytes_are_returned_for_write_back() {
        let mut cache = PageCache::new(1);
        let _ = cache.put(1, vec![1, 2, 3]);
        let evicted = cache.put(2, vec![4, 5, 6]);
        assert_eq!(evicted, vec![(1, vec![1, 2, 3])]);
    }

    #[test]
    fn pinned_entries_survive_eviction() {
        let mut cache = PageCache::new(1);
        let _ = cache.put(1, vec![]);
        cache.pin(1);
        let evicted = cache.put(2, vec![]);
        assert!(cache.contains(1));
        assert!(cache.contains(2));
        assert!(evicted.is_empty());
    }

    #[test]
    fn drain_empties_cache() {
        let mut cache = PageCache::new(4);
        let _ = cache.put(1, vec![9]);
        let _ = cache.put(2, vec![8]);
        let drained = cache.drain();
        assert_eq!(drained.len(), 2);
        assert!(cache.is_empty());
    }
}
