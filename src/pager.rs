//! Disk-backed page management layer.
//!
//! The `pager` module defines [`Pager`], responsible for allocating,
//! caching, and writing fixed-size pages to and from the database file. It
//! abstracts the low-level mechanics of file I/O so the rest of the engine
//! deals in [`PageId`]s rather than byte offsets.
//!
//! # Responsibilities
//!
//! - Allocating new pages (growing the file) and reusing free-list runs.
//! - Reading pages through a read-only memory map; writing pages into a
//!   pinned cache of dirty buffers that is flushed at commit.
//! - Copy-on-write: [`Pager::copy`] clones a page's bytes into a freshly
//!   allocated page stamped with the copying writer's txid.
//!
//! # mmap policy
//!
//! The file is mapped read-only, covering the size as of the last flush.
//! When a transaction grows the file, [`Pager::flush`] extends the file,
//! writes dirty pages, and remaps. A remap would invalidate any `&[u8]`
//! slice a concurrent reader had borrowed straight out of the old mapping;
//! this module sidesteps that by always copying a page's bytes out into an
//! owned `Vec<u8>` before returning ([`Pager::read_through_mmap`]), and by
//! never remapping except from inside [`crate::db::Db::update`]/`flush`,
//! which [`crate::db`] already serializes against every reader behind one
//! mutex. See `DESIGN.md` for why that coarse lock stands in for
//! per-reader mmap snapshot lifetimes here.
//!
//! # See Also
//! - [`crate::cache`]: the pinned dirty-buffer cache.
//! - [`crate::freelist`]: run reuse consulted by [`Pager::alloc`].

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::{debug, trace};
use memmap2::Mmap;

use crate::cache::PageCache;
use crate::error::PagerError;
use crate::freelist::FreeList;
use crate::page::{NULL_PAGE, PageId};

pub struct Pager {
    file: File,
    mmap: Option<Mmap>,
    pub page_size: usize,
    pub page_count: u32,
    cache: PageCache,
    pub freelist: FreeList,
}

/// Pre-transaction snapshot of the bits of [`Pager`] state a write
/// transaction can mutate, so a rollback can undo them without ever having
/// touched disk.
pub struct PagerCheckpoint {
    page_count: u32,
    freelist: FreeList,
}

impl Pager {
    pub fn open(path: &Path, page_size: usize, cache_pool_page_count: usize) -> Result<Self, PagerError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        let page_count = (len / page_size as u64) as u32;
        let mmap = if page_count > 0 {
            Some(unsafe { Mmap::map(&file)? })
        } else {
            None
        };

        Ok(Self {
            file,
            mmap,
            page_size,
            page_count,
            cache: PageCache::new(cache_pool_page_count),
            freelist: FreeList::new(),
        })
    }

    /// Reads a page, preferring a pinned dirty buffer over the mmap'd
    /// on-disk view (so a writer sees its own uncommitted CoW copies).
    pub fn read_page(&self, id: PageId) -> Result<Vec<u8>, PagerError> {
        if let Some(buf) = self.cache.get(id) {
            return Ok(buf.lock().unwrap().clone());
        }
        self.read_through_mmap(id)
    }

    /// Reads straight through the memory-mapped view, bypassing the dirty
    /// cache entirely. Used by read-only transactions, which only ever see
    /// pages committed as of their snapshot.
    pub fn read_through_mmap(&self, id: PageId) -> Result<Vec<u8>, PagerError> {
        if id >= self.page_count {
            return Err(PagerError::OutOfBounds(id));
        }
        let offset = id as usize * self.page_size;
        if let Some(mmap) = &self.mmap {
            if offset + self.page_size <= mmap.len() {
                return Ok(mmap[offset..offset + self.page_size].to_vec());
            }
        }
        // File grew since the last remap but this read predates a flush;
        // fall back to a direct positioned read.
        let mut buf = vec![0u8; self.page_size];
        let mut file = self.file.try_clone()?;
        file.seek(SeekFrom::Start(offset as u64))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Stages a page write in the dirty cache; not durable (no fsync, no
    /// remap) until [`Pager::flush`]. If staging this page pushes the cache
    /// past capacity, the evicted buffer is written to the file immediately
    /// — growing it if necessary — so it stays readable via
    /// [`Pager::read_through_mmap`]'s positioned-read fallback even though
    /// it is no longer cached. Eviction must never just drop a dirty page.
    pub fn write_page(&mut self, id: PageId, buf: Vec<u8>) -> Result<(), PagerError> {
        trace!("staging page {id} ({} bytes)", buf.len());
        let evicted = self.cache.put(id, buf);
        for (evicted_id, evicted_buf) in evicted {
            debug!("writing back page {evicted_id} evicted from cache before commit");
            self.write_back(evicted_id, &evicted_buf)?;
        }
        Ok(())
    }

    /// Writes `buf` directly to `id`'s offset in the file, growing the file
    /// first if `id` falls past its current length. Used to persist a page
    /// evicted from the dirty cache mid-transaction, ahead of the next
    /// [`Pager::flush`].
    fn write_back(&mut self, id: PageId, buf: &[u8]) -> Result<(), PagerError> {
        let needed_len = (id as u64 + 1) * self.page_size as u64;
        if self.file.metadata()?.len() < needed_len {
            self.file.set_len(needed_len)?;
        }
        let offset = id as u64 * self.page_size as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    /// Allocates `n` contiguous pages, preferring a free-list run eligible
    /// for reuse (freed strictly before `min_live_reader_txid`) over
    /// growing the file.
    pub fn alloc(&mut self, n: u32, min_live_reader_txid: u64) -> PageId {
        if let Some(id) = self.freelist.allocate(n, min_live_reader_txid) {
            debug!("reused {n} page(s) from free-list at {id}");
            return id;
        }
        let id = self.page_count;
        self.page_count += n;
        debug!("grew file by {n} page(s) starting at {id}");
        id
    }

    pub fn free(&mut self, pgid: PageId, run_len: u32, txid: u64) {
        self.freelist.free(txid, pgid, run_len);
    }

    /// Copy-on-write: clones `pgid`'s bytes into a freshly allocated page
    /// stamped with `txid` as its new `last_modified_txid`, and returns the
    /// new id. The first 8 bytes of every node page are the txid field, so
    /// restamping is a simple byte overwrite.
    pub fn copy(&mut self, pgid: PageId, txid: u64, min_live_reader_txid: u64) -> Result<PageId, PagerError> {
        let mut buf = self.read_page(pgid)?;
        if buf.len() >= 8 {
            buf[0..8].copy_from_slice(&txid.to_le_bytes());
        }
        let new_id = self.alloc(1, min_live_reader_txid);
        self.write_page(new_id, buf)?;
        Ok(new_id)
    }

    /// Flushes all dirty buffers to disk, grows the file if needed, fsyncs,
    /// and remaps the read-only view to cover the new size.
    pub fn flush(&mut self) -> Result<(), PagerError> {
        let needed_len = self.page_count as u64 * self.page_size as u64;
        if self.file.metadata()?.len() < needed_len {
            self.file.set_len(needed_len)?;
        }

        for (id, buf) in self.cache.drain() {
            let offset = id as u64 * self.page_size as u64;
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.write_all(&buf)?;
        }
        self.file.sync_all()?;
        self.mmap = Some(unsafe { Mmap::map(&self.file)? });
        Ok(())
    }

    /// Pins a page in the dirty cache so it survives eviction while a
    /// caller holds a reference to its buffer across several operations.
    pub fn reference(&mut self, id: PageId) {
        self.cache.pin(id);
    }

    pub fn dereference(&mut self, id: PageId) {
        self.cache.unpin(id);
    }

    pub fn is_null(id: PageId) -> bool {
        id == NULL_PAGE
    }

    /// Captures `page_count`/`freelist` before a write transaction begins.
    pub fn checkpoint(&self) -> PagerCheckpoint {
        PagerCheckpoint { page_count: self.page_count, freelist: self.freelist.clone() }
    }

    /// Undoes every allocation and free recorded since `checkpoint`, and
    /// discards any pages still staged in the dirty cache. Safe even though
    /// [`Pager::write_page`] may already have written some of this
    /// transaction's evicted pages straight to the file ahead of a real
    /// flush: `page_count` and `freelist` roll back to `checkpoint`, so
    /// nothing in the restored state can reach those bytes, and the next
    /// writer's allocations will simply overwrite them.
    pub fn rollback_to(&mut self, checkpoint: PagerCheckpoint) {
        self.page_count = checkpoint.page_count;
        self.freelist = checkpoint.freelist;
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;

    #[test]
    fn alloc_grows_file() {
        let temp = TempDir::new("pager").unwrap();
        let mut pager = Pager::open(&temp.path().join("db"), 256, 4).unwrap();
        let a = pager.alloc(1, 0);
        let b = pager.alloc(1, 0);
        assert_eq!(b, a + 1);
        assert_eq!(pager.page_count, b + 1);
    }

    #[test]
    fn write_then_flush_then_read() {
        let temp = TempDir::new("pager").unwrap();
        let mut pager = Pager::open(&temp.path().join("db"), 256, 4).unwrap();
        let id = pager.alloc(1, 0);
        pager.write_page(id, vec![7u8; 256]).unwrap();
        pager.flush().unwrap();
        assert_eq!(pager.read_through_mmap(id).unwrap(), vec![7u8; 256]);
    }

    #[test]
    fn copy_restamps_txid() {
        let temp = TempDir::new("pager").unwrap();
        let mut pager = Pager::open(&temp.path().join("db"), 256, 4).unwrap();
        let id = pager.alloc(1, 0);
        let mut buf = vec![0u8; 256];
        buf[0..8].copy_from_slice(&1u64.to_le_bytes());
        pager.write_page(id, buf).unwrap();
        pager.flush().unwrap();

        let new_id = pager.copy(id, 5, 0).unwrap();
        let copied = pager.read_page(new_id).unwrap();
        assert_eq!(u64::from_le_bytes(copied[0..8].try_into().unwrap()), 5);
    }

    #[test]
    fn reuse_from_freelist_before_growing() {
        let temp = TempDir::new("pager").unwrap();
        let mut pager = Pager::open(&temp.path().join("db"), 256, 4).unwrap();
        let a = pager.alloc(1, 0);
        pager.free(a, 1, 1);
        let b = pager.alloc(1, 10);
        assert_eq!(a, b);
    }

    /// A page written, then evicted from a tiny cache before any flush,
    /// must still be readable: eviction has to write it back rather than
    /// drop it.
    #[test]
    fn evicted_dirty_page_survives_without_a_flush() {
        let temp = TempDir::new("pager").unwrap();
        let mut pager = Pager::open(&temp.path().join("db"), 256, 1).unwrap();

        let first = pager.alloc(1, 0);
        pager.write_page(first, vec![1u8; 256]).unwrap();
        // Staging a second page overflows the one-entry cache and evicts
        // `first`, which has never been flushed.
        let second = pager.alloc(1, 0);
        pager.write_page(second, vec![2u8; 256]).unwrap();

        assert_eq!(pager.read_page(first).unwrap(), vec![1u8; 256]);
        assert_eq!(pager.read_page(second).unwrap(), vec![2u8; 256]);
    }
}
