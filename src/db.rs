//! The top-level handle: [`Db`] owns the pager, WAL, and meta state, and
//! hands out [`UpdateTx`]/[`ViewTx`] through closure-scoped [`Db::update`]/
//! [`Db::view`] calls.
//!
//! # Locking
//!
//! A single [`std::sync::Mutex`] guards the pager (and, by extension, the
//! meta and free-list, which are only ever touched while that lock is
//! held). This serializes every transaction — readers included — rather
//! than giving read-only transactions true lock-free concurrency against
//! a running writer. Real MVCC concurrency would need each reader to hold
//! its own independently-lifetimed mmap snapshot (an `Arc`'d mapping that
//! survives a writer's remap); the free-list's `min_live_reader_txid`
//! gating and the WAL's logical-record format are both already written to
//! support that, so swapping the coarse mutex for per-reader snapshots
//! later doesn't require touching [`crate::btree`] or [`crate::wal`].
//! Recorded as an accepted Open Question in `DESIGN.md`.
//!
//! # See Also
//! - [`crate::recovery`]: runs once, inside [`Db::open`].
//! - [`crate::tx`]: the transaction types this module constructs.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, info};

use crate::error::Error;
use crate::freelist::FreeList;
use crate::meta::{META_PAGE_IDS, Meta};
use crate::page::{DEFAULT_PAGE_SIZE, PageId, set_overflow_next};
use crate::pager::Pager;
use crate::recovery;
use crate::tx::{UpdateTx, ViewTx};
use crate::wal::WalWriter;

/// Key ordering used throughout a [`Db`]; only the byte-lexical default is
/// implemented, so this exists as a named extension point rather than a
/// working pluggable-comparator feature. See `DESIGN.md`.
pub type Comparator = fn(&[u8], &[u8]) -> std::cmp::Ordering;

fn byte_lexical(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
    a.cmp(b)
}

/// Tuning knobs for [`Db::open`]. Matches the constructor-argument shape
/// the pager and WAL modules already expose, rather than introducing a
/// second configuration vocabulary on top of theirs.
#[derive(Debug, Clone)]
pub struct Options {
    /// Page size in bytes; ignored on reopen of an existing file (the
    /// file's own meta page is authoritative there).
    pub page_size: usize,
    /// Number of page buffers the writer's dirty cache may hold before
    /// evicting unpinned entries.
    pub cache_pool_page_count: usize,
    /// Size at which the WAL would be checkpointed instead of rotated on
    /// every commit. Unused: this engine flushes meta and truncates the
    /// log after every commit, so the log never grows past one
    /// transaction's worth of records. Kept for parity with the on-disk
    /// open-options surface.
    pub log_file_limit_bytes: u64,
    /// Key comparator. Only [`byte_lexical`] is implemented; a different
    /// function here changes nothing yet.
    pub comparator: Comparator,
    /// Opens the database refusing any `update` call outright, so a
    /// process that should never write can't accidentally do so.
    pub read_only: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_pool_page_count: 1024,
            log_file_limit_bytes: 64 * 1024 * 1024,
            comparator: byte_lexical,
            read_only: false,
        }
    }
}

struct Shared {
    pager: Pager,
    wal: WalWriter,
    meta: Meta,
}

pub struct Db {
    inner: Mutex<Shared>,
    live_readers: Mutex<BTreeSet<u64>>,
    wal_path: PathBuf,
    options: Options,
}

impl Db {
    pub fn open(path: &Path, options: Options) -> Result<Self, Error> {
        let wal_path = wal_path_for(path);
        let mut pager = Pager::open(path, options.page_size, options.cache_pool_page_count)?;

        let meta = if pager.page_count == 0 {
            info!("initializing new database at {}", path.display());
            let meta = Meta::initial(options.page_size as u16);
            bootstrap(&mut pager, &meta)?;
            meta
        } else {
            let loaded = recovery::load_active_meta(&pager)?;
            recovery::load_freelist(&mut pager, &loaded)?;
            loaded
        };

        let mut wal = WalWriter::open(&wal_path)?;
        let meta = recovery::replay(&mut pager, &wal_path, &mut wal, meta)?;
        persist_meta(&mut pager, &meta)?;
        wal.rotate()?;

        Ok(Self {
            inner: Mutex::new(Shared { pager, wal, meta }),
            live_readers: Mutex::new(BTreeSet::new()),
            wal_path,
            options,
        })
    }

    /// Runs `f` inside a single read-write transaction. On `Ok`, the
    /// transaction's WAL `Commit` record is synced and a new meta page is
    /// flushed before this returns; on `Err`, every page the transaction
    /// touched is discarded and the database is left exactly as it was.
    pub fn update<F, T>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut UpdateTx) -> Result<T, Error>,
    {
        if self.options.read_only {
            return Err(Error::TxReadOnly);
        }

        let mut shared = self.inner.lock().unwrap();
        let Shared { pager, wal, meta } = &mut *shared;

        let txid = meta.txid + 1;
        let min_live_reader_txid = self.live_readers.lock().unwrap().iter().next().copied().unwrap_or(txid);
        let checkpoint = pager.checkpoint();

        let mut tx = UpdateTx::begin(pager, wal, txid, min_live_reader_txid, meta.page_size as usize, meta.user_root)?;
        match f(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                let new_root = tx.final_user_root();
                meta.txid = txid;
                meta.user_root = new_root;
                persist_freelist(pager, meta, txid, min_live_reader_txid)?;
                persist_meta(pager, meta)?;
                // Meta is flushed every commit (no batched checkpointing),
                // so it alone is the durability watermark; truncate the
                // log immediately rather than waiting for a `Persisted`
                // marker to be replayed on the next open.
                wal.rotate()?;
                debug!("committed txid {txid}, user_root={new_root}");
                Ok(value)
            }
            Err(e) => {
                tx.rollback()?;
                pager.rollback_to(checkpoint);
                Err(e)
            }
        }
    }

    /// Runs `f` inside a read-only transaction pinned to the database's
    /// state as of the moment this call starts.
    pub fn view<F, T>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&ViewTx) -> Result<T, Error>,
    {
        let shared = self.inner.lock().unwrap();
        let txid = shared.meta.txid;
        let user_root = shared.meta.user_root;
        self.live_readers.lock().unwrap().insert(txid);

        let tx = ViewTx::new(&shared.pager, user_root, txid, &self.live_readers);
        f(&tx)
    }

    pub fn wal_path(&self) -> &Path {
        &self.wal_path
    }
}

fn wal_path_for(db_path: &Path) -> PathBuf {
    let mut os = db_path.as_os_str().to_owned();
    os.push(".wal");
    PathBuf::from(os)
}

/// Lays out a brand-new file: two meta pages, an empty user-root leaf, and
/// a single-page empty free-list chain, matching [`Meta::initial`].
fn bootstrap(pager: &mut Pager, meta: &Meta) -> Result<(), Error> {
    let leaf = crate::node::Node::new_leaf(0);
    let buf = leaf.encode(meta.page_size as usize)?;
    pager.page_count = pager.page_count.max(meta.user_root + 1);
    pager.write_page(meta.user_root, buf)?;

    let mut free_pages = FreeList::new().encode_pages(meta.page_size as usize).map_err(|cause| Error::Wal { cause })?;
    let mut free_chunk = free_pages.remove(0);
    set_overflow_next(&mut free_chunk, crate::page::NULL_PAGE);
    pager.page_count = pager.page_count.max(meta.free_list_pgid + 1);
    pager.write_page(meta.free_list_pgid, free_chunk)?;

    persist_meta(pager, meta)?;
    pager.flush()?;
    Ok(())
}

fn persist_meta(pager: &mut Pager, meta: &Meta) -> Result<(), Error> {
    let buf = meta.encode(meta.page_size as usize);
    let slot = meta.next_slot();
    pager.page_count = pager.page_count.max(META_PAGE_IDS[0] + 1).max(META_PAGE_IDS[1] + 1);
    pager.write_page(slot, buf)?;
    pager.flush()?;
    Ok(())
}

/// Re-encodes `pager.freelist` into a fresh page chain, frees the old
/// chain, and updates `meta`'s pointer/counters to match.
fn persist_freelist(pager: &mut Pager, meta: &mut Meta, txid: u64, min_live_reader_txid: u64) -> Result<(), Error> {
    let mut old_id = meta.free_list_pgid;
    for _ in 0..meta.free_list_page_count {
        if old_id == crate::page::NULL_PAGE {
            break;
        }
        let buf = pager.read_page(old_id)?;
        let next = FreeList::chain_next(&buf);
        pager.free(old_id, 1, txid);
        old_id = next;
    }

    let pages = pager.freelist.encode_pages(meta.page_size as usize).map_err(|cause| Error::Wal { cause })?;
    let ids: Vec<PageId> = (0..pages.len()).map(|_| pager.alloc(1, min_live_reader_txid)).collect();
    for (i, mut page) in pages.into_iter().enumerate() {
        let next = ids.get(i + 1).copied().unwrap_or(crate::page::NULL_PAGE);
        set_overflow_next(&mut page, next);
        pager.write_page(ids[i], page)?;
    }

    meta.free_list_pgid = ids[0];
    meta.free_list_page_count = ids.len() as u32;
    meta.free_pair_count = pager.freelist.pair_count();
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;

    #[test]
    fn open_update_view_roundtrip_after_reopen() {
        let temp = TempDir::new("db").unwrap();
        let path = temp.path().join("test.db");

        {
            let db = Db::open(&path, Options { page_size: 1024, ..Default::default() }).unwrap();
            db.update(|tx| {
                tx.root_bucket().put(b"hello".to_vec(), b"world".to_vec())?;
                Ok(())
            })
            .unwrap();
        }

        let db = Db::open(&path, Options { page_size: 1024, ..Default::default() }).unwrap();
        db.view(|tx| {
            let got = tx.root_bucket().get(b"hello")?;
            assert_eq!(got, Some(b"world".to_vec()));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn failed_update_leaves_no_trace() {
        let temp = TempDir::new("db").unwrap();
        let path = temp.path().join("test.db");
        let db = Db::open(&path, Options::default()).unwrap();

        db.update(|tx| {
            tx.root_bucket().put(b"a".to_vec(), b"1".to_vec())?;
            Err(Error::AlreadyExists)
        })
        .unwrap_err();

        db.view(|tx| {
            assert_eq!(tx.root_bucket().get(b"a")?, None);
            Ok(())
        })
        .unwrap();

        // A subsequent successful transaction should behave as if the
        // failed one never happened.
        db.update(|tx| {
            tx.root_bucket().put(b"a".to_vec(), b"2".to_vec())?;
            Ok(())
        })
        .unwrap();
        db.view(|tx| {
            assert_eq!(tx.root_bucket().get(b"a")?, Some(b"2".to_vec()));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn read_only_rejects_update() {
        let temp = TempDir::new("db").unwrap();
        let path = temp.path().join("test.db");
        Db::open(&path, Options::default()).unwrap();

        let db = Db::open(&path, Options { read_only: true, ..Default::default() }).unwrap();
        let result = db.update(|_| Ok(()));
        assert!(matches!(result, Err(Error::TxReadOnly)));
    }

    #[test]
    fn sub_bucket_roundtrips_and_frees_its_subtree_on_delete() {
        let temp = TempDir::new("db").unwrap();
        let path = temp.path().join("test.db");
        let db = Db::open(&path, Options::default()).unwrap();

        db.update(|tx| {
            let mut root = tx.root_bucket();
            let mut widgets = root.sub_bucket(b"widgets")?;
            widgets.put(b"sprocket".to_vec(), b"1".to_vec())?;
            widgets.put(b"gear".to_vec(), b"2".to_vec())?;
            Ok(())
        })
        .unwrap();

        db.view(|tx| {
            let root = tx.root_bucket();
            let widgets = root.sub_bucket(b"widgets")?.unwrap();
            assert_eq!(widgets.get(b"sprocket")?, Some(b"1".to_vec()));
            Ok(())
        })
        .unwrap();

        db.update(|tx| {
            tx.root_bucket().delete_sub_bucket(b"widgets")?;
            Ok(())
        })
        .unwrap();

        db.view(|tx| {
            assert!(tx.root_bucket().sub_bucket(b"widgets")?.is_none());
            Ok(())
        })
        .unwrap();
    }
}
