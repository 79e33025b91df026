//! Transaction handles: [`UpdateTx`] (single writer) and [`ViewTx`] (many
//! concurrent readers).
//!
//! Both are built and torn down entirely inside [`crate::db::Db::update`]/
//! [`crate::db::Db::view`], which is what lets them borrow the pager
//! directly instead of juggling a self-referential guard: the lock guard
//! lives on `Db`'s stack frame for the duration of the closure, and these
//! structs just hold `&mut Pager`/`&Pager` borrowed from it.
//!
//! # See Also
//! - [`crate::bucket`]: the per-bucket API a transaction hands out.
//! - [`crate::db`]: owns the locks and WAL that wrap a transaction's lifetime.

use std::collections::BTreeSet;
use std::sync::Mutex;

use log::debug;

use crate::bucket::{BucketRegistry, ROOT_BUCKET_ID, UpdateBucket, ViewBucket};
use crate::error::Error;
use crate::page::PageId;
use crate::pager::Pager;
use crate::wal::{LogicalRecord, WalWriter};

/// A read-write transaction. Every mutation goes through a bucket handle
/// obtained from [`UpdateTx::root_bucket`]; `commit`/`rollback` are driven
/// by [`crate::db::Db::update`], not called directly by users.
pub struct UpdateTx<'p> {
    pager: &'p mut Pager,
    wal: &'p mut WalWriter,
    txid: u64,
    min_live_reader_txid: u64,
    page_size: usize,
    user_root: PageId,
    registry: BucketRegistry,
}

impl<'p> UpdateTx<'p> {
    pub(crate) fn begin(
        pager: &'p mut Pager,
        wal: &'p mut WalWriter,
        txid: u64,
        min_live_reader_txid: u64,
        page_size: usize,
        user_root: PageId,
    ) -> Result<Self, Error> {
        wal.append(&LogicalRecord::Begin { txid })?;
        Ok(Self {
            pager,
            wal,
            txid,
            min_live_reader_txid,
            page_size,
            user_root,
            registry: BucketRegistry::new(user_root),
        })
    }

    pub fn root_bucket(&mut self) -> UpdateBucket<'_, 'p> {
        UpdateBucket::new(self, ROOT_BUCKET_ID)
    }

    /// Addresses a bucket by its ephemeral id directly, bypassing a
    /// `root_bucket().sub_bucket(...)` walk. Used by [`crate::recovery`],
    /// which replays WAL records that already name the id a prior run
    /// assigned rather than a path of keys.
    pub(crate) fn bucket_by_id(&mut self, id: crate::wal::BucketId) -> UpdateBucket<'_, 'p> {
        UpdateBucket::new(self, id)
    }

    pub fn txid(&self) -> u64 {
        self.txid
    }

    pub fn min_live_reader_txid(&self) -> u64 {
        self.min_live_reader_txid
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub(crate) fn pager_ref(&self) -> &Pager {
        self.pager
    }

    pub(crate) fn pager_mut(&mut self) -> &mut Pager {
        self.pager
    }

    pub(crate) fn wal_mut(&mut self) -> &mut WalWriter {
        self.wal
    }

    pub(crate) fn registry(&self) -> &BucketRegistry {
        &self.registry
    }

    pub(crate) fn registry_mut(&mut self) -> &mut BucketRegistry {
        &mut self.registry
    }

    pub(crate) fn set_user_root(&mut self, root: PageId) {
        self.user_root = root;
    }

    /// The tree root a fully-committed meta page should record.
    pub(crate) fn final_user_root(&self) -> PageId {
        self.user_root
    }

    /// Appends the `Commit` record and fsyncs the log. Called by `Db::update`
    /// once the closure has returned `Ok` and the new meta page is about to
    /// be written.
    pub(crate) fn commit(&mut self) -> Result<(), Error> {
        self.wal.append(&LogicalRecord::Commit)?;
        self.wal.sync()?;
        debug!("tx {} committed, user_root={}", self.txid, self.user_root);
        Ok(())
    }

    /// Appends the `Rollback` record; the caller separately restores the
    /// pager's pre-transaction state via [`crate::pager::Pager::rollback_to`].
    pub(crate) fn rollback(&mut self) -> Result<(), Error> {
        self.wal.append(&LogicalRecord::Rollback)?;
        self.wal.sync()?;
        debug!("tx {} rolled back", self.txid);
        Ok(())
    }
}

/// A read-only snapshot transaction. Sees exactly the tree as of the txid
/// it was opened with, independent of any writer committing concurrently.
pub struct ViewTx<'p> {
    pager: &'p Pager,
    user_root: PageId,
    txid: u64,
    live_readers: Option<&'p Mutex<BTreeSet<u64>>>,
}

impl<'p> ViewTx<'p> {
    pub(crate) fn new(
        pager: &'p Pager,
        user_root: PageId,
        txid: u64,
        live_readers: &'p Mutex<BTreeSet<u64>>,
    ) -> Self {
        Self { pager, user_root, txid, live_readers: Some(live_readers) }
    }

    pub fn root_bucket(&self) -> ViewBucket<'p> {
        ViewBucket::new(self.pager, self.user_root)
    }

    pub fn txid(&self) -> u64 {
        self.txid
    }
}

impl Drop for ViewTx<'_> {
    fn drop(&mut self) {
        if let Some(live) = self.live_readers {
            live.lock().unwrap().remove(&self.txid);
        }
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;
    use crate::wal::WalWriter;

    #[test]
    fn update_tx_put_and_propagate_root_changes_user_root() {
        let temp = TempDir::new("tx").unwrap();
        let mut pager = Pager::open(&temp.path().join("db"), 4096, 64).unwrap();

        let leaf = crate::node::Node::new_leaf(0);
        let buf = leaf.encode(4096).unwrap();
        let root = pager.alloc(1, 0);
        pager.write_page(root, buf).unwrap();
        pager.flush().unwrap();

        let mut wal = WalWriter::open(&temp.path().join("wal.log")).unwrap();
        let mut tx = UpdateTx::begin(&mut pager, &mut wal, 1, 0, 4096, root).unwrap();
        tx.root_bucket().put(b"a".to_vec(), b"1".to_vec()).unwrap();
        let new_root = tx.final_user_root();
        assert_ne!(new_root, root);

        tx.commit().unwrap();
        pager.flush().unwrap();

        let got = crate::btree::lookup(&pager, new_root, b"a").unwrap();
        assert!(got.is_some());
    }
}
