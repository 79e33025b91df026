//! Buckets: named sub-trees within a transaction.
//!
//! A bucket is just a B+tree root plus bookkeeping for the sub-buckets it
//! has opened. The user root bucket is pre-registered under the
//! well-known id [`ROOT_BUCKET_ID`]; every other bucket gets an ephemeral
//! id the first time a transaction touches it, via [`BucketRegistry`].
//!
//! Sub-bucket roots live as ordinary leaf values in their parent's tree
//! (`is_bucket = true`, payload = the sub-tree's root `PageId`). Because
//! CoW means a bucket's root changes on every mutation, any write to a
//! sub-bucket must walk back up and rewrite that pointer in its parent,
//! which may itself be a sub-bucket — [`UpdateBucket::propagate_root`]
//! does this recursively up to the transaction's `meta.user_root`.
//!
//! # See Also
//! - [`crate::btree`]: the tree operations this module drives.
//! - [`crate::tx`]: owns the [`BucketRegistry`] and hands out bucket handles.

use std::collections::HashMap;

use log::debug;

use crate::btree::BTree;
use crate::error::Error;
use crate::node::{Entry, Node, Value, MAX_KEY_SIZE};
use crate::page::{NULL_PAGE, PageId, chunk_overflow_payload, overflow_next, overflow_payload, set_overflow_next};
use crate::pager::Pager;
use crate::tx::UpdateTx;
use crate::wal::{BucketId, LogicalRecord};

/// Well-known id of the bucket whose root is `meta.user_root`.
pub const ROOT_BUCKET_ID: BucketId = 0xFFFF_FFFF;

/// Values at or under this many bytes are stored inline in the leaf
/// record; larger values spill into an overflow chain. Scaled to
/// `page_size` rather than fixed: a flat budget sized for a 4 KiB page
/// can exceed what a leaf entry can ever fit on the 256/512-byte pages
/// spec's page-size range allows, which would turn `Node::encode`'s
/// `NodeError::Full` into a spurious failure for valid mid-size values
/// instead of spilling them to overflow as intended.
fn inline_value_budget(page_size: usize) -> usize {
    (page_size / 4).max(64)
}

/// Per-transaction bucket bookkeeping: current root per bucket id, and
/// enough parent/key context to propagate a root change upward.
///
/// Absent from a transaction until the first sub-bucket is opened within
/// it — mirrored here by simply never calling [`BucketRegistry::register_child`]
/// rather than an explicit `Option`, since the maps themselves start empty.
#[derive(Debug, Default)]
pub struct BucketRegistry {
    roots: HashMap<BucketId, PageId>,
    parents: HashMap<BucketId, (BucketId, Vec<u8>)>,
    by_parent_key: HashMap<(BucketId, Vec<u8>), BucketId>,
    next_id: BucketId,
}

impl BucketRegistry {
    pub fn new(user_root: PageId) -> Self {
        let mut roots = HashMap::new();
        roots.insert(ROOT_BUCKET_ID, user_root);
        Self { roots, parents: HashMap::new(), by_parent_key: HashMap::new(), next_id: 0 }
    }

    pub fn root_of(&self, id: BucketId) -> PageId {
        self.roots[&id]
    }

    fn set_root(&mut self, id: BucketId, root: PageId) {
        self.roots.insert(id, root);
    }

    fn lookup_child(&self, parent: BucketId, key: &[u8]) -> Option<BucketId> {
        self.by_parent_key.get(&(parent, key.to_vec())).copied()
    }

    fn register_child(&mut self, parent: BucketId, key: Vec<u8>, root: PageId) -> BucketId {
        let id = self.next_id;
        self.next_id += 1;
        self.roots.insert(id, root);
        self.parents.insert(id, (parent, key.clone()));
        self.by_parent_key.insert((parent, key), id);
        id
    }

    fn forget_child(&mut self, parent: BucketId, key: &[u8]) {
        if let Some(id) = self.by_parent_key.remove(&(parent, key.to_vec())) {
            self.roots.remove(&id);
            self.parents.remove(&id);
        }
    }

    fn parent_of(&self, id: BucketId) -> Option<(BucketId, Vec<u8>)> {
        self.parents.get(&id).cloned()
    }
}

fn is_bucket_entry(value: &Value) -> bool {
    matches!(value, Value::Inline { is_bucket: true, .. } | Value::Overflow { is_bucket: true, .. })
}

fn sub_bucket_root(bytes: &[u8]) -> PageId {
    u32::from_le_bytes(bytes[0..4].try_into().expect("sub-bucket payload is 4 bytes"))
}

/// Reassembles a leaf value, following its overflow chain if it has one.
/// Reads each overflow page through the cache-aware path, so a writer
/// sees its own uncommitted chunks. Used by [`UpdateBucket`].
pub(crate) fn materialize(pager: &Pager, value: &Value) -> Result<Vec<u8>, Error> {
    materialize_with(value, |id| pager.read_page(id).map_err(Error::from))
}

/// Reassembles a leaf value like [`materialize`], but resolves overflow
/// pages through the mmap-only read path instead of the dirty cache.
/// Used by [`ViewBucket`]/[`BucketIter`], so a read-only snapshot never
/// sees a concurrent writer's uncommitted overflow chunks, matching how
/// [`crate::btree::lookup_snapshot`] and [`crate::btree::Cursor`] resolve
/// the rest of a reader's view.
pub(crate) fn materialize_snapshot(pager: &Pager, value: &Value) -> Result<Vec<u8>, Error> {
    materialize_with(value, |id| pager.read_through_mmap(id).map_err(Error::from))
}

fn materialize_with(
    value: &Value,
    mut read_page: impl FnMut(PageId) -> Result<Vec<u8>, Error>,
) -> Result<Vec<u8>, Error> {
    match value {
        Value::Child(_) => unreachable!("leaf entries never carry Value::Child"),
        Value::Inline { bytes, .. } => Ok(bytes.clone()),
        Value::Overflow { head, total_len, .. } => {
            let mut out = Vec::with_capacity(*total_len as usize);
            let mut id = *head;
            while id != NULL_PAGE && (out.len() as u64) < *total_len {
                let buf = read_page(id)?;
                let remaining = (*total_len - out.len() as u64) as usize;
                let chunk = overflow_payload(&buf);
                let take = remaining.min(chunk.len());
                out.extend_from_slice(&chunk[..take]);
                id = overflow_next(&buf);
            }
            Ok(out)
        }
    }
}

/// Stores `bytes` inline if it fits the budget, otherwise spills it into a
/// freshly allocated overflow chain.
pub(crate) fn store_value(
    pager: &mut Pager,
    min_live_reader_txid: u64,
    bytes: &[u8],
    is_bucket: bool,
    page_size: usize,
) -> Result<Value, Error> {
    if bytes.len() <= inline_value_budget(page_size) {
        return Ok(Value::Inline { bytes: bytes.to_vec(), is_bucket });
    }
    let chunks = chunk_overflow_payload(bytes, page_size);
    let ids: Vec<PageId> = (0..chunks.len()).map(|_| pager.alloc(1, min_live_reader_txid)).collect();
    for (i, mut chunk) in chunks.into_iter().enumerate() {
        let next = ids.get(i + 1).copied().unwrap_or(NULL_PAGE);
        set_overflow_next(&mut chunk, next);
        pager.write_page(ids[i], chunk)?;
    }
    Ok(Value::Overflow { head: ids[0], total_len: bytes.len() as u64, is_bucket })
}

pub(crate) fn free_overflow_chain(pager: &mut Pager, head: PageId, txid: u64) -> Result<(), Error> {
    let mut id = head;
    while id != NULL_PAGE {
        let buf = pager.read_page(id)?;
        let next = overflow_next(&buf);
        pager.free(id, 1, txid);
        id = next;
    }
    Ok(())
}

/// Recursively frees every page in a sub-tree: its overflow chains, any
/// nested sub-buckets, and finally its own node pages.
pub(crate) fn free_subtree(pager: &mut Pager, root: PageId, txid: u64) -> Result<(), Error> {
    let buf = pager.read_page(root)?;
    let node = Node::decode(&buf)?;
    if node.is_leaf() {
        for entry in node.entries() {
            match &entry.value {
                Value::Overflow { head, .. } => free_overflow_chain(pager, *head, txid)?,
                Value::Inline { bytes, is_bucket: true } => {
                    free_subtree(pager, sub_bucket_root(bytes), txid)?;
                }
                _ => {}
            }
        }
    } else {
        for entry in node.entries() {
            if let Value::Child(c) = &entry.value {
                free_subtree(pager, *c, txid)?;
            }
        }
        free_subtree(pager, node.tail_child, txid)?;
    }
    pager.free(root, 1, txid);
    Ok(())
}

/// A writable handle onto one bucket of an [`UpdateTx`].
///
/// Two lifetimes: `'tx` is this handle's own borrow of the transaction,
/// `'p` is the transaction's borrow of the pager/WAL it was opened with.
pub struct UpdateBucket<'tx, 'p> {
    tx: &'tx mut UpdateTx<'p>,
    id: BucketId,
}

impl<'tx, 'p> UpdateBucket<'tx, 'p> {
    pub(crate) fn new(tx: &'tx mut UpdateTx<'p>, id: BucketId) -> Self {
        Self { tx, id }
    }

    fn root(&self) -> PageId {
        self.tx.registry().root_of(self.id)
    }

    fn btree(&mut self) -> BTree<'_> {
        let txid = self.tx.txid();
        let min_live = self.tx.min_live_reader_txid();
        let page_size = self.tx.page_size();
        BTree::new(self.tx.pager_mut(), txid, min_live, page_size)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        match crate::btree::lookup(self.tx.pager_ref(), self.root(), key)? {
            Some(entry) if !is_bucket_entry(&entry.value) => Ok(Some(materialize(self.tx.pager_ref(), &entry.value)?)),
            _ => Ok(None),
        }
    }

    /// First key `>= key`, or `None` if past the end.
    pub fn lower_bound(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>, Error> {
        let mut cursor = crate::btree::Cursor::seek(self.tx.pager_ref(), self.root(), key)?;
        loop {
            match cursor.current() {
                None => return Ok(None),
                Some(entry) if is_bucket_entry(&entry.value) => {
                    cursor.advance()?;
                }
                Some(entry) => {
                    let k = entry.key.clone();
                    let v = materialize(self.tx.pager_ref(), &entry.value)?;
                    return Ok(Some((k, v)));
                }
            }
        }
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<(), Error> {
        if key.len() > MAX_KEY_SIZE {
            return Err(Error::KeyTooLarge(key.len()));
        }
        if value.len() > u32::MAX as usize {
            return Err(Error::ValueTooLarge(value.len()));
        }
        let root = self.root();
        let wal_value = value.clone();

        if let Some(existing) = crate::btree::lookup(self.tx.pager_ref(), root, &key)? {
            if is_bucket_entry(&existing.value) {
                return Err(Error::BucketConflict(key));
            }
            if let Value::Overflow { head, .. } = existing.value {
                free_overflow_chain(self.tx.pager_mut(), head, self.tx.txid())?;
            }
        }

        let page_size = self.tx.page_size();
        let min_live = self.tx.min_live_reader_txid();
        let stored = store_value(self.tx.pager_mut(), min_live, &value, false, page_size)?;
        let entry = Entry { key: key.clone(), value: stored };
        let new_root = self.btree().put(root, entry)?;
        self.propagate_root(self.id, new_root)?;

        debug!("bucket {:#x}: put {} byte key, {} byte value", self.id, key.len(), wal_value.len());
        self.tx.wal_mut().append(&LogicalRecord::PutNotBucket { bucket_id: self.id, key, value: wal_value })?;
        Ok(())
    }

    /// Returns whether a key was present to delete, mirroring bbolt's
    /// idempotent `Delete` rather than erroring on a missing key.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool, Error> {
        let root = self.root();
        let Some(existing) = crate::btree::lookup(self.tx.pager_ref(), root, key)? else {
            return Ok(false);
        };
        if is_bucket_entry(&existing.value) {
            return Err(Error::BucketConflict(key.to_vec()));
        }
        if let Value::Overflow { head, .. } = existing.value {
            free_overflow_chain(self.tx.pager_mut(), head, self.tx.txid())?;
        }

        let (new_root, _) = self.btree().delete(root, key)?;
        self.propagate_root(self.id, new_root)?;
        self.tx.wal_mut().append(&LogicalRecord::Delete { bucket_id: self.id, key: key.to_vec() })?;
        Ok(true)
    }

    /// Opens (creating on first touch) the named sub-bucket.
    pub fn sub_bucket(&mut self, key: &[u8]) -> Result<UpdateBucket<'_, 'p>, Error> {
        if let Some(id) = self.tx.registry().lookup_child(self.id, key) {
            return Ok(UpdateBucket::new(self.tx, id));
        }

        let root = self.root();
        let existing = crate::btree::lookup(self.tx.pager_ref(), root, key)?;
        let child_root = match existing {
            Some(entry) if is_bucket_entry(&entry.value) => match &entry.value {
                Value::Inline { bytes, .. } => sub_bucket_root(bytes),
                Value::Overflow { .. } => unreachable!("sub-bucket pointers are always inline"),
                Value::Child(_) => unreachable!(),
            },
            Some(_) => return Err(Error::BucketConflict(key.to_vec())),
            None => {
                let leaf = Node::new_leaf(self.tx.txid());
                let page_size = self.tx.page_size();
                let buf = leaf.encode(page_size)?;
                let min_live = self.tx.min_live_reader_txid();
                let id = self.tx.pager_mut().alloc(1, min_live);
                self.tx.pager_mut().write_page(id, buf)?;

                let entry = Entry {
                    key: key.to_vec(),
                    value: Value::Inline { bytes: id.to_le_bytes().to_vec(), is_bucket: true },
                };
                let new_root = self.btree().put(root, entry)?;
                self.propagate_root(self.id, new_root)?;
                self.tx.wal_mut().append(&LogicalRecord::SubBucket { bucket_id: self.id, key: key.to_vec() })?;
                id
            }
        };

        let child_id = self.tx.registry_mut().register_child(self.id, key.to_vec(), child_root);
        Ok(UpdateBucket::new(self.tx, child_id))
    }

    /// Removes a sub-bucket and every page reachable from it.
    pub fn delete_sub_bucket(&mut self, key: &[u8]) -> Result<bool, Error> {
        let root = self.root();
        let Some(entry) = crate::btree::lookup(self.tx.pager_ref(), root, key)? else {
            return Ok(false);
        };
        let Value::Inline { bytes, is_bucket: true } = &entry.value else {
            return Err(Error::BucketConflict(key.to_vec()));
        };
        let sub_root = sub_bucket_root(bytes);
        free_subtree(self.tx.pager_mut(), sub_root, self.tx.txid())?;

        let (new_root, _) = self.btree().delete(root, key)?;
        self.tx.registry_mut().forget_child(self.id, key);
        self.propagate_root(self.id, new_root)?;
        self.tx.wal_mut().append(&LogicalRecord::Delete { bucket_id: self.id, key: key.to_vec() })?;
        Ok(true)
    }

    /// Records `bucket_id`'s new root, then rewrites the pointer in its
    /// parent's tree (recursing up to `meta.user_root`) since CoW means a
    /// bucket's root changes on every mutation within it.
    fn propagate_root(&mut self, bucket_id: BucketId, new_root: PageId) -> Result<(), Error> {
        self.tx.registry_mut().set_root(bucket_id, new_root);
        if bucket_id == ROOT_BUCKET_ID {
            self.tx.set_user_root(new_root);
            return Ok(());
        }
        let (parent_id, key) =
            self.tx.registry().parent_of(bucket_id).expect("non-root bucket is registered with a parent");
        let parent_root = self.tx.registry().root_of(parent_id);
        let entry = Entry { key, value: Value::Inline { bytes: new_root.to_le_bytes().to_vec(), is_bucket: true } };

        let txid = self.tx.txid();
        let min_live = self.tx.min_live_reader_txid();
        let page_size = self.tx.page_size();
        let new_parent_root = BTree::new(self.tx.pager_mut(), txid, min_live, page_size).put(parent_root, entry)?;
        self.propagate_root(parent_id, new_parent_root)
    }
}

/// A read-only handle onto one bucket of a [`crate::tx::ViewTx`].
pub struct ViewBucket<'tx> {
    pager: &'tx Pager,
    root: PageId,
}

impl<'tx> ViewBucket<'tx> {
    pub(crate) fn new(pager: &'tx Pager, root: PageId) -> Self {
        Self { pager, root }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        match crate::btree::lookup_snapshot(self.pager, self.root, key)? {
            Some(entry) if !is_bucket_entry(&entry.value) => {
                Ok(Some(materialize_snapshot(self.pager, &entry.value)?))
            }
            _ => Ok(None),
        }
    }

    pub fn lower_bound(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>, Error> {
        let mut cursor = crate::btree::Cursor::seek(self.pager, self.root, key)?;
        loop {
            match cursor.current() {
                None => return Ok(None),
                Some(entry) if is_bucket_entry(&entry.value) => cursor.advance()?,
                Some(entry) => {
                    let k = entry.key.clone();
                    let v = materialize_snapshot(self.pager, &entry.value)?;
                    return Ok(Some((k, v)));
                }
            }
        }
    }

    pub fn sub_bucket(&self, key: &[u8]) -> Result<Option<ViewBucket<'tx>>, Error> {
        match crate::btree::lookup_snapshot(self.pager, self.root, key)? {
            Some(Entry { value: Value::Inline { bytes, is_bucket: true }, .. }) => {
                Ok(Some(ViewBucket::new(self.pager, sub_bucket_root(&bytes))))
            }
            _ => Ok(None),
        }
    }

    /// Iterates every non-bucket key in ascending order.
    pub fn iter(&self) -> Result<BucketIter<'tx>, Error> {
        let cursor = crate::btree::Cursor::first(self.pager, self.root)?;
        Ok(BucketIter { pager: self.pager, cursor })
    }
}

pub struct BucketIter<'tx> {
    pager: &'tx Pager,
    cursor: crate::btree::Cursor<'tx>,
}

impl Iterator for BucketIter<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = self.cursor.current()?;
            if is_bucket_entry(&entry.value) {
                if let Err(e) = self.cursor.advance() {
                    return Some(Err(e));
                }
                continue;
            }
            let key = entry.key.clone();
            let result = materialize_snapshot(self.pager, &entry.value).map(|v| (key, v));
            if let Err(e) = self.cursor.advance() {
                return Some(Err(e));
            }
            return Some(result);
        }
    }
}
