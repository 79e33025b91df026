//! Copy-on-write B+tree: the durable index backing every bucket.
//!
//! [`BTree`] drives recursive insert/delete over a tree of [`Node`] pages,
//! propagating a new root id on every mutation (the old root, and every
//! page on the path to it, are left untouched for any reader still on an
//! earlier snapshot — see [`crate::pager::Pager::copy`] and the free-list
//! gating in [`crate::freelist`]).
//!
//! Rebalancing on delete is merge-only: an underfull node is folded into a
//! sibling when the combined size fits a page, and left underfull otherwise.
//! There is no key redistribution between siblings; this mirrors the
//! original storage layer's `attempt_merge`, generalized from a flat record
//! list to a tree of pages.
//!
//! [`Cursor`] is the read-side counterpart: an in-order walk over a
//! snapshot that never touches the pager's dirty cache, so it is safe to
//! hold across a whole read-only transaction.
//!
//! # See Also
//! - [`crate::node`]: the page codec this module drives.
//! - [`crate::bucket`]: the per-bucket API built on top of this.

use crate::error::Error;
use crate::node::{Entry, Node, Value};
use crate::page::{NULL_PAGE, PageId};
use crate::pager::Pager;

pub struct BTree<'p> {
    pager: &'p mut Pager,
    txid: u64,
    min_live_reader_txid: u64,
    page_size: usize,
}

type Split = Option<(Vec<u8>, PageId)>;

impl<'p> BTree<'p> {
    pub fn new(pager: &'p mut Pager, txid: u64, min_live_reader_txid: u64, page_size: usize) -> Self {
        Self { pager, txid, min_live_reader_txid, page_size }
    }

    pub fn get(&self, root: PageId, key: &[u8]) -> Result<Option<Entry>, Error> {
        lookup(self.pager, root, key)
    }

    /// Inserts or overwrites `entry`, returning the new root page id.
    pub fn put(&mut self, root: PageId, entry: Entry) -> Result<PageId, Error> {
        let (new_root, split) = self.put_recursive(root, entry)?;
        match split {
            None => Ok(new_root),
            Some((sep_key, right_id)) => {
                let mut root_node = Node::new_branch(self.txid, right_id);
                root_node.insert(Entry { key: sep_key, value: Value::Child(new_root) })?;
                let buf = root_node.encode(self.page_size)?;
                let root_id = self.pager.alloc(1, self.min_live_reader_txid);
                self.pager.write_page(root_id, buf)?;
                Ok(root_id)
            }
        }
    }

    fn put_recursive(&mut self, node_id: PageId, entry: Entry) -> Result<(PageId, Split), Error> {
        let buf = self.pager.read_page(node_id)?;
        let mut node = Node::decode(&buf)?;

        if node.is_leaf() {
            node.upsert(entry);
            return self.finish_node(node, node_id);
        }

        let search_key = entry.key.clone();
        let child_id = node.child_for(&search_key);
        let (new_child_id, split) = self.put_recursive(child_id, entry)?;
        Self::route_child_update(&mut node, &search_key, new_child_id, split)?;
        self.finish_node(node, node_id)
    }

    /// Removes `key`, returning the new root page id and the removed entry.
    pub fn delete(&mut self, root: PageId, key: &[u8]) -> Result<(PageId, Entry), Error> {
        let (mut new_root, removed) = self.delete_recursive(root, key)?;

        // Collapse pass-through branch roots left with no entries.
        loop {
            let buf = self.pager.read_page(new_root)?;
            let node = Node::decode(&buf)?;
            if node.is_leaf() || !node.is_empty() {
                break;
            }
            let child = node.tail_child;
            self.pager.free(new_root, 1, self.txid);
            new_root = child;
        }
        Ok((new_root, removed))
    }

    fn delete_recursive(&mut self, node_id: PageId, key: &[u8]) -> Result<(PageId, Entry), Error> {
        let buf = self.pager.read_page(node_id)?;
        let mut node = Node::decode(&buf)?;

        if node.is_leaf() {
            let removed = node.remove(key)?;
            let (new_id, _) = self.finish_node(node, node_id)?;
            return Ok((new_id, removed));
        }

        let pos = node.entries().partition_point(|e| e.key.as_slice() <= key);
        let child_id = Self::child_at(&node, pos);
        let (new_child_id, removed) = self.delete_recursive(child_id, key)?;

        match node.entries().get(pos).map(|e| e.key.clone()) {
            Some(k) => node.upsert(Entry { key: k, value: Value::Child(new_child_id) }),
            None => node.tail_child = new_child_id,
        }

        let child_buf = self.pager.read_page(new_child_id)?;
        let child_node = Node::decode(&child_buf)?;
        if Self::is_underfull(&child_node, self.page_size) {
            self.try_merge(&mut node, pos)?;
        }

        let (new_id, _) = self.finish_node(node, node_id)?;
        Ok((new_id, removed))
    }

    fn is_underfull(node: &Node, page_size: usize) -> bool {
        node.encoded_size() < page_size / 4
    }

    fn child_at(branch: &Node, idx: usize) -> PageId {
        match branch.entries().get(idx) {
            Some(e) => match &e.value {
                Value::Child(c) => *c,
                _ => unreachable!("branch entries always carry Value::Child"),
            },
            None => branch.tail_child,
        }
    }

    /// Merges the child at `pos` with a neighbor when doing so keeps the
    /// merged node under a page. Prefers the right neighbor.
    fn try_merge(&mut self, node: &mut Node, pos: usize) -> Result<(), Error> {
        let len = node.entries().len();
        if pos < len {
            let left_id = Self::child_at(node, pos);
            let right_id = Self::child_at(node, pos + 1);
            self.merge_children(node, pos, left_id, right_id)?;
        } else if pos > 0 {
            let left_id = Self::child_at(node, pos - 1);
            let right_id = Self::child_at(node, pos);
            self.merge_children(node, pos - 1, left_id, right_id)?;
        }
        Ok(())
    }

    /// Merges `left_id`/`right_id`, two children separated by
    /// `node.entries()[consumed_pos]`, and rewires `node` to point at the
    /// merged page. Leaves both children intact if the merge would not fit
    /// in a single page.
    fn merge_children(
        &mut self,
        node: &mut Node,
        consumed_pos: usize,
        left_id: PageId,
        right_id: PageId,
    ) -> Result<(), Error> {
        let consumed_key = node.entries()[consumed_pos].key.clone();
        let right_slot_key = node.entries().get(consumed_pos + 1).map(|e| e.key.clone());

        let left_buf = self.pager.read_page(left_id)?;
        let right_buf = self.pager.read_page(right_id)?;
        let mut left = Node::decode(&left_buf)?;
        let right = Node::decode(&right_buf)?;
        left.last_modified_txid = self.txid;

        let separator = if left.is_leaf() {
            None
        } else {
            Some(Entry { key: consumed_key.clone(), value: Value::Child(NULL_PAGE) })
        };
        left.merge(right, separator);

        if left.encoded_size() > self.page_size {
            // Leave both children as-is; still underfull, but correct.
            return Ok(());
        }

        let merged_id = self.pager.alloc(1, self.min_live_reader_txid);
        self.pager.write_page(merged_id, left.encode(self.page_size)?)?;
        self.pager.free(left_id, 1, self.txid);
        self.pager.free(right_id, 1, self.txid);

        node.remove(&consumed_key)?;
        match right_slot_key {
            Some(k) => node.upsert(Entry { key: k, value: Value::Child(merged_id) }),
            None => node.tail_child = merged_id,
        }
        Ok(())
    }

    /// Rewires the child pointer a recursive call just returned through,
    /// inserting a new separator entry if the child split.
    fn route_child_update(node: &mut Node, search_key: &[u8], new_child_id: PageId, split: Split) -> Result<(), Error> {
        let slot = node.entries().partition_point(|e| e.key.as_slice() <= search_key);
        let existing_key = node.entries().get(slot).map(|e| e.key.clone());

        if let Some((sep_key, right_id)) = split {
            node.insert(Entry { key: sep_key, value: Value::Child(new_child_id) })?;
            match existing_key {
                Some(k) => node.upsert(Entry { key: k, value: Value::Child(right_id) }),
                None => node.tail_child = right_id,
            }
        } else {
            match existing_key {
                Some(k) => node.upsert(Entry { key: k, value: Value::Child(new_child_id) }),
                None => node.tail_child = new_child_id,
            }
        }
        Ok(())
    }

    /// Stamps `node` with this transaction's txid, writes it to a freshly
    /// allocated page (splitting first if it no longer fits), and frees
    /// `old_id`. Every touched node gets a new id: simpler than tracking
    /// which pages this same transaction already owns, at the cost of
    /// churning a few extra free-list entries per multi-level mutation.
    fn finish_node(&mut self, mut node: Node, old_id: PageId) -> Result<(PageId, Split), Error> {
        node.last_modified_txid = self.txid;

        if node.encoded_size() <= self.page_size {
            let buf = node.encode(self.page_size)?;
            let new_id = self.pager.alloc(1, self.min_live_reader_txid);
            self.pager.write_page(new_id, buf)?;
            if old_id != NULL_PAGE {
                self.pager.free(old_id, 1, self.txid);
            }
            return Ok((new_id, None));
        }

        let (sep, mut right) = node.split_off();
        right.last_modified_txid = self.txid;
        let left_buf = node.encode(self.page_size)?;
        let right_buf = right.encode(self.page_size)?;

        let left_id = self.pager.alloc(1, self.min_live_reader_txid);
        let right_id = self.pager.alloc(1, self.min_live_reader_txid);
        self.pager.write_page(left_id, left_buf)?;
        self.pager.write_page(right_id, right_buf)?;
        if old_id != NULL_PAGE {
            self.pager.free(old_id, 1, self.txid);
        }
        Ok((left_id, Some((sep.key, right_id))))
    }
}

/// Point lookup through a writer's own dirty cache plus the mmap'd view;
/// used by [`BTree::get`] and anywhere a writer reads back its own
/// in-progress mutations mid-transaction.
pub fn lookup(pager: &Pager, root: PageId, key: &[u8]) -> Result<Option<Entry>, Error> {
    let mut id = root;
    loop {
        let buf = pager.read_page(id)?;
        let node = Node::decode(&buf)?;
        if node.is_leaf() {
            return Ok(node.get(key).cloned());
        }
        id = node.child_for(key);
    }
}

/// Point lookup through the committed mmap'd view only, bypassing any
/// writer's dirty cache. Used by read-only transactions so a concurrent
/// writer's uncommitted pages never become visible to a snapshot.
pub fn lookup_snapshot(pager: &Pager, root: PageId, key: &[u8]) -> Result<Option<Entry>, Error> {
    let mut id = root;
    loop {
        let buf = pager.read_through_mmap(id)?;
        let node = Node::decode(&buf)?;
        if node.is_leaf() {
            return Ok(node.get(key).cloned());
        }
        id = node.child_for(key);
    }
}

/// An in-order walk over a tree snapshot, independent of any write
/// transaction's dirty cache.
pub struct Cursor<'p> {
    pager: &'p Pager,
    path: Vec<(Node, usize)>,
}

impl<'p> Cursor<'p> {
    /// Positions at the first entry `>= key` (or exhausted, if none).
    pub fn seek(pager: &'p Pager, root: PageId, key: &[u8]) -> Result<Self, Error> {
        let mut cursor = Self { pager, path: Vec::new() };
        let mut id = root;
        loop {
            let buf = pager.read_through_mmap(id)?;
            let node = Node::decode(&buf)?;
            if node.is_leaf() {
                let idx = node.lower_bound(key);
                cursor.path.push((node, idx));
                break;
            }
            let idx = node.entries().partition_point(|e| e.key.as_slice() <= key);
            let child = Self::child_at(&node, idx);
            cursor.path.push((node, idx));
            id = child;
        }
        Ok(cursor)
    }

    pub fn first(pager: &'p Pager, root: PageId) -> Result<Self, Error> {
        let mut cursor = Self { pager, path: Vec::new() };
        cursor.descend_leftmost(root)?;
        Ok(cursor)
    }

    pub fn current(&self) -> Option<&Entry> {
        let (leaf, idx) = self.path.last()?;
        leaf.entries().get(*idx)
    }

    /// Advances to the next entry in key order.
    pub fn advance(&mut self) -> Result<(), Error> {
        if let Some((leaf, idx)) = self.path.last_mut() {
            *idx += 1;
            if *idx < leaf.len() {
                return Ok(());
            }
        }
        self.path.pop();

        while let Some((branch, idx)) = self.path.last_mut() {
            *idx += 1;
            let total_children = branch.len() + 1;
            if *idx < total_children {
                let child_id = Self::child_at(branch, *idx);
                self.descend_leftmost(child_id)?;
                return Ok(());
            }
            self.path.pop();
        }
        Ok(())
    }

    fn child_at(branch: &Node, idx: usize) -> PageId {
        match branch.entries().get(idx) {
            Some(e) => match &e.value {
                Value::Child(c) => *c,
                _ => unreachable!("branch entries always carry Value::Child"),
            },
            None => branch.tail_child,
        }
    }

    fn descend_leftmost(&mut self, mut id: PageId) -> Result<(), Error> {
        loop {
            let buf = self.pager.read_through_mmap(id)?;
            let node = Node::decode(&buf)?;
            if node.is_leaf() {
                self.path.push((node, 0));
                return Ok(());
            }
            let child = Self::child_at(&node, 0);
            self.path.push((node, 0));
            id = child;
        }
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;
    use crate::pager::Pager;

    fn leaf_entry(key: &[u8], value: &[u8]) -> Entry {
        Entry { key: key.to_vec(), value: Value::Inline { bytes: value.to_vec(), is_bucket: false } }
    }

    fn new_pager(page_size: usize) -> (TempDir, Pager) {
        let temp = TempDir::new("btree").unwrap();
        let pager = Pager::open(&temp.path().join("db"), page_size, 64).unwrap();
        (temp, pager)
    }

    #[test]
    fn insert_and_get_roundtrip() {
        let (_temp, mut pager) = new_pager(256);
        let mut root = {
            let node = Node::new_leaf(1);
            let buf = node.encode(256).unwrap();
            let id = pager.alloc(1, 0);
            pager.write_page(id, buf).unwrap();
            id
        };

        let mut tree = BTree::new(&mut pager, 1, 0, 256);
        root = tree.put(root, leaf_entry(b"a", b"1")).unwrap();
        root = tree.put(root, leaf_entry(b"b", b"2")).unwrap();

        assert_eq!(tree.get(root, b"a").unwrap(), Some(leaf_entry(b"a", b"1")));
        assert_eq!(tree.get(root, b"b").unwrap(), Some(leaf_entry(b"b", b"2")));
        assert_eq!(tree.get(root, b"missing").unwrap(), None);
    }

    #[test]
    fn many_inserts_force_splits_and_stay_readable() {
        let (_temp, mut pager) = new_pager(256);
        let mut root = {
            let node = Node::new_leaf(1);
            let buf = node.encode(256).unwrap();
            let id = pager.alloc(1, 0);
            pager.write_page(id, buf).unwrap();
            id
        };

        let mut tree = BTree::new(&mut pager, 1, 0, 256);
        for i in 0..200u32 {
            let key = format!("key-{i:04}").into_bytes();
            root = tree.put(root, leaf_entry(&key, b"v")).unwrap();
        }
        for i in 0..200u32 {
            let key = format!("key-{i:04}").into_bytes();
            assert!(tree.get(root, &key).unwrap().is_some(), "missing {i}");
        }
    }

    #[test]
    fn delete_removes_key_and_shrinks_tree() {
        let (_temp, mut pager) = new_pager(256);
        let mut root = {
            let node = Node::new_leaf(1);
            let buf = node.encode(256).unwrap();
            let id = pager.alloc(1, 0);
            pager.write_page(id, buf).unwrap();
            id
        };

        let mut tree = BTree::new(&mut pager, 1, 0, 256);
        let keys: Vec<Vec<u8>> = (0..100u32).map(|i| format!("k{i:04}").into_bytes()).collect();
        for key in &keys {
            root = tree.put(root, leaf_entry(key, b"v")).unwrap();
        }
        for key in &keys {
            let (new_root, removed) = tree.delete(root, key).unwrap();
            root = new_root;
            assert_eq!(removed.key, *key);
        }
        for key in &keys {
            assert_eq!(tree.get(root, key).unwrap(), None);
        }
    }

    #[test]
    fn cursor_walks_in_order() {
        let (_temp, mut pager) = new_pager(256);
        let mut root = {
            let node = Node::new_leaf(1);
            let buf = node.encode(256).unwrap();
            let id = pager.alloc(1, 0);
            pager.write_page(id, buf).unwrap();
            id
        };
        {
            let mut tree = BTree::new(&mut pager, 1, 0, 256);
            for key in [b"c".to_vec(), b"a".to_vec(), b"b".to_vec()] {
                root = tree.put(root, leaf_entry(&key, b"v")).unwrap();
            }
        }
        pager.flush().unwrap();

        let mut cursor = Cursor::first(&pager, root).unwrap();
        let mut seen = Vec::new();
        while let Some(entry) = cursor.current() {
            seen.push(entry.key.clone());
            cursor.advance().unwrap();
        }
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }
}
