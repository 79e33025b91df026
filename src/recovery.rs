//! Crash recovery: pick the valid meta page, replay any WAL transactions
//! it doesn't yet reflect, and leave the database consistent again.
//!
//! The commit protocol ([`crate::db::Db::update`]) appends a WAL `Commit`
//! record and fsyncs the log *before* flushing the new meta page, so a
//! crash can only ever leave the log ahead of the meta, never behind it.
//! Recovery replays every fully-logged (`Begin` ... `Commit`) transaction
//! newer than the active meta's `txid`; a transaction left dangling
//! without a matching `Commit` is simply dropped, same as an explicit
//! rollback.
//!
//! # See Also
//! - [`crate::wal`]: the log format being replayed.
//! - [`crate::tx`]: `UpdateTx`/`UpdateBucket` drive the actual replay.

use std::path::Path;

use log::{info, warn};

use crate::bucket::ROOT_BUCKET_ID;
use crate::error::{Error, MetaError};
use crate::freelist::FreeList;
use crate::meta::{META_PAGE_IDS, Meta};
use crate::pager::Pager;
use crate::tx::UpdateTx;
use crate::wal::{LogicalRecord, WalReader, WalWriter};

/// Reads both meta page slots and returns whichever is valid with the
/// higher `txid`. Errors only if both are corrupt.
pub fn load_active_meta(pager: &Pager) -> Result<Meta, Error> {
    let candidates: Vec<Meta> = META_PAGE_IDS
        .iter()
        .filter_map(|&id| pager.read_through_mmap(id).ok())
        .filter_map(|buf| Meta::decode(&buf).ok())
        .collect();

    candidates
        .into_iter()
        .max_by_key(|m| m.txid)
        .ok_or_else(|| Error::Meta { cause: MetaError::BothCorrupt })
}

/// Loads the free-list chain named by `meta.free_list_pgid` into `pager`.
pub fn load_freelist(pager: &mut Pager, meta: &Meta) -> Result<(), Error> {
    let mut pages = Vec::with_capacity(meta.free_list_page_count as usize);
    let mut id = meta.free_list_pgid;
    for _ in 0..meta.free_list_page_count {
        let buf = pager.read_through_mmap(id)?;
        id = FreeList::chain_next(&buf);
        pages.push(buf);
    }
    pager.freelist = FreeList::decode_pages(&pages).map_err(|cause| Error::Wal { cause })?;
    Ok(())
}

/// Replays every WAL transaction newer than `meta.txid`, applying its
/// operations directly through [`UpdateTx`]/[`crate::bucket::UpdateBucket`]
/// so replay exercises the same code path as a live write. Returns the
/// meta reflecting the replayed state (unchanged if there was nothing to
/// replay).
pub fn replay(pager: &mut Pager, wal_path: &Path, wal: &mut WalWriter, mut meta: Meta) -> Result<Meta, Error> {
    if !wal_path.exists() {
        return Ok(meta);
    }

    let mut reader = WalReader::open(wal_path)?;
    let mut records = Vec::new();
    loop {
        match reader.next_record() {
            Ok(Some(r)) => records.push(r),
            Ok(None) => break,
            Err(e) => {
                warn!("wal tail truncated during recovery scan: {e}");
                break;
            }
        }
    }
    drop(reader);

    let mut i = 0;
    while i < records.len() {
        let txid = match &records[i] {
            LogicalRecord::Begin { txid } => *txid,
            _ => {
                i += 1;
                continue;
            }
        };
        if txid <= meta.txid {
            i += 1;
            continue;
        }

        // Collect this transaction's ops up to its Commit; if the log ends
        // (or hits a Rollback) first, the transaction never completed.
        let mut ops = Vec::new();
        let mut j = i + 1;
        let mut committed = false;
        while j < records.len() {
            match &records[j] {
                LogicalRecord::Commit => {
                    committed = true;
                    j += 1;
                    break;
                }
                LogicalRecord::Rollback => {
                    j += 1;
                    break;
                }
                LogicalRecord::Begin { .. } => break,
                op => ops.push(op.clone()),
            }
            j += 1;
        }

        if committed {
            info!("replaying transaction {txid} ({} ops)", ops.len());
            meta = replay_transaction(pager, wal, txid, meta, &ops)?;
        } else {
            warn!("dropping incomplete transaction {txid} ({} ops) found during recovery", ops.len());
        }
        i = j;
    }

    Ok(meta)
}

fn replay_transaction(
    pager: &mut Pager,
    wal: &mut WalWriter,
    txid: u64,
    meta: Meta,
    ops: &[LogicalRecord],
) -> Result<Meta, Error> {
    let mut tx = UpdateTx::begin(pager, wal, txid, 0, meta.page_size as usize, meta.user_root)?;

    for op in ops {
        match op {
            LogicalRecord::SubBucket { bucket_id, key } => {
                tx.bucket_by_id(*bucket_id).sub_bucket(key)?;
            }
            LogicalRecord::PutNotBucket { bucket_id, key, value } => {
                tx.bucket_by_id(*bucket_id).put(key.clone(), value.clone())?;
            }
            LogicalRecord::PutIsBucket { .. } => {
                unreachable!("no code path logs PutIsBucket; sub-bucket creation uses SubBucket")
            }
            LogicalRecord::Delete { bucket_id, key } => {
                // A Delete record covers both "remove a data key" and "drop
                // a sub-bucket"; the tree itself (not the log) says which.
                match tx.bucket_by_id(*bucket_id).delete_sub_bucket(key) {
                    Ok(_) => {}
                    Err(Error::BucketConflict(_)) => {
                        tx.bucket_by_id(*bucket_id).delete(key)?;
                    }
                    Err(e) => return Err(e),
                }
            }
            LogicalRecord::Begin { .. } | LogicalRecord::Commit | LogicalRecord::Rollback | LogicalRecord::Persisted { .. } => {
                unreachable!("control records are consumed by the caller's scan, not replayed")
            }
        }
    }

    tx.commit()?;
    let mut meta = meta;
    meta.txid = txid;
    meta.user_root = tx.final_user_root();
    Ok(meta)
}
