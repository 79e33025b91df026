//! The meta page: byte-exact layout of page 0 and page 1.
//!
//! Two copies of [`Meta`] live at fixed page ids 0 and 1. Every committed
//! writer alternates which slot it rewrites (`txid mod 2`), so there is
//! always one slot holding the previous consistent version while the other
//! is being replaced. On open, both are decoded and validated; the one
//! with a valid CRC32 and the larger `txid` is the active meta.
//!
//! # See Also
//! - [`crate::recovery`]: picks the active meta and replays the WAL tail.
//! - [`crate::pager`]: persists `Meta` as part of commit.

use crate::error::MetaError;
use crate::page::{NULL_PAGE, PageId};

pub const META_MAGIC: u32 = 0x4C4F_414D; // "LOAM"
pub const MIN_VERSION: u32 = 1;

const SIGN: usize = 0;
const SIGN_SIZE: usize = size_of::<u32>();
const PAGE_SIZE_OFF: usize = SIGN + SIGN_SIZE;
const PAGE_SIZE_SIZE: usize = size_of::<u16>();
const MIN_VERSION_OFF: usize = PAGE_SIZE_OFF + PAGE_SIZE_SIZE;
const MIN_VERSION_SIZE: usize = size_of::<u32>();
const PAGE_COUNT_OFF: usize = MIN_VERSION_OFF + MIN_VERSION_SIZE;
const PAGE_COUNT_SIZE: usize = size_of::<u32>();
const USER_ROOT_OFF: usize = PAGE_COUNT_OFF + PAGE_COUNT_SIZE;
const USER_ROOT_SIZE: usize = size_of::<u32>();
const FREE_LIST_PGID_OFF: usize = USER_ROOT_OFF + USER_ROOT_SIZE;
const FREE_LIST_PGID_SIZE: usize = size_of::<u32>();
const FREE_PAIR_COUNT_OFF: usize = FREE_LIST_PGID_OFF + FREE_LIST_PGID_SIZE;
const FREE_PAIR_COUNT_SIZE: usize = size_of::<u32>();
const FREE_LIST_PAGE_COUNT_OFF: usize = FREE_PAIR_COUNT_OFF + FREE_PAIR_COUNT_SIZE;
const FREE_LIST_PAGE_COUNT_SIZE: usize = size_of::<u32>();
const TXID_OFF: usize = FREE_LIST_PAGE_COUNT_OFF + FREE_LIST_PAGE_COUNT_SIZE;
const TXID_SIZE: usize = size_of::<u64>();
const CRC_OFF: usize = TXID_OFF + TXID_SIZE;
const CRC_SIZE: usize = size_of::<u32>();

/// Total encoded size of a [`Meta`] record, including its trailing CRC32.
pub const META_ENCODED_SIZE: usize = CRC_OFF + CRC_SIZE;

/// The two fixed page ids reserved for meta copies.
pub const META_PAGE_IDS: [PageId; 2] = [0, 1];

/// Decoded contents of a meta page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meta {
    pub page_size: u16,
    pub min_version: u32,
    pub page_count: u32,
    pub user_root: PageId,
    pub free_list_pgid: PageId,
    pub free_pair_count: u32,
    pub free_list_page_count: u32,
    pub txid: u64,
}

impl Meta {
    /// A fresh meta for a brand-new database file: two meta pages already
    /// reserved (ids 0/1), an empty user root leaf at page 2, an empty
    /// free-list leaf at page 3.
    pub fn initial(page_size: u16) -> Self {
        Self {
            page_size,
            min_version: MIN_VERSION,
            page_count: 4,
            user_root: 2,
            free_list_pgid: 3,
            free_pair_count: 0,
            free_list_page_count: 1,
            txid: 0,
        }
    }

    /// Encodes the meta into a page-sized buffer with a trailing CRC32.
    pub fn encode(&self, page_size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; page_size];
        buf[SIGN..SIGN + SIGN_SIZE].copy_from_slice(&META_MAGIC.to_le_bytes());
        buf[PAGE_SIZE_OFF..PAGE_SIZE_OFF + PAGE_SIZE_SIZE].copy_from_slice(&self.page_size.to_le_bytes());
        buf[MIN_VERSION_OFF..MIN_VERSION_OFF + MIN_VERSION_SIZE]
            .copy_from_slice(&self.min_version.to_le_bytes());
        buf[PAGE_COUNT_OFF..PAGE_COUNT_OFF + PAGE_COUNT_SIZE]
            .copy_from_slice(&self.page_count.to_le_bytes());
        buf[USER_ROOT_OFF..USER_ROOT_OFF + USER_ROOT_SIZE].copy_from_slice(&self.user_root.to_le_bytes());
        buf[FREE_LIST_PGID_OFF..FREE_LIST_PGID_OFF + FREE_LIST_PGID_SIZE]
            .copy_from_slice(&self.free_list_pgid.to_le_bytes());
        buf[FREE_PAIR_COUNT_OFF..FREE_PAIR_COUNT_OFF + FREE_PAIR_COUNT_SIZE]
            .copy_from_slice(&self.free_pair_count.to_le_bytes());
        buf[FREE_LIST_PAGE_COUNT_OFF..FREE_LIST_PAGE_COUNT_OFF + FREE_LIST_PAGE_COUNT_SIZE]
            .copy_from_slice(&self.free_list_page_count.to_le_bytes());
        buf[TXID_OFF..TXID_OFF + TXID_SIZE].copy_from_slice(&self.txid.to_le_bytes());

        let crc = crc32fast::hash(&buf[..CRC_OFF]);
        buf[CRC_OFF..CRC_OFF + CRC_SIZE].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes and validates a meta page; returns [`MetaError`] on bad
    /// signature or checksum so the caller can fall back to the other slot.
    pub fn decode(buf: &[u8]) -> Result<Self, MetaError> {
        if buf.len() < META_ENCODED_SIZE {
            return Err(MetaError::BadSignature);
        }
        let sign = u32::from_le_bytes(buf[SIGN..SIGN + SIGN_SIZE].try_into().unwrap());
        if sign != META_MAGIC {
            return Err(MetaError::BadSignature);
        }

        let crc_stored =
            u32::from_le_bytes(buf[CRC_OFF..CRC_OFF + CRC_SIZE].try_into().unwrap());
        let crc_actual = crc32fast::hash(&buf[..CRC_OFF]);
        if crc_stored != crc_actual {
            return Err(MetaError::BadChecksum);
        }

        Ok(Self {
            page_size: u16::from_le_bytes(
                buf[PAGE_SIZE_OFF..PAGE_SIZE_OFF + PAGE_SIZE_SIZE].try_into().unwrap(),
            ),
            min_version: u32::from_le_bytes(
                buf[MIN_VERSION_OFF..MIN_VERSION_OFF + MIN_VERSION_SIZE].try_into().unwrap(),
            ),
            page_count: u32::from_le_bytes(
                buf[PAGE_COUNT_OFF..PAGE_COUNT_OFF + PAGE_COUNT_SIZE].try_into().unwrap(),
            ),
            user_root: u32::from_le_bytes(
                buf[USER_ROOT_OFF..USER_ROOT_OFF + USER_ROOT_SIZE].try_into().unwrap(),
            ),
            free_list_pgid: u32::from_le_bytes(
                buf[FREE_LIST_PGID_OFF..FREE_LIST_PGID_OFF + FREE_LIST_PGID_SIZE]
                    .try_into()
                    .unwrap(),
            ),
            free_pair_count: u32::from_le_bytes(
                buf[FREE_PAIR_COUNT_OFF..FREE_PAIR_COUNT_OFF + FREE_PAIR_COUNT_SIZE]
                    .try_into()
                    .unwrap(),
            ),
            free_list_page_count: u32::from_le_bytes(
                buf[FREE_LIST_PAGE_COUNT_OFF..FREE_LIST_PAGE_COUNT_OFF + FREE_LIST_PAGE_COUNT_SIZE]
                    .try_into()
                    .unwrap(),
            ),
            txid: u64::from_le_bytes(buf[TXID_OFF..TXID_OFF + TXID_SIZE].try_into().unwrap()),
        })
    }

    /// `true` if `user_root` names no tree at all (should never happen post-init).
    pub fn has_user_root(&self) -> bool {
        self.user_root != NULL_PAGE
    }

    /// Which of the two meta page slots this meta's *next* commit should
    /// land in, per `txid mod 2`.
    pub fn next_slot(&self) -> PageId {
        META_PAGE_IDS[((self.txid + 1) % 2) as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let meta = Meta::initial(4096);
        let buf = meta.encode(4096);
        let decoded = Meta::decode(&buf).unwrap();
        assert_eq!(meta, decoded);
    }

    #[test]
    fn rejects_corrupt_checksum() {
        let meta = Meta::initial(4096);
        let mut buf = meta.encode(4096);
        buf[10] ^= 0xFF;
        assert!(Meta::decode(&buf).is_err());
    }

    #[test]
    fn rejects_bad_signature() {
        let buf = vec![0u8; 4096];
        assert!(matches!(Meta::decode(&buf), Err(MetaError::BadSignature)));
    }

    #[test]
    fn next_slot_alternates() {
        let mut meta = Meta::initial(4096);
        meta.txid = 4;
        assert_eq!(meta.next_slot(), META_PAGE_IDS[1]);
        meta.txid = 5;
        assert_eq!(meta.next_slot(), META_PAGE_IDS[0]);
    }
}
