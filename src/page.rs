//! Page identifiers and the on-disk overflow chain format.
//!
//! Everything in the store is addressed in units of a fixed-size `Page`.
//! This module only defines the identifier type and the overflow-chain
//! encoding; the interpretation of a page's contents as a B+tree node
//! lives in [`crate::node`], and the meta page layout lives in
//! [`crate::meta`].

/// Index of a page within the database file.
///
/// `PageId(0xFFFFFFFF)` is the null sentinel: it never names a real page.
pub type PageId = u32;

/// The null page id. Used as "no child"/"no next page" in on-disk pointers.
pub const NULL_PAGE: PageId = 0xFFFF_FFFF;

/// Default page size in bytes. Must be a power of two in `[256, 32768]`.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Header of an overflow page: the next page in the chain, or [`NULL_PAGE`]
/// if this is the last page.
pub const OVERFLOW_NEXT_SIZE: usize = size_of::<u32>();

/// Splits an oversized key/value payload into a chain of overflow pages.
///
/// Each page holds `page_size - OVERFLOW_NEXT_SIZE` bytes of payload,
/// prefixed by the little-endian `PageId` of the next page in the chain
/// (`NULL_PAGE` terminates it). Returns the encoded bytes for each page in
/// chain order; the caller is responsible for allocating page ids and
/// writing them through the pager.
pub fn chunk_overflow_payload(payload: &[u8], page_size: usize) -> Vec<Vec<u8>> {
    let capacity = page_size - OVERFLOW_NEXT_SIZE;
    if payload.is_empty() {
        return vec![vec![0u8; page_size]];
    }
    payload
        .chunks(capacity)
        .map(|chunk| {
            let mut buf = vec![0u8; page_size];
            buf[OVERFLOW_NEXT_SIZE..OVERFLOW_NEXT_SIZE + chunk.len()].copy_from_slice(chunk);
            buf
        })
        .collect()
}

/// Reads the `next` pointer out of a raw overflow page buffer.
pub fn overflow_next(buf: &[u8]) -> PageId {
    u32::from_le_bytes(buf[0..OVERFLOW_NEXT_SIZE].try_into().expect("4 bytes"))
}

/// Writes the `next` pointer into a raw overflow page buffer.
pub fn set_overflow_next(buf: &mut [u8], next: PageId) {
    buf[0..OVERFLOW_NEXT_SIZE].copy_from_slice(&next.to_le_bytes());
}

/// Payload bytes carried by a single overflow page (everything after the
/// `next` pointer, trimmed to `len` bytes of real data by the caller).
pub fn overflow_payload(buf: &[u8]) -> &[u8] {
    &buf[OVERFLOW_NEXT_SIZE..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_single_page() {
        let payload = vec![1u8; 10];
        let pages = chunk_overflow_payload(&payload, 4096);
        assert_eq!(pages.len(), 1);
        assert_eq!(&pages[0][OVERFLOW_NEXT_SIZE..OVERFLOW_NEXT_SIZE + 10], &payload[..]);
    }

    #[test]
    fn chunk_multiple_pages() {
        let payload = vec![7u8; 9000];
        let pages = chunk_overflow_payload(&payload, 4096);
        assert_eq!(pages.len(), 3);
    }

    #[test]
    fn overflow_next_roundtrip() {
        let mut buf = vec![0u8; 4096];
        set_overflow_next(&mut buf, 42);
        assert_eq!(overflow_next(&buf), 42);
    }
}
