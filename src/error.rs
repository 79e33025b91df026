//! Error taxonomy for the storage engine.
//!
//! Errors are grouped by the subsystem that raised them, the same way the
//! pre-transformation storage layer split `PageError`/`PagerError` out of a
//! top-level `StorageError`. Each subsystem enum carries just enough detail
//! to explain *why* an operation failed; the top-level [`Error`] is what
//! crosses the public API boundary.

use std::io;

use thiserror::Error;

/// Errors returned by any public operation on a [`Db`](crate::db::Db),
/// transaction, or bucket.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("pager error: {cause}")]
    Pager { cause: PagerError },

    #[error("meta error: {cause}")]
    Meta { cause: MetaError },

    #[error("wal error: {cause}")]
    Wal { cause: WalError },

    #[error("node error: {cause}")]
    Node { cause: NodeError },

    #[error("key of {0} bytes exceeds the maximum inline key size (0x7FFF)")]
    KeyTooLarge(usize),

    #[error("value of {0} bytes exceeds the maximum value size (0xFFFFFFFF)")]
    ValueTooLarge(usize),

    #[error("bucket already exists")]
    AlreadyExists,

    #[error("sub-bucket {0:?} conflicts with an existing non-bucket key")]
    BucketConflict(Vec<u8>),

    #[error("mutation attempted on a read-only transaction")]
    TxReadOnly,

    #[error("transaction already committed or rolled back")]
    TxClosed,
}

#[derive(Debug, Error)]
pub enum PagerError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("page {0} checksum mismatch")]
    Corrupt(u32),
    #[error("page {0} is out of bounds")]
    OutOfBounds(u32),
    #[error("attempted to free an already-free page {0}")]
    DoubleFree(u32),
}

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("meta signature mismatch")]
    BadSignature,
    #[error("meta crc32 mismatch")]
    BadChecksum,
    #[error("both meta pages are invalid")]
    BothCorrupt,
}

#[derive(Debug, Error)]
pub enum WalError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("record checksum mismatch, log truncated at this point")]
    Truncated,
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node is full")]
    Full,
    #[error("key not found in node")]
    MissingKey,
    #[error("duplicate key inserted into node")]
    Duplicate,
    #[error("page does not decode to a valid node: {0}")]
    Malformed(&'static str),
}

impl From<PagerError> for Error {
    fn from(cause: PagerError) -> Self {
        Error::Pager { cause }
    }
}

impl From<MetaError> for Error {
    fn from(cause: MetaError) -> Self {
        Error::Meta { cause }
    }
}

impl From<WalError> for Error {
    fn from(cause: WalError) -> Self {
        Error::Wal { cause }
    }
}

impl From<NodeError> for Error {
    fn from(cause: NodeError) -> Self {
        Error::Node { cause }
    }
}
