mod bucket;
mod btree;
mod cache;
mod error;
mod freelist;
mod meta;
mod node;
mod page;
mod pager;
mod recovery;
mod tx;
mod wal;

pub mod db;

pub use bucket::{BucketIter, UpdateBucket, ViewBucket};
pub use db::{Comparator, Db, Options};
pub use error::{Error, MetaError, NodeError, PagerError, WalError};
pub use page::{DEFAULT_PAGE_SIZE, PageId};
pub use tx::{UpdateTx, ViewTx};
