//! Summary: cachex, a string key-value cache on an embedded B+ tree file.
//! Copyright (c) YOAB. All rights reserved.
//!
//! The storage engine keeps one file of fixed-size pages organized as
//! copy-on-write B+ trees, one per bucket. Any number of read transactions
//! see stable snapshots while a single write transaction prepares the next
//! state; a commit becomes visible, and durable, only once its meta page is
//! written. The `Cache` trait and `BucketCache` sit on top for callers that
//! only need string get/set/search.
//!
//! # Example
//!
//! ```no_run
//! use cachex::{BucketCache, Cache};
//!
//! let cache = BucketCache::open("cache.db", "sessions")?;
//! cache.set("user:1", "ann")?;
//! assert_eq!(cache.get("user:1")?, "ann");
//! for (key, value) in cache.search("user:")? {
//!     println!("{key} = {value}");
//! }
//! # Ok::<(), cachex::Error>(())
//! ```
//!
//! Working with the engine directly:
//!
//! ```no_run
//! use cachex::Database;
//!
//! let db = Database::open("data.db")?;
//! db.update(|tx| {
//!     let mut bucket = tx.create_bucket_if_not_exists(b"numbers")?;
//!     bucket.put(b"one", b"1")?;
//!     bucket.put(b"two", b"2")
//! })?;
//! let value = db.view(|tx| tx.bucket(b"numbers")?.get(b"two"))?;
//! assert_eq!(value.as_deref(), Some(&b"2"[..]));
//! # Ok::<(), cachex::Error>(())
//! ```

pub mod bucket;
pub mod cache;
mod check;
pub mod checksum;
pub mod cursor;
pub mod db;
pub mod error;
pub mod freelist;
pub mod meta;
mod node;
pub mod options;
pub mod page;
pub mod tx;

pub use bucket::{Bucket, BucketMut, MAX_BUCKET_NAME_LEN, MAX_KEY_SIZE, MAX_VALUE_SIZE};
pub use cache::{BucketCache, BucketPolicy, Cache, open_database};
pub use cursor::{Cursor, Entry, Keys, PrefixIter};
#[cfg(any(test, feature = "failpoint"))]
pub use db::Failpoint;
pub use db::{Database, Stats};
pub use error::{Error, Result};
pub use options::Options;
pub use page::{PAGE_SIZE, PageId, TxId};
pub use tx::{ReadTx, WriteTx};
