//! Summary: String key/value cache facade over a single bucket.
//! Copyright (c) YOAB. All rights reserved.
//!
//! Each operation runs in its own transaction: lookups and scans in a read
//! transaction, mutations in a write transaction committed before return.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use tracing::error;

use crate::db::Database;
use crate::error::{Error, Result};
use crate::tx::ReadTx;

/// Operations offered by a cache engine.
pub trait Cache {
    /// Stores `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Returns the value under `key`, or `KeyNotFound`.
    fn get(&self, key: &str) -> Result<String>;

    /// Returns every pair whose key starts with `prefix`.
    fn search(&self, prefix: &str) -> Result<BTreeMap<String, String>>;

    /// Removes `key`. Removing an absent key succeeds.
    fn delete(&self, key: &str) -> Result<()>;

    /// Returns every key currently stored.
    fn keys(&self) -> Result<BTreeSet<String>>;
}

/// What `BucketCache::with_policy` does when the bucket does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BucketPolicy {
    /// Create the bucket.
    #[default]
    CreateIfMissing,
    /// Fail with `BucketNotFound`.
    RequireExisting,
}

/// Opens a database with default options, logging a failure before
/// returning it.
pub fn open_database<P: AsRef<Path>>(path: P) -> Result<Arc<Database>> {
    let path = path.as_ref();
    match Database::open(path) {
        Ok(db) => Ok(Arc::new(db)),
        Err(e) => {
            error!(path = %path.display(), error = %e, "failed to open database");
            Err(e)
        }
    }
}

/// A `Cache` storing its entries in one top-level bucket.
#[derive(Debug, Clone)]
pub struct BucketCache {
    db: Arc<Database>,
    bucket: Vec<u8>,
}

impl BucketCache {
    /// Binds a cache to `bucket`, creating the bucket when it is missing.
    pub fn new(db: Arc<Database>, bucket: &str) -> Result<Self> {
        Self::with_policy(db, bucket, BucketPolicy::CreateIfMissing)
    }

    /// Binds a cache to `bucket`, resolving a missing bucket per `policy`.
    pub fn with_policy(db: Arc<Database>, bucket: &str, policy: BucketPolicy) -> Result<Self> {
        let name = bucket.as_bytes().to_vec();
        match policy {
            BucketPolicy::CreateIfMissing => {
                db.update(|tx| tx.create_bucket_if_not_exists(&name).map(|_| ()))?;
            }
            BucketPolicy::RequireExisting => {
                db.view(|tx| tx.bucket(&name).map(|_| ()))?;
            }
        }
        Ok(Self { db, bucket: name })
    }

    /// Opens the database at `path` and binds a cache to `bucket`.
    pub fn open<P: AsRef<Path>>(path: P, bucket: &str) -> Result<Self> {
        Self::new(open_database(path)?, bucket)
    }

    /// The underlying database.
    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn bucket_name(&self) -> &[u8] {
        &self.bucket
    }

    /// Runs `f` over the bucket, or returns `None` when the bucket is missing.
    fn read<T>(&self, f: impl FnOnce(crate::bucket::Bucket<'_>) -> Result<T>) -> Result<Option<T>> {
        let tx: ReadTx<'_> = self.db.read_tx();
        match tx.bucket(&self.bucket) {
            Ok(bucket) => f(bucket).map(Some),
            Err(Error::BucketNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Cache for BucketCache {
    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.db.update(|tx| {
            tx.bucket_mut(&self.bucket)?
                .put(key.as_bytes(), value.as_bytes())
        })
    }

    fn get(&self, key: &str) -> Result<String> {
        let tx = self.db.read_tx();
        let value = tx.bucket(&self.bucket)?.get(key.as_bytes())?;
        value
            .map(|v| String::from_utf8_lossy(&v).into_owned())
            .ok_or_else(|| Error::KeyNotFound {
                key: key.as_bytes().to_vec(),
            })
    }

    fn search(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
        let found = self.read(|bucket| {
            bucket
                .seek_prefix(prefix.as_bytes())
                .map(|item| {
                    item.map(|(k, v)| {
                        (
                            String::from_utf8_lossy(&k).into_owned(),
                            String::from_utf8_lossy(&v).into_owned(),
                        )
                    })
                })
                .collect::<Result<BTreeMap<_, _>>>()
        })?;
        Ok(found.unwrap_or_default())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.db
            .update(|tx| tx.bucket_mut(&self.bucket)?.delete(key.as_bytes()))
    }

    fn keys(&self) -> Result<BTreeSet<String>> {
        let found = self.read(|bucket| {
            bucket
                .keys()
                .map(|item| item.map(|k| String::from_utf8_lossy(&k).into_owned()))
                .collect::<Result<BTreeSet<_>>>()
        })?;
        Ok(found.unwrap_or_default())
    }
}
