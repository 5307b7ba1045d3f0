//! Summary: Buckets, the named key spaces of the database.
//! Copyright (c) YOAB. All rights reserved.
//!
//! Every bucket is its own B+ tree. The root bucket's header lives in the
//! meta page; a nested bucket is stored as an entry of its parent whose leaf
//! flag marks it as a bucket and whose value is the child's `BucketHeader`.
//! This design follows bbolt/boltdb as used in etcd.
//!
//! `Bucket` is a read view usable from either transaction kind. `BucketMut`
//! is a handle into a write transaction and routes every change through it.

use crate::cursor::{Cursor, Keys, PrefixIter, TreeView};
use crate::error::{Error, Result};
use crate::page::{PageId, read_u64};
use crate::tx::{BucketId, OpenPolicy, WriteTx};

/// Maximum allowed bucket name length in bytes.
pub const MAX_BUCKET_NAME_LEN: usize = 255;

/// Maximum key size in bytes.
pub const MAX_KEY_SIZE: usize = 32768;

/// Maximum value size in bytes.
pub const MAX_VALUE_SIZE: usize = u32::MAX as usize / 2;

/// Persistent header of a bucket: its root page and sequence counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BucketHeader {
    pub root: PageId,
    pub sequence: u64,
}

impl BucketHeader {
    /// Encoded size in bytes.
    pub const SIZE: usize = 16;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.root.to_le_bytes());
        buf[8..16].copy_from_slice(&self.sequence.to_le_bytes());
        buf
    }

    /// Returns `None` if the buffer is too short.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            root: read_u64(buf, 0),
            sequence: read_u64(buf, 8),
        })
    }
}

/// Validates a bucket name.
///
/// # Errors
///
/// Returns `InvalidBucketName` if the name is empty or exceeds the maximum length.
pub fn validate_bucket_name(name: &[u8]) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidBucketName {
            reason: "bucket name cannot be empty",
        });
    }
    if name.len() > MAX_BUCKET_NAME_LEN {
        return Err(Error::InvalidBucketName {
            reason: "bucket name exceeds maximum length",
        });
    }
    Ok(())
}

/// Checks a key/value pair against the size limits before a write.
pub(crate) fn validate_entry(key: &[u8], value: Option<&[u8]>) -> Result<()> {
    if key.is_empty() {
        return Err(Error::KeyRequired);
    }
    if key.len() > MAX_KEY_SIZE {
        return Err(Error::KeyTooLarge {
            size: key.len(),
            max: MAX_KEY_SIZE,
        });
    }
    if let Some(value) = value {
        if value.len() > MAX_VALUE_SIZE {
            return Err(Error::ValueTooLarge {
                size: value.len(),
                max: MAX_VALUE_SIZE,
            });
        }
    }
    Ok(())
}

/// Read-only view of a bucket, valid for the life of its transaction.
pub struct Bucket<'a> {
    view: &'a dyn TreeView,
    header: BucketHeader,
}

impl<'a> Bucket<'a> {
    pub(crate) fn new(view: &'a dyn TreeView, header: BucketHeader) -> Self {
        Self { view, header }
    }

    /// Root page of the bucket's tree.
    pub fn root(&self) -> PageId {
        self.header.root
    }

    /// Current value of the bucket's sequence counter.
    pub fn sequence(&self) -> u64 {
        self.header.sequence
    }

    /// Creates a cursor over the bucket's entries, nested buckets included.
    pub fn cursor(&self) -> Cursor<'a> {
        Cursor::new(self.view, self.header.root)
    }

    /// Returns the value stored under `key`.
    ///
    /// Returns `None` if the key is absent or names a nested bucket.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.cursor().seek(key)? {
            Some(entry) if entry.key == key && !entry.is_bucket() => Ok(Some(entry.value)),
            _ => Ok(None),
        }
    }

    /// Opens the nested bucket `name`.
    pub fn bucket(&self, name: &[u8]) -> Result<Bucket<'a>> {
        validate_bucket_name(name)?;
        match self.cursor().seek(name)? {
            Some(entry) if entry.key == name && entry.is_bucket() => {
                let header = BucketHeader::from_bytes(&entry.value).ok_or_else(|| {
                    Error::Corrupted {
                        context: "opening bucket",
                        details: format!("truncated header for {:?}", String::from_utf8_lossy(name)),
                    }
                })?;
                Ok(Bucket::new(self.view, header))
            }
            Some(entry) if entry.key == name => Err(Error::IncompatibleValue { key: entry.key }),
            _ => Err(Error::BucketNotFound {
                name: name.to_vec(),
            }),
        }
    }

    /// Names of the nested buckets, in ascending order.
    pub fn buckets(&self) -> Result<Vec<Vec<u8>>> {
        let mut cursor = self.cursor();
        let mut names = Vec::new();
        let mut item = cursor.first()?;
        while let Some(entry) = item {
            if entry.is_bucket() {
                names.push(entry.key);
            }
            item = cursor.next()?;
        }
        Ok(names)
    }

    /// Iterates the pairs whose key starts with `prefix`, in key order.
    pub fn seek_prefix(&self, prefix: &[u8]) -> PrefixIter<'a> {
        PrefixIter::new(self.cursor(), prefix)
    }

    /// Iterates every key of the bucket, in key order.
    pub fn keys(&self) -> Keys<'a> {
        Keys::new(self.cursor())
    }
}

/// Writable handle to a bucket inside a write transaction.
pub struct BucketMut<'tx, 'db> {
    tx: &'tx mut WriteTx<'db>,
    id: BucketId,
}

impl<'tx, 'db> BucketMut<'tx, 'db> {
    pub(crate) fn new(tx: &'tx mut WriteTx<'db>, id: BucketId) -> Self {
        Self { tx, id }
    }

    /// Name of the bucket; empty for the root bucket.
    pub fn name(&self) -> &[u8] {
        self.tx.bucket_name(self.id)
    }

    /// Read view of this bucket including the transaction's own writes.
    pub fn as_bucket(&self) -> Bucket<'_> {
        self.tx.bucket_view(self.id)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.as_bucket().get(key)
    }

    /// Inserts or replaces the value under `key`.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tx.put(self.id, key, value)
    }

    /// Removes `key`. Removing an absent key succeeds.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.tx.delete(self.id, key)
    }

    pub fn seek_prefix(&self, prefix: &[u8]) -> PrefixIter<'_> {
        self.as_bucket().seek_prefix(prefix)
    }

    pub fn keys(&self) -> Keys<'_> {
        self.as_bucket().keys()
    }

    /// Names of the nested buckets, in ascending order.
    pub fn buckets(&self) -> Result<Vec<Vec<u8>>> {
        self.as_bucket().buckets()
    }

    /// Creates the nested bucket `name`; fails if it already exists.
    pub fn create_bucket(&mut self, name: &[u8]) -> Result<BucketMut<'_, 'db>> {
        let id = self.tx.open_bucket(self.id, name, OpenPolicy::Create)?;
        Ok(BucketMut::new(&mut *self.tx, id))
    }

    /// Opens the nested bucket `name`, creating it when missing.
    pub fn create_bucket_if_not_exists(&mut self, name: &[u8]) -> Result<BucketMut<'_, 'db>> {
        let id = self.tx.open_bucket(self.id, name, OpenPolicy::CreateIfMissing)?;
        Ok(BucketMut::new(&mut *self.tx, id))
    }

    /// Opens the existing nested bucket `name` for writing.
    pub fn bucket_mut(&mut self, name: &[u8]) -> Result<BucketMut<'_, 'db>> {
        let id = self.tx.open_bucket(self.id, name, OpenPolicy::Existing)?;
        Ok(BucketMut::new(&mut *self.tx, id))
    }

    /// Deletes the nested bucket `name` and everything below it.
    pub fn delete_bucket(&mut self, name: &[u8]) -> Result<()> {
        self.tx.delete_bucket_in(self.id, name)
    }

    pub fn sequence(&self) -> u64 {
        self.tx.bucket_sequence(self.id)
    }

    /// Increments and returns the bucket's sequence counter.
    pub fn next_sequence(&mut self) -> Result<u64> {
        self.tx.next_sequence(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_bucket_name() {
        assert!(validate_bucket_name(b"users").is_ok());
        assert!(validate_bucket_name(&[0u8; MAX_BUCKET_NAME_LEN]).is_ok());
        assert!(matches!(
            validate_bucket_name(b""),
            Err(Error::InvalidBucketName { .. })
        ));
        assert!(matches!(
            validate_bucket_name(&[b'x'; MAX_BUCKET_NAME_LEN + 1]),
            Err(Error::InvalidBucketName { .. })
        ));
    }

    #[test]
    fn test_validate_entry_limits() {
        assert!(validate_entry(b"k", Some(b"v")).is_ok());
        assert!(validate_entry(b"k", Some(b"")).is_ok());
        assert!(matches!(validate_entry(b"", Some(b"v")), Err(Error::KeyRequired)));
        let big_key = vec![1u8; MAX_KEY_SIZE + 1];
        assert!(matches!(
            validate_entry(&big_key, None),
            Err(Error::KeyTooLarge { size, max: MAX_KEY_SIZE }) if size == MAX_KEY_SIZE + 1
        ));
        // Value lengths must fit the u32 length field with room to spare.
        assert_eq!(MAX_VALUE_SIZE, (1 << 31) - 1);
    }

    #[test]
    fn test_header_round_trip() {
        let header = BucketHeader {
            root: 12,
            sequence: 7,
        };
        assert_eq!(BucketHeader::from_bytes(&header.to_bytes()), Some(header));
        assert_eq!(BucketHeader::from_bytes(&[0u8; 8]), None);
    }
}
