//! Summary: Error types for the cachex storage engine and cache facade.
//! Copyright (c) YOAB. All rights reserved.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::page::PageId;

/// Result type alias for cachex operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for cachex database operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    // ==================== I/O ====================
    /// Plain I/O error without further context.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The database file could not be opened or created.
    #[error("failed to open database file '{}': {source}", .path.display())]
    FileOpen { path: PathBuf, source: io::Error },

    /// File metadata could not be read.
    #[error("failed to read metadata of '{}': {source}", .path.display())]
    FileMetadata { path: PathBuf, source: io::Error },

    /// A positional read failed.
    #[error("read of {len} bytes at offset {offset} failed ({context}): {source}")]
    FileRead {
        offset: u64,
        len: usize,
        context: &'static str,
        source: io::Error,
    },

    /// A positional write failed.
    #[error("write of {len} bytes at offset {offset} failed ({context}): {source}")]
    FileWrite {
        offset: u64,
        len: usize,
        context: &'static str,
        source: io::Error,
    },

    /// Flushing to stable storage failed.
    #[error("sync failed ({context}): {source}")]
    FileSync {
        context: &'static str,
        source: io::Error,
    },

    /// The advisory file lock could not be taken for a reason other than contention.
    #[error("failed to lock '{}': {source}", .path.display())]
    FileLock { path: PathBuf, source: io::Error },

    // ==================== Corruption ====================
    /// Database file is corrupted or invalid.
    #[error("database corrupted while {context}: {details}")]
    Corrupted {
        context: &'static str,
        details: String,
    },

    /// A page failed structural or checksum validation.
    #[error("invalid page {id}: {reason}")]
    InvalidPage { id: PageId, reason: &'static str },

    /// A single meta page failed validation.
    #[error("invalid meta page {page_number}: {reason}")]
    InvalidMetaPage {
        page_number: u64,
        reason: &'static str,
    },

    /// Neither meta page validates; the file needs operator attention.
    #[error("both meta pages are invalid")]
    BothMetaPagesInvalid,

    // ==================== Locking ====================
    /// Another handle holds the database file lock.
    #[error("database '{}' is locked by another handle", .path.display())]
    DatabaseLocked { path: PathBuf },

    /// The writer lock could not be acquired in time.
    #[error("write transaction still active after waiting {waited:?}")]
    WriteConflict { waited: Duration },

    /// Write transaction requested on a read-only handle.
    #[error("database is opened read-only")]
    DatabaseReadOnly,

    /// An earlier commit left a meta page in an unknown state.
    #[error("database must be reopened: an earlier commit could not restore its meta page")]
    DatabasePoisoned,

    /// Commit failed; the previous committed state is still current.
    #[error("transaction commit failed: {reason}")]
    TxCommitFailed {
        reason: String,
        #[source]
        source: Box<Error>,
    },

    // ==================== Lookups ====================
    /// Key not found in a bucket.
    #[error("key {:?} not found", String::from_utf8_lossy(.key))]
    KeyNotFound { key: Vec<u8> },

    /// Bucket does not exist.
    #[error("bucket {:?} not found", String::from_utf8_lossy(.name))]
    BucketNotFound { name: Vec<u8> },

    /// Bucket already exists.
    #[error("bucket {:?} already exists", String::from_utf8_lossy(.name))]
    BucketAlreadyExists { name: Vec<u8> },

    /// A key was used as a value but holds a nested bucket, or the reverse.
    #[error("key {:?} holds an incompatible value", String::from_utf8_lossy(.key))]
    IncompatibleValue { key: Vec<u8> },

    // ==================== Arguments ====================
    /// Invalid bucket name.
    #[error("invalid bucket name: {reason}")]
    InvalidBucketName { reason: &'static str },

    /// Empty key passed to a write.
    #[error("key required")]
    KeyRequired,

    /// Key longer than the maximum key size.
    #[error("key of {size} bytes exceeds maximum of {max}")]
    KeyTooLarge { size: usize, max: usize },

    /// Value longer than the maximum value size.
    #[error("value of {size} bytes exceeds maximum of {max}")]
    ValueTooLarge { size: usize, max: usize },

    /// Rejected `Options`.
    #[error("invalid options: {reason}")]
    InvalidOptions { reason: &'static str },
}

impl Error {
    /// Returns true for errors that describe a normal, recoverable outcome
    /// (missing key or bucket, writer contention) rather than a fault.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::KeyNotFound { .. }
                | Error::BucketNotFound { .. }
                | Error::WriteConflict { .. }
                | Error::DatabaseLocked { .. }
        )
    }
}
