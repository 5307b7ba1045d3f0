//! Summary: Database open/close and core management logic.
//! Copyright (c) YOAB. All rights reserved.
//!
//! File layout: pages 0 and 1 hold the two meta copies, every other page
//! belongs to a B+ tree or to the freelist. A fresh file starts with the
//! freelist at page 2 and an empty root leaf at page 3.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::checksum;
use crate::error::{Error, Result};
use crate::freelist::FreeList;
use crate::meta::Meta;
use crate::node::Node;
use crate::options::Options;
use crate::page::{MAX_PAGE_SIZE, MIN_PAGE_SIZE, Page, PageId, TxId, overflow_of, span_len};
use crate::tx::{ReadTx, WriteTx};

/// Interval between attempts to take a contended file lock.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// State owned by the single writer.
#[derive(Debug)]
pub(crate) struct WriterState {
    pub freelist: FreeList,
}

/// Counters describing a database handle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    pub page_size: usize,
    /// Id of the latest committed transaction.
    pub txid: TxId,
    /// First page id never allocated.
    pub high_water: PageId,
    /// Pages immediately reusable by the next writer.
    pub free_page_count: usize,
    /// Freed pages still reachable from an open snapshot.
    pub pending_page_count: usize,
    pub open_read_tx_count: usize,
    pub read_tx_count: u64,
    pub commit_count: u64,
    pub rollback_count: u64,
}

/// Points in the commit path where a test can inject a failure.
#[cfg(any(test, feature = "failpoint"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failpoint {
    /// Fail after the data pages are synced, before the meta page is written.
    BeforeMetaWrite,
    /// Write only part of the meta page, then fail.
    TornMetaWrite,
    /// Write the whole meta page, then fail the sync that follows.
    MetaSyncFailure,
}

/// The main database handle.
///
/// A `Database` represents an open cachex database file. It provides
/// methods to begin read and write transactions and is shared between
/// threads by reference or through an `Arc`.
///
/// # Concurrency
///
/// - Multiple read transactions can be active concurrently.
/// - Only one write transaction can be active at a time.
/// - Readers never wait for the writer and the writer never waits for readers.
pub struct Database {
    /// Path to the database file.
    path: PathBuf,
    /// The underlying file handle, holding the advisory lock.
    file: Flock<File>,
    options: Options,
    page_size: usize,
    /// Latest committed meta.
    meta: RwLock<Meta>,
    writer: Mutex<WriterState>,
    /// Snapshot txid -> number of open read transactions on it.
    readers: Mutex<BTreeMap<TxId, usize>>,
    stats: Mutex<Stats>,
    /// Set when a failed meta write could not be undone.
    poisoned: AtomicBool,
    #[cfg(any(test, feature = "failpoint"))]
    failpoint: Mutex<Option<Failpoint>>,
}

impl Database {
    /// Opens a database at the given path with default options.
    ///
    /// If the file does not exist, a new database will be created.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created, if another
    /// handle holds its lock, or if the database file is corrupted.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, Options::default())
    }

    /// Opens a database at the given path.
    pub fn open_with<P: AsRef<Path>>(path: P, options: Options) -> Result<Self> {
        options.validate()?;
        let path = path.as_ref();
        let path_buf = path.to_path_buf();

        let mut open = OpenOptions::new();
        open.read(true);
        if !options.read_only {
            open.write(true).create(true).truncate(false);
        }
        open.mode(options.file_mode);
        let file = open.open(path).map_err(|source| Error::FileOpen {
            path: path_buf.clone(),
            source,
        })?;
        let file = Self::lock(file, &path_buf, !options.read_only, options.lock_timeout)?;

        let file_len = file
            .metadata()
            .map_err(|source| Error::FileMetadata {
                path: path_buf.clone(),
                source,
            })?
            .len();
        if file_len == 0 {
            if options.read_only {
                return Err(Error::Corrupted {
                    context: "opening read-only",
                    details: "database file is empty".into(),
                });
            }
            Self::init_db(&file, options.page_size, !options.no_sync)?;
            info!(path = %path.display(), page_size = options.page_size, "initialized new database");
        }

        let meta = Self::load_meta(&file, options.page_size)?;
        let page_size = meta.page_size as usize;
        let freelist = Self::load_freelist(&file, &meta, page_size)?;
        info!(
            path = %path.display(),
            txid = meta.txid,
            page_size,
            high_water = meta.pgid,
            free_pages = freelist.count(),
            "opened database"
        );

        let stats = Stats {
            page_size,
            txid: meta.txid,
            high_water: meta.pgid,
            free_page_count: freelist.free_count(),
            ..Stats::default()
        };
        Ok(Self {
            path: path_buf,
            file,
            options,
            page_size,
            meta: RwLock::new(meta),
            writer: Mutex::new(WriterState { freelist }),
            readers: Mutex::new(BTreeMap::new()),
            stats: Mutex::new(stats),
            poisoned: AtomicBool::new(false),
            #[cfg(any(test, feature = "failpoint"))]
            failpoint: Mutex::new(None),
        })
    }

    /// Takes the advisory lock, retrying until `timeout` when it is contended.
    fn lock(
        file: File,
        path: &Path,
        exclusive: bool,
        timeout: Option<Duration>,
    ) -> Result<Flock<File>> {
        let arg = if exclusive {
            FlockArg::LockExclusiveNonblock
        } else {
            FlockArg::LockSharedNonblock
        };
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut file = file;
        loop {
            match Flock::lock(file, arg) {
                Ok(locked) => return Ok(locked),
                Err((unlocked, errno)) if errno == Errno::EWOULDBLOCK => match deadline {
                    Some(deadline) if Instant::now() < deadline => {
                        debug!(path = %path.display(), "database file is locked, retrying");
                        file = unlocked;
                        thread::sleep(LOCK_RETRY_INTERVAL);
                    }
                    _ => {
                        return Err(Error::DatabaseLocked {
                            path: path.to_path_buf(),
                        });
                    }
                },
                Err((_, errno)) => {
                    return Err(Error::FileLock {
                        path: path.to_path_buf(),
                        source: io::Error::from(errno),
                    });
                }
            }
        }
    }

    /// Initializes a new database file: two meta pages, an empty freelist
    /// and an empty root leaf.
    fn init_db(file: &File, page_size: usize, sync: bool) -> Result<()> {
        let mut pages: Vec<(PageId, Vec<u8>)> = (0..2)
            .map(|txid| (txid, Meta::new(page_size as u32, 3, 2, 4, txid).to_page(page_size)))
            .collect();
        let mut freelist = FreeList::new().to_page(2, 1, page_size);
        let mut root = Node::new_leaf(3).write(3, page_size);
        checksum::seal_page(&mut freelist);
        checksum::seal_page(&mut root);
        pages.push((2, freelist));
        pages.push((3, root));

        for (id, buf) in &pages {
            Self::write_at(file, *id * page_size as u64, buf, "initializing database")?;
        }
        if sync {
            Self::fdatasync(file, "syncing new database")?;
        }
        Ok(())
    }

    /// Loads and validates both meta pages, returning the newest valid one.
    fn load_meta(file: &File, page_size: usize) -> Result<Meta> {
        let meta0 = Self::read_meta_slot(file, 0)?;
        // Slot 1 sits one page in. Its offset comes from slot 0 when that
        // validates; otherwise every legal page size is probed.
        let meta1 = match meta0.filter(|m| m.validate().is_ok()) {
            Some(m) => Self::read_meta_slot(file, u64::from(m.page_size))?
                .filter(|m1| m1.page_size == m.page_size),
            None => Self::probe_meta_slot(file, page_size)?,
        };

        let checked = |slot: u64, meta: Option<Meta>| {
            let reason = match meta.map(|m| m.validate()) {
                Some(Ok(())) => return meta,
                Some(Err(reason)) => reason,
                None => "not a meta page",
            };
            let err = Error::InvalidMetaPage {
                page_number: slot,
                reason,
            };
            warn!(error = %err, "ignoring meta page");
            None
        };
        match (checked(0, meta0), checked(1, meta1)) {
            (Some(m0), Some(m1)) => Ok(if m1.txid > m0.txid { m1 } else { m0 }),
            (Some(m), None) | (None, Some(m)) => {
                warn!(txid = m.txid, "recovering from the remaining valid meta page");
                Ok(m)
            }
            (None, None) => Err(Error::BothMetaPagesInvalid),
        }
    }

    /// Looks for a valid slot 1 meta at each legal page size, the
    /// configured one first.
    fn probe_meta_slot(file: &File, page_size: usize) -> Result<Option<Meta>> {
        let mut sizes = vec![page_size];
        let mut size = MIN_PAGE_SIZE;
        while size <= MAX_PAGE_SIZE {
            if size != page_size {
                sizes.push(size);
            }
            size *= 2;
        }
        for size in sizes {
            if let Some(meta) = Self::read_meta_slot(file, size as u64)? {
                if meta.validate().is_ok() && meta.page_size as usize == size {
                    return Ok(Some(meta));
                }
            }
        }
        Ok(None)
    }

    fn read_meta_slot(file: &File, offset: u64) -> Result<Option<Meta>> {
        let mut buf = [0u8; Meta::READ_LEN];
        match file.read_exact_at(&mut buf, offset) {
            Ok(()) => Ok(Meta::from_bytes(&buf)),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(source) => Err(Error::FileRead {
                offset,
                len: Meta::READ_LEN,
                context: "reading meta page",
                source,
            }),
        }
    }

    fn load_freelist(file: &File, meta: &Meta, page_size: usize) -> Result<FreeList> {
        if meta.freelist < 2 || meta.freelist >= meta.pgid {
            return Err(Error::Corrupted {
                context: "loading freelist",
                details: format!("freelist page {} outside the file", meta.freelist),
            });
        }
        let page = Page::from_bytes(Self::read_span(file, meta.freelist, page_size)?, meta.freelist)?;
        FreeList::from_page(&page).ok_or_else(|| Error::Corrupted {
            context: "loading freelist",
            details: format!("page {} is not a valid freelist", meta.freelist),
        })
    }

    /// Reads the page span starting at `id`, overflow pages included.
    fn read_span(file: &File, id: PageId, page_size: usize) -> Result<Vec<u8>> {
        let offset = id * page_size as u64;
        let mut buf = vec![0u8; page_size];
        file.read_exact_at(&mut buf, offset)
            .map_err(|source| Error::FileRead {
                offset,
                len: page_size,
                context: "reading page",
                source,
            })?;
        let overflow = overflow_of(id, &buf, page_size)?;
        if overflow > 0 {
            let total = span_len(overflow, page_size);
            buf.resize(total, 0);
            let rest = offset + page_size as u64;
            file.read_exact_at(&mut buf[page_size..], rest)
                .map_err(|source| Error::FileRead {
                    offset: rest,
                    len: total - page_size,
                    context: "reading overflow pages",
                    source,
                })?;
        }
        Ok(buf)
    }

    fn write_at(file: &File, offset: u64, buf: &[u8], context: &'static str) -> Result<()> {
        file.write_all_at(buf, offset)
            .map_err(|source| Error::FileWrite {
                offset,
                len: buf.len(),
                context,
                source,
            })
    }

    /// Performs fdatasync on Unix systems, falling back to sync_all elsewhere.
    /// fdatasync is faster than fsync because it doesn't sync file metadata.
    #[inline]
    fn fdatasync(file: &File, context: &'static str) -> Result<()> {
        #[cfg(unix)]
        {
            // SAFETY: fdatasync is a standard POSIX call, safe with a valid fd.
            let ret = unsafe { libc::fdatasync(file.as_raw_fd()) };
            if ret != 0 {
                return Err(Error::FileSync {
                    context,
                    source: io::Error::last_os_error(),
                });
            }
            Ok(())
        }

        #[cfg(not(unix))]
        {
            file.sync_all().map_err(|e| Error::FileSync { context, source: e })
        }
    }

    // ==================== Page I/O used by transactions ====================

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    pub(crate) fn fill_percent(&self) -> f64 {
        self.options.fill_percent
    }

    pub(crate) fn read_page(&self, id: PageId) -> Result<Arc<Page>> {
        let buf = Self::read_span(&self.file, id, self.page_size)?;
        Page::from_bytes(buf, id).map(Arc::new)
    }

    pub(crate) fn write_span(&self, id: PageId, buf: &[u8]) -> Result<()> {
        Self::write_at(&self.file, id * self.page_size as u64, buf, "writing page")
    }

    pub(crate) fn sync(&self, context: &'static str) -> Result<()> {
        if self.options.no_sync {
            return Ok(());
        }
        Self::fdatasync(&self.file, context)
    }

    /// Writes `meta` to its slot and syncs it.
    ///
    /// When the write or its sync fails the slot's previous bytes are put
    /// back, so a reopen never selects a meta whose pages the next writer
    /// may reuse. If that fails too, the handle refuses further writes.
    pub(crate) fn write_meta(&self, meta: &Meta) -> Result<()> {
        let buf = meta.to_page(self.page_size);
        let offset = meta.slot() * self.page_size as u64;

        #[cfg(any(test, feature = "failpoint"))]
        if self.take_failpoint(Failpoint::TornMetaWrite) {
            let torn = crate::page::PAGE_HEADER_SIZE + Meta::SIZE / 2;
            Self::write_at(&self.file, offset, &buf[..torn], "writing meta page")?;
            return Err(Error::Io(io::Error::other("failpoint: torn meta write")));
        }

        let mut previous = vec![0u8; self.page_size];
        self.file
            .read_exact_at(&mut previous, offset)
            .map_err(|source| Error::FileRead {
                offset,
                len: self.page_size,
                context: "reading meta page",
                source,
            })?;

        let result = Self::write_at(&self.file, offset, &buf, "writing meta page").and_then(|()| {
            #[cfg(any(test, feature = "failpoint"))]
            self.check_failpoint(Failpoint::MetaSyncFailure)?;
            self.sync("flushing meta page")
        });
        if let Err(e) = result {
            let restored = Self::write_at(&self.file, offset, &previous, "restoring meta page")
                .and_then(|()| self.sync("flushing restored meta page"));
            match restored {
                Ok(()) => warn!(txid = meta.txid, "meta write failed, previous slot contents restored"),
                Err(restore_err) => {
                    error!(txid = meta.txid, error = %restore_err, "meta slot could not be restored");
                    self.poisoned.store(true, Ordering::Release);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Makes `meta` the committed state seen by new transactions.
    pub(crate) fn publish(&self, meta: Meta, freelist: &FreeList) {
        *self.meta.write() = meta;
        let mut stats = self.stats.lock();
        stats.txid = meta.txid;
        stats.high_water = meta.pgid;
        stats.free_page_count = freelist.free_count();
        stats.pending_page_count = freelist.pending_count();
        stats.commit_count += 1;
    }

    pub(crate) fn note_rollback(&self) {
        self.stats.lock().rollback_count += 1;
    }

    pub(crate) fn release_reader(&self, txid: TxId) {
        let mut readers = self.readers.lock();
        if let Some(count) = readers.get_mut(&txid) {
            *count -= 1;
            if *count == 0 {
                readers.remove(&txid);
            }
        }
    }

    // ==================== Failpoints ====================

    /// Arms a failpoint for the next commit, or disarms with `None`.
    #[cfg(any(test, feature = "failpoint"))]
    pub fn set_failpoint(&self, failpoint: Option<Failpoint>) {
        *self.failpoint.lock() = failpoint;
    }

    #[cfg(any(test, feature = "failpoint"))]
    fn take_failpoint(&self, point: Failpoint) -> bool {
        let mut armed = self.failpoint.lock();
        if *armed == Some(point) {
            *armed = None;
            true
        } else {
            false
        }
    }

    #[cfg(any(test, feature = "failpoint"))]
    pub(crate) fn check_failpoint(&self, point: Failpoint) -> Result<()> {
        if self.take_failpoint(point) {
            return Err(Error::Io(io::Error::other(format!("failpoint: {point:?}"))));
        }
        Ok(())
    }

    // ==================== Public API ====================

    /// Returns the path to the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the options the database was opened with.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Returns a snapshot of the handle's counters.
    pub fn stats(&self) -> Stats {
        let open = self.readers.lock().values().sum();
        let mut stats = self.stats.lock().clone();
        stats.open_read_tx_count = open;
        stats
    }

    /// Begins a new read-only transaction.
    ///
    /// Read transactions provide a consistent snapshot view of the database.
    /// Multiple read transactions can be active concurrently.
    pub fn read_tx(&self) -> ReadTx<'_> {
        let meta = {
            let mut readers = self.readers.lock();
            let meta = *self.meta.read();
            *readers.entry(meta.txid).or_insert(0) += 1;
            meta
        };
        self.stats.lock().read_tx_count += 1;
        ReadTx::new(self, meta)
    }

    /// Begins a new read-write transaction.
    ///
    /// Only one write transaction can be active at a time; a second caller
    /// blocks until the first finishes, or fails with `WriteConflict` once
    /// `Options::write_timeout` elapses.
    pub fn write_tx(&self) -> Result<WriteTx<'_>> {
        if self.options.read_only {
            return Err(Error::DatabaseReadOnly);
        }
        let mut state = match self.options.write_timeout {
            None => self.writer.lock(),
            Some(timeout) => self
                .writer
                .try_lock_for(timeout)
                .ok_or(Error::WriteConflict { waited: timeout })?,
        };
        if self.poisoned.load(Ordering::Acquire) {
            return Err(Error::DatabasePoisoned);
        }

        let meta = *self.meta.read();
        {
            let readers = self.readers.lock();
            // Pages freed by txid t are unreachable from snapshots >= t.
            let releasable = match readers.keys().next() {
                Some(&oldest) => oldest.saturating_sub(1),
                None => meta.txid,
            };
            state.freelist.release(releasable);
        }
        {
            let mut stats = self.stats.lock();
            stats.free_page_count = state.freelist.free_count();
            stats.pending_page_count = state.freelist.pending_count();
        }
        debug!(txid = meta.txid + 1, "write transaction started");
        Ok(WriteTx::new(self, state, meta))
    }

    /// Runs `f` in a read transaction.
    pub fn view<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ReadTx<'_>) -> Result<T>,
    {
        let tx = self.read_tx();
        f(&tx)
    }

    /// Runs `f` in a write transaction and commits it if `f` succeeds.
    /// The transaction is rolled back if `f` returns an error.
    pub fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut WriteTx<'_>) -> Result<T>,
    {
        let mut tx = self.write_tx()?;
        let out = f(&mut tx)?;
        tx.commit()?;
        Ok(out)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("page_size", &self.page_size)
            .field("txid", &self.meta.read().txid)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn test_db_path(name: &str) -> (TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join(format!("{name}.db"));
        (dir, path)
    }

    fn put(db: &Database, bucket: &[u8], key: &[u8], value: &[u8]) {
        db.update(|tx| tx.create_bucket_if_not_exists(bucket)?.put(key, value))
            .expect("update");
    }

    fn get(db: &Database, bucket: &[u8], key: &[u8]) -> Option<Vec<u8>> {
        db.view(|tx| match tx.bucket(bucket) {
            Ok(b) => b.get(key),
            Err(Error::BucketNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        })
        .expect("view")
    }

    #[test]
    fn test_open_creates_file() {
        let (_dir, path) = test_db_path("create");
        let db = Database::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(db.path(), path.as_path());
        let stats = db.stats();
        assert_eq!(stats.txid, 1);
        assert_eq!(stats.high_water, 4);
        assert_eq!(fs::metadata(&path).unwrap().len(), 4 * 4096);
        db.read_tx().check().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_new_file_mode() {
        use std::os::unix::fs::PermissionsExt;
        let (_dir, path) = test_db_path("mode");
        let _db = Database::open(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let (_dir, path) = test_db_path("reopen");
        {
            let db = Database::open(&path).unwrap();
            put(&db, b"b", b"k", b"v");
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(get(&db, b"b", b"k"), Some(b"v".to_vec()));
        assert_eq!(db.stats().txid, 2);
        db.read_tx().check().unwrap();
    }

    #[test]
    fn test_custom_page_size_is_persisted() {
        let (_dir, path) = test_db_path("page_size");
        {
            let options = Options {
                page_size: 1024,
                ..Options::default()
            };
            let db = Database::open_with(&path, options).unwrap();
            put(&db, b"b", b"k", b"v");
        }
        // Reopening with a different configured size keeps the file's size.
        let db = Database::open(&path).unwrap();
        assert_eq!(db.stats().page_size, 1024);
        assert_eq!(get(&db, b"b", b"k"), Some(b"v".to_vec()));
    }

    #[test]
    fn test_second_handle_is_locked_out() {
        let (_dir, path) = test_db_path("locked");
        let _db = Database::open(&path).unwrap();
        let err = Database::open(&path).unwrap_err();
        assert!(matches!(err, Error::DatabaseLocked { .. }));
        assert!(err.is_recoverable());

        let options = Options {
            lock_timeout: Some(Duration::from_millis(120)),
            ..Options::default()
        };
        let started = Instant::now();
        assert!(matches!(
            Database::open_with(&path, options),
            Err(Error::DatabaseLocked { .. })
        ));
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_lock_released_on_drop() {
        let (_dir, path) = test_db_path("relock");
        drop(Database::open(&path).unwrap());
        Database::open(&path).unwrap();
    }

    #[test]
    fn test_read_only_handle() {
        let (_dir, path) = test_db_path("read_only");
        {
            let db = Database::open(&path).unwrap();
            put(&db, b"b", b"k", b"v");
        }
        let options = Options {
            read_only: true,
            ..Options::default()
        };
        let reader_a = Database::open_with(&path, options.clone()).unwrap();
        let reader_b = Database::open_with(&path, options).unwrap();
        assert_eq!(get(&reader_a, b"b", b"k"), Some(b"v".to_vec()));
        assert_eq!(get(&reader_b, b"b", b"k"), Some(b"v".to_vec()));
        assert!(matches!(reader_a.write_tx(), Err(Error::DatabaseReadOnly)));
        // Shared locks keep writers out.
        assert!(matches!(Database::open(&path), Err(Error::DatabaseLocked { .. })));
    }

    #[test]
    fn test_read_only_missing_file_fails() {
        let (_dir, path) = test_db_path("missing");
        let options = Options {
            read_only: true,
            ..Options::default()
        };
        assert!(matches!(
            Database::open_with(&path, options),
            Err(Error::FileOpen { .. })
        ));
    }

    #[test]
    fn test_crash_before_meta_write_keeps_previous_state() {
        let (_dir, path) = test_db_path("crash");
        {
            let db = Database::open(&path).unwrap();
            put(&db, b"b", b"committed", b"1");

            db.set_failpoint(Some(Failpoint::BeforeMetaWrite));
            let err = db
                .update(|tx| tx.bucket_mut(b"b")?.put(b"lost", b"2"))
                .unwrap_err();
            assert!(matches!(err, Error::TxCommitFailed { .. }));

            // The handle keeps serving the previous state and accepts new writes.
            assert_eq!(get(&db, b"b", b"lost"), None);
            db.read_tx().check().unwrap();
            put(&db, b"b", b"after", b"3");
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(get(&db, b"b", b"committed"), Some(b"1".to_vec()));
        assert_eq!(get(&db, b"b", b"lost"), None);
        assert_eq!(get(&db, b"b", b"after"), Some(b"3".to_vec()));
        db.read_tx().check().unwrap();
    }

    #[test]
    fn test_meta_sync_failure_restores_slot() {
        let (_dir, path) = test_db_path("meta_sync");
        {
            let db = Database::open(&path).unwrap();
            put(&db, b"b", b"committed", b"1");

            // The meta bytes reach the file but the sync fails.
            db.set_failpoint(Some(Failpoint::MetaSyncFailure));
            let err = db
                .update(|tx| {
                    let mut bucket = tx.bucket_mut(b"b")?;
                    for i in 0..300u32 {
                        bucket.put(format!("lost{i:04}").as_bytes(), &[1u8; 48])?;
                    }
                    Ok(())
                })
                .unwrap_err();
            assert!(matches!(err, Error::TxCommitFailed { .. }));
            assert_eq!(db.stats().txid, 2);

            // The next writer reuses the same pages, then crashes before
            // its own meta write.
            db.set_failpoint(Some(Failpoint::BeforeMetaWrite));
            let err = db
                .update(|tx| {
                    let mut bucket = tx.bucket_mut(b"b")?;
                    for i in 0..300u32 {
                        bucket.put(format!("other{i:04}").as_bytes(), &[2u8; 48])?;
                    }
                    Ok(())
                })
                .unwrap_err();
            assert!(matches!(err, Error::TxCommitFailed { .. }));
        }

        let db = Database::open(&path).unwrap();
        assert_eq!(db.stats().txid, 2);
        assert_eq!(get(&db, b"b", b"committed"), Some(b"1".to_vec()));
        assert_eq!(get(&db, b"b", b"lost0000"), None);
        assert_eq!(get(&db, b"b", b"other0000"), None);
        db.read_tx().check().unwrap();

        put(&db, b"b", b"after", b"3");
        drop(db);
        let db = Database::open(&path).unwrap();
        assert_eq!(db.stats().txid, 3);
        assert_eq!(get(&db, b"b", b"after"), Some(b"3".to_vec()));
        db.read_tx().check().unwrap();
    }

    #[test]
    fn test_torn_meta_write_falls_back() {
        let (_dir, path) = test_db_path("torn");
        {
            let db = Database::open(&path).unwrap();
            put(&db, b"b", b"first", b"1");
            db.set_failpoint(Some(Failpoint::TornMetaWrite));
            assert!(db.update(|tx| tx.bucket_mut(b"b")?.put(b"second", b"2")).is_err());
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(get(&db, b"b", b"first"), Some(b"1".to_vec()));
        assert_eq!(get(&db, b"b", b"second"), None);
        db.read_tx().check().unwrap();
    }

    #[test]
    fn test_corrupt_newest_meta_falls_back_one_commit() {
        let (_dir, path) = test_db_path("fallback");
        let newest_slot = {
            let db = Database::open(&path).unwrap();
            put(&db, b"b", b"a", b"1");
            put(&db, b"b", b"b", b"2");
            db.stats().txid % 2
        };
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all_at(&[0xFF; 8], newest_slot * 4096 + 24 + 48).unwrap();
        drop(file);

        let db = Database::open(&path).unwrap();
        assert_eq!(get(&db, b"b", b"a"), Some(b"1".to_vec()));
        assert_eq!(get(&db, b"b", b"b"), None);
        db.read_tx().check().unwrap();
    }

    #[test]
    fn test_slot_zero_lost_with_custom_page_size() {
        let (_dir, path) = test_db_path("probe");
        let options = Options {
            page_size: 2048,
            ..Options::default()
        };
        {
            let db = Database::open_with(&path, options).unwrap();
            // txid 2 lands in slot 0, txid 3 in slot 1.
            put(&db, b"b", b"k", b"1");
            put(&db, b"b", b"k", b"2");
        }
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all_at(&[0u8; 64], 24).unwrap();
        drop(file);

        // Opened with the default page size, slot 1 is still found.
        let db = Database::open(&path).unwrap();
        assert_eq!(db.stats().page_size, 2048);
        assert_eq!(get(&db, b"b", b"k"), Some(b"2".to_vec()));
    }

    #[test]
    fn test_both_metas_corrupt() {
        let (_dir, path) = test_db_path("both");
        drop(Database::open(&path).unwrap());
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all_at(&[0u8; 64], 24).unwrap();
        file.write_all_at(&[0u8; 64], 4096 + 24).unwrap();
        drop(file);
        assert!(matches!(Database::open(&path), Err(Error::BothMetaPagesInvalid)));
    }

    #[cfg(not(feature = "no_checksum"))]
    #[test]
    fn test_corrupted_page_is_reported() {
        let (_dir, path) = test_db_path("bitrot");
        {
            let db = Database::open(&path).unwrap();
            put(&db, b"b", b"k", b"v");
        }
        let root = {
            let db = Database::open(&path).unwrap();
            let tx = db.read_tx();
            tx.root().root()
        };
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all_at(&[0x5A; 16], root * 4096 + 200).unwrap();
        drop(file);

        let db = Database::open(&path).unwrap();
        let err = db.view(|tx| tx.buckets()).unwrap_err();
        assert!(matches!(err, Error::InvalidPage { reason: "checksum mismatch", .. }));
    }

    #[test]
    fn test_pending_pages_wait_for_readers() {
        let (_dir, path) = test_db_path("pending");
        let options = Options {
            no_sync: true,
            ..Options::default()
        };
        let db = Database::open_with(&path, options).unwrap();
        put(&db, b"b", b"k", b"v1");

        let old_reader = db.read_tx();
        put(&db, b"b", b"k", b"v2");
        put(&db, b"b", b"k", b"v3");
        assert!(db.stats().pending_page_count > 0);
        assert_eq!(db.stats().open_read_tx_count, 1);

        // The old snapshot still reads its own version.
        assert_eq!(
            old_reader.bucket(b"b").unwrap().get(b"k").unwrap(),
            Some(b"v1".to_vec())
        );
        drop(old_reader);

        put(&db, b"b", b"k", b"v4");
        let stats = db.stats();
        assert!(stats.free_page_count > 0);
        assert_eq!(stats.open_read_tx_count, 0);
        db.read_tx().check().unwrap();
    }

    #[test]
    fn test_write_timeout_reports_conflict() {
        let (_dir, path) = test_db_path("conflict");
        let options = Options {
            write_timeout: Some(Duration::from_millis(50)),
            no_sync: true,
            ..Options::default()
        };
        let db = Database::open_with(&path, options).unwrap();
        let _writer = db.write_tx().unwrap();
        let err = db.write_tx().unwrap_err();
        assert!(matches!(err, Error::WriteConflict { waited } if waited == Duration::from_millis(50)));
    }

    #[test]
    fn test_update_rolls_back_on_error() {
        let (_dir, path) = test_db_path("update_err");
        let db = Database::open(&path).unwrap();
        let result: Result<()> = db.update(|tx| {
            tx.create_bucket(b"b")?.put(b"k", b"v")?;
            Err(Error::KeyRequired)
        });
        assert!(matches!(result, Err(Error::KeyRequired)));
        assert!(db.view(|tx| tx.buckets()).unwrap().is_empty());
        assert_eq!(db.stats().rollback_count, 1);
        assert_eq!(db.stats().commit_count, 0);
    }
}
