//! Summary: Options controlling how a database is opened.
//! Copyright (c) YOAB. All rights reserved.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::page::{MAX_PAGE_SIZE, MIN_PAGE_SIZE, PAGE_SIZE};

/// Default fraction of a page filled before a node is split.
pub const DEFAULT_FILL_PERCENT: f64 = 0.5;

/// Configuration for opening a database.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use cachex::{Database, Options};
///
/// let options = Options {
///     lock_timeout: Some(Duration::from_secs(1)),
///     ..Options::default()
/// };
/// let db = Database::open_with("cache.db", options)?;
/// # Ok::<(), cachex::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    /// Page size used when creating a file. Existing files keep the page
    /// size recorded in their meta page.
    pub page_size: usize,
    /// How long to retry the file lock. `None` fails on the first attempt.
    pub lock_timeout: Option<Duration>,
    /// How long `write_tx` waits for the active writer. `None` waits forever.
    pub write_timeout: Option<Duration>,
    /// Fraction of a page filled before splitting, between 0.1 and 1.0.
    pub fill_percent: f64,
    /// Skip fdatasync on commit. Unsafe across power loss; meant for tests.
    pub no_sync: bool,
    /// Open with a shared lock and reject write transactions.
    pub read_only: bool,
    /// Permission bits for a newly created file.
    pub file_mode: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE,
            lock_timeout: None,
            write_timeout: None,
            fill_percent: DEFAULT_FILL_PERCENT,
            no_sync: false,
            read_only: false,
            file_mode: 0o600,
        }
    }
}

impl Options {
    /// Rejects values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two()
            || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size)
        {
            return Err(Error::InvalidOptions {
                reason: "page size must be a power of two between 1 KiB and 64 KiB",
            });
        }
        if !(0.1..=1.0).contains(&self.fill_percent) {
            return Err(Error::InvalidOptions {
                reason: "fill percent must be between 0.1 and 1.0",
            });
        }
        if self.file_mode & !0o777 != 0 {
            return Err(Error::InvalidOptions {
                reason: "file mode must only contain permission bits",
            });
        }
        Ok(())
    }
}
