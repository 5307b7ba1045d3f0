//! Summary: Page layout, encoding, and helper utilities.
//! Copyright (c) YOAB. All rights reserved.
//!
//! Every page starts with a fixed 24-byte header:
//!
//! ```text
//! [0..8]    id (u64)
//! [8]       page type (u8)
//! [9]       reserved
//! [10..12]  element count (u16)
//! [12..16]  overflow (u32) - extra contiguous pages in this span
//! [16..20]  checksum (u32) - CRC32 of the span with this field zeroed
//! [20..24]  reserved
//! ```
//!
//! Branch and leaf pages follow the header with `count` fixed-size element
//! descriptors, then the packed key and value bytes they point at.

#[cfg(not(feature = "no_checksum"))]
use crate::checksum;
use crate::error::{Error, Result};

/// Default page size in bytes (4KB).
pub const PAGE_SIZE: usize = 4096;

/// Smallest page size accepted by `Options`.
pub const MIN_PAGE_SIZE: usize = 1024;

/// Largest page size accepted by `Options`.
pub const MAX_PAGE_SIZE: usize = 64 * 1024;

/// Magic number to identify cachex database files.
pub const MAGIC: u32 = 0x43_48_45_58; // "CHEX" in ASCII

/// Current database file format version.
pub const VERSION: u32 = 1;

/// Size of the common page header.
pub const PAGE_HEADER_SIZE: usize = 24;

/// Size of one leaf element descriptor.
pub const LEAF_ELEMENT_SIZE: usize = 16;

/// Size of one branch element descriptor.
pub const BRANCH_ELEMENT_SIZE: usize = 16;

/// Leaf element flag marking a nested bucket entry.
pub const BUCKET_LEAF_FLAG: u32 = 0x01;

/// Byte range of the checksum field inside the header.
pub(crate) const CHECKSUM_RANGE: std::ops::Range<usize> = 16..20;

/// Upper bound on a single page span, guards allocation on corrupted headers.
const MAX_SPAN_BYTES: usize = u32::MAX as usize;

/// Page identifier type.
pub type PageId = u64;

/// Transaction identifier type.
pub type TxId = u64;

/// Page types used in the database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    /// Meta page containing database metadata.
    Meta = 1,
    /// Freelist page tracking free pages.
    Freelist = 2,
    /// Branch page (internal B+ tree node).
    Branch = 3,
    /// Leaf page (B+ tree leaf with key-value pairs).
    Leaf = 4,
}

impl PageType {
    /// Converts a raw header byte to a page type.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(PageType::Meta),
            2 => Some(PageType::Freelist),
            3 => Some(PageType::Branch),
            4 => Some(PageType::Leaf),
            _ => None,
        }
    }
}

/// Decoded fixed page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageHeader {
    pub id: PageId,
    pub page_type: u8,
    pub count: u16,
    pub overflow: u32,
    pub checksum: u32,
}

impl PageHeader {
    /// Decodes the header from the first bytes of a page.
    ///
    /// Returns `None` if the buffer is shorter than a header.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < PAGE_HEADER_SIZE {
            return None;
        }
        Some(Self {
            id: read_u64(buf, 0),
            page_type: buf[8],
            count: u16::from_le_bytes([buf[10], buf[11]]),
            overflow: read_u32(buf, 12),
            checksum: read_u32(buf, 16),
        })
    }

    /// Writes the header into the first bytes of `buf`. The checksum field is
    /// left zeroed; it is filled in when the page is sealed.
    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.id.to_le_bytes());
        buf[8] = self.page_type;
        buf[9] = 0;
        buf[10..12].copy_from_slice(&self.count.to_le_bytes());
        buf[12..16].copy_from_slice(&self.overflow.to_le_bytes());
        buf[CHECKSUM_RANGE].copy_from_slice(&0u32.to_le_bytes());
        buf[20..24].copy_from_slice(&0u32.to_le_bytes());
    }
}

/// Returns the number of bytes a span of `overflow + 1` pages occupies.
#[inline]
pub(crate) fn span_len(overflow: u32, page_size: usize) -> usize {
    (overflow as usize + 1) * page_size
}

/// Returns the overflow recorded in a raw header, validating the span size.
pub(crate) fn overflow_of(id: PageId, buf: &[u8], page_size: usize) -> Result<u32> {
    let header = PageHeader::decode(buf).ok_or(Error::InvalidPage {
        id,
        reason: "page shorter than header",
    })?;
    if span_len(header.overflow, page_size) > MAX_SPAN_BYTES {
        return Err(Error::InvalidPage {
            id,
            reason: "overflow count exceeds maximum span",
        });
    }
    Ok(header.overflow)
}

/// A leaf element borrowed from a page.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LeafElement<'a> {
    pub flags: u32,
    pub key: &'a [u8],
    pub value: &'a [u8],
}

impl LeafElement<'_> {
    #[inline]
    pub fn is_bucket(&self) -> bool {
        self.flags & BUCKET_LEAF_FLAG != 0
    }
}

/// A branch element borrowed from a page.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BranchElement<'a> {
    pub key: &'a [u8],
    pub pgid: PageId,
}

/// An owned, validated page span read from disk.
///
/// Construction checks the header id, the page type, the checksum and that
/// every element descriptor points inside the buffer, so the accessors
/// below never index out of bounds.
#[derive(Debug)]
pub struct Page {
    buf: Vec<u8>,
    header: PageHeader,
    page_type: PageType,
}

impl Page {
    /// Validates a raw page span read at `id`.
    pub(crate) fn from_bytes(buf: Vec<u8>, id: PageId) -> Result<Self> {
        let header = PageHeader::decode(&buf).ok_or(Error::InvalidPage {
            id,
            reason: "page shorter than header",
        })?;
        if header.id != id {
            return Err(Error::InvalidPage {
                id,
                reason: "page id in header does not match location",
            });
        }
        let page_type = PageType::from_u8(header.page_type).ok_or(Error::InvalidPage {
            id,
            reason: "unknown page type",
        })?;

        #[cfg(not(feature = "no_checksum"))]
        if page_type != PageType::Meta && !checksum::verify_page(&buf) {
            return Err(Error::InvalidPage {
                id,
                reason: "checksum mismatch",
            });
        }

        let page = Self {
            buf,
            header,
            page_type,
        };
        page.validate_elements()?;
        Ok(page)
    }

    fn validate_elements(&self) -> Result<()> {
        let count = self.header.count as usize;
        let elem_size = match self.page_type {
            PageType::Leaf => LEAF_ELEMENT_SIZE,
            PageType::Branch => BRANCH_ELEMENT_SIZE,
            PageType::Meta | PageType::Freelist => return Ok(()),
        };
        let invalid = |reason| Error::InvalidPage {
            id: self.header.id,
            reason,
        };
        if PAGE_HEADER_SIZE + count * elem_size > self.buf.len() {
            return Err(invalid("element table exceeds page span"));
        }
        for i in 0..count {
            let off = PAGE_HEADER_SIZE + i * elem_size;
            let (pos, data_len) = match self.page_type {
                PageType::Leaf => {
                    let pos = read_u32(&self.buf, off + 4) as usize;
                    let ksize = read_u32(&self.buf, off + 8) as usize;
                    let vsize = read_u32(&self.buf, off + 12) as usize;
                    (pos, ksize + vsize)
                }
                _ => {
                    let pos = read_u32(&self.buf, off) as usize;
                    let ksize = read_u32(&self.buf, off + 4) as usize;
                    (pos, ksize)
                }
            };
            if pos < PAGE_HEADER_SIZE || pos.saturating_add(data_len) > self.buf.len() {
                return Err(invalid("element data out of bounds"));
            }
        }
        Ok(())
    }

    /// Returns the page id.
    #[inline]
    pub fn id(&self) -> PageId {
        self.header.id
    }

    /// Returns the page type.
    #[inline]
    pub fn page_type(&self) -> PageType {
        self.page_type
    }

    /// Returns the number of elements.
    #[inline]
    pub fn count(&self) -> usize {
        self.header.count as usize
    }

    /// Returns the number of extra pages in this span.
    #[inline]
    pub fn overflow(&self) -> u32 {
        self.header.overflow
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.page_type == PageType::Leaf
    }

    /// Bytes after the header.
    #[inline]
    pub(crate) fn body(&self) -> &[u8] {
        &self.buf[PAGE_HEADER_SIZE..]
    }

    /// Returns leaf element `index`. Caller guarantees a leaf page and
    /// `index < count()`.
    pub(crate) fn leaf_element(&self, index: usize) -> LeafElement<'_> {
        let off = PAGE_HEADER_SIZE + index * LEAF_ELEMENT_SIZE;
        let flags = read_u32(&self.buf, off);
        let pos = read_u32(&self.buf, off + 4) as usize;
        let ksize = read_u32(&self.buf, off + 8) as usize;
        let vsize = read_u32(&self.buf, off + 12) as usize;
        LeafElement {
            flags,
            key: &self.buf[pos..pos + ksize],
            value: &self.buf[pos + ksize..pos + ksize + vsize],
        }
    }

    /// Returns branch element `index`. Caller guarantees a branch page and
    /// `index < count()`.
    pub(crate) fn branch_element(&self, index: usize) -> BranchElement<'_> {
        let off = PAGE_HEADER_SIZE + index * BRANCH_ELEMENT_SIZE;
        let pos = read_u32(&self.buf, off) as usize;
        let ksize = read_u32(&self.buf, off + 4) as usize;
        let pgid = read_u64(&self.buf, off + 8);
        BranchElement {
            key: &self.buf[pos..pos + ksize],
            pgid,
        }
    }

    /// Key of element `index` regardless of page kind.
    #[inline]
    pub(crate) fn key_at(&self, index: usize) -> &[u8] {
        if self.is_leaf() {
            self.leaf_element(index).key
        } else {
            self.branch_element(index).key
        }
    }
}

#[inline]
pub(crate) fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

#[inline]
pub(crate) fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(bytes)
}
