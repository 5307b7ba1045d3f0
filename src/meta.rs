//! Summary: Double-buffered meta page holding the committed database roots.
//! Copyright (c) YOAB. All rights reserved.
//!
//! Pages 0 and 1 each hold a meta copy. A commit with transaction id `txid`
//! writes slot `txid % 2`, so the previous committed meta is never touched
//! by the write that replaces it. On open, the valid copy with the higher
//! txid wins.

use crate::bucket::BucketHeader;
use crate::page::{
    MAGIC, PAGE_HEADER_SIZE, PageHeader, PageId, PageType, TxId, VERSION, read_u32, read_u64,
};

/// A decoded meta page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meta {
    pub magic: u32,
    pub version: u32,
    pub page_size: u32,
    pub flags: u32,
    /// Header of the root bucket.
    pub root: BucketHeader,
    /// First page of the persisted freelist.
    pub freelist: PageId,
    /// High-water mark: first page id never allocated.
    pub pgid: PageId,
    pub txid: TxId,
    pub checksum: u32,
}

impl Meta {
    /// Encoded size of the meta fields, checksum included.
    pub const SIZE: usize = 60;

    /// Bytes read from the start of a slot to decode a meta.
    pub const READ_LEN: usize = PAGE_HEADER_SIZE + Self::SIZE;

    /// Creates the meta of a freshly initialized file.
    pub fn new(page_size: u32, root: PageId, freelist: PageId, pgid: PageId, txid: TxId) -> Self {
        let mut meta = Self {
            magic: MAGIC,
            version: VERSION,
            page_size,
            flags: 0,
            root: BucketHeader {
                root,
                sequence: 0,
            },
            freelist,
            pgid,
            txid,
            checksum: 0,
        };
        meta.checksum = meta.sum();
        meta
    }

    /// Meta slot (page id) this meta is written to.
    #[inline]
    pub fn slot(&self) -> PageId {
        self.txid % 2
    }

    fn encode_fields(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.page_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.flags.to_le_bytes());
        buf[16..32].copy_from_slice(&self.root.to_bytes());
        buf[32..40].copy_from_slice(&self.freelist.to_le_bytes());
        buf[40..48].copy_from_slice(&self.pgid.to_le_bytes());
        buf[48..56].copy_from_slice(&self.txid.to_le_bytes());
        buf[56..60].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// CRC32 over every field except the checksum itself.
    pub fn sum(&self) -> u32 {
        crc32fast::hash(&self.encode_fields()[..Self::SIZE - 4])
    }

    /// Recomputes the checksum after fields changed.
    pub fn seal(&mut self) {
        self.checksum = self.sum();
    }

    /// Serializes the meta into a full page for its slot.
    pub fn to_page(&self, page_size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; page_size];
        PageHeader {
            id: self.slot(),
            page_type: PageType::Meta as u8,
            count: 0,
            overflow: 0,
            checksum: 0,
        }
        .encode(&mut buf);
        buf[PAGE_HEADER_SIZE..Self::READ_LEN].copy_from_slice(&self.encode_fields());
        buf
    }

    /// Parses a meta from the start of a slot.
    ///
    /// Returns `None` if the buffer is truncated or not a meta page.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::READ_LEN {
            return None;
        }
        let header = PageHeader::decode(buf)?;
        if header.page_type != PageType::Meta as u8 {
            return None;
        }
        let b = &buf[PAGE_HEADER_SIZE..];
        Some(Self {
            magic: read_u32(b, 0),
            version: read_u32(b, 4),
            page_size: read_u32(b, 8),
            flags: read_u32(b, 12),
            root: BucketHeader::from_bytes(&b[16..32])?,
            freelist: read_u64(b, 32),
            pgid: read_u64(b, 40),
            txid: read_u64(b, 48),
            checksum: read_u32(b, 56),
        })
    }

    /// Checks magic, version and checksum.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.magic != MAGIC {
            return Err("magic number mismatch");
        }
        if self.version != VERSION {
            return Err("unsupported format version");
        }
        if self.checksum != self.sum() {
            return Err("checksum mismatch");
        }
        if !(self.page_size as usize).is_power_of_two() {
            return Err("page size is not a power of two");
        }
        Ok(())
    }
}
