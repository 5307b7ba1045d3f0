//! Summary: Page allocation and free page tracking.
//! Copyright (c) YOAB. All rights reserved.
//!
//! The freelist tracks pages no longer referenced by the latest committed
//! tree. Pages freed by a write transaction first become *pending*: an
//! older read snapshot may still reach them. They move to the free set once
//! every open reader started after the freeing transaction.

use std::collections::{BTreeMap, BTreeSet};

use crate::page::{PAGE_HEADER_SIZE, Page, PageHeader, PageId, PageType, TxId};

/// A freelist for tracking available (freed) pages.
///
/// # Implementation
///
/// Uses a `BTreeSet` for the free ids so that contiguous runs can be found
/// by walking them in order, and a `BTreeMap` of pending ids keyed by the
/// transaction that freed them so release is a prefix split.
#[derive(Debug, Clone, Default)]
pub struct FreeList {
    /// Pages free in the committed state.
    ids: BTreeSet<PageId>,
    /// Pages freed by a transaction, still visible to older snapshots.
    pending: BTreeMap<TxId, Vec<PageId>>,
}

impl FreeList {
    /// Creates a new empty freelist.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if there are no free or pending pages.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.pending.is_empty()
    }

    /// Number of immediately reusable pages.
    pub fn free_count(&self) -> usize {
        self.ids.len()
    }

    /// Number of pages waiting for readers to finish.
    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Total free and pending pages.
    pub fn count(&self) -> usize {
        self.free_count() + self.pending_count()
    }

    /// Allocates `n` contiguous pages from the free set.
    ///
    /// Returns the first id of the lowest run that fits, or `None` when no
    /// run is long enough and the caller has to grow the file.
    pub fn allocate(&mut self, n: usize) -> Option<PageId> {
        if n == 0 {
            return None;
        }
        let n = n as u64;
        let mut start: Option<PageId> = None;
        let mut prev: PageId = 0;
        let mut found = None;
        for &id in &self.ids {
            match start {
                Some(_) if id == prev + 1 => {}
                _ => start = Some(id),
            }
            prev = id;
            if let Some(s) = start {
                if id - s + 1 == n {
                    found = Some(s);
                    break;
                }
            }
        }
        let first = found?;
        for id in first..first + n {
            self.ids.remove(&id);
        }
        Some(first)
    }

    /// Marks the span `id..=id + overflow` as freed by `txid`.
    pub fn free(&mut self, txid: TxId, id: PageId, overflow: u32) {
        debug_assert!(id > 1, "meta pages are never freed");
        let pending = self.pending.entry(txid).or_default();
        for page in id..=id + overflow as u64 {
            debug_assert!(!self.ids.contains(&page), "page {page} freed twice");
            pending.push(page);
        }
    }

    /// Moves pages freed by transactions `<= txid` into the free set.
    pub fn release(&mut self, txid: TxId) {
        let keep = self.pending.split_off(&txid.saturating_add(1));
        let released = std::mem::replace(&mut self.pending, keep);
        for (_, pages) in released {
            self.ids.extend(pages);
        }
    }

    /// Forgets the pages freed by an abandoned transaction; they remain in use.
    pub fn rollback(&mut self, txid: TxId) {
        self.pending.remove(&txid);
    }

    /// Returns a span taken by `allocate` back to the free set.
    pub fn restore(&mut self, id: PageId, n: usize) {
        self.ids.extend(id..id + n as u64);
    }

    /// Checks if a page is free or pending.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.ids.contains(&page_id) || self.pending.values().any(|p| p.contains(&page_id))
    }

    /// Returns every free and pending id in ascending order.
    pub fn all_ids(&self) -> Vec<PageId> {
        let mut all: Vec<PageId> = self
            .ids
            .iter()
            .copied()
            .chain(self.pending.values().flatten().copied())
            .collect();
        all.sort_unstable();
        all
    }

    /// Serialized size in bytes.
    pub fn size(&self) -> usize {
        8 + self.count() * 8
    }

    /// Serializes the freelist to bytes.
    ///
    /// Pending pages are written as free: after a reopen no snapshot older
    /// than the committed one can exist.
    ///
    /// Format:
    /// - 8 bytes: count (u64 little-endian)
    /// - count * 8 bytes: page IDs (u64 little-endian each), ascending
    pub fn to_bytes(&self) -> Vec<u8> {
        let all = self.all_ids();
        let mut buf = Vec::with_capacity(8 + all.len() * 8);
        buf.extend_from_slice(&(all.len() as u64).to_le_bytes());
        for page_id in all {
            buf.extend_from_slice(&page_id.to_le_bytes());
        }
        buf
    }

    /// Number of pages the serialized freelist occupies.
    pub fn page_count(&self, page_size: usize) -> usize {
        (PAGE_HEADER_SIZE + self.size()).div_ceil(page_size)
    }

    /// Serializes the freelist into a span of `pages` pages at `id`.
    ///
    /// `pages` may exceed what the contents need: the span is sized before
    /// allocating it, which can only shrink the list. The checksum is left
    /// for sealing.
    pub fn to_page(&self, id: PageId, pages: usize, page_size: usize) -> Vec<u8> {
        let body = self.to_bytes();
        let pages = pages.max((PAGE_HEADER_SIZE + body.len()).div_ceil(page_size));
        let mut buf = vec![0u8; pages * page_size];
        PageHeader {
            id,
            page_type: PageType::Freelist as u8,
            count: 0,
            overflow: (pages - 1) as u32,
            checksum: 0,
        }
        .encode(&mut buf);
        buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + body.len()].copy_from_slice(&body);
        buf
    }

    /// Decodes the freelist stored in a freelist page.
    pub fn from_page(page: &Page) -> Option<Self> {
        if page.page_type() != PageType::Freelist {
            return None;
        }
        Self::from_bytes(page.body())
    }

    /// Deserializes a freelist from bytes.
    ///
    /// Returns `None` if the data is corrupted or truncated.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < 8 {
            return None;
        }

        let count = u64::from_le_bytes(buf[0..8].try_into().ok()?) as usize;

        // Validate buffer has enough data.
        let expected_len = count.checked_mul(8)?.checked_add(8)?;
        if buf.len() < expected_len {
            return None;
        }

        let mut ids = BTreeSet::new();
        for i in 0..count {
            let offset = 8 + i * 8;
            let page_id = u64::from_le_bytes(buf[offset..offset + 8].try_into().ok()?);
            ids.insert(page_id);
        }

        Some(Self {
            ids,
            pending: BTreeMap::new(),
        })
    }
}
