//! Summary: Page checksums, sealed in parallel using rayon for large commits.
//! Copyright (c) YOAB. All rights reserved.
//!
//! Every non-meta page carries a CRC32 of its whole span (with the checksum
//! field itself zeroed). Computing these is the only CPU-heavy part of a
//! commit, so large batches of dirty pages are sealed across the rayon pool
//! while the I/O that follows stays sequential.

use rayon::prelude::*;

use crate::page::CHECKSUM_RANGE;

/// Minimum number of pages to trigger parallel sealing.
/// Below this threshold, sequential hashing is faster due to thread overhead.
pub const PARALLEL_THRESHOLD: usize = 64;

/// Computes the checksum of a page span, skipping the checksum field.
#[inline]
pub fn page_checksum(buf: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[..CHECKSUM_RANGE.start]);
    hasher.update(&[0u8; 4]);
    hasher.update(&buf[CHECKSUM_RANGE.end..]);
    hasher.finalize()
}

/// Writes the checksum of `buf` into its header.
#[inline]
pub fn seal_page(buf: &mut [u8]) {
    let sum = page_checksum(buf);
    buf[CHECKSUM_RANGE].copy_from_slice(&sum.to_le_bytes());
}

/// Returns true if the stored checksum matches the page contents.
#[inline]
pub fn verify_page(buf: &[u8]) -> bool {
    if buf.len() < CHECKSUM_RANGE.end {
        return false;
    }
    let stored = u32::from_le_bytes([
        buf[CHECKSUM_RANGE.start],
        buf[CHECKSUM_RANGE.start + 1],
        buf[CHECKSUM_RANGE.start + 2],
        buf[CHECKSUM_RANGE.start + 3],
    ]);
    stored == page_checksum(buf)
}

/// Seals a batch of dirty pages.
///
/// Returns true if the batch was large enough to be sealed in parallel.
pub fn seal_pages(pages: Vec<&mut Vec<u8>>) -> bool {
    if pages.len() < PARALLEL_THRESHOLD {
        for buf in pages {
            seal_page(buf);
        }
        false
    } else {
        pages.into_par_iter().for_each(|buf| seal_page(buf));
        true
    }
}
