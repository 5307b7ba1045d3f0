//! Summary: Structural consistency check of a committed snapshot.
//! Copyright (c) YOAB. All rights reserved.

use std::collections::HashSet;

use crate::bucket::BucketHeader;
use crate::cursor::{Cursor, TreeView};
use crate::error::{Error, Result};
use crate::freelist::FreeList;
use crate::meta::Meta;
use crate::page::{PageId, PageType};

fn corrupted(details: String) -> Error {
    Error::Corrupted {
        context: "checking consistency",
        details,
    }
}

/// Marks the span `id..=id + overflow` as used, failing on double use.
fn mark(used: &mut HashSet<PageId>, id: PageId, overflow: u32, pgid: PageId) -> Result<()> {
    for page in id..=id + u64::from(overflow) {
        if page >= pgid {
            return Err(corrupted(format!(
                "page {page} is beyond the high-water mark {pgid}"
            )));
        }
        if !used.insert(page) {
            return Err(corrupted(format!("page {page} is referenced twice")));
        }
    }
    Ok(())
}

/// Walks the snapshot described by `meta` and verifies page accounting and
/// key order.
pub(crate) fn check_snapshot(view: &dyn TreeView, meta: &Meta, page_size: usize) -> Result<()> {
    let pgid = meta.pgid;
    let mut used: HashSet<PageId> = HashSet::from([0, 1]);

    let freelist_page = view.page(meta.freelist)?;
    let freelist = FreeList::from_page(&freelist_page)
        .ok_or_else(|| corrupted(format!("page {} is not a freelist", meta.freelist)))?;
    mark(&mut used, meta.freelist, freelist_page.overflow(), pgid)?;
    let free: HashSet<PageId> = freelist.all_ids().into_iter().collect();

    let mut roots = vec![meta.root.root];
    let mut stack = vec![meta.root.root];
    while let Some(id) = stack.pop() {
        if free.contains(&id) {
            return Err(corrupted(format!("reachable page {id} is on the freelist")));
        }
        let page = view.page(id)?;
        mark(&mut used, id, page.overflow(), pgid)?;
        for i in 0..page.count() {
            if i > 0 && page.key_at(i - 1) >= page.key_at(i) {
                return Err(corrupted(format!("keys out of order in page {id}")));
            }
            match page.page_type() {
                PageType::Branch => stack.push(page.branch_element(i).pgid),
                PageType::Leaf => {
                    let elem = page.leaf_element(i);
                    if elem.is_bucket() {
                        let header = BucketHeader::from_bytes(elem.value).ok_or_else(|| {
                            corrupted(format!("truncated bucket header in page {id}"))
                        })?;
                        roots.push(header.root);
                        stack.push(header.root);
                    }
                }
                _ => return Err(corrupted(format!("page {id} is not a tree page"))),
            }
        }
    }

    for id in &free {
        if *id >= pgid {
            return Err(corrupted(format!("free page {id} is beyond the high-water mark")));
        }
        if used.contains(id) {
            return Err(corrupted(format!("free page {id} is also in use")));
        }
    }
    if let Some(lost) = (0..pgid).find(|id| !used.contains(id) && !free.contains(id)) {
        return Err(corrupted(format!("page {lost} is neither reachable nor free")));
    }

    for root in roots {
        let mut cursor = Cursor::new(view, root);
        let mut prev: Option<Vec<u8>> = None;
        let mut item = cursor.first()?;
        while let Some(entry) = item {
            if prev.as_ref().is_some_and(|p| *p >= entry.key) {
                return Err(corrupted(format!("keys out of order in bucket rooted at {root}")));
            }
            prev = Some(entry.key);
            item = cursor.next()?;
        }
    }

    tracing::debug!(txid = meta.txid, pages = pgid, page_size, "consistency check passed");
    Ok(())
}
