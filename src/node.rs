//! Summary: In-memory B+ tree nodes materialized by a write transaction.
//! Copyright (c) YOAB. All rights reserved.
//!
//! A write transaction never edits pages. The first write that reaches a
//! page copies it into a `Node` kept in the transaction's arena; parents
//! and children refer to each other by `NodeId` (arena index), never by
//! pointer. On commit every node is split to fit the page size, written to
//! freshly allocated pages and linked into its parent.

use crate::page::{
    BRANCH_ELEMENT_SIZE, BUCKET_LEAF_FLAG, LEAF_ELEMENT_SIZE, PAGE_HEADER_SIZE, Page, PageHeader,
    PageId, PageType,
};

/// Index of a node inside a write transaction's arena.
pub(crate) type NodeId = usize;

/// Minimum number of keys a split part may hold.
pub(crate) const MIN_KEYS_PER_PAGE: usize = 2;

/// A single entry of a node.
///
/// Leaf entries use `flags`, `key` and `value`; branch entries use `key` and
/// `pgid` (the child page).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct Inode {
    pub flags: u32,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub pgid: PageId,
}

impl Inode {
    #[inline]
    pub fn is_bucket(&self) -> bool {
        self.flags & BUCKET_LEAF_FLAG != 0
    }
}

#[derive(Debug)]
pub(crate) struct Node {
    pub is_leaf: bool,
    /// Page this node was read from, or the page it was last written to.
    pub pgid: PageId,
    /// Overflow of the span at `pgid`, needed to free it.
    pub overflow: u32,
    pub parent: Option<NodeId>,
    /// Key this node is filed under in its parent.
    pub key: Vec<u8>,
    pub inodes: Vec<Inode>,
    /// Materialized children, spilled before this node.
    pub children: Vec<NodeId>,
    pub spilled: bool,
}

impl Node {
    /// Creates an empty leaf that has not been written yet.
    pub fn new_leaf(pgid: PageId) -> Self {
        Self {
            is_leaf: true,
            pgid,
            overflow: 0,
            parent: None,
            key: Vec::new(),
            inodes: Vec::new(),
            children: Vec::new(),
            spilled: false,
        }
    }

    /// Creates an empty branch used as a new root above split siblings.
    pub fn new_branch() -> Self {
        Self {
            is_leaf: false,
            ..Self::new_leaf(0)
        }
    }

    /// Copies a leaf or branch page into a node.
    pub fn read(page: &Page, parent: Option<NodeId>, key: Vec<u8>) -> Self {
        let is_leaf = page.is_leaf();
        let inodes = (0..page.count())
            .map(|i| {
                if is_leaf {
                    let elem = page.leaf_element(i);
                    Inode {
                        flags: elem.flags,
                        key: elem.key.to_vec(),
                        value: elem.value.to_vec(),
                        pgid: 0,
                    }
                } else {
                    let elem = page.branch_element(i);
                    Inode {
                        flags: 0,
                        key: elem.key.to_vec(),
                        value: Vec::new(),
                        pgid: elem.pgid,
                    }
                }
            })
            .collect();
        Self {
            is_leaf,
            pgid: page.id(),
            overflow: page.overflow(),
            parent,
            key,
            inodes,
            children: Vec::new(),
            spilled: false,
        }
    }

    /// Binary search for `key` among the entries.
    #[inline]
    pub fn search(&self, key: &[u8]) -> Result<usize, usize> {
        self.inodes.binary_search_by(|inode| inode.key.as_slice().cmp(key))
    }

    /// Index of the child a branch routes `key` to: the last entry whose key
    /// is `<= key`, or the first entry when `key` sorts before all of them.
    pub fn child_index(&self, key: &[u8]) -> usize {
        match self.search(key) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        }
    }

    /// Inserts or replaces the entry filed under `old_key`, storing it as
    /// `new_key`.
    pub fn put(&mut self, old_key: &[u8], new_key: &[u8], value: Vec<u8>, pgid: PageId, flags: u32) {
        let inode = Inode {
            flags,
            key: new_key.to_vec(),
            value,
            pgid,
        };
        match self.search(old_key) {
            Ok(i) => self.inodes[i] = inode,
            Err(i) => self.inodes.insert(i, inode),
        }
    }

    /// Removes the entry for `key`, returning it if present.
    pub fn del(&mut self, key: &[u8]) -> Option<Inode> {
        match self.search(key) {
            Ok(i) => Some(self.inodes.remove(i)),
            Err(_) => None,
        }
    }

    #[inline]
    fn element_size(&self) -> usize {
        if self.is_leaf {
            LEAF_ELEMENT_SIZE
        } else {
            BRANCH_ELEMENT_SIZE
        }
    }

    #[inline]
    fn inode_size(is_leaf: bool, inode: &Inode) -> usize {
        if is_leaf {
            LEAF_ELEMENT_SIZE + inode.key.len() + inode.value.len()
        } else {
            BRANCH_ELEMENT_SIZE + inode.key.len()
        }
    }

    /// Serialized size of the node in bytes.
    pub fn size(&self) -> usize {
        PAGE_HEADER_SIZE
            + self
                .inodes
                .iter()
                .map(|inode| Self::inode_size(self.is_leaf, inode))
                .sum::<usize>()
    }

    /// Splits the entries into parts that each fit a page.
    ///
    /// Nothing is split unless the node exceeds `page_size`. When it does,
    /// parts are cut once they would pass `page_size * fill_percent`, each
    /// part keeps at least `MIN_KEYS_PER_PAGE` entries, and a single entry
    /// larger than a page stays alone in an overflow span.
    pub fn split_inodes(&mut self, page_size: usize, fill_percent: f64) -> Vec<Vec<Inode>> {
        let inodes = std::mem::take(&mut self.inodes);
        if inodes.len() <= MIN_KEYS_PER_PAGE * 2 || self.size_of(&inodes) <= page_size {
            return vec![inodes];
        }

        let threshold = ((page_size as f64) * fill_percent) as usize;
        let threshold = threshold.max(PAGE_HEADER_SIZE + self.element_size());
        let total = inodes.len();
        let mut parts = Vec::new();
        let mut current = Vec::new();
        let mut size = PAGE_HEADER_SIZE;

        for (i, inode) in inodes.into_iter().enumerate() {
            let elsize = Self::inode_size(self.is_leaf, &inode);
            let remaining = total - i;
            if current.len() >= MIN_KEYS_PER_PAGE
                && remaining >= MIN_KEYS_PER_PAGE
                && size + elsize > threshold
            {
                parts.push(std::mem::take(&mut current));
                size = PAGE_HEADER_SIZE;
            }
            size += elsize;
            current.push(inode);
        }
        parts.push(current);
        parts
    }

    fn size_of(&self, inodes: &[Inode]) -> usize {
        PAGE_HEADER_SIZE
            + inodes
                .iter()
                .map(|inode| Self::inode_size(self.is_leaf, inode))
                .sum::<usize>()
    }

    /// Serializes the node into a page span of `overflow + 1` pages at `id`.
    /// The checksum is left for sealing.
    pub fn write(&self, id: PageId, page_size: usize) -> Vec<u8> {
        let size = self.size();
        let pages = size.div_ceil(page_size).max(1);
        let mut buf = vec![0u8; pages * page_size];
        let page_type = if self.is_leaf {
            PageType::Leaf
        } else {
            PageType::Branch
        };
        PageHeader {
            id,
            page_type: page_type as u8,
            count: self.inodes.len() as u16,
            overflow: (pages - 1) as u32,
            checksum: 0,
        }
        .encode(&mut buf);

        let elem_size = self.element_size();
        let mut data = PAGE_HEADER_SIZE + self.inodes.len() * elem_size;
        for (i, inode) in self.inodes.iter().enumerate() {
            let off = PAGE_HEADER_SIZE + i * elem_size;
            if self.is_leaf {
                buf[off..off + 4].copy_from_slice(&inode.flags.to_le_bytes());
                buf[off + 4..off + 8].copy_from_slice(&(data as u32).to_le_bytes());
                buf[off + 8..off + 12].copy_from_slice(&(inode.key.len() as u32).to_le_bytes());
                buf[off + 12..off + 16]
                    .copy_from_slice(&(inode.value.len() as u32).to_le_bytes());
            } else {
                buf[off..off + 4].copy_from_slice(&(data as u32).to_le_bytes());
                buf[off + 4..off + 8].copy_from_slice(&(inode.key.len() as u32).to_le_bytes());
                buf[off + 8..off + 16].copy_from_slice(&inode.pgid.to_le_bytes());
            }
            buf[data..data + inode.key.len()].copy_from_slice(&inode.key);
            data += inode.key.len();
            if self.is_leaf {
                buf[data..data + inode.value.len()].copy_from_slice(&inode.value);
                data += inode.value.len();
            }
        }
        buf
    }
}
