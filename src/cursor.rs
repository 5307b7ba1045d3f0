//! Summary: Ordered traversal of a bucket's B+ tree.
//! Copyright (c) YOAB. All rights reserved.
//!
//! A cursor keeps a stack of (node, index) pairs from the bucket root to
//! the current leaf. Nodes are either pages read from the transaction's
//! snapshot or, inside a write transaction, nodes already copied into the
//! transaction's arena, so a writer sees its own uncommitted changes.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::node::Node;
use crate::page::{BUCKET_LEAF_FLAG, Page, PageId, PageType};

/// Source of pages for a cursor: a read snapshot or a write transaction.
pub(crate) trait TreeView {
    /// Reads a page of the transaction's snapshot.
    fn page(&self, id: PageId) -> Result<Arc<Page>>;

    /// Returns the in-memory copy of a page if the transaction made one.
    fn materialized(&self, _id: PageId) -> Option<&Node> {
        None
    }
}

/// A key/value entry produced by a cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    /// The value, or the encoded bucket header for nested buckets.
    pub value: Vec<u8>,
    flags: u32,
}

impl Entry {
    /// Returns true if this entry is a nested bucket.
    #[inline]
    pub fn is_bucket(&self) -> bool {
        self.flags & BUCKET_LEAF_FLAG != 0
    }
}

#[derive(Clone)]
enum NodeRef<'a> {
    Page(Arc<Page>),
    Node(&'a Node),
}

impl NodeRef<'_> {
    fn is_leaf(&self) -> bool {
        match self {
            NodeRef::Page(p) => p.is_leaf(),
            NodeRef::Node(n) => n.is_leaf,
        }
    }

    fn count(&self) -> usize {
        match self {
            NodeRef::Page(p) => p.count(),
            NodeRef::Node(n) => n.inodes.len(),
        }
    }

    fn key(&self, index: usize) -> &[u8] {
        match self {
            NodeRef::Page(p) => p.key_at(index),
            NodeRef::Node(n) => &n.inodes[index].key,
        }
    }

    fn child(&self, index: usize) -> PageId {
        match self {
            NodeRef::Page(p) => p.branch_element(index).pgid,
            NodeRef::Node(n) => n.inodes[index].pgid,
        }
    }

    fn entry(&self, index: usize) -> Entry {
        match self {
            NodeRef::Page(p) => {
                let elem = p.leaf_element(index);
                Entry {
                    key: elem.key.to_vec(),
                    value: elem.value.to_vec(),
                    flags: elem.flags,
                }
            }
            NodeRef::Node(n) => {
                let inode = &n.inodes[index];
                Entry {
                    key: inode.key.clone(),
                    value: inode.value.clone(),
                    flags: inode.flags,
                }
            }
        }
    }

    /// Index of the first key `>= key`, and whether it is an exact match.
    fn lower_bound(&self, key: &[u8]) -> (usize, bool) {
        let (mut lo, mut hi) = (0, self.count());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.key(mid).cmp(key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Equal => return (mid, true),
                Ordering::Greater => hi = mid,
            }
        }
        (lo, false)
    }

    /// Child index a branch routes `key` to.
    fn route(&self, key: &[u8]) -> usize {
        match self.lower_bound(key) {
            (i, true) => i,
            (i, false) => i.saturating_sub(1),
        }
    }
}

struct ElemRef<'a> {
    node: NodeRef<'a>,
    index: usize,
}

/// A cursor over one bucket, valid for the lifetime of its transaction.
///
/// Entries come out in ascending byte order of their keys.
pub struct Cursor<'a> {
    view: &'a dyn TreeView,
    root: PageId,
    stack: Vec<ElemRef<'a>>,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(view: &'a dyn TreeView, root: PageId) -> Self {
        Self {
            view,
            root,
            stack: Vec::new(),
        }
    }

    fn load(&self, id: PageId) -> Result<NodeRef<'a>> {
        let view = self.view;
        if let Some(node) = view.materialized(id) {
            return Ok(NodeRef::Node(node));
        }
        let page = view.page(id)?;
        match page.page_type() {
            PageType::Branch | PageType::Leaf => Ok(NodeRef::Page(page)),
            _ => Err(Error::InvalidPage {
                id,
                reason: "expected a branch or leaf page",
            }),
        }
    }

    /// Moves to the first entry of the bucket.
    pub fn first(&mut self) -> Result<Option<Entry>> {
        self.stack.clear();
        let root = self.load(self.root)?;
        self.stack.push(ElemRef {
            node: root,
            index: 0,
        });
        self.descend_first()?;
        self.settle()
    }

    /// Moves to the first entry whose key is `>= key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<Option<Entry>> {
        self.stack.clear();
        let mut node = self.load(self.root)?;
        loop {
            if node.is_leaf() {
                let (index, _) = node.lower_bound(key);
                self.stack.push(ElemRef { node, index });
                break;
            }
            if node.count() == 0 {
                return Err(Error::Corrupted {
                    context: "seeking",
                    details: "empty branch node".into(),
                });
            }
            let index = node.route(key);
            let child = node.child(index);
            self.stack.push(ElemRef { node, index });
            node = self.load(child)?;
        }
        self.settle()
    }

    /// Moves to the next entry.
    ///
    /// Returns `None` at the end of the bucket or on an unpositioned cursor.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<Entry>> {
        match self.stack.last_mut() {
            Some(top) => top.index += 1,
            None => return Ok(None),
        }
        self.settle()
    }

    /// Follows index 0 down from the top of the stack to a leaf.
    fn descend_first(&mut self) -> Result<()> {
        loop {
            let (child, is_leaf) = match self.stack.last() {
                Some(top) if top.node.is_leaf() => (0, true),
                Some(top) if top.index < top.node.count() => (top.node.child(top.index), false),
                Some(_) => {
                    return Err(Error::Corrupted {
                        context: "iterating",
                        details: "empty branch node".into(),
                    });
                }
                None => return Ok(()),
            };
            if is_leaf {
                return Ok(());
            }
            let node = self.load(child)?;
            self.stack.push(ElemRef { node, index: 0 });
        }
    }

    /// Returns the entry under the cursor, stepping into following leaves
    /// when the current one is exhausted.
    fn settle(&mut self) -> Result<Option<Entry>> {
        loop {
            match self.stack.last() {
                None => return Ok(None),
                Some(top) if top.index < top.node.count() => {
                    return Ok(Some(top.node.entry(top.index)));
                }
                Some(_) => {}
            }
            if !self.next_leaf()? {
                return Ok(None);
            }
        }
    }

    /// Pops the exhausted leaf and moves to the first entry of the next one.
    fn next_leaf(&mut self) -> Result<bool> {
        self.stack.pop();
        loop {
            match self.stack.last_mut() {
                None => return Ok(false),
                Some(top) if top.index + 1 < top.node.count() => {
                    top.index += 1;
                    break;
                }
                Some(_) => {
                    self.stack.pop();
                }
            }
        }
        self.descend_first()?;
        Ok(true)
    }
}

/// Lazy iterator over the key/value pairs whose key starts with a prefix.
///
/// Nested bucket entries are skipped. Iteration stops at the first key
/// without the prefix or at the first error.
pub struct PrefixIter<'a> {
    cursor: Cursor<'a>,
    prefix: Vec<u8>,
    started: bool,
    done: bool,
}

impl<'a> PrefixIter<'a> {
    pub(crate) fn new(cursor: Cursor<'a>, prefix: &[u8]) -> Self {
        Self {
            cursor,
            prefix: prefix.to_vec(),
            started: false,
            done: false,
        }
    }
}

impl Iterator for PrefixIter<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let step = if self.started {
                self.cursor.next()
            } else {
                self.started = true;
                self.cursor.seek(&self.prefix)
            };
            match step {
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
                Ok(Some(entry)) if entry.key.starts_with(&self.prefix) => {
                    if !entry.is_bucket() {
                        return Some(Ok((entry.key, entry.value)));
                    }
                }
                Ok(_) => self.done = true,
            }
        }
        None
    }
}

/// Lazy iterator over every key of a bucket, nested buckets excluded.
pub struct Keys<'a>(PrefixIter<'a>);

impl<'a> Keys<'a> {
    pub(crate) fn new(cursor: Cursor<'a>) -> Self {
        Self(PrefixIter::new(cursor, b""))
    }
}

impl Iterator for Keys<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|item| item.map(|(key, _)| key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum;
    use crate::page::PAGE_SIZE;
    use std::collections::HashMap;

    /// In-memory page store for driving a cursor without a file.
    #[derive(Default)]
    struct MemView {
        pages: HashMap<PageId, Arc<Page>>,
    }

    impl MemView {
        fn add(&mut self, id: PageId, node: &Node) {
            let mut buf = node.write(id, PAGE_SIZE);
            checksum::seal_page(&mut buf);
            let page = Page::from_bytes(buf, id).expect("valid page");
            self.pages.insert(id, Arc::new(page));
        }
    }

    impl TreeView for MemView {
        fn page(&self, id: PageId) -> Result<Arc<Page>> {
            self.pages.get(&id).cloned().ok_or(Error::InvalidPage {
                id,
                reason: "missing",
            })
        }
    }

    fn leaf(keys: &[&str]) -> Node {
        let mut node = Node::new_leaf(0);
        for k in keys {
            node.put(k.as_bytes(), k.as_bytes(), format!("v-{k}").into_bytes(), 0, 0);
        }
        node
    }

    /// Root branch 1 -> leaves 2, 3, 4 (4 is empty).
    fn two_level() -> MemView {
        let mut view = MemView::default();
        view.add(2, &leaf(&["apple", "apricot", "banana"]));
        view.add(3, &leaf(&["cherry", "date"]));
        view.add(4, &leaf(&[]));
        let mut root = Node::new_branch();
        root.put(b"apple", b"apple", Vec::new(), 2, 0);
        root.put(b"cherry", b"cherry", Vec::new(), 3, 0);
        root.put(b"zzz", b"zzz", Vec::new(), 4, 0);
        view.add(1, &root);
        view
    }

    fn collect_keys(cursor: &mut Cursor<'_>) -> Vec<String> {
        let mut out = Vec::new();
        let mut item = cursor.first().unwrap();
        while let Some(entry) = item {
            out.push(String::from_utf8(entry.key).unwrap());
            item = cursor.next().unwrap();
        }
        out
    }

    #[test]
    fn test_first_next_across_leaves() {
        let view = two_level();
        let mut cursor = Cursor::new(&view, 1);
        assert_eq!(
            collect_keys(&mut cursor),
            vec!["apple", "apricot", "banana", "cherry", "date"]
        );
        // Exhausted cursor stays exhausted.
        assert_eq!(cursor.next().unwrap(), None);
    }

    #[test]
    fn test_seek_exact_and_between() {
        let view = two_level();
        let mut cursor = Cursor::new(&view, 1);

        let hit = cursor.seek(b"banana").unwrap().unwrap();
        assert_eq!(hit.key, b"banana");
        assert_eq!(hit.value, b"v-banana");

        // Between leaves: continues into the next leaf.
        let next = cursor.seek(b"bz").unwrap().unwrap();
        assert_eq!(next.key, b"cherry");

        // Before everything.
        assert_eq!(cursor.seek(b"a").unwrap().unwrap().key, b"apple");

        // Past the end, including an empty trailing leaf.
        assert_eq!(cursor.seek(b"e").unwrap(), None);
    }

    #[test]
    fn test_empty_root_leaf() {
        let mut view = MemView::default();
        view.add(7, &leaf(&[]));
        let mut cursor = Cursor::new(&view, 7);
        assert_eq!(cursor.first().unwrap(), None);
        assert_eq!(cursor.seek(b"x").unwrap(), None);
    }

    #[test]
    fn test_prefix_iter() {
        let view = two_level();
        let found: Vec<_> = PrefixIter::new(Cursor::new(&view, 1), b"ap")
            .map(|r| String::from_utf8(r.unwrap().0).unwrap())
            .collect();
        assert_eq!(found, vec!["apple", "apricot"]);

        let none: Vec<_> = PrefixIter::new(Cursor::new(&view, 1), b"kiwi").collect();
        assert!(none.is_empty());
    }

    #[test]
    fn test_prefix_iter_skips_buckets() {
        let mut view = MemView::default();
        let mut node = leaf(&["a1", "a3"]);
        node.put(b"a2", b"a2", vec![0u8; 16], 0, BUCKET_LEAF_FLAG);
        view.add(2, &node);
        let found: Vec<_> = Keys::new(Cursor::new(&view, 2))
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(found, vec![b"a1".to_vec(), b"a3".to_vec()]);
    }

    #[test]
    fn test_missing_page_surfaces_error() {
        let view = MemView::default();
        let mut iter = PrefixIter::new(Cursor::new(&view, 42), b"");
        assert!(matches!(iter.next(), Some(Err(Error::InvalidPage { id: 42, .. }))));
        assert!(iter.next().is_none());
    }
}
