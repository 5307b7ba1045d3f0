//! Summary: Read and write transaction types.
//! Copyright (c) YOAB. All rights reserved.
//!
//! A `ReadTx` pins one committed meta and reads pages through it; nothing
//! it can reach is overwritten while it is open. A `WriteTx` holds the
//! single writer lock, copies the pages it touches into an arena of
//! `Node`s and, on commit, writes every changed node to newly allocated
//! pages before publishing a new meta.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::MutexGuard;
use tracing::{debug, warn};

use crate::bucket::{self, Bucket, BucketHeader, BucketMut};
use crate::check;
use crate::checksum;
use crate::cursor::TreeView;
use crate::db::{Database, WriterState};
use crate::error::{Error, Result};
use crate::meta::Meta;
use crate::node::{Node, NodeId};
use crate::page::{BUCKET_LEAF_FLAG, Page, PageId, PageType, TxId};

/// A read-only transaction.
///
/// Provides a consistent snapshot view of the database at the time
/// the transaction was started. Read transactions never block other
/// read transactions or the writer.
///
/// # Lifetime
///
/// The transaction holds a reference to the database and must not
/// outlive it.
pub struct ReadTx<'db> {
    db: &'db Database,
    meta: Meta,
}

impl<'db> ReadTx<'db> {
    /// Creates a read transaction over an already registered snapshot.
    pub(crate) fn new(db: &'db Database, meta: Meta) -> Self {
        Self { db, meta }
    }

    /// Transaction id of the snapshot.
    pub fn id(&self) -> TxId {
        self.meta.txid
    }

    /// The root bucket, which holds the top-level buckets.
    pub fn root(&self) -> Bucket<'_> {
        Bucket::new(self, self.meta.root)
    }

    /// Opens the top-level bucket `name`.
    pub fn bucket(&self, name: &[u8]) -> Result<Bucket<'_>> {
        self.root().bucket(name)
    }

    /// Names of the top-level buckets, in ascending order.
    pub fn buckets(&self) -> Result<Vec<Vec<u8>>> {
        self.root().buckets()
    }

    /// Verifies the structure of the snapshot.
    ///
    /// Every page below the high-water mark must be a meta page, part of
    /// the freelist span, free, or reachable from the root exactly once;
    /// keys must ascend within every bucket.
    pub fn check(&self) -> Result<()> {
        check::check_snapshot(self, &self.meta, self.db.page_size())
    }
}

impl TreeView for ReadTx<'_> {
    fn page(&self, id: PageId) -> Result<Arc<Page>> {
        if id >= self.meta.pgid {
            return Err(Error::Corrupted {
                context: "reading page",
                details: format!("page {id} is beyond the high-water mark {}", self.meta.pgid),
            });
        }
        self.db.read_page(id)
    }
}

impl std::fmt::Debug for ReadTx<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadTx").field("txid", &self.meta.txid).finish()
    }
}

impl Drop for ReadTx<'_> {
    fn drop(&mut self) {
        self.db.release_reader(self.meta.txid);
    }
}

/// Index of a bucket opened inside a write transaction.
pub(crate) type BucketId = usize;

const ROOT_BUCKET: BucketId = 0;

/// How `open_bucket` treats an existing or missing bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpenPolicy {
    Existing,
    Create,
    CreateIfMissing,
}

/// A bucket touched by a write transaction.
#[derive(Debug)]
struct BucketState {
    name: Vec<u8>,
    parent: Option<BucketId>,
    depth: usize,
    header: BucketHeader,
    /// Materialized root node, once something below it was touched.
    root_node: Option<NodeId>,
    deleted: bool,
}

/// A read-write transaction.
///
/// Provides exclusive write access to the database. Changes are not
/// visible to other transactions until `commit()` is called; dropping the
/// transaction without committing rolls it back.
///
/// # Lifetime
///
/// The transaction holds the database's writer lock for its whole life.
/// Only one write transaction can exist at a time.
pub struct WriteTx<'db> {
    db: &'db Database,
    state: MutexGuard<'db, WriterState>,
    /// Meta being built; `txid` is already the new transaction id.
    meta: Meta,
    nodes: Vec<Node>,
    page_nodes: HashMap<PageId, NodeId>,
    buckets: Vec<BucketState>,
    bucket_index: HashMap<(BucketId, Vec<u8>), BucketId>,
    /// Serialized pages waiting to be written, keyed by first page id.
    dirty: BTreeMap<PageId, Vec<u8>>,
    /// Spans taken from the free set, returned to it on rollback.
    allocated: Vec<(PageId, usize)>,
    done: bool,
}

impl<'db> WriteTx<'db> {
    /// Creates a write transaction on top of the committed `meta`.
    pub(crate) fn new(db: &'db Database, state: MutexGuard<'db, WriterState>, mut meta: Meta) -> Self {
        meta.txid += 1;
        let root = BucketState {
            name: Vec::new(),
            parent: None,
            depth: 0,
            header: meta.root,
            root_node: None,
            deleted: false,
        };
        Self {
            db,
            state,
            meta,
            nodes: Vec::new(),
            page_nodes: HashMap::new(),
            buckets: vec![root],
            bucket_index: HashMap::new(),
            dirty: BTreeMap::new(),
            allocated: Vec::new(),
            done: false,
        }
    }

    /// Id this transaction commits as.
    pub fn id(&self) -> TxId {
        self.meta.txid
    }

    /// The root bucket, which holds the top-level buckets.
    pub fn root(&mut self) -> BucketMut<'_, 'db> {
        BucketMut::new(self, ROOT_BUCKET)
    }

    /// Read view of the top-level bucket `name`, including uncommitted writes.
    pub fn bucket(&self, name: &[u8]) -> Result<Bucket<'_>> {
        self.bucket_view(ROOT_BUCKET).bucket(name)
    }

    /// Names of the top-level buckets, in ascending order.
    pub fn buckets(&self) -> Result<Vec<Vec<u8>>> {
        self.bucket_view(ROOT_BUCKET).buckets()
    }

    /// Opens the existing top-level bucket `name` for writing.
    pub fn bucket_mut(&mut self, name: &[u8]) -> Result<BucketMut<'_, 'db>> {
        let id = self.open_bucket(ROOT_BUCKET, name, OpenPolicy::Existing)?;
        Ok(BucketMut::new(self, id))
    }

    /// Creates the top-level bucket `name`; fails if it already exists.
    pub fn create_bucket(&mut self, name: &[u8]) -> Result<BucketMut<'_, 'db>> {
        let id = self.open_bucket(ROOT_BUCKET, name, OpenPolicy::Create)?;
        Ok(BucketMut::new(self, id))
    }

    /// Opens the top-level bucket `name`, creating it when missing.
    pub fn create_bucket_if_not_exists(&mut self, name: &[u8]) -> Result<BucketMut<'_, 'db>> {
        let id = self.open_bucket(ROOT_BUCKET, name, OpenPolicy::CreateIfMissing)?;
        Ok(BucketMut::new(self, id))
    }

    /// Deletes the top-level bucket `name` and everything below it.
    pub fn delete_bucket(&mut self, name: &[u8]) -> Result<()> {
        self.delete_bucket_in(ROOT_BUCKET, name)
    }

    /// Commits the transaction, persisting all changes.
    ///
    /// Data pages are written and synced before the meta page, so a crash
    /// at any point leaves either the previous or the new state.
    ///
    /// # Errors
    ///
    /// Returns `TxCommitFailed` wrapping the underlying error. The
    /// transaction is rolled back and the previous state stays current.
    pub fn commit(mut self) -> Result<()> {
        let result = self.commit_inner();
        self.done = true;
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(txid = self.meta.txid, error = %e, "commit failed, rolling back");
                self.release_allocations();
                self.db.note_rollback();
                Err(Error::TxCommitFailed {
                    reason: format!("transaction {} could not be persisted", self.meta.txid),
                    source: Box::new(e),
                })
            }
        }
    }

    /// Discards every change made by the transaction.
    pub fn rollback(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if !self.done {
            self.done = true;
            self.release_allocations();
            self.db.note_rollback();
            debug!(txid = self.meta.txid, "write transaction rolled back");
        }
    }

    fn release_allocations(&mut self) {
        for (id, count) in self.allocated.drain(..) {
            self.state.freelist.restore(id, count);
        }
        self.state.freelist.rollback(self.meta.txid);
    }

    fn commit_inner(&mut self) -> Result<()> {
        let page_size = self.db.page_size();
        self.spill()?;

        let old = self.page(self.meta.freelist)?;
        self.free(old.id(), old.overflow());
        let pages = self.state.freelist.page_count(page_size);
        let freelist_id = self.allocate(pages)?;
        let buf = self.state.freelist.to_page(freelist_id, pages, page_size);
        self.dirty.insert(freelist_id, buf);
        self.meta.freelist = freelist_id;

        let parallel = checksum::seal_pages(self.dirty.values_mut().collect());
        debug!(
            txid = self.meta.txid,
            pages = self.dirty.len(),
            parallel,
            high_water = self.meta.pgid,
            "writing dirty pages"
        );
        for (&id, buf) in &self.dirty {
            self.db.write_span(id, buf)?;
        }
        self.db.sync("flushing data pages")?;

        #[cfg(any(test, feature = "failpoint"))]
        self.db.check_failpoint(crate::db::Failpoint::BeforeMetaWrite)?;

        self.meta.seal();
        self.db.write_meta(&self.meta)?;
        self.db.publish(self.meta, &self.state.freelist);
        debug!(txid = self.meta.txid, "committed");
        Ok(())
    }

    // ==================== Bucket plumbing ====================

    pub(crate) fn bucket_view(&self, id: BucketId) -> Bucket<'_> {
        Bucket::new(self, self.buckets[id].header)
    }

    pub(crate) fn bucket_name(&self, id: BucketId) -> &[u8] {
        &self.buckets[id].name
    }

    pub(crate) fn bucket_sequence(&self, id: BucketId) -> u64 {
        self.buckets[id].header.sequence
    }

    /// Looks up the entry stored exactly under `key` in a bucket.
    fn find(&self, bucket: BucketId, key: &[u8]) -> Result<Option<crate::cursor::Entry>> {
        let entry = self.bucket_view(bucket).cursor().seek(key)?;
        Ok(entry.filter(|e| e.key == key))
    }

    pub(crate) fn open_bucket(
        &mut self,
        parent: BucketId,
        name: &[u8],
        policy: OpenPolicy,
    ) -> Result<BucketId> {
        bucket::validate_bucket_name(name)?;
        if let Some(&id) = self.bucket_index.get(&(parent, name.to_vec())) {
            return match policy {
                OpenPolicy::Create => Err(Error::BucketAlreadyExists {
                    name: name.to_vec(),
                }),
                _ => Ok(id),
            };
        }

        match self.find(parent, name)? {
            Some(entry) if !entry.is_bucket() => Err(Error::IncompatibleValue { key: entry.key }),
            Some(_) if policy == OpenPolicy::Create => Err(Error::BucketAlreadyExists {
                name: name.to_vec(),
            }),
            Some(entry) => {
                let header = BucketHeader::from_bytes(&entry.value).ok_or_else(|| {
                    Error::Corrupted {
                        context: "opening bucket",
                        details: format!("truncated header for {:?}", String::from_utf8_lossy(name)),
                    }
                })?;
                Ok(self.register_bucket(parent, name, header, None))
            }
            None if policy == OpenPolicy::Existing => Err(Error::BucketNotFound {
                name: name.to_vec(),
            }),
            None => {
                let pgid = self.allocate(1)?;
                let node = self.push_node(Node::new_leaf(pgid));
                self.page_nodes.insert(pgid, node);
                let header = BucketHeader {
                    root: pgid,
                    sequence: 0,
                };
                let leaf = self.leaf_for(parent, name)?;
                self.nodes[leaf].put(name, name, header.to_bytes().to_vec(), 0, BUCKET_LEAF_FLAG);
                debug!(name = %String::from_utf8_lossy(name), "created bucket");
                Ok(self.register_bucket(parent, name, header, Some(node)))
            }
        }
    }

    fn register_bucket(
        &mut self,
        parent: BucketId,
        name: &[u8],
        header: BucketHeader,
        root_node: Option<NodeId>,
    ) -> BucketId {
        let id = self.buckets.len();
        self.buckets.push(BucketState {
            name: name.to_vec(),
            parent: Some(parent),
            depth: self.buckets[parent].depth + 1,
            header,
            root_node,
            deleted: false,
        });
        self.bucket_index.insert((parent, name.to_vec()), id);
        id
    }

    pub(crate) fn delete_bucket_in(&mut self, parent: BucketId, name: &[u8]) -> Result<()> {
        bucket::validate_bucket_name(name)?;
        let header = match self.find(parent, name)? {
            None => {
                return Err(Error::BucketNotFound {
                    name: name.to_vec(),
                });
            }
            Some(entry) if !entry.is_bucket() => {
                return Err(Error::IncompatibleValue { key: entry.key });
            }
            Some(entry) => BucketHeader::from_bytes(&entry.value).ok_or(Error::Corrupted {
                context: "deleting bucket",
                details: "truncated bucket header".into(),
            })?,
        };

        self.free_tree(header.root)?;
        if let Some(id) = self.bucket_index.remove(&(parent, name.to_vec())) {
            for other in 0..self.buckets.len() {
                if self.descends_from(other, id) {
                    self.buckets[other].deleted = true;
                }
            }
            let buckets = &self.buckets;
            self.bucket_index.retain(|_, b| !buckets[*b].deleted);
        }

        let leaf = self.leaf_for(parent, name)?;
        self.nodes[leaf].del(name);
        debug!(name = %String::from_utf8_lossy(name), "deleted bucket");
        Ok(())
    }

    fn descends_from(&self, mut bucket: BucketId, ancestor: BucketId) -> bool {
        loop {
            if bucket == ancestor {
                return true;
            }
            match self.buckets[bucket].parent {
                Some(parent) => bucket = parent,
                None => return false,
            }
        }
    }

    /// Frees every page of the tree rooted at `root`, nested buckets included.
    fn free_tree(&mut self, root: PageId) -> Result<()> {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let overflow = if let Some(&node_id) = self.page_nodes.get(&id) {
                let node = &self.nodes[node_id];
                for inode in &node.inodes {
                    if !node.is_leaf {
                        stack.push(inode.pgid);
                    } else if inode.is_bucket() {
                        stack.extend(BucketHeader::from_bytes(&inode.value).map(|h| h.root));
                    }
                }
                node.overflow
            } else {
                let page = self.page(id)?;
                for i in 0..page.count() {
                    match page.page_type() {
                        PageType::Branch => stack.push(page.branch_element(i).pgid),
                        PageType::Leaf => {
                            let elem = page.leaf_element(i);
                            if elem.is_bucket() {
                                stack.extend(BucketHeader::from_bytes(elem.value).map(|h| h.root));
                            }
                        }
                        _ => {
                            return Err(Error::InvalidPage {
                                id,
                                reason: "expected a branch or leaf page",
                            });
                        }
                    }
                }
                page.overflow()
            };
            self.free(id, overflow);
        }
        Ok(())
    }

    pub(crate) fn put(&mut self, bucket: BucketId, key: &[u8], value: &[u8]) -> Result<()> {
        bucket::validate_entry(key, Some(value))?;
        let leaf = self.leaf_for(bucket, key)?;
        let node = &mut self.nodes[leaf];
        if let Ok(i) = node.search(key) {
            if node.inodes[i].is_bucket() {
                return Err(Error::IncompatibleValue { key: key.to_vec() });
            }
        }
        node.put(key, key, value.to_vec(), 0, 0);
        Ok(())
    }

    pub(crate) fn delete(&mut self, bucket: BucketId, key: &[u8]) -> Result<()> {
        bucket::validate_entry(key, None)?;
        match self.find(bucket, key)? {
            None => return Ok(()),
            Some(entry) if entry.is_bucket() => {
                return Err(Error::IncompatibleValue { key: entry.key });
            }
            Some(_) => {}
        }
        let leaf = self.leaf_for(bucket, key)?;
        self.nodes[leaf].del(key);
        Ok(())
    }

    pub(crate) fn next_sequence(&mut self, bucket: BucketId) -> Result<u64> {
        // Materializing the root makes the commit rewrite the header.
        self.root_node(bucket)?;
        let header = &mut self.buckets[bucket].header;
        header.sequence += 1;
        Ok(header.sequence)
    }

    // ==================== Node arena ====================

    fn push_node(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    fn materialize(&mut self, pgid: PageId, parent: Option<NodeId>, key: Vec<u8>) -> Result<NodeId> {
        let page = self.page(pgid)?;
        if !matches!(page.page_type(), PageType::Branch | PageType::Leaf) {
            return Err(Error::InvalidPage {
                id: pgid,
                reason: "expected a branch or leaf page",
            });
        }
        let id = self.push_node(Node::read(&page, parent, key));
        self.page_nodes.insert(pgid, id);
        if let Some(parent) = parent {
            self.nodes[parent].children.push(id);
        }
        Ok(id)
    }

    fn root_node(&mut self, bucket: BucketId) -> Result<NodeId> {
        if let Some(id) = self.buckets[bucket].root_node {
            return Ok(id);
        }
        let pgid = self.buckets[bucket].header.root;
        let id = match self.page_nodes.get(&pgid) {
            Some(&id) => id,
            None => self.materialize(pgid, None, Vec::new())?,
        };
        self.buckets[bucket].root_node = Some(id);
        Ok(id)
    }

    fn child_at(&mut self, parent: NodeId, index: usize) -> Result<NodeId> {
        let inode = &self.nodes[parent].inodes[index];
        if let Some(&id) = self.page_nodes.get(&inode.pgid) {
            return Ok(id);
        }
        let (pgid, key) = (inode.pgid, inode.key.clone());
        self.materialize(pgid, Some(parent), key)
    }

    /// Materializes the path from the bucket root to the leaf owning `key`.
    fn leaf_for(&mut self, bucket: BucketId, key: &[u8]) -> Result<NodeId> {
        let mut id = self.root_node(bucket)?;
        while !self.nodes[id].is_leaf {
            if self.nodes[id].inodes.is_empty() {
                return Err(Error::Corrupted {
                    context: "descending tree",
                    details: format!("empty branch node at page {}", self.nodes[id].pgid),
                });
            }
            let index = self.nodes[id].child_index(key);
            id = self.child_at(id, index)?;
        }
        Ok(id)
    }

    // ==================== Allocation ====================

    /// Allocates `count` contiguous pages, reusing free pages first.
    fn allocate(&mut self, count: usize) -> Result<PageId> {
        if let Some(id) = self.state.freelist.allocate(count) {
            self.allocated.push((id, count));
            return Ok(id);
        }
        let id = self.meta.pgid;
        self.meta.pgid = id
            .checked_add(count as u64)
            .ok_or_else(|| Error::Corrupted {
                context: "allocating pages",
                details: "page id space exhausted".into(),
            })?;
        Ok(id)
    }

    fn free(&mut self, id: PageId, overflow: u32) {
        self.state.freelist.free(self.meta.txid, id, overflow);
    }

    // ==================== Spill ====================

    /// Writes every materialized node to new pages, deepest buckets first,
    /// and records the new bucket roots in their parents and the meta.
    fn spill(&mut self) -> Result<()> {
        let mut order: Vec<BucketId> = (0..self.buckets.len())
            .filter(|&b| !self.buckets[b].deleted)
            .collect();
        order.sort_by(|a, b| self.buckets[*b].depth.cmp(&self.buckets[*a].depth));

        for bucket in order {
            let Some(root) = self.buckets[bucket].root_node else {
                continue;
            };
            self.spill_node(root)?;
            let mut top = root;
            while let Some(parent) = self.nodes[top].parent {
                top = parent;
            }
            self.buckets[bucket].root_node = Some(top);
            self.buckets[bucket].header.root = self.nodes[top].pgid;

            if let Some(parent) = self.buckets[bucket].parent {
                let name = self.buckets[bucket].name.clone();
                let value = self.buckets[bucket].header.to_bytes().to_vec();
                let leaf = self.leaf_for(parent, &name)?;
                self.nodes[leaf].put(&name, &name, value, 0, BUCKET_LEAF_FLAG);
            }
        }
        self.meta.root = self.buckets[ROOT_BUCKET].header;
        Ok(())
    }

    fn spill_node(&mut self, id: NodeId) -> Result<()> {
        if self.nodes[id].spilled {
            return Ok(());
        }
        let mut children = std::mem::take(&mut self.nodes[id].children);
        children.sort_by(|a, b| self.nodes[*a].key.cmp(&self.nodes[*b].key));
        for child in children {
            self.spill_node(child)?;
        }

        let parent = self.nodes[id].parent;
        if self.nodes[id].inodes.is_empty() {
            match parent {
                Some(parent) => {
                    self.free_node_page(id);
                    let key = std::mem::take(&mut self.nodes[id].key);
                    self.nodes[parent].del(&key);
                    self.nodes[id].spilled = true;
                    return Ok(());
                }
                None => self.nodes[id].is_leaf = true,
            }
        }

        let page_size = self.db.page_size();
        let parts = self.nodes[id].split_inodes(page_size, self.db.fill_percent());
        let is_leaf = self.nodes[id].is_leaf;
        let mut siblings = Vec::with_capacity(parts.len());
        for (i, inodes) in parts.into_iter().enumerate() {
            if i == 0 {
                self.nodes[id].inodes = inodes;
                siblings.push(id);
            } else {
                let mut node = if is_leaf {
                    Node::new_leaf(0)
                } else {
                    Node::new_branch()
                };
                node.parent = parent;
                node.inodes = inodes;
                siblings.push(self.push_node(node));
            }
        }

        let mut new_root = None;
        let parent = match parent {
            Some(parent) => Some(parent),
            None if siblings.len() > 1 => {
                let root = self.push_node(Node::new_branch());
                for &sibling in &siblings {
                    self.nodes[sibling].parent = Some(root);
                }
                new_root = Some(root);
                Some(root)
            }
            None => None,
        };

        for &node_id in &siblings {
            self.free_node_page(node_id);
            let pages = self.nodes[node_id].size().div_ceil(page_size).max(1);
            let pgid = self.allocate(pages)?;
            let buf = self.nodes[node_id].write(pgid, page_size);
            self.dirty.insert(pgid, buf);

            let node = &mut self.nodes[node_id];
            node.pgid = pgid;
            node.overflow = (pages - 1) as u32;
            node.spilled = true;
            if let Some(parent) = parent {
                let first = node.inodes.first().map(|i| i.key.clone()).unwrap_or_default();
                let old = if node.key.is_empty() {
                    first.clone()
                } else {
                    std::mem::take(&mut node.key)
                };
                node.key = first.clone();
                self.nodes[parent].put(&old, &first, Vec::new(), pgid, 0);
            }
        }

        if let Some(root) = new_root {
            self.spill_node(root)?;
        }
        Ok(())
    }

    fn free_node_page(&mut self, id: NodeId) {
        let (pgid, overflow) = (self.nodes[id].pgid, self.nodes[id].overflow);
        if pgid > 1 {
            self.free(pgid, overflow);
            self.nodes[id].pgid = 0;
        }
    }
}

impl TreeView for WriteTx<'_> {
    fn page(&self, id: PageId) -> Result<Arc<Page>> {
        if id >= self.meta.pgid {
            return Err(Error::Corrupted {
                context: "reading page",
                details: format!("page {id} is beyond the high-water mark {}", self.meta.pgid),
            });
        }
        self.db.read_page(id)
    }

    fn materialized(&self, id: PageId) -> Option<&Node> {
        self.page_nodes.get(&id).map(|&n| &self.nodes[n])
    }
}

impl std::fmt::Debug for WriteTx<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTx")
            .field("txid", &self.meta.txid)
            .field("nodes", &self.nodes.len())
            .field("buckets", &self.buckets.len())
            .field("done", &self.done)
            .finish()
    }
}

impl Drop for WriteTx<'_> {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use crate::db::Database;
    use crate::error::Error;
    use crate::options::Options;
    use tempfile::TempDir;

    fn test_db() -> (TempDir, Database) {
        let dir = tempfile::tempdir().expect("temp dir");
        let options = Options {
            no_sync: true,
            ..Options::default()
        };
        let db = Database::open_with(dir.path().join("tx.db"), options).expect("open");
        (dir, db)
    }

    // ==================== ReadTx Tests ====================

    #[test]
    fn test_read_tx_empty_db() {
        let (_dir, db) = test_db();
        let rtx = db.read_tx();
        assert!(rtx.buckets().unwrap().is_empty());
        assert!(matches!(rtx.bucket(b"nope"), Err(Error::BucketNotFound { .. })));
        rtx.check().unwrap();
    }

    #[test]
    fn test_read_tx_sees_committed_bucket() {
        let (_dir, db) = test_db();
        let mut wtx = db.write_tx().unwrap();
        wtx.create_bucket(b"users").unwrap().put(b"alice", b"1").unwrap();
        wtx.commit().unwrap();

        let rtx = db.read_tx();
        let bucket = rtx.bucket(b"users").unwrap();
        assert_eq!(bucket.get(b"alice").unwrap(), Some(b"1".to_vec()));
        assert_eq!(bucket.get(b"bob").unwrap(), None);
        rtx.check().unwrap();
    }

    // ==================== WriteTx Tests ====================

    #[test]
    fn test_write_tx_reads_own_writes() {
        let (_dir, db) = test_db();
        let mut wtx = db.write_tx().unwrap();
        {
            let mut bucket = wtx.create_bucket(b"b").unwrap();
            bucket.put(b"k1", b"v1").unwrap();
            assert_eq!(bucket.get(b"k1").unwrap(), Some(b"v1".to_vec()));
            bucket.put(b"k1", b"v2").unwrap();
            assert_eq!(bucket.get(b"k1").unwrap(), Some(b"v2".to_vec()));
        }
        assert_eq!(
            wtx.bucket(b"b").unwrap().get(b"k1").unwrap(),
            Some(b"v2".to_vec())
        );
    }

    #[test]
    fn test_write_tx_rollback_on_drop() {
        let (_dir, db) = test_db();
        {
            let mut wtx = db.write_tx().unwrap();
            wtx.create_bucket(b"b").unwrap().put(b"k", b"v").unwrap();
        }
        let rtx = db.read_tx();
        assert!(rtx.bucket(b"b").is_err());
        assert_eq!(db.stats().rollback_count, 1);
        rtx.check().unwrap();
    }

    #[test]
    fn test_write_tx_rollback_restores_allocations() {
        let (_dir, db) = test_db();
        let mut wtx = db.write_tx().unwrap();
        wtx.create_bucket(b"b").unwrap().put(b"k", b"v").unwrap();
        wtx.commit().unwrap();

        let before = db.stats();
        let mut wtx = db.write_tx().unwrap();
        wtx.bucket_mut(b"b").unwrap().put(b"k2", b"v2").unwrap();
        wtx.rollback();
        let after = db.stats();
        assert_eq!(before.high_water, after.high_water);
        db.read_tx().check().unwrap();
    }

    #[test]
    fn test_create_bucket_twice_fails() {
        let (_dir, db) = test_db();
        let mut wtx = db.write_tx().unwrap();
        wtx.create_bucket(b"b").unwrap();
        assert!(matches!(
            wtx.create_bucket(b"b"),
            Err(Error::BucketAlreadyExists { .. })
        ));
        wtx.create_bucket_if_not_exists(b"b").unwrap();
        wtx.commit().unwrap();

        let mut wtx = db.write_tx().unwrap();
        assert!(matches!(
            wtx.create_bucket(b"b"),
            Err(Error::BucketAlreadyExists { .. })
        ));
    }

    #[test]
    fn test_put_rejects_bad_keys() {
        let (_dir, db) = test_db();
        let mut wtx = db.write_tx().unwrap();
        let mut bucket = wtx.create_bucket(b"b").unwrap();
        assert!(matches!(bucket.put(b"", b"v"), Err(Error::KeyRequired)));
        let huge = vec![0u8; crate::bucket::MAX_KEY_SIZE + 1];
        assert!(matches!(bucket.put(&huge, b"v"), Err(Error::KeyTooLarge { .. })));
    }

    #[test]
    fn test_bucket_and_value_do_not_mix() {
        let (_dir, db) = test_db();
        let mut wtx = db.write_tx().unwrap();
        let mut parent = wtx.create_bucket(b"p").unwrap();
        parent.put(b"plain", b"v").unwrap();
        parent.create_bucket(b"child").unwrap();

        assert!(matches!(
            parent.put(b"child", b"v"),
            Err(Error::IncompatibleValue { .. })
        ));
        assert!(matches!(
            parent.delete(b"child"),
            Err(Error::IncompatibleValue { .. })
        ));
        assert!(matches!(
            parent.create_bucket(b"plain"),
            Err(Error::IncompatibleValue { .. })
        ));
        assert!(matches!(
            parent.delete_bucket(b"plain"),
            Err(Error::IncompatibleValue { .. })
        ));
        assert_eq!(parent.get(b"child").unwrap(), None);
    }

    #[test]
    fn test_delete_missing_key_is_ok() {
        let (_dir, db) = test_db();
        let mut wtx = db.write_tx().unwrap();
        let mut bucket = wtx.create_bucket(b"b").unwrap();
        bucket.delete(b"ghost").unwrap();
        bucket.put(b"k", b"v").unwrap();
        bucket.delete(b"k").unwrap();
        bucket.delete(b"k").unwrap();
        assert_eq!(bucket.get(b"k").unwrap(), None);
        wtx.commit().unwrap();
        db.read_tx().check().unwrap();
    }

    #[test]
    fn test_nested_buckets_persist() {
        let (_dir, db) = test_db();
        let mut wtx = db.write_tx().unwrap();
        {
            let mut outer = wtx.create_bucket(b"outer").unwrap();
            outer.put(b"a", b"1").unwrap();
            let mut inner = outer.create_bucket(b"inner").unwrap();
            inner.put(b"deep", b"2").unwrap();
        }
        wtx.commit().unwrap();

        let rtx = db.read_tx();
        let outer = rtx.bucket(b"outer").unwrap();
        assert_eq!(outer.buckets().unwrap(), vec![b"inner".to_vec()]);
        let keys: Vec<_> = outer.keys().map(|k| k.unwrap()).collect();
        assert_eq!(keys, vec![b"a".to_vec()]);
        let inner = outer.bucket(b"inner").unwrap();
        assert_eq!(inner.get(b"deep").unwrap(), Some(b"2".to_vec()));
        rtx.check().unwrap();
    }

    #[test]
    fn test_delete_bucket_frees_pages() {
        let (_dir, db) = test_db();
        let mut wtx = db.write_tx().unwrap();
        {
            let mut bucket = wtx.create_bucket(b"big").unwrap();
            for i in 0..2000u32 {
                bucket.put(format!("key{i:06}").as_bytes(), &[7u8; 64]).unwrap();
            }
            bucket.create_bucket(b"nested").unwrap().put(b"x", b"y").unwrap();
        }
        wtx.commit().unwrap();
        db.read_tx().check().unwrap();

        let mut wtx = db.write_tx().unwrap();
        wtx.delete_bucket(b"big").unwrap();
        assert!(matches!(wtx.bucket(b"big"), Err(Error::BucketNotFound { .. })));
        wtx.commit().unwrap();

        let rtx = db.read_tx();
        assert!(rtx.buckets().unwrap().is_empty());
        rtx.check().unwrap();
        assert!(db.stats().free_page_count + db.stats().pending_page_count > 30);
    }

    #[test]
    fn test_delete_nested_bucket() {
        let (_dir, db) = test_db();
        let mut wtx = db.write_tx().unwrap();
        {
            let mut outer = wtx.create_bucket(b"outer").unwrap();
            outer.put(b"keep", b"1").unwrap();
            let mut inner = outer.create_bucket(b"inner").unwrap();
            for i in 0..500u32 {
                inner.put(format!("k{i:04}").as_bytes(), &[3u8; 32]).unwrap();
            }
        }
        wtx.commit().unwrap();

        let mut wtx = db.write_tx().unwrap();
        {
            let mut outer = wtx.bucket_mut(b"outer").unwrap();
            outer.delete_bucket(b"inner").unwrap();
            assert!(matches!(
                outer.bucket_mut(b"inner"),
                Err(Error::BucketNotFound { .. })
            ));
            assert!(matches!(
                outer.delete_bucket(b"inner"),
                Err(Error::BucketNotFound { .. })
            ));
        }
        wtx.commit().unwrap();

        let rtx = db.read_tx();
        let outer = rtx.bucket(b"outer").unwrap();
        assert!(outer.buckets().unwrap().is_empty());
        assert_eq!(outer.get(b"keep").unwrap(), Some(b"1".to_vec()));
        rtx.check().unwrap();
    }

    #[test]
    fn test_write_tx_debug() {
        let (_dir, db) = test_db();
        let wtx = db.write_tx().unwrap();
        assert!(format!("{wtx:?}").contains("txid: 2"));
        drop(wtx);
        assert!(format!("{:?}", db.read_tx()).contains("txid: 1"));
    }

    #[test]
    fn test_delete_then_recreate_bucket_same_tx() {
        let (_dir, db) = test_db();
        let mut wtx = db.write_tx().unwrap();
        wtx.create_bucket(b"b").unwrap().put(b"old", b"1").unwrap();
        wtx.delete_bucket(b"b").unwrap();
        wtx.create_bucket(b"b").unwrap().put(b"new", b"2").unwrap();
        wtx.commit().unwrap();

        let rtx = db.read_tx();
        let bucket = rtx.bucket(b"b").unwrap();
        assert_eq!(bucket.get(b"old").unwrap(), None);
        assert_eq!(bucket.get(b"new").unwrap(), Some(b"2".to_vec()));
        rtx.check().unwrap();
    }

    #[test]
    fn test_sequence_survives_commit() {
        let (_dir, db) = test_db();
        let mut wtx = db.write_tx().unwrap();
        {
            let mut bucket = wtx.create_bucket(b"seq").unwrap();
            assert_eq!(bucket.next_sequence().unwrap(), 1);
            assert_eq!(bucket.next_sequence().unwrap(), 2);
        }
        wtx.commit().unwrap();

        let mut wtx = db.write_tx().unwrap();
        assert_eq!(wtx.bucket_mut(b"seq").unwrap().next_sequence().unwrap(), 3);
        wtx.commit().unwrap();
        assert_eq!(db.read_tx().bucket(b"seq").unwrap().sequence(), 3);
    }

    #[test]
    fn test_split_and_shrink_keep_structure_valid() {
        let (_dir, db) = test_db();
        let mut wtx = db.write_tx().unwrap();
        {
            let mut bucket = wtx.create_bucket(b"b").unwrap();
            for i in 0..5000u32 {
                bucket.put(format!("{i:08}").as_bytes(), format!("value-{i}").as_bytes()).unwrap();
            }
        }
        wtx.commit().unwrap();
        db.read_tx().check().unwrap();

        let mut wtx = db.write_tx().unwrap();
        {
            let mut bucket = wtx.bucket_mut(b"b").unwrap();
            for i in (0..5000u32).filter(|i| i % 10 != 0) {
                bucket.delete(format!("{i:08}").as_bytes()).unwrap();
            }
        }
        wtx.commit().unwrap();

        let rtx = db.read_tx();
        rtx.check().unwrap();
        let keys: Vec<_> = rtx.bucket(b"b").unwrap().keys().map(|k| k.unwrap()).collect();
        assert_eq!(keys.len(), 500);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_large_value_uses_overflow_pages() {
        let (_dir, db) = test_db();
        let value = vec![0xAB; 3 * 4096 + 17];
        let mut wtx = db.write_tx().unwrap();
        wtx.create_bucket(b"b").unwrap().put(b"blob", &value).unwrap();
        wtx.commit().unwrap();

        let rtx = db.read_tx();
        assert_eq!(rtx.bucket(b"b").unwrap().get(b"blob").unwrap(), Some(value));
        rtx.check().unwrap();
    }
}
