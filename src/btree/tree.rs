use std::sync::Arc;

use log::{debug, trace};

use crate::{
    btree::node::{Node, NO_NEXT_LEAF},
    buffer_pool::BufferManager,
    error::{ErrorKind, SmallError},
    page::{Page, PageID},
    types::{RecordID, StorageResult},
};

/// A clustered primary-key B+ tree: `i32` key -> [`RecordID`] pointing
/// into the owning table's heap file. Page 0 of the index file is a
/// header page holding only the root's page number; every other page
/// is a leaf or internal node. `max_keys` bounds a node's fanout before
/// it splits -- it is a constructor parameter rather than a compile
/// time constant so tests can force small trees.
pub struct BPlusTree {
    file_id: u32,
    buffer_pool: Arc<BufferManager>,
    max_keys: usize,
}

const HEADER_PAGE_NO: u32 = 0;

impl BPlusTree {
    pub fn new(buffer_pool: Arc<BufferManager>, file_id: u32, max_keys: usize) -> StorageResult<Self> {
        let tree = Self {
            file_id,
            buffer_pool,
            max_keys,
        };
        tree.bootstrap()?;
        Ok(tree)
    }

    fn pid(&self, page_no: u32) -> PageID {
        PageID::new(self.file_id, page_no)
    }

    fn bootstrap(&self) -> StorageResult<()> {
        if self.buffer_pool.page_count(self.file_id)? > 0 {
            return Ok(());
        }

        let header_guard = self.buffer_pool.allocate_page(self.file_id)?;
        debug_assert_eq!(header_guard.id.page_no, HEADER_PAGE_NO);

        let root_guard = self.buffer_pool.allocate_page(self.file_id)?;
        let root_page_no = root_guard.id.page_no;
        {
            let mut page = root_guard.write();
            Node::new_leaf().encode(&mut page)?;
        }

        {
            let mut header = header_guard.write();
            write_root_pointer(&mut header, root_page_no);
        }

        debug!("bootstrapped B+ tree index (file {}), root page {}", self.file_id, root_page_no);
        Ok(())
    }

    fn root_page_no(&self) -> StorageResult<u32> {
        let guard = self.buffer_pool.fetch(self.pid(HEADER_PAGE_NO))?;
        Ok(read_root_pointer(&guard.read()))
    }

    fn set_root_page_no(&self, page_no: u32) -> StorageResult<()> {
        let guard = self.buffer_pool.fetch(self.pid(HEADER_PAGE_NO))?;
        write_root_pointer(&mut guard.write(), page_no);
        Ok(())
    }

    fn read_node(&self, page_no: u32) -> StorageResult<Node> {
        let guard = self.buffer_pool.fetch(self.pid(page_no))?;
        Node::decode(&guard.read())
    }

    fn write_node(&self, page_no: u32, node: &Node) -> StorageResult<()> {
        let guard = self.buffer_pool.fetch(self.pid(page_no))?;
        node.encode(&mut guard.write())
    }

    fn allocate_node_page(&self, node: &Node) -> StorageResult<u32> {
        let guard = self.buffer_pool.allocate_page(self.file_id)?;
        let page_no = guard.id.page_no;
        node.encode(&mut guard.write())?;
        Ok(page_no)
    }

    /// Descend from the root to the leaf that would hold `key`,
    /// recording the page number of every internal node visited (for
    /// `insert`'s possible chain of splits).
    fn descend_to_leaf(&self, key: i32) -> StorageResult<(Vec<u32>, u32)> {
        let mut path = Vec::new();
        let mut page_no = self.root_page_no()?;

        loop {
            let node = self.read_node(page_no)?;
            match node {
                Node::Leaf { .. } => return Ok((path, page_no)),
                Node::Internal { keys, children } => {
                    path.push(page_no);
                    let idx = child_index_for_key(&keys, key);
                    page_no = children[idx];
                }
            }
        }
    }

    pub fn search(&self, key: i32) -> StorageResult<Option<RecordID>> {
        let (_, leaf_page_no) = self.descend_to_leaf(key)?;
        let node = self.read_node(leaf_page_no)?;
        if let Node::Leaf { keys, values, .. } = node {
            Ok(keys
                .iter()
                .position(|k| *k == key)
                .map(|idx| values[idx]))
        } else {
            unreachable!("descend_to_leaf always returns a leaf")
        }
    }

    /// Insert `key -> value`, an upsert: if `key` already exists its
    /// value is replaced in place and `find` returns the
    /// most-recently-associated value.
    pub fn insert(&self, key: i32, value: RecordID) -> StorageResult<()> {
        let (path, leaf_page_no) = self.descend_to_leaf(key)?;
        let mut leaf = self.read_node(leaf_page_no)?;

        let (keys, values) = match &mut leaf {
            Node::Leaf { keys, values, .. } => (keys, values),
            Node::Internal { .. } => unreachable!(),
        };

        match keys.binary_search(&key) {
            Ok(idx) => {
                values[idx] = value;
                self.write_node(leaf_page_no, &leaf)?;
                return Ok(());
            }
            Err(idx) => {
                keys.insert(idx, key);
                values.insert(idx, value);
            }
        }

        if leaf.key_count() <= self.max_keys {
            self.write_node(leaf_page_no, &leaf)?;
            return Ok(());
        }

        // Split the overfull leaf: the upper half moves to a new page,
        // the new leaf's first key is promoted to the parent.
        let (left, right, promoted_key) = split_leaf(leaf);
        let right_page_no = self.allocate_node_page(&right)?;

        let mut left = left;
        if let Node::Leaf { next, .. } = &mut left {
            *next = right_page_no;
        }
        self.write_node(leaf_page_no, &left)?;

        trace!(
            "split leaf {} -> new leaf {} at key {}",
            leaf_page_no, right_page_no, promoted_key
        );

        self.insert_into_parent(path, leaf_page_no, promoted_key, right_page_no)
    }

    /// Propagate a split upward: insert `promoted_key -> right_page_no`
    /// as a new routing entry into the parent named by the end of
    /// `path`, splitting that parent in turn if it overflows, up to and
    /// including creating a brand new root.
    fn insert_into_parent(
        &self,
        mut path: Vec<u32>,
        left_page_no: u32,
        promoted_key: i32,
        right_page_no: u32,
    ) -> StorageResult<()> {
        let parent_page_no = match path.pop() {
            Some(p) => p,
            None => {
                // left_page_no was the root; build a new root.
                let new_root = Node::Internal {
                    keys: vec![promoted_key],
                    children: vec![left_page_no, right_page_no],
                };
                let new_root_page_no = self.allocate_node_page(&new_root)?;
                self.set_root_page_no(new_root_page_no)?;
                debug!("grew a new root at page {}", new_root_page_no);
                return Ok(());
            }
        };

        let mut parent = self.read_node(parent_page_no)?;
        if let Node::Internal { keys, children } = &mut parent {
            let idx = keys.partition_point(|k| *k < promoted_key);
            keys.insert(idx, promoted_key);
            children.insert(idx + 1, right_page_no);
        } else {
            unreachable!("path only ever contains internal pages");
        }

        if parent.key_count() <= self.max_keys {
            self.write_node(parent_page_no, &parent)?;
            return Ok(());
        }

        let (left, right, split_key) = split_internal(parent);
        let right_page_no = self.allocate_node_page(&right)?;
        self.write_node(parent_page_no, &left)?;

        self.insert_into_parent(path, parent_page_no, split_key, right_page_no)
    }

    /// Remove `key`. Only the leaf is modified -- no merge or
    /// rebalance of underfull siblings is performed, a deliberate
    /// simplification of this tree.
    pub fn delete(&self, key: i32) -> StorageResult<()> {
        let (_, leaf_page_no) = self.descend_to_leaf(key)?;
        let mut leaf = self.read_node(leaf_page_no)?;

        if let Node::Leaf { keys, values, .. } = &mut leaf {
            match keys.binary_search(&key) {
                Ok(idx) => {
                    keys.remove(idx);
                    values.remove(idx);
                }
                Err(_) => {
                    return Err(SmallError::with_kind(
                        ErrorKind::NotFound,
                        &format!("key {} not found in index", key),
                    ))
                }
            }
        }

        self.write_node(leaf_page_no, &leaf)
    }

    /// Scan `[start, end]` inclusive, in key order, following the leaf
    /// chain.
    pub fn range_scan(&self, start: i32, end: i32) -> StorageResult<Vec<(i32, RecordID)>> {
        let (_, mut leaf_page_no) = self.descend_to_leaf(start)?;
        let mut out = Vec::new();

        loop {
            let node = self.read_node(leaf_page_no)?;
            let (keys, values, next) = match node {
                Node::Leaf { keys, values, next } => (keys, values, next),
                Node::Internal { .. } => unreachable!(),
            };

            for (k, v) in keys.iter().zip(values.iter()) {
                if *k > end {
                    return Ok(out);
                }
                if *k >= start {
                    out.push((*k, *v));
                }
            }

            if next == NO_NEXT_LEAF {
                return Ok(out);
            }
            leaf_page_no = next;
        }
    }
}

fn child_index_for_key(keys: &[i32], key: i32) -> usize {
    keys.partition_point(|k| *k <= key)
}

fn split_leaf(node: Node) -> (Node, Node, i32) {
    if let Node::Leaf { mut keys, mut values, next } = node {
        let mid = keys.len() / 2;
        let right_keys = keys.split_off(mid);
        let right_values = values.split_off(mid);
        let promoted_key = right_keys[0];

        let left = Node::Leaf {
            keys,
            values,
            next: NO_NEXT_LEAF, // caller fixes this up to point at the new right leaf
        };
        let right = Node::Leaf {
            keys: right_keys,
            values: right_values,
            next,
        };
        (left, right, promoted_key)
    } else {
        unreachable!("split_leaf called on a non-leaf node")
    }
}

fn split_internal(node: Node) -> (Node, Node, i32) {
    if let Node::Internal { mut keys, mut children } = node {
        let mid = keys.len() / 2;
        // the middle key is pushed up rather than duplicated into
        // either sibling, as is standard for internal-node splits.
        let promoted_key = keys[mid];
        let right_keys = keys.split_off(mid + 1);
        keys.pop();
        let right_children = children.split_off(mid + 1);

        let left = Node::Internal { keys, children };
        let right = Node::Internal {
            keys: right_keys,
            children: right_children,
        };
        (left, right, promoted_key)
    } else {
        unreachable!("split_internal called on a non-internal node")
    }
}

fn read_root_pointer(page: &Page) -> u32 {
    u32::from_ne_bytes(page.bytes()[0..4].try_into().unwrap())
}

fn write_root_pointer(page: &mut Page, root_page_no: u32) {
    page.bytes_mut()[0..4].copy_from_slice(&root_page_no.to_ne_bytes());
}
