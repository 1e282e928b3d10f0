//! B-tree node types.
//!
//! Nodes are immutable once published in a root. A node is shared through
//! `Arc` by every root that still reaches it; writers copy a node before
//! changing it (`Arc::make_mut`), so older roots keep seeing the old version.
//!
//! - Leaf nodes: ordered `(key, member value)` pairs
//! - Branch nodes: separator keys and shared child pointers

use std::sync::Arc;

/// An ordered byte-string key. Cloning shares the bytes.
pub type Key = Arc<[u8]>;

/// Location of a value stored outside the tree.
///
/// `length` is signed: a negative length marks a tombstone record whose
/// bytes still occupy `|length|` bytes at `offset` and must be kept alive
/// like any other value, but which lookups treat as absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueRef {
    pub file_id: u32,
    pub offset: u64,
    pub length: i32,
}

impl ValueRef {
    /// Reference to `length` live value bytes.
    #[must_use]
    pub const fn new(file_id: u32, offset: u64, length: i32) -> Self {
        Self {
            file_id,
            offset,
            length,
        }
    }

    /// Reference to a tombstone record of `length` bytes.
    ///
    /// # Pre-conditions
    /// - `length > 0`
    #[must_use]
    pub const fn tombstone(file_id: u32, offset: u64, length: i32) -> Self {
        debug_assert!(length > 0, "tombstone length must be positive");
        Self {
            file_id,
            offset,
            length: -length,
        }
    }

    #[must_use]
    pub const fn is_tombstone(&self) -> bool {
        self.length < 0
    }

    /// Number of bytes the referenced record occupies in its file.
    #[must_use]
    pub const fn stored_length(&self) -> u32 {
        self.length.unsigned_abs()
    }

    /// The same record at a new location. The tombstone sign is kept.
    #[must_use]
    pub const fn relocated(&self, file_id: u32, offset: u64) -> Self {
        Self {
            file_id,
            offset,
            length: self.length,
        }
    }
}

/// What a leaf stores for a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberValue {
    /// Small value kept in the leaf itself.
    Inline(Arc<[u8]>),
    /// Value bytes living in a segment file.
    Ref(ValueRef),
}

impl MemberValue {
    #[must_use]
    pub fn inline(bytes: &[u8]) -> Self {
        Self::Inline(Arc::from(bytes))
    }

    #[must_use]
    pub const fn value_ref(&self) -> Option<&ValueRef> {
        match self {
            Self::Ref(r) => Some(r),
            Self::Inline(_) => None,
        }
    }

    #[must_use]
    pub const fn is_tombstone(&self) -> bool {
        match self {
            Self::Ref(r) => r.is_tombstone(),
            Self::Inline(_) => false,
        }
    }
}

/// A key and its member value.
#[derive(Debug, Clone)]
pub struct LeafEntry {
    pub key: Key,
    pub value: MemberValue,
}

/// A leaf node: entries in strictly increasing key order.
#[derive(Debug, Clone, Default)]
pub struct LeafNode {
    pub entries: Vec<LeafEntry>,
}

impl LeafNode {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Key at `idx`.
    #[must_use]
    pub fn key(&self, idx: usize) -> &[u8] {
        &self.entries[idx].key
    }

    /// Member value at `idx`.
    #[must_use]
    pub fn member_value(&self, idx: usize) -> &MemberValue {
        &self.entries[idx].value
    }

    /// Replace the member value at `idx`, keeping its key.
    pub fn set_member_value(&mut self, idx: usize, value: MemberValue) {
        self.entries[idx].value = value;
    }

    /// Find the index where a key exists or would be inserted.
    pub fn find_index(&self, key: &[u8]) -> Result<usize, usize> {
        self.entries.binary_search_by(|e| (*e.key).cmp(key))
    }

    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<&MemberValue> {
        self.find_index(key).ok().map(|i| &self.entries[i].value)
    }

    /// Insert or update an entry.
    ///
    /// Returns the old value if updating, None if inserting.
    pub fn insert(&mut self, key: &[u8], value: MemberValue) -> Option<MemberValue> {
        match self.find_index(key) {
            Ok(i) => Some(std::mem::replace(&mut self.entries[i].value, value)),
            Err(i) => {
                self.entries.insert(
                    i,
                    LeafEntry {
                        key: Arc::from(key),
                        value,
                    },
                );
                None
            }
        }
    }

    /// Remove an entry by key, returning its value if present.
    pub fn remove(&mut self, key: &[u8]) -> Option<MemberValue> {
        self.find_index(key)
            .ok()
            .map(|i| self.entries.remove(i).value)
    }

    /// Split the node, returning the split key and the new right node.
    ///
    /// The split key is the first key of the right node.
    #[must_use]
    pub fn split(&mut self) -> (Key, Self) {
        let mid = self.entries.len() / 2;
        let right_entries: Vec<LeafEntry> = self.entries.drain(mid..).collect();
        let split_key = Arc::clone(&right_entries[0].key);
        (
            split_key,
            Self {
                entries: right_entries,
            },
        )
    }
}

/// A branch node.
///
/// Stores N separator keys and N+1 children.
/// `children[i]` holds keys < `keys[i]`;
/// `children[i+1]` holds keys >= `keys[i]`.
#[derive(Debug, Clone)]
pub struct BranchNode {
    pub keys: Vec<Key>,
    pub children: Vec<Arc<Node>>,
}

impl BranchNode {
    /// A branch with two children, used when the root splits.
    #[must_use]
    pub fn with_children(left: Arc<Node>, key: Key, right: Arc<Node>) -> Self {
        Self {
            keys: vec![key],
            children: vec![left, right],
        }
    }

    /// Find the child index for a given key.
    #[must_use]
    pub fn child_index(&self, key: &[u8]) -> usize {
        match self.keys.binary_search_by(|k| (**k).cmp(key)) {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }

    /// Split the node, returning the promoted median key and the right node.
    #[must_use]
    pub fn split(&mut self) -> (Key, Self) {
        let mid = self.keys.len() / 2;
        let right_keys: Vec<Key> = self.keys.drain(mid + 1..).collect();
        let right_children: Vec<Arc<Node>> = self.children.drain(mid + 1..).collect();
        let median = self
            .keys
            .pop()
            .unwrap_or_else(|| unreachable!("split of a branch without keys"));
        (
            median,
            Self {
                keys: right_keys,
                children: right_children,
            },
        )
    }
}

/// A B-tree node. Dispatch is a match over the tag.
#[derive(Debug, Clone)]
pub enum Node {
    Leaf(LeafNode),
    Branch(BranchNode),
}

impl Node {
    /// Fill of the node: entries for a leaf, children for a branch.
    #[must_use]
    pub fn fill(&self) -> usize {
        match self {
            Self::Leaf(leaf) => leaf.len(),
            Self::Branch(branch) => branch.children.len(),
        }
    }
}
