//! Persistent B-tree used as the in-memory index of the key-value store.
//!
//! # Structure
//!
//! - Branch nodes: separator keys and `Arc`-shared children
//! - Leaf nodes: ordered keys with an inline value or a [`ValueRef`]
//!
//! Every committed version of the tree is a [`PersistentTree`]. Versions share
//! all nodes they have in common; a write copies only its root-to-leaf path.
//!
//! # Usage
//!
//! ```
//! use kvdb::btree::{MemberValue, PersistentTree, TreeConfig};
//!
//! let mut tree = PersistentTree::new(TreeConfig::default());
//! tree.upsert(b"a", MemberValue::inline(b"1"));
//! let snapshot = tree.clone();
//!
//! tree.delete(b"a");
//!
//! assert!(tree.find(b"a").is_none());
//! assert_eq!(snapshot.find(b"a"), Some(&MemberValue::inline(b"1")));
//! ```

mod node;
mod tree;

pub use node::{BranchNode, Key, LeafEntry, LeafNode, MemberValue, Node, ValueRef};
pub use tree::{
    DEFAULT_MAX_BRANCH_CHILDREN, DEFAULT_MAX_LEAF_ENTRIES, Iter, PersistentTree, TreeConfig,
    TreeError,
};
