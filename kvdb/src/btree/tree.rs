//! Persistent (copy-on-write) B-tree.
//!
//! A [`PersistentTree`] is one version of the tree. Cloning it is O(1): the
//! clone shares every node. Mutating a version copies only the nodes on the
//! root-to-leaf path it touches; every other version, and every subtree the
//! mutation did not touch, stays shared and unchanged.
//!
//! This is what makes snapshot isolation cheap: a read transaction holds a
//! clone of the committed version, the writer mutates its own clone, and the
//! commit publishes the writer's version as the new root.

use std::sync::Arc;

use crate::btree::node::{BranchNode, Key, LeafNode, MemberValue, Node, ValueRef};
use crate::cancel::{CancellationToken, Cancelled};

/// Default maximum number of entries in a leaf.
pub const DEFAULT_MAX_LEAF_ENTRIES: usize = 64;

/// Default maximum number of children of a branch.
pub const DEFAULT_MAX_BRANCH_CHILDREN: usize = 64;

/// Fanout thresholds for splits and merges.
///
/// Nodes split when they exceed the maximum and are rebalanced when they drop
/// below half of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeConfig {
    pub max_leaf_entries: usize,
    pub max_branch_children: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_leaf_entries: DEFAULT_MAX_LEAF_ENTRIES,
            max_branch_children: DEFAULT_MAX_BRANCH_CHILDREN,
        }
    }
}

impl TreeConfig {
    /// Smallest accepted `max_leaf_entries`.
    pub const MIN_LEAF_ENTRIES: usize = 2;
    /// Smallest accepted `max_branch_children`.
    pub const MIN_BRANCH_CHILDREN: usize = 4;

    #[must_use]
    pub const fn new(max_leaf_entries: usize, max_branch_children: usize) -> Self {
        Self {
            max_leaf_entries,
            max_branch_children,
        }
    }

    /// Whether the thresholds keep a split node and a merged node in range.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.max_leaf_entries >= Self::MIN_LEAF_ENTRIES
            && self.max_branch_children >= Self::MIN_BRANCH_CHILDREN
    }

    const fn min_fill(&self, node: &Node) -> usize {
        match node {
            Node::Leaf(_) => self.max_leaf_entries / 2,
            Node::Branch(_) => self.max_branch_children / 2,
        }
    }

    fn is_underfull(&self, node: &Node) -> bool {
        node.fill() < self.min_fill(node)
    }

    fn can_lend(&self, node: &Node) -> bool {
        node.fill() > self.min_fill(node)
    }
}

/// One immutable-once-shared version of the tree.
#[derive(Debug, Clone)]
pub struct PersistentTree {
    root: Arc<Node>,
    len: usize,
    config: TreeConfig,
}

impl Default for PersistentTree {
    fn default() -> Self {
        Self::new(TreeConfig::default())
    }
}

impl PersistentTree {
    /// Create an empty tree.
    #[must_use]
    pub fn new(config: TreeConfig) -> Self {
        Self {
            root: Arc::new(Node::Leaf(LeafNode::new())),
            len: 0,
            config,
        }
    }

    /// Build a tree from entries in strictly increasing key order.
    ///
    /// Out-of-order input means the source is corrupt and is rejected.
    pub fn from_sorted<I>(config: TreeConfig, entries: I) -> Result<Self, TreeError>
    where
        I: IntoIterator<Item = (Key, MemberValue)>,
    {
        let mut tree = Self::new(config);
        let mut previous: Option<Key> = None;
        for (key, value) in entries {
            if previous.as_deref().is_some_and(|p| p >= &*key) {
                return Err(TreeError::KeysOutOfOrder);
            }
            tree.upsert(&key, value);
            previous = Some(key);
        }
        Ok(tree)
    }

    /// Number of keys, tombstones included.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// Whether two versions share the same root node.
    #[must_use]
    pub fn same_root(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.root, &other.root)
    }

    /// Number of levels from the root to the leaves.
    #[must_use]
    pub fn depth(&self) -> usize {
        let mut depth = 1;
        let mut node = &*self.root;
        while let Node::Branch(branch) = node {
            node = &branch.children[0];
            depth += 1;
        }
        depth
    }

    /// Look up a key. Deleted and tombstoned keys are not found.
    #[must_use]
    pub fn find(&self, key: &[u8]) -> Option<&MemberValue> {
        self.find_member(key).filter(|v| !v.is_tombstone())
    }

    /// Look up a key, returning tombstones too.
    #[must_use]
    pub fn find_member(&self, key: &[u8]) -> Option<&MemberValue> {
        let mut node = &*self.root;
        loop {
            match node {
                Node::Leaf(leaf) => return leaf.get(key),
                Node::Branch(branch) => node = &branch.children[branch.child_index(key)],
            }
        }
    }

    /// Insert or update a key in this version.
    ///
    /// Nodes shared with other versions are copied before they change.
    /// Returns the previous member value.
    pub fn upsert(&mut self, key: &[u8], value: MemberValue) -> Option<MemberValue> {
        let (old, split) = insert_into(&mut self.root, key, value, &self.config);
        if let Some((split_key, right)) = split {
            let left = Arc::clone(&self.root);
            self.root = Arc::new(Node::Branch(BranchNode::with_children(
                left, split_key, right,
            )));
        }
        if old.is_none() {
            self.len += 1;
        }
        old
    }

    /// Remove a key from this version, returning its member value.
    ///
    /// Removing an absent key copies nothing.
    pub fn delete(&mut self, key: &[u8]) -> Option<MemberValue> {
        self.find_member(key)?;
        let removed = remove_from(&mut self.root, key, &self.config);

        let collapsed = match &*self.root {
            Node::Branch(branch) if branch.children.len() == 1 => {
                Some(Arc::clone(&branch.children[0]))
            }
            _ => None,
        };
        if let Some(child) = collapsed {
            self.root = child;
        }

        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    /// Iterate all entries in key order, tombstones included.
    #[must_use]
    pub fn iter(&self) -> Iter<'_> {
        let mut iter = Iter {
            stack: Vec::new(),
            leaf: None,
        };
        iter.descend_leftmost(&self.root);
        iter
    }

    /// Iterate entries with keys >= `start_key`.
    #[must_use]
    pub fn iter_from(&self, start_key: &[u8]) -> Iter<'_> {
        let mut iter = Iter {
            stack: Vec::new(),
            leaf: None,
        };
        let mut node = &*self.root;
        loop {
            match node {
                Node::Leaf(leaf) => {
                    let start = leaf.find_index(start_key).unwrap_or_else(|i| i);
                    iter.leaf = Some((leaf, start));
                    return iter;
                }
                Node::Branch(branch) => {
                    let idx = branch.child_index(start_key);
                    iter.stack.push((branch, idx));
                    node = &branch.children[idx];
                }
            }
        }
    }

    /// Visit every value reference reachable from this version, tombstones
    /// included, in key order. Stops at the first error the visitor returns.
    pub fn try_for_each_value_ref<E, F>(&self, mut visit: F) -> Result<(), E>
    where
        F: FnMut(&ValueRef) -> Result<(), E>,
    {
        for (_, value) in self.iter() {
            if let MemberValue::Ref(value_ref) = value {
                visit(value_ref)?;
            }
        }
        Ok(())
    }

    /// Rewrite value references in this version.
    ///
    /// `remap` returns the new location of a reference, or None to keep it.
    /// Only nodes containing a remapped reference (and their ancestors) are
    /// copied. Cancellation is polled once per node; a cancelled rewrite
    /// leaves this version untouched. Returns the number of rewritten
    /// references.
    pub fn replace_values<F>(
        &mut self,
        cancel: &CancellationToken,
        remap: F,
    ) -> Result<usize, Cancelled>
    where
        F: Fn(&ValueRef) -> Option<ValueRef>,
    {
        let mut changed = 0;
        if let Some(new_root) = remap_node(&self.root, cancel, &remap, &mut changed)? {
            self.root = new_root;
        }
        Ok(changed)
    }

    /// Check the structural invariants: strictly ordered keys, children
    /// partitioning the key space, uniform leaf depth, consistent length.
    pub fn validate(&self) -> Result<(), TreeError> {
        let mut check = Validation {
            leaf_depth: None,
            count: 0,
        };
        check.node(&self.root, None, None, 0)?;
        if check.count != self.len {
            return Err(TreeError::LengthMismatch {
                expected: self.len,
                found: check.count,
            });
        }
        Ok(())
    }
}

/// Result of inserting into a subtree: the replaced value and, when the
/// subtree root split, the separator and the new right sibling.
type InsertOutcome = (Option<MemberValue>, Option<(Key, Arc<Node>)>);

fn insert_into(
    node: &mut Arc<Node>,
    key: &[u8],
    value: MemberValue,
    config: &TreeConfig,
) -> InsertOutcome {
    match Arc::make_mut(node) {
        Node::Leaf(leaf) => {
            let old = leaf.insert(key, value);
            let split = (leaf.len() > config.max_leaf_entries).then(|| {
                let (split_key, right) = leaf.split();
                (split_key, Arc::new(Node::Leaf(right)))
            });
            (old, split)
        }
        Node::Branch(branch) => {
            let idx = branch.child_index(key);
            let (old, child_split) = insert_into(&mut branch.children[idx], key, value, config);
            if let Some((split_key, right)) = child_split {
                branch.keys.insert(idx, split_key);
                branch.children.insert(idx + 1, right);
            }
            let split = (branch.children.len() > config.max_branch_children).then(|| {
                let (median, right) = branch.split();
                (median, Arc::new(Node::Branch(right)))
            });
            (old, split)
        }
    }
}

fn remove_from(node: &mut Arc<Node>, key: &[u8], config: &TreeConfig) -> Option<MemberValue> {
    match Arc::make_mut(node) {
        Node::Leaf(leaf) => leaf.remove(key),
        Node::Branch(branch) => {
            let idx = branch.child_index(key);
            let removed = remove_from(&mut branch.children[idx], key, config);
            if removed.is_some() && config.is_underfull(&branch.children[idx]) {
                rebalance(branch, idx, config);
            }
            removed
        }
    }
}

/// Restore the fill of `branch.children[idx]` by borrowing from a sibling,
/// or merging with one when neither can lend.
fn rebalance(branch: &mut BranchNode, idx: usize, config: &TreeConfig) {
    let has_left = idx > 0;
    let has_right = idx + 1 < branch.children.len();

    if has_left && config.can_lend(&branch.children[idx - 1]) {
        borrow_from_left(branch, idx);
    } else if has_right && config.can_lend(&branch.children[idx + 1]) {
        borrow_from_right(branch, idx);
    } else if has_left {
        merge_children(branch, idx - 1);
    } else if has_right {
        merge_children(branch, idx);
    }
}

fn borrow_from_left(branch: &mut BranchNode, idx: usize) {
    let (before, after) = branch.children.split_at_mut(idx);
    let left = Arc::make_mut(&mut before[idx - 1]);
    let child = Arc::make_mut(&mut after[0]);
    match (left, child) {
        (Node::Leaf(left), Node::Leaf(child)) => {
            if let Some(entry) = left.entries.pop() {
                branch.keys[idx - 1] = Arc::clone(&entry.key);
                child.entries.insert(0, entry);
            }
        }
        (Node::Branch(left), Node::Branch(child)) => {
            if let (Some(moved_key), Some(moved_child)) = (left.keys.pop(), left.children.pop()) {
                let separator = std::mem::replace(&mut branch.keys[idx - 1], moved_key);
                child.keys.insert(0, separator);
                child.children.insert(0, moved_child);
            }
        }
        _ => unreachable!("siblings at different depths"),
    }
}

fn borrow_from_right(branch: &mut BranchNode, idx: usize) {
    let (before, after) = branch.children.split_at_mut(idx + 1);
    let child = Arc::make_mut(&mut before[idx]);
    let right = Arc::make_mut(&mut after[0]);
    match (child, right) {
        (Node::Leaf(child), Node::Leaf(right)) => {
            if !right.entries.is_empty() {
                child.entries.push(right.entries.remove(0));
                if let Some(first) = right.entries.first() {
                    branch.keys[idx] = Arc::clone(&first.key);
                }
            }
        }
        (Node::Branch(child), Node::Branch(right)) => {
            if !right.keys.is_empty() {
                let moved_child = right.children.remove(0);
                let moved_key = right.keys.remove(0);
                let separator = std::mem::replace(&mut branch.keys[idx], moved_key);
                child.keys.push(separator);
                child.children.push(moved_child);
            }
        }
        _ => unreachable!("siblings at different depths"),
    }
}

/// Merge `children[left_idx + 1]` into `children[left_idx]`.
fn merge_children(branch: &mut BranchNode, left_idx: usize) {
    let right = Arc::unwrap_or_clone(branch.children.remove(left_idx + 1));
    let separator = branch.keys.remove(left_idx);
    match (Arc::make_mut(&mut branch.children[left_idx]), right) {
        (Node::Leaf(left), Node::Leaf(right)) => left.entries.extend(right.entries),
        (Node::Branch(left), Node::Branch(right)) => {
            left.keys.push(separator);
            left.keys.extend(right.keys);
            left.children.extend(right.children);
        }
        _ => unreachable!("siblings at different depths"),
    }
}

fn remap_node<F>(
    node: &Arc<Node>,
    cancel: &CancellationToken,
    remap: &F,
    changed: &mut usize,
) -> Result<Option<Arc<Node>>, Cancelled>
where
    F: Fn(&ValueRef) -> Option<ValueRef>,
{
    cancel.check()?;
    match &**node {
        Node::Leaf(leaf) => {
            let mut copy: Option<LeafNode> = None;
            for idx in 0..leaf.len() {
                let Some(new_ref) = leaf.member_value(idx).value_ref().and_then(remap) else {
                    continue;
                };
                copy.get_or_insert_with(|| leaf.clone())
                    .set_member_value(idx, MemberValue::Ref(new_ref));
                *changed += 1;
            }
            Ok(copy.map(|leaf| Arc::new(Node::Leaf(leaf))))
        }
        Node::Branch(branch) => {
            let mut copy: Option<BranchNode> = None;
            for (idx, child) in branch.children.iter().enumerate() {
                if let Some(new_child) = remap_node(child, cancel, remap, changed)? {
                    copy.get_or_insert_with(|| branch.clone()).children[idx] = new_child;
                }
            }
            Ok(copy.map(|branch| Arc::new(Node::Branch(branch))))
        }
    }
}

struct Validation {
    leaf_depth: Option<usize>,
    count: usize,
}

impl Validation {
    fn node(
        &mut self,
        node: &Node,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        depth: usize,
    ) -> Result<(), TreeError> {
        match node {
            Node::Leaf(leaf) => {
                match self.leaf_depth {
                    Some(expected) if expected != depth => {
                        return Err(TreeError::DepthMismatch {
                            expected,
                            found: depth,
                        });
                    }
                    _ => self.leaf_depth = Some(depth),
                }
                let keys: Vec<&[u8]> = leaf.entries.iter().map(|e| &*e.key).collect();
                check_keys(&keys, lower, upper)?;
                self.count += leaf.len();
            }
            Node::Branch(branch) => {
                if branch.children.len() != branch.keys.len() + 1 {
                    return Err(TreeError::ChildCountMismatch {
                        keys: branch.keys.len(),
                        children: branch.children.len(),
                    });
                }
                let keys: Vec<&[u8]> = branch.keys.iter().map(|k| &**k).collect();
                check_keys(&keys, lower, upper)?;
                for (idx, child) in branch.children.iter().enumerate() {
                    let child_lower = if idx == 0 { lower } else { Some(keys[idx - 1]) };
                    let child_upper = keys.get(idx).copied().or(upper);
                    self.node(child, child_lower, child_upper, depth + 1)?;
                }
            }
        }
        Ok(())
    }
}

fn check_keys(keys: &[&[u8]], lower: Option<&[u8]>, upper: Option<&[u8]>) -> Result<(), TreeError> {
    if keys.windows(2).any(|w| w[0] >= w[1]) {
        return Err(TreeError::KeysOutOfOrder);
    }
    let below = |k: &&[u8]| lower.is_some_and(|l| *k < l);
    let above = |k: &&[u8]| upper.is_some_and(|u| *k >= u);
    if keys.iter().any(|k| below(k) || above(k)) {
        return Err(TreeError::KeyOutOfRange);
    }
    Ok(())
}

/// Iterator over tree entries in key order.
pub struct Iter<'a> {
    /// Branches on the path to the current leaf, with the index of the child
    /// being visited.
    stack: Vec<(&'a BranchNode, usize)>,
    leaf: Option<(&'a LeafNode, usize)>,
}

impl<'a> Iter<'a> {
    fn descend_leftmost(&mut self, mut node: &'a Node) {
        loop {
            match node {
                Node::Leaf(leaf) => {
                    self.leaf = Some((leaf, 0));
                    return;
                }
                Node::Branch(branch) => {
                    self.stack.push((branch, 0));
                    node = &branch.children[0];
                }
            }
        }
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a [u8], &'a MemberValue);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((leaf, idx)) = self.leaf {
                if let Some(entry) = leaf.entries.get(idx) {
                    self.leaf = Some((leaf, idx + 1));
                    return Some((&*entry.key, &entry.value));
                }
                self.leaf = None;
            }

            let top = self.stack.last_mut()?;
            top.1 += 1;
            let (branch, idx) = *top;
            if idx < branch.children.len() {
                self.descend_leftmost(&branch.children[idx]);
            } else {
                self.stack.pop();
            }
        }
    }
}

/// Structural invariant violations. These mean the tree (or the data it was
/// loaded from) is corrupt; they are never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    /// Keys within a node, or in loaded input, are not strictly increasing.
    KeysOutOfOrder,
    /// A key lies outside the range its parent's separators assign to it.
    KeyOutOfRange,
    /// Leaves were found at different depths.
    DepthMismatch { expected: usize, found: usize },
    /// A branch does not have exactly one more child than keys.
    ChildCountMismatch { keys: usize, children: usize },
    /// The recorded length disagrees with the number of leaf entries.
    LengthMismatch { expected: usize, found: usize },
}

impl std::fmt::Display for TreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeysOutOfOrder => write!(f, "keys out of order"),
            Self::KeyOutOfRange => write!(f, "key outside its parent's separator range"),
            Self::DepthMismatch { expected, found } => {
                write!(f, "leaf depth mismatch: expected {expected}, found {found}")
            }
            Self::ChildCountMismatch { keys, children } => {
                write!(f, "branch with {keys} keys has {children} children")
            }
            Self::LengthMismatch { expected, found } => {
                write!(f, "tree length mismatch: expected {expected}, found {found}")
            }
        }
    }
}

impl std::error::Error for TreeError {}
