//! Weighted selection tree.
//!
//! A binary tree where every node owns one host entry and caches the total
//! weight of its subtree. The cached sums let a weight drawn uniformly from
//! `[0, total)` be mapped to an entry in O(depth), each entry being hit with
//! probability proportional to its own weight.
//!
//! Nodes live in an arena and refer to each other by [`NodeId`]. Freed slots
//! go on a free list and are handed out again by later inserts, so ids are
//! stable for as long as the node they name is alive.
//!
//! The tree is not self-balancing. Inserts descend into the lighter child,
//! which keeps the weight roughly even on both sides of every node and the
//! expected depth near `log n` for typical weights, but there is no
//! worst-case depth bound.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::entry::{HostEntry, HostId};

// =============================================================================
// Node ids
// =============================================================================

/// Index of a node in the tree's arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct NodeId(u32);

impl NodeId {
    pub const NULL: NodeId = NodeId(u32::MAX);

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == u32::MAX
    }

    /// # Panics
    /// Panics if the index does not fit below `u32::MAX`.
    #[inline]
    fn from_usize(idx: usize) -> Self {
        assert!(idx < u32::MAX as usize, "selection tree arena full");
        Self(idx as u32)
    }

    #[inline]
    fn as_usize(self) -> usize {
        debug_assert!(!self.is_null());
        self.0 as usize
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("NodeId(NULL)")
        } else {
            write!(f, "NodeId({})", self.0)
        }
    }
}

// =============================================================================
// Tree
// =============================================================================

#[derive(Clone, Debug)]
struct Node {
    entry: HostEntry,
    parent: NodeId,
    left: NodeId,
    right: NodeId,
    /// Own weight plus the subtree weights of both children.
    subtree_weight: u128,
}

/// Result of [`WeightTree::remove`].
#[derive(Debug)]
pub struct Removed {
    pub entry: HostEntry,
    /// Set when another entry was moved into the removed node's slot. The
    /// caller must repoint that host's locator at the given node.
    pub relocated: Option<(HostId, NodeId)>,
}

/// Nodes hidden from draws without touching the tree, for sampling without
/// replacement under a shared borrow.
#[derive(Debug, Default)]
pub struct Exclusions {
    nodes: HashSet<NodeId>,
    /// Excluded weight below (and including) each node.
    subtree: HashMap<NodeId, u128>,
}

impl Exclusions {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct WeightTree {
    slots: Vec<Option<Node>>,
    free: Vec<NodeId>,
    root: NodeId,
    len: usize,
}

impl WeightTree {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            root: NodeId::NULL,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sum of the weights of every entry in the tree.
    pub fn total_weight(&self) -> u128 {
        self.subtree_weight(self.root)
    }

    pub fn entry(&self, id: NodeId) -> &HostEntry {
        &self.node(id).entry
    }

    /// Entries in arena order.
    pub fn entries(&self) -> impl Iterator<Item = &HostEntry> + '_ {
        self.slots.iter().flatten().map(|node| &node.entry)
    }

    /// Adds `entry` as a new leaf and returns its node.
    ///
    /// The caller is responsible for keeping host ids unique.
    pub fn insert(&mut self, entry: HostEntry) -> NodeId {
        let weight = u128::from(entry.weight);

        if self.root.is_null() {
            let id = self.alloc(entry, NodeId::NULL);
            self.root = id;
            return id;
        }

        // Walk towards the lighter side until a free child slot turns up.
        let mut current = self.root;
        let (parent, attach_left) = loop {
            let (left, right) = {
                let node = self.node(current);
                (node.left, node.right)
            };
            if self.subtree_weight(left) <= self.subtree_weight(right) {
                if left.is_null() {
                    break (current, true);
                }
                current = left;
            } else {
                if right.is_null() {
                    break (current, false);
                }
                current = right;
            }
        };

        let id = self.alloc(entry, parent);
        let parent_node = self.node_mut(parent);
        if attach_left {
            parent_node.left = id;
        } else {
            parent_node.right = id;
        }

        let mut current = parent;
        while !current.is_null() {
            let node = self.node_mut(current);
            node.subtree_weight += weight;
            current = node.parent;
        }

        id
    }

    /// Removes the node `id` and returns its entry.
    ///
    /// Internal nodes are not unlinked. Instead a leaf below them donates its
    /// entry and the leaf is unlinked, so only leaves ever leave the arena.
    pub fn remove(&mut self, id: NodeId) -> Removed {
        let (left, right, removed_weight) = {
            let node = self.node(id);
            (node.left, node.right, u128::from(node.entry.weight))
        };

        let leaf = if !right.is_null() {
            self.descend_to_leaf(right, true)
        } else if !left.is_null() {
            self.descend_to_leaf(left, false)
        } else {
            id
        };

        let leaf_node = self.unlink_leaf(leaf);
        let leaf_weight = u128::from(leaf_node.entry.weight);

        // Ancestors strictly between the leaf and `id` lose the leaf's weight;
        // `id` and everything above it lose the removed entry's weight.
        let mut delta = leaf_weight;
        let mut current = leaf_node.parent;
        while !current.is_null() {
            if current == id {
                delta = removed_weight;
            }
            let node = self.node_mut(current);
            debug_assert!(node.subtree_weight >= delta);
            node.subtree_weight -= delta;
            current = node.parent;
        }

        if leaf == id {
            return Removed {
                entry: leaf_node.entry,
                relocated: None,
            };
        }

        let moved_id = leaf_node.entry.id.clone();
        let entry = std::mem::replace(&mut self.node_mut(id).entry, leaf_node.entry);
        Removed {
            entry,
            relocated: Some((moved_id, id)),
        }
    }

    /// Returns the entry whose weight interval contains `weight`.
    ///
    /// Entries partition `[0, total_weight())` into consecutive intervals,
    /// each as wide as the entry's weight, in pre-order: a node's own
    /// interval comes first, then its left subtree's, then its right's.
    ///
    /// # Panics
    /// Panics if `weight >= total_weight()`.
    pub fn entry_at_weight(&self, weight: u128) -> &HostEntry {
        &self.node(self.node_at_weight(weight)).entry
    }

    /// Node form of [`entry_at_weight`](WeightTree::entry_at_weight).
    pub fn node_at_weight(&self, weight: u128) -> NodeId {
        self.node_at_weight_excluding(weight, &Exclusions::default())
    }

    /// Weight left to draw from once `excluded` is taken out.
    pub fn remaining_weight(&self, excluded: &Exclusions) -> u128 {
        self.remaining_subtree_weight(self.root, excluded)
    }

    /// Like [`node_at_weight`](WeightTree::node_at_weight) over
    /// `[0, remaining_weight(excluded))`, with excluded nodes carrying no
    /// weight. The tree itself is left alone.
    ///
    /// # Panics
    /// Panics if `weight >= remaining_weight(excluded)`.
    pub fn node_at_weight_excluding(&self, mut weight: u128, excluded: &Exclusions) -> NodeId {
        let mut current = self.root;
        while !current.is_null() {
            let node = self.node(current);
            let own_weight = if !excluded.is_empty() && excluded.nodes.contains(&current) {
                0
            } else {
                u128::from(node.entry.weight)
            };
            if weight < own_weight {
                return current;
            }
            weight -= own_weight;
            let left_weight = self.remaining_subtree_weight(node.left, excluded);
            if weight < left_weight {
                current = node.left;
            } else {
                weight -= left_weight;
                current = node.right;
            }
        }
        panic!(
            "weight {weight} outside the selection tree (remaining {})",
            self.remaining_weight(excluded)
        );
    }

    /// Takes `id` out of later draws against `excluded`. O(depth).
    pub fn exclude(&self, id: NodeId, excluded: &mut Exclusions) {
        if !excluded.nodes.insert(id) {
            return;
        }
        let weight = u128::from(self.node(id).entry.weight);
        let mut current = id;
        while !current.is_null() {
            *excluded.subtree.entry(current).or_default() += weight;
            current = self.node(current).parent;
        }
    }

    fn remaining_subtree_weight(&self, id: NodeId, excluded: &Exclusions) -> u128 {
        if excluded.is_empty() {
            return self.subtree_weight(id);
        }
        let taken = excluded.subtree.get(&id).copied().unwrap_or(0);
        self.subtree_weight(id) - taken
    }

    /// Follows one preferred side (falling back to the other) down to a leaf.
    fn descend_to_leaf(&self, start: NodeId, prefer_right: bool) -> NodeId {
        let mut current = start;
        loop {
            let node = self.node(current);
            let (first, second) = if prefer_right {
                (node.right, node.left)
            } else {
                (node.left, node.right)
            };
            let next = if first.is_null() { second } else { first };
            if next.is_null() {
                return current;
            }
            current = next;
        }
    }

    /// Detaches a childless node from its parent and frees its slot.
    fn unlink_leaf(&mut self, id: NodeId) -> Node {
        let node = match self.slots[id.as_usize()].take() {
            Some(node) => node,
            None => panic!("unlinking freed node {id:?}"),
        };
        debug_assert!(node.left.is_null() && node.right.is_null());

        if node.parent.is_null() {
            debug_assert_eq!(self.root, id);
            self.root = NodeId::NULL;
        } else {
            let parent = self.node_mut(node.parent);
            if parent.left == id {
                parent.left = NodeId::NULL;
            } else {
                debug_assert_eq!(parent.right, id);
                parent.right = NodeId::NULL;
            }
        }

        self.free.push(id);
        self.len -= 1;
        node
    }

    fn alloc(&mut self, entry: HostEntry, parent: NodeId) -> NodeId {
        let node = Node {
            subtree_weight: u128::from(entry.weight),
            entry,
            parent,
            left: NodeId::NULL,
            right: NodeId::NULL,
        };
        self.len += 1;
        match self.free.pop() {
            Some(id) => {
                self.slots[id.as_usize()] = Some(node);
                id
            }
            None => {
                let id = NodeId::from_usize(self.slots.len());
                self.slots.push(Some(node));
                id
            }
        }
    }

    #[inline]
    fn subtree_weight(&self, id: NodeId) -> u128 {
        if id.is_null() {
            0
        } else {
            self.node(id).subtree_weight
        }
    }

    #[inline]
    fn node(&self, id: NodeId) -> &Node {
        match self.slots.get(id.as_usize()) {
            Some(Some(node)) => node,
            _ => panic!("dangling node {id:?}"),
        }
    }

    #[inline]
    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        match self.slots.get_mut(id.as_usize()) {
            Some(Some(node)) => node,
            _ => panic!("dangling node {id:?}"),
        }
    }

    /// Walks every reachable node checking links, cached weights and the
    /// live node count.
    #[cfg(test)]
    pub(crate) fn validate(&self) {
        let mut reachable = 0usize;
        let mut stack = Vec::new();
        if !self.root.is_null() {
            assert!(self.node(self.root).parent.is_null(), "root has a parent");
            stack.push(self.root);
        }
        while let Some(id) = stack.pop() {
            reachable += 1;
            let node = self.node(id);
            for child in [node.left, node.right] {
                if !child.is_null() {
                    assert_eq!(self.node(child).parent, id, "broken parent link");
                    stack.push(child);
                }
            }
            assert_eq!(
                node.subtree_weight,
                u128::from(node.entry.weight)
                    + self.subtree_weight(node.left)
                    + self.subtree_weight(node.right),
                "cached subtree weight of {} is stale",
                node.entry.id
            );
        }
        assert_eq!(reachable, self.len, "reachable nodes must match len");
        assert_eq!(
            self.slots.iter().filter(|slot| slot.is_some()).count(),
            self.len,
            "live slots must match len"
        );
    }

    #[cfg(test)]
    pub(crate) fn depth(&self) -> usize {
        let mut max = 0;
        let mut stack = Vec::new();
        if !self.root.is_null() {
            stack.push((self.root, 1));
        }
        while let Some((id, depth)) = stack.pop() {
            max = max.max(depth);
            let node = self.node(id);
            for child in [node.left, node.right] {
                if !child.is_null() {
                    stack.push((child, depth + 1));
                }
            }
        }
        max
    }
}

impl Default for WeightTree {
    fn default() -> Self {
        Self::new()
    }
}
