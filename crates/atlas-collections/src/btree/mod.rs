// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

//! A reimplementation of the source's `lsl::BTree<T>`: an order-preserving
//! multiset with preemptive splitting on insert and rotate-or-merge
//! rebalancing on erase, generic over where its nodes live.
//!
//! WARNING: as in the source, any mutation may relocate nodes; there is no
//! iterator that survives across an `insert` or `erase`.

mod node;

#[cfg(test)]
mod btree_test;

pub use node::{Node, INTERIOR_CAPACITY, LEAF_CAPACITY};

use atlas_core::NodeSource;

/// An ordered B-tree over `T`, drawing node storage from `S`.
///
/// Duplicate keys are permitted; [`crate::OrderedSet`] and
/// [`crate::OrderedMap`] layer uniqueness on top by checking `contains`
/// before inserting, the same division of labor the source's `OrderedSet`
/// has with its `BTree`.
pub struct BTree<T, H, S>
where
    H: Copy + Eq,
    S: NodeSource<Node<T, H>, Handle = H>,
{
    source: S,
    root: Option<H>,
    len: usize,
}

impl<T, H, S> BTree<T, H, S>
where
    T: Ord + Clone,
    H: Copy + Eq,
    S: NodeSource<Node<T, H>, Handle = H>,
{
    pub fn new(source: S) -> Self {
        Self { source, root: None, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Direct access to the node source backing this tree, for callers (such
    /// as `atlas-alloc`'s magazine) that manage its capacity out of band.
    pub fn node_source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn contains(&self, key: &T) -> bool {
        let Some(mut cursor) = self.root else { return false };
        loop {
            match self.source.get(cursor) {
                Node::Leaf(keys) => return keys.binary_search(key).is_ok(),
                Node::Interior(keys, children) => {
                    let idx = keys.partition_point(|k| k < key);
                    cursor = children[idx];
                }
            }
        }
    }

    /// The smallest stored element that is `>= key`, if any.
    pub fn lower_bound(&self, key: &T) -> Option<&T> {
        let mut cursor = self.root?;
        let mut candidate: Option<&T> = None;
        loop {
            match self.source.get(cursor) {
                Node::Leaf(keys) => {
                    let pos = keys.partition_point(|k| k < key);
                    return if pos < keys.len() { Some(&keys[pos]) } else { candidate };
                }
                Node::Interior(keys, children) => {
                    let idx = keys.partition_point(|k| k < key);
                    if idx < keys.len() {
                        candidate = Some(&keys[idx]);
                    }
                    cursor = children[idx];
                }
            }
        }
    }

    /// Visits every stored element in ascending order.
    pub fn for_each(&self, f: &mut impl FnMut(&T)) {
        if let Some(root) = self.root {
            self.walk(root, f);
        }
    }

    fn walk(&self, handle: H, f: &mut impl FnMut(&T)) {
        match self.source.get(handle) {
            Node::Leaf(keys) => {
                for key in keys {
                    f(key);
                }
            }
            Node::Interior(_, children) => {
                for &child in children {
                    self.walk(child, f);
                }
            }
        }
    }

    /// Collects every stored element in ascending order.
    pub fn to_vec(&self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        self.for_each(&mut |item| out.push(item.clone()));
        out
    }

    /// Inserts `key`, permitting duplicates. Panics if the node source is
    /// exhausted mid-insert, which for a magazine-backed source indicates
    /// its refill invariant was violated.
    pub fn insert(&mut self, key: T) {
        let root = match self.root {
            None => {
                let handle = self.acquire(Node::Leaf(vec![key]));
                self.root = Some(handle);
                self.len = 1;
                return;
            }
            Some(root) => root,
        };
        let root = if self.source.get(root).is_full() {
            let (sep, right) = self.split_node(root);
            let new_root = self.acquire(Node::Interior(vec![sep], vec![root, right]));
            self.root = Some(new_root);
            new_root
        } else {
            root
        };
        self.insert_non_full(root, key);
        self.len += 1;
    }

    fn acquire(&mut self, node: Node<T, H>) -> H {
        self.source.acquire(node).unwrap_or_else(|_| panic!("atlas-collections: node source exhausted"))
    }

    /// Splits a full node in place: the handle keeps the left half, a newly
    /// acquired node holds the right half, and the returned key is promoted
    /// to the caller. Leaves duplicate the promoted key into the right half
    /// (it becomes the right leaf's minimum); interior nodes remove it, since
    /// interior keys are disposable routing copies rather than real data.
    fn split_node(&mut self, handle: H) -> (T, H) {
        let (sep, new_node) = match self.source.get_mut(handle) {
            Node::Leaf(keys) => {
                let pivot = keys.len() / 2;
                let right_keys = keys.split_off(pivot);
                let sep = right_keys[0].clone();
                (sep, Node::Leaf(right_keys))
            }
            Node::Interior(keys, children) => {
                let pivot = keys.len() / 2;
                let mut right_keys = keys.split_off(pivot);
                let sep = right_keys.remove(0);
                let right_children = children.split_off(pivot + 1);
                (sep, Node::Interior(right_keys, right_children))
            }
        };
        let right_handle = self.acquire(new_node);
        (sep, right_handle)
    }

    fn insert_non_full(&mut self, handle: H, key: T) {
        if matches!(self.source.get(handle), Node::Leaf(_)) {
            if let Node::Leaf(keys) = self.source.get_mut(handle) {
                let pos = keys.partition_point(|k| *k < key);
                keys.insert(pos, key);
            }
            return;
        }
        loop {
            let idx = match self.source.get(handle) {
                Node::Interior(keys, _) => keys.partition_point(|k| *k < key),
                Node::Leaf(_) => unreachable!(),
            };
            let child = match self.source.get(handle) {
                Node::Interior(_, children) => children[idx],
                Node::Leaf(_) => unreachable!(),
            };
            if self.source.get(child).is_full() {
                let (sep, new_right) = self.split_node(child);
                if let Node::Interior(keys, children) = self.source.get_mut(handle) {
                    keys.insert(idx, sep);
                    children.insert(idx + 1, new_right);
                }
                continue;
            }
            self.insert_non_full(child, key);
            return;
        }
    }

    /// Removes one element equal to `key`, if present.
    pub fn erase(&mut self, key: &T) -> bool {
        let Some(root) = self.root else { return false };
        let removed = self.erase_from(root, key);
        if removed {
            self.len -= 1;
            self.collapse_root();
        }
        removed
    }

    fn collapse_root(&mut self) {
        let Some(root) = self.root else { return };
        let collapse_to = match self.source.get(root) {
            Node::Interior(keys, children) if keys.is_empty() => Some(children[0]),
            _ => None,
        };
        if let Some(child) = collapse_to {
            self.source.release(root);
            self.root = Some(child);
            return;
        }
        let drop_empty_leaf = matches!(self.source.get(root), Node::Leaf(keys) if keys.is_empty());
        if drop_empty_leaf {
            self.source.release(root);
            self.root = None;
        }
    }

    fn erase_from(&mut self, handle: H, key: &T) -> bool {
        if matches!(self.source.get(handle), Node::Leaf(_)) {
            let Node::Leaf(keys) = self.source.get_mut(handle) else { unreachable!() };
            return match keys.binary_search(key) {
                Ok(pos) => {
                    keys.remove(pos);
                    true
                }
                Err(_) => false,
            };
        }
        let idx = match self.source.get(handle) {
            Node::Interior(keys, _) => keys.partition_point(|k| k < key),
            Node::Leaf(_) => unreachable!(),
        };
        self.ensure_fillable(handle, idx);
        let idx = match self.source.get(handle) {
            Node::Interior(keys, _) => keys.partition_point(|k| k < key),
            Node::Leaf(_) => unreachable!(),
        };
        let child = match self.source.get(handle) {
            Node::Interior(_, children) => children[idx],
            Node::Leaf(_) => unreachable!(),
        };
        self.erase_from(child, key)
    }

    fn node_size(&self, handle: H) -> usize {
        self.source.get(handle).size()
    }

    fn min_fill(&self, handle: H) -> usize {
        self.source.get(handle).min_fill()
    }

    /// Guarantees `children[idx]` holds more than its minimum fill, rotating
    /// from a sibling or merging two siblings as needed, before the caller
    /// descends into it and possibly removes one element.
    fn ensure_fillable(&mut self, parent: H, idx: usize) {
        let child = match self.source.get(parent) {
            Node::Interior(_, children) => children[idx],
            Node::Leaf(_) => unreachable!(),
        };
        if self.node_size(child) > self.min_fill(child) {
            return;
        }
        let keys_len = match self.source.get(parent) {
            Node::Interior(keys, _) => keys.len(),
            Node::Leaf(_) => unreachable!(),
        };
        let left = (idx > 0).then(|| match self.source.get(parent) {
            Node::Interior(_, children) => children[idx - 1],
            Node::Leaf(_) => unreachable!(),
        });
        let right = (idx < keys_len).then(|| match self.source.get(parent) {
            Node::Interior(_, children) => children[idx + 1],
            Node::Leaf(_) => unreachable!(),
        });

        if let Some(left) = left {
            if self.node_size(left) > self.min_fill(left) {
                self.rotate_from_left(parent, idx);
                return;
            }
        }
        if let Some(right) = right {
            if self.node_size(right) > self.min_fill(right) {
                self.rotate_from_right(parent, idx);
                return;
            }
        }
        if right.is_some() {
            self.merge_children(parent, idx);
        } else {
            self.merge_children(parent, idx - 1);
        }
    }

    fn rotate_from_left(&mut self, parent: H, idx: usize) {
        let (left, right) = match self.source.get(parent) {
            Node::Interior(_, children) => (children[idx - 1], children[idx]),
            Node::Leaf(_) => unreachable!(),
        };
        match self.source.get_mut(left) {
            Node::Leaf(left_keys) => {
                let moved = left_keys.pop().expect("left sibling has spare elements");
                if let Node::Leaf(right_keys) = self.source.get_mut(right) {
                    right_keys.insert(0, moved.clone());
                }
                if let Node::Interior(keys, _) = self.source.get_mut(parent) {
                    keys[idx - 1] = moved;
                }
            }
            Node::Interior(..) => {
                let (moved_key, moved_child) = match self.source.get_mut(left) {
                    Node::Interior(keys, children) => {
                        (keys.pop().expect("left sibling has spare keys"), children.pop().expect("left sibling has spare children"))
                    }
                    Node::Leaf(_) => unreachable!(),
                };
                let old_sep = match self.source.get(parent) {
                    Node::Interior(keys, _) => keys[idx - 1].clone(),
                    Node::Leaf(_) => unreachable!(),
                };
                if let Node::Interior(keys, children) = self.source.get_mut(right) {
                    keys.insert(0, old_sep);
                    children.insert(0, moved_child);
                }
                if let Node::Interior(keys, _) = self.source.get_mut(parent) {
                    keys[idx - 1] = moved_key;
                }
            }
        }
    }

    fn rotate_from_right(&mut self, parent: H, idx: usize) {
        let (left, right) = match self.source.get(parent) {
            Node::Interior(_, children) => (children[idx], children[idx + 1]),
            Node::Leaf(_) => unreachable!(),
        };
        match self.source.get_mut(right) {
            Node::Leaf(right_keys) => {
                let moved = right_keys.remove(0);
                if let Node::Leaf(left_keys) = self.source.get_mut(left) {
                    left_keys.push(moved);
                }
                let new_min = match self.source.get(right) {
                    Node::Leaf(right_keys) => right_keys[0].clone(),
                    Node::Interior(..) => unreachable!(),
                };
                if let Node::Interior(keys, _) = self.source.get_mut(parent) {
                    keys[idx] = new_min;
                }
            }
            Node::Interior(..) => {
                let (moved_key, moved_child) = match self.source.get_mut(right) {
                    Node::Interior(keys, children) => (keys.remove(0), children.remove(0)),
                    Node::Leaf(_) => unreachable!(),
                };
                let old_sep = match self.source.get(parent) {
                    Node::Interior(keys, _) => keys[idx].clone(),
                    Node::Leaf(_) => unreachable!(),
                };
                if let Node::Interior(keys, children) = self.source.get_mut(left) {
                    keys.push(old_sep);
                    children.push(moved_child);
                }
                if let Node::Interior(keys, _) = self.source.get_mut(parent) {
                    keys[idx] = moved_key;
                }
            }
        }
    }

    /// Merges `children[idx + 1]` into `children[idx]`, removing
    /// `keys[idx]` from `parent`. Only safe once rotation from both
    /// siblings has been ruled out.
    fn merge_children(&mut self, parent: H, idx: usize) {
        let (left, right) = match self.source.get(parent) {
            Node::Interior(_, children) => (children[idx], children[idx + 1]),
            Node::Leaf(_) => unreachable!(),
        };
        match self.source.release(right) {
            Node::Leaf(mut right_keys) => {
                if let Node::Leaf(left_keys) = self.source.get_mut(left) {
                    left_keys.append(&mut right_keys);
                }
            }
            Node::Interior(mut right_keys, mut right_children) => {
                let sep = match self.source.get(parent) {
                    Node::Interior(keys, _) => keys[idx].clone(),
                    Node::Leaf(_) => unreachable!(),
                };
                if let Node::Interior(keys, children) = self.source.get_mut(left) {
                    keys.push(sep);
                    keys.append(&mut right_keys);
                    children.append(&mut right_children);
                }
            }
        }
        if let Node::Interior(keys, children) = self.source.get_mut(parent) {
            keys.remove(idx);
            children.remove(idx + 1);
        }
    }
}
