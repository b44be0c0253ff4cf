// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

use super::{Node, BTree, LEAF_CAPACITY};
use crate::arena::GlobalNodeSource;
use proptest::prelude::*;

type TestTree = BTree<i64, usize, GlobalNodeSource<Node<i64, usize>>>;

fn new_tree() -> TestTree {
    BTree::new(GlobalNodeSource::new())
}

#[test]
fn empty_tree_has_no_elements() {
    let tree = new_tree();
    assert_eq!(tree.len(), 0);
    assert!(tree.is_empty());
    assert!(!tree.contains(&0));
}

#[test]
fn insert_and_contains_round_trip() {
    let mut tree = new_tree();
    for value in [5, 1, 9, 3, 7] {
        tree.insert(value);
    }
    assert_eq!(tree.len(), 5);
    for value in [5, 1, 9, 3, 7] {
        assert!(tree.contains(&value));
    }
    assert!(!tree.contains(&42));
}

#[test]
fn in_order_traversal_is_sorted_after_many_splits() {
    let mut tree = new_tree();
    // Comfortably larger than LEAF_CAPACITY so the root splits more than once.
    let count = (LEAF_CAPACITY as i64) * 20;
    for value in (0..count).rev() {
        tree.insert(value);
    }
    let collected = tree.to_vec();
    let mut expected: Vec<i64> = (0..count).collect();
    expected.sort_unstable();
    assert_eq!(collected, expected);
    assert_eq!(tree.len(), count as usize);
}

#[test]
fn erase_shrinks_the_tree_and_preserves_order() {
    let mut tree = new_tree();
    let count = (LEAF_CAPACITY as i64) * 10;
    for value in 0..count {
        tree.insert(value);
    }
    // Remove every third element, forcing rotations and merges throughout.
    let mut removed = Vec::new();
    for value in (0..count).step_by(3) {
        assert!(tree.erase(&value));
        removed.push(value);
    }
    assert_eq!(tree.len(), (count as usize) - removed.len());
    for value in &removed {
        assert!(!tree.contains(value));
    }
    let remaining = tree.to_vec();
    let mut expected: Vec<i64> = (0..count).filter(|v| v % 3 != 0).collect();
    expected.sort_unstable();
    assert_eq!(remaining, expected);
}

#[test]
fn erase_missing_key_returns_false() {
    let mut tree = new_tree();
    tree.insert(1);
    assert!(!tree.erase(&2));
    assert_eq!(tree.len(), 1);
}

#[test]
fn erasing_every_element_empties_the_tree() {
    let mut tree = new_tree();
    let values: Vec<i64> = (0..(LEAF_CAPACITY as i64) * 5).collect();
    for &value in &values {
        tree.insert(value);
    }
    for &value in &values {
        assert!(tree.erase(&value));
    }
    assert!(tree.is_empty());
    assert_eq!(tree.to_vec(), Vec::<i64>::new());
}

#[test]
fn lower_bound_finds_the_smallest_match_or_successor() {
    let mut tree = new_tree();
    for value in [10, 20, 30, 40] {
        tree.insert(value);
    }
    assert_eq!(tree.lower_bound(&25), Some(&30));
    assert_eq!(tree.lower_bound(&10), Some(&10));
    assert_eq!(tree.lower_bound(&41), None);
}

#[test]
fn duplicate_keys_are_all_retained() {
    let mut tree = new_tree();
    for _ in 0..5 {
        tree.insert(7);
    }
    assert_eq!(tree.len(), 5);
    assert!(tree.erase(&7));
    assert_eq!(tree.len(), 4);
    assert!(tree.contains(&7));
}

proptest! {
    #[test]
    fn arbitrary_insert_sequences_stay_sorted(values in proptest::collection::vec(any::<i32>(), 0..300)) {
        let mut tree: BTree<i32, usize, GlobalNodeSource<Node<i32, usize>>> = BTree::new(GlobalNodeSource::new());
        for &v in &values {
            tree.insert(v);
        }
        let mut expected = values.clone();
        expected.sort_unstable();
        prop_assert_eq!(tree.to_vec(), expected);
        prop_assert_eq!(tree.len(), values.len());
    }

    #[test]
    fn insert_then_erase_every_value_drains_the_tree(values in proptest::collection::vec(any::<i32>(), 0..200)) {
        let mut tree: BTree<i32, usize, GlobalNodeSource<Node<i32, usize>>> = BTree::new(GlobalNodeSource::new());
        for &v in &values {
            tree.insert(v);
        }
        for &v in &values {
            prop_assert!(tree.erase(&v));
        }
        prop_assert!(tree.is_empty());
    }
}
