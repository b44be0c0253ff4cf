// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

use crate::ordered_set::OrderedSet;

#[test]
fn insert_rejects_duplicates() {
    let mut set: OrderedSet<i32> = OrderedSet::new();
    assert!(set.insert(5));
    assert!(!set.insert(5));
    assert_eq!(set.len(), 1);
}

#[test]
fn remove_reports_whether_the_value_was_present() {
    let mut set: OrderedSet<i32> = OrderedSet::new();
    set.insert(3);
    assert!(set.remove(&3));
    assert!(!set.remove(&3));
    assert!(set.is_empty());
}

#[test]
fn to_vec_is_sorted() {
    let mut set: OrderedSet<i32> = OrderedSet::new();
    for value in [9, 1, 5, 3, 7] {
        set.insert(value);
    }
    assert_eq!(set.to_vec(), vec![1, 3, 5, 7, 9]);
}
