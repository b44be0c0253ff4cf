// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

use crate::ordered_map::OrderedMap;

#[test]
fn insert_then_get_round_trips() {
    let mut map: OrderedMap<u32, &'static str> = OrderedMap::new();
    assert_eq!(map.insert(1, "one"), None);
    assert_eq!(map.get(&1), Some(&"one"));
    assert!(map.contains_key(&1));
    assert!(!map.contains_key(&2));
}

#[test]
fn insert_overwrites_and_returns_previous_value() {
    let mut map: OrderedMap<u32, u32> = OrderedMap::new();
    map.insert(1, 10);
    let previous = map.insert(1, 20);
    assert_eq!(previous, Some(10));
    assert_eq!(map.get(&1), Some(&20));
    assert_eq!(map.len(), 1);
}

#[test]
fn remove_returns_the_stored_value_once() {
    let mut map: OrderedMap<u32, u32> = OrderedMap::new();
    map.insert(1, 100);
    assert_eq!(map.remove(&1), Some(100));
    assert_eq!(map.remove(&1), None);
    assert!(map.is_empty());
}

#[test]
fn for_each_visits_keys_in_order() {
    let mut map: OrderedMap<u32, u32> = OrderedMap::new();
    for key in [5, 1, 3] {
        map.insert(key, key * 10);
    }
    let mut seen = Vec::new();
    map.for_each(|k, v| seen.push((*k, *v)));
    assert_eq!(seen, vec![(1, 10), (3, 30), (5, 50)]);
}
