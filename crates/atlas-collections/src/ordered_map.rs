// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

//! A sorted key/value map, implemented (as the source's `OrderedMap` is)
//! as an [`OrderedSet`] over key/value pairs ordered solely by key.

use crate::arena::GlobalNodeSource;
use crate::btree::{BTree, Node};

/// A key/value pair ordered only by `key`. Lookups build a throwaway
/// `Entry` with `V::default()` standing in for a value the comparison
/// never inspects; callers needing a `V` with no sensible default should
/// keep their values behind an `Option` or small enum instead.
#[derive(Clone)]
struct Entry<K, V> {
    key: K,
    value: V,
}

impl<K: PartialEq, V> PartialEq for Entry<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<K: Eq, V> Eq for Entry<K, V> {}

impl<K: PartialOrd, V> PartialOrd for Entry<K, V> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.key.partial_cmp(&other.key)
    }
}

impl<K: Ord, V> Ord for Entry<K, V> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

type Source<K, V> = GlobalNodeSource<Node<Entry<K, V>, usize>>;

pub struct OrderedMap<K: Ord + Clone, V: Clone + Default> {
    tree: BTree<Entry<K, V>, usize, Source<K, V>>,
}

impl<K: Ord + Clone, V: Clone + Default> Default for OrderedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone, V: Clone + Default> OrderedMap<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self { tree: BTree::new(GlobalNodeSource::new()) }
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    fn probe(key: &K) -> Entry<K, V> {
        Entry { key: key.clone(), value: V::default() }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.tree.contains(&Self::probe(key))
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let probe = Self::probe(key);
        let found = self.tree.lower_bound(&probe)?;
        (found.key == *key).then_some(&found.value)
    }

    /// Inserts or overwrites the value for `key`, returning the prior value.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let previous = self.get(&key).cloned();
        if previous.is_some() {
            self.tree.erase(&Self::probe(&key));
        }
        self.tree.insert(Entry { key, value });
        previous
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let previous = self.get(key).cloned();
        if previous.is_some() {
            self.tree.erase(&Self::probe(key));
        }
        previous
    }

    pub fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        self.tree.for_each(&mut |entry| f(&entry.key, &entry.value));
    }
}
