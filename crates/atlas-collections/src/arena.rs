// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

//! A plain slab-backed [`NodeSource`], the node storage for every tree in
//! the workspace that has no reentrancy hazard to avoid — the snapshot's
//! ordered image set, for example, unlike the allocator's free-range
//! indices, which draw from `atlas-alloc`'s magazine instead.

use atlas_core::NodeSource;

enum Slot<T> {
    Occupied(T),
    Vacant { next_free: usize },
}

/// Owns a growable `Vec` of slots and hands out indices into it.
pub struct GlobalNodeSource<T> {
    slots: Vec<Slot<T>>,
    next_free: Option<usize>,
}

impl<T> Default for GlobalNodeSource<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> GlobalNodeSource<T> {
    #[must_use]
    pub fn new() -> Self {
        Self { slots: Vec::new(), next_free: None }
    }
}

impl<T> NodeSource<T> for GlobalNodeSource<T> {
    type Handle = usize;

    fn acquire(&mut self, node: T) -> Result<usize, T> {
        if let Some(index) = self.next_free {
            let Slot::Vacant { next_free } = self.slots[index] else {
                unreachable!("free list points at an occupied slot");
            };
            self.next_free = (next_free != usize::MAX).then_some(next_free);
            self.slots[index] = Slot::Occupied(node);
            Ok(index)
        } else {
            self.slots.push(Slot::Occupied(node));
            Ok(self.slots.len() - 1)
        }
    }

    fn release(&mut self, handle: usize) -> T {
        let next_free = self.next_free.unwrap_or(usize::MAX);
        let slot = std::mem::replace(&mut self.slots[handle], Slot::Vacant { next_free });
        self.next_free = Some(handle);
        match slot {
            Slot::Occupied(node) => node,
            Slot::Vacant { .. } => panic!("atlas-collections: double release of node handle {handle}"),
        }
    }

    fn get(&self, handle: usize) -> &T {
        match &self.slots[handle] {
            Slot::Occupied(node) => node,
            Slot::Vacant { .. } => panic!("atlas-collections: use of released node handle {handle}"),
        }
    }

    fn get_mut(&mut self, handle: usize) -> &mut T {
        match &mut self.slots[handle] {
            Slot::Occupied(node) => node,
            Slot::Vacant { .. } => panic!("atlas-collections: use of released node handle {handle}"),
        }
    }
}
