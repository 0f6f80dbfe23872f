// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An ordered wait queue.
//!
//! `WaitList` is the one sequence type used by the simulated kernel: the
//! ready queue, the pending-interrupt queue, and the wait list of every
//! blocking primitive are all `WaitList`s.
//!
//! Each item carries a key. Items can be added in plain FIFO order (`append`,
//! keyed with `K::default()`), or at a position determined by their key
//! (`sorted_insert`). Sorted insertion is *stable*: an item goes after
//! every existing item with an equal key, so equal keys leave in arrival
//! order.
//!
//! # Design goals
//!
//! 1. `no_std` with `alloc`, so the queue can back kernel structures directly.
//! 2. Removal from the head is cheap, since that's what every consumer does.
//! 3. Code clarity. Insertion is a binary search followed by an insert into
//!    a `VecDeque`; nothing cleverer.
//!
//! Non-goals:
//!
//! - Concurrent access. The queue is always mutated through `&mut`; callers
//!   provide their own exclusion (in the kernel, that means interrupts off).
//! - Removal from the middle of the queue. Nothing in the kernel needs it.

#![no_std]

extern crate alloc;

use alloc::collections::VecDeque;

/// An ordered sequence of `T`, each tagged with a key of type `K`.
///
/// The key defaults to `()`, which makes `WaitList<T>` a plain FIFO.
#[derive(Clone, Debug)]
pub struct WaitList<T, K = ()> {
    items: VecDeque<(K, T)>,
}

impl<T, K> Default for WaitList<T, K> {
    fn default() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }
}

impl<T, K: Ord + Copy + Default> WaitList<T, K> {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `item` at the tail, keyed with `K::default()`.
    pub fn append(&mut self, item: T) {
        self.items.push_back((K::default(), item));
    }

    /// Removes the item at the head, discarding its key.
    pub fn remove(&mut self) -> Option<T> {
        self.items.pop_front().map(|(_, item)| item)
    }

    /// Inserts `item` in key order, after any items whose key is equal to
    /// `key`.
    pub fn sorted_insert(&mut self, item: T, key: K) {
        let at = self.items.partition_point(|(k, _)| *k <= key);
        self.items.insert(at, (key, item));
    }

    /// Removes the item at the head and reports the key it was filed under.
    pub fn sorted_remove(&mut self) -> Option<(K, T)> {
        self.items.pop_front()
    }

    /// Returns the key at the head without removing anything.
    pub fn first_key(&self) -> Option<K> {
        self.items.front().map(|(k, _)| *k)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Walks the list from head to tail.
    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> + '_ {
        self.items.iter().map(|(k, item)| (*k, item))
    }

    /// Empties the list, handing back everything in head-to-tail order.
    pub fn drain(&mut self) -> impl Iterator<Item = (K, T)> + '_ {
        self.items.drain(..)
    }
}
