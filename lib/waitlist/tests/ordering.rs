// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use proptest::prelude::*;
use waitlist::WaitList;

proptest! {
    /// Draining a sorted list gives keys in nondecreasing order, and among
    /// equal keys, items come out in the order they were inserted.
    #[test]
    fn sorted_insert_is_stable(keys in proptest::collection::vec(0u8..8, 0..64)) {
        let mut list = WaitList::new();
        for (seq, key) in keys.iter().enumerate() {
            list.sorted_insert(seq, *key);
        }
        prop_assert_eq!(list.len(), keys.len());

        let mut out = Vec::new();
        while let Some(pair) = list.sorted_remove() {
            out.push(pair);
        }

        let mut expected: Vec<(u8, usize)> =
            keys.iter().enumerate().map(|(seq, key)| (*key, seq)).collect();
        // `sort_by_key` is stable, so this is the reference ordering.
        expected.sort_by_key(|(key, _)| *key);
        prop_assert_eq!(out, expected);
    }

    /// Plain appends never reorder anything.
    #[test]
    fn append_preserves_order(items in proptest::collection::vec(any::<u32>(), 0..64)) {
        let mut list: WaitList<u32> = WaitList::new();
        for i in &items {
            list.append(*i);
        }
        let out: Vec<u32> = std::iter::from_fn(|| list.remove()).collect();
        prop_assert_eq!(out, items);
    }
}
