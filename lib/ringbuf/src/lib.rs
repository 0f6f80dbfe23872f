// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring buffer for tracing the simulated kernel
//!
//! This contains an owned, fixed-size ring buffer designed to record the most
//! recent events of some context. The kernel keeps one inside its state and
//! hands a chronological copy of it back to the host when a run ends, so a
//! test (or a person staring at a failed run) can see what happened last.
//!
//! ## Constraints
//!
//! The type in the ring buffer must implement both `Copy` and `PartialEq`.
//!
//! ## Recording entries
//!
//! A ring buffer is created with [`Ringbuf::new`], giving the value used to
//! fill unused slots:
//!
//! ```
//! # use ringbuf::Ringbuf;
//! let mut buf: Ringbuf<u32, 16> = Ringbuf::new(0);
//! # let _ = &mut buf;
//! ```
//!
//! Entries are added with [`ringbuf_entry!`], which records the source line
//! of the call site along with the payload:
//!
//! ```
//! # use ringbuf::{ringbuf_entry, Ringbuf};
//! # let mut buf: Ringbuf<u32, 16> = Ringbuf::new(0);
//! ringbuf_entry!(buf, 42);
//! assert_eq!(buf.iter().count(), 1);
//! ```
//!
//! When an entry is recorded with an identical payload from the same line as
//! the most recent entry, the most recent entry's `count` is bumped instead
//! of using a new slot. A thread spinning in a loop therefore shows up as a
//! single entry with a large count rather than wiping out the history.

#![no_std]

/// Inserts data into a ring buffer.
///
/// `ringbuf_entry!(buf, expr)` records `expr` in `buf`, which must be a place
/// expression of type `Ringbuf<T, N>` that can be mutably borrowed.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        // Evaluate the payload before borrowing the buffer, so that the
        // payload expression is free to read from the same structure.
        let p = $payload;
        $crate::Ringbuf::entry(&mut $buf, line!() as u16, p);
    }};
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        let _ = &$buf;
        let _ = &$payload;
    }};
}

///
/// The structure of a single [`Ringbuf`] entry, carrying a payload of arbitrary
/// type.  When a ring buffer entry is generated with an identical payload to
/// the most recent entry (in terms of both `line` and `payload`), `count` will
/// be incremented rather than generating a new entry.
///
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

///
/// A ring buffer of parametrized type and size.
///
#[derive(Debug, Clone)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    last: Option<usize>,
    buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, { N }> {
    /// Creates an empty ring buffer whose slots are filled with `init`.
    pub const fn new(init: T) -> Self {
        Self {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: init,
            }; N],
        }
    }

    pub fn entry(&mut self, line: u16, payload: T) {
        // On first use `last` is None. Treating that as an out-of-range index
        // makes both the reuse check and the advance below do the right
        // thing: nothing gets reused, and the first entry lands in slot 0.
        let last = self.last.unwrap_or(usize::MAX);

        if let Some(ent) = self.buffer.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                // Only reuse this entry if we don't overflow the count.
                if let Some(new_count) = ent.count.checked_add(1) {
                    ent.count = new_count;
                    return;
                }
            }
        }

        let ndx = {
            let last_plus_1 = last.wrapping_add(1);
            if last_plus_1 >= self.buffer.len() {
                0
            } else {
                last_plus_1
            }
        };

        // N == 0 leaves us nowhere to put anything.
        let Some(ent) = self.buffer.get_mut(ndx) else {
            return;
        };
        *ent = RingbufEntry {
            line,
            payload,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };

        self.last = Some(ndx);
    }

    /// Returns the most recently recorded entry, if any.
    pub fn last_entry(&self) -> Option<&RingbufEntry<T>> {
        self.last.and_then(|ndx| self.buffer.get(ndx))
    }

    /// Walks the recorded entries, oldest first. Slots that have never been
    /// written are skipped.
    pub fn iter(&self) -> impl Iterator<Item = &RingbufEntry<T>> + '_ {
        // The oldest entry sits just past the newest one, once we've wrapped.
        let start = self.last.map_or(0, |l| l + 1);
        let (newer, older) = self.buffer.split_at(start.min(N));
        older
            .iter()
            .chain(newer.iter())
            .filter(|ent| ent.count != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_buffer_has_no_entries() {
        let buf: Ringbuf<u8, 4> = Ringbuf::new(0);
        assert_eq!(buf.iter().count(), 0);
        assert!(buf.last_entry().is_none());
    }

    #[test]
    fn repeated_entries_coalesce() {
        let mut buf: Ringbuf<u8, 4> = Ringbuf::new(0);
        buf.entry(10, 7);
        buf.entry(10, 7);
        buf.entry(10, 7);
        let last = buf.last_entry().unwrap();
        assert_eq!(last.count, 3);
        assert_eq!(buf.iter().count(), 1);

        // Same payload from a different line is a new entry.
        buf.entry(11, 7);
        assert_eq!(buf.iter().count(), 2);
    }

    #[test]
    fn wraps_oldest_first() {
        let mut buf: Ringbuf<u8, 3> = Ringbuf::new(0);
        for p in 1..=5 {
            buf.entry(1, p);
        }
        let payloads: [u8; 3] = {
            let mut it = buf.iter().map(|e| e.payload);
            [it.next().unwrap(), it.next().unwrap(), it.next().unwrap()]
        };
        assert_eq!(payloads, [3, 4, 5]);
        // Slot 0 has been written twice.
        assert_eq!(buf.iter().find(|e| e.payload == 4).unwrap().generation, 2);
    }

    #[test]
    fn macro_records_call_site() {
        let mut buf: Ringbuf<u8, 2> = Ringbuf::new(0);
        ringbuf_entry!(buf, 9);
        let line = buf.last_entry().unwrap().line;
        assert_eq!(u32::from(line), line!() - 2);
    }
}
