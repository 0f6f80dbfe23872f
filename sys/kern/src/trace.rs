// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Compact kernel events, recorded in the kernel's trace ring.

use ringbuf::{Ringbuf, RingbufEntry};

use crate::interrupt::IntKind;
use crate::thread::ThreadId;
use crate::time::Timestamp;

/// Number of entries kept in the trace ring.
pub const TRACE_DEPTH: usize = 64;

pub type TraceRing = Ringbuf<Trace, TRACE_DEPTH>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Trace {
    None,
    Boot,
    Forked(ThreadId),
    Ready(ThreadId),
    Blocked(ThreadId),
    Dispatch { from: ThreadId, to: ThreadId },
    Finished(ThreadId),
    Destroyed(ThreadId),
    Scheduled { kind: IntKind, at: Timestamp },
    Fired { kind: IntKind, at: Timestamp },
    IdleUntil(Timestamp),
    Halt,
}

pub fn new_ring() -> TraceRing {
    Ringbuf::new(Trace::None)
}

/// Copies out the ring, oldest entry first.
pub fn snapshot(ring: &TraceRing) -> Vec<RingbufEntry<Trace>> {
    ring.iter().copied().collect()
}
