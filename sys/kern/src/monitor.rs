// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hoare-style monitors.
//!
//! A [`Monitor`] is an entry lock plus an "urgent" queue. A [`ConditionH`]
//! hands the monitor directly from signaler to waiter: the signaler steps
//! aside onto the urgent queue, the waiter runs immediately with the monitor
//! and with the condition it waited for still true, and the signaler gets the
//! monitor back (ahead of anybody waiting to enter) once the waiter waits
//! again or leaves.
//!
//! So, unlike with [`Condition`](crate::synch::Condition), a waiter doesn't
//! need to re-check in a loop:
//!
//! ```ignore
//! monitor.enter();
//! if count == 0 {
//!     not_empty.wait(&monitor);
//! }
//! // count > 0 here, guaranteed.
//! monitor.leave();
//! ```
//!
//! Everything here is built from semaphores, with the classic construction.

use std::fmt;

use crate::cell::KernelCell;
use crate::kernel::Kernel;
use crate::synch::Semaphore;

/// The shared part of a Hoare monitor: entry lock and urgent queue.
pub struct Monitor {
    name: String,
    mutex: Semaphore,
    /// Signalers wait here for the monitor to come back to them.
    next: Semaphore,
    next_count: KernelCell<u32>,
}

impl Monitor {
    pub fn new(kernel: &Kernel, name: &str) -> Self {
        Self {
            name: name.to_string(),
            mutex: Semaphore::new(kernel, &format!("{name} mutex"), 1),
            next: Semaphore::new(kernel, &format!("{name} next"), 0),
            next_count: KernelCell::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn enter(&self) {
        self.mutex.p();
    }

    /// Leaves the monitor, handing it to a suspended signaler if there is one,
    /// or to the next thread waiting to enter otherwise.
    pub fn leave(&self) {
        self.hand_off();
    }

    fn hand_off(&self) {
        let urgent = self.next_count.with(|n| *n);
        if urgent > 0 {
            log::trace!(
                "monitor \"{}\" back to a signaler ({urgent} urgent)",
                self.name
            );
            self.next.v();
        } else {
            self.mutex.v();
        }
    }

    /// Number of signalers suspended waiting to get the monitor back.
    pub fn urgent_count(&self) -> u32 {
        self.next_count.with(|n| *n)
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A condition variable with Hoare semantics, used inside a [`Monitor`].
pub struct ConditionH {
    name: String,
    sem: Semaphore,
    count: KernelCell<u32>,
}

impl ConditionH {
    pub fn new(kernel: &Kernel, name: &str) -> Self {
        Self {
            name: name.to_string(),
            sem: Semaphore::new(kernel, name, 0),
            count: KernelCell::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gives up the monitor and waits to be signaled. Returns holding the
    /// monitor, with the signaled condition true.
    pub fn wait(&self, monitor: &Monitor) {
        self.count.with(|c| *c += 1);
        log::trace!(
            "waiting on \"{}\" in monitor \"{}\"",
            self.name,
            monitor.name
        );
        monitor.hand_off();
        self.sem.p();
        self.count.with(|c| *c -= 1);
    }

    /// If anybody is waiting, hands the monitor to one of them and waits for
    /// it to come back. Does nothing otherwise.
    pub fn signal(&self, monitor: &Monitor) {
        if self.count.with(|c| *c) == 0 {
            return;
        }
        monitor.next_count.with(|n| *n += 1);
        log::trace!(
            "\"{}\" signaled; handing monitor \"{}\" to the waiter",
            self.name,
            monitor.name
        );
        self.sem.v();
        monitor.next.p();
        monitor.next_count.with(|n| *n -= 1);
    }

    /// Signals every thread that was waiting when `broadcast` was called, one
    /// at a time. Each gets the monitor in turn; the broadcaster gets it back
    /// after the last. Threads that start waiting during the broadcast are
    /// not woken by it.
    pub fn broadcast(&self, monitor: &Monitor) {
        let waiting = self.waiting();
        for _ in 0..waiting {
            if self.waiting() == 0 {
                break;
            }
            self.signal(monitor);
        }
    }

    /// Number of threads waiting right now.
    pub fn waiting(&self) -> u32 {
        self.count.with(|c| *c)
    }
}

impl fmt::Debug for ConditionH {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionH")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
