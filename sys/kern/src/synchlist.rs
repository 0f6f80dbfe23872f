// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A list that threads can block on.

use waitlist::WaitList;

use crate::cell::KernelCell;
use crate::kernel::Kernel;
use crate::synch::{Condition, Lock};

/// A FIFO list with mutual exclusion, where `remove` waits for something to
/// remove. The usual way to hand work from one thread to another.
pub struct SynchList<T> {
    name: String,
    items: KernelCell<WaitList<T>>,
    lock: Lock,
    list_empty: Condition,
}

impl<T: Send> SynchList<T> {
    pub fn new(kernel: &Kernel, name: &str) -> Self {
        Self {
            name: name.to_string(),
            items: KernelCell::new(WaitList::new()),
            lock: Lock::new(kernel, &format!("{name} lock")),
            list_empty: Condition::new(kernel, &format!("{name} not empty")),
        }
    }

    /// Adds `item` at the end, waking a thread waiting in `remove` if there is
    /// one.
    pub fn append(&self, item: T) {
        self.lock.acquire();
        let n = self.items.with(|l| {
            l.append(item);
            l.len()
        });
        log::trace!("appended to \"{}\", now {n} long", self.name);
        self.list_empty.signal(&self.lock);
        self.lock.release();
    }

    /// Takes the first item off the list, waiting for one to show up if the
    /// list is empty.
    pub fn remove(&self) -> T {
        self.lock.acquire();
        let item = loop {
            if let Some(item) = self.items.with(|l| l.remove()) {
                break item;
            }
            log::trace!("waiting for something on \"{}\"", self.name);
            self.list_empty.wait(&self.lock);
        };
        self.lock.release();
        item
    }

    /// Calls `f` on each item, first to last, with the list locked. `f` must
    /// not call back into the kernel.
    pub fn for_each(&self, mut f: impl FnMut(&T)) {
        self.lock.acquire();
        self.items.with(|l| {
            for (_, item) in l.iter() {
                f(item);
            }
        });
        self.lock.release();
    }

    pub fn len(&self) -> usize {
        self.lock.acquire();
        let n = self.items.with(|l| l.len());
        self.lock.release();
        n
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
