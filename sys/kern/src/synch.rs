// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Semaphores, locks, and (Mesa-style) condition variables.
//!
//! All three get their atomicity the same way the rest of the kernel does:
//! by turning interrupts off for the duration of each operation. Blocking is
//! always "put myself on a wait list, then `sleep`"; waking is "take somebody
//! off a wait list and `ready_to_run` them".

use std::fmt;

use waitlist::WaitList;

use crate::cell::KernelCell;
use crate::fail;
use crate::interrupt::IntLevel;
use crate::kernel::Kernel;
use crate::thread::ThreadId;

struct SemState {
    value: u32,
    waiters: WaitList<ThreadId>,
}

/// A counting semaphore.
///
/// The count never goes negative: `p` waits for it to be positive before
/// decrementing it. `v` wakes at most one waiter and increments the count
/// regardless, so a `v` with nobody waiting is never lost.
pub struct Semaphore {
    kernel: Kernel,
    name: String,
    state: KernelCell<SemState>,
}

impl Semaphore {
    pub fn new(kernel: &Kernel, name: &str, initial: u32) -> Self {
        Self {
            kernel: kernel.clone(),
            name: name.to_string(),
            state: KernelCell::new(SemState {
                value: initial,
                waiters: WaitList::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current count. Only meaningful to tests and diagnostics; by the time
    /// you look at it, it may have changed.
    pub fn value(&self) -> u32 {
        self.state.with(|s| s.value)
    }

    /// Waits until the count is positive, then decrements it.
    pub fn p(&self) {
        let k = &self.kernel;
        let old = k.set_level(IntLevel::Off);
        loop {
            let me = k.current_thread();
            let acquired = self.state.with(|s| {
                if s.value == 0 {
                    s.waiters.append(me);
                    false
                } else {
                    s.value -= 1;
                    true
                }
            });
            if acquired {
                break;
            }
            log::trace!("{me} waiting on semaphore \"{}\"", self.name);
            k.sleep();
        }
        k.set_level(old);
    }

    /// Increments the count, waking one waiter if there are any.
    pub fn v(&self) {
        let k = &self.kernel;
        let old = k.set_level(IntLevel::Off);
        let woken = self.state.with(|s| s.waiters.remove());
        if let Some(t) = woken {
            log::trace!("semaphore \"{}\" waking {t}", self.name);
            k.ready_to_run(t);
        }
        self.state.with(|s| s.value += 1);
        k.set_level(old);
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A mutual-exclusion lock with an owner.
///
/// Only the thread that acquired a lock may release it; anything else is a
/// kernel bug and kills the run.
pub struct Lock {
    kernel: Kernel,
    id: u64,
    name: String,
    sem: Semaphore,
    owner: KernelCell<Option<ThreadId>>,
}

impl Lock {
    pub fn new(kernel: &Kernel, name: &str) -> Self {
        Self {
            kernel: kernel.clone(),
            id: kernel.object_id(),
            name: name.to_string(),
            sem: Semaphore::new(kernel, name, 1),
            owner: KernelCell::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn acquire(&self) {
        let k = &self.kernel;
        let old = k.set_level(IntLevel::Off);
        let me = k.current_thread();
        if self.owner.with(|o| *o) == Some(me) {
            fail::die(format_args!(
                "{me} acquiring lock \"{}\" it already holds",
                self.name
            ));
        }
        self.sem.p();
        self.owner.with(|o| *o = Some(me));
        k.set_level(old);
    }

    pub fn release(&self) {
        let k = &self.kernel;
        let old = k.set_level(IntLevel::Off);
        let me = k.current_thread();
        let owner = self.owner.with(|o| o.take());
        if owner != Some(me) {
            fail::die(format_args!(
                "{me} released lock \"{}\" held by {owner:?}",
                self.name
            ));
        }
        self.sem.v();
        k.set_level(old);
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        let me = self.kernel.current_thread();
        self.owner.with(|o| *o == Some(me))
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

struct CondState {
    waiters: WaitList<ThreadId>,
    /// The lock this condition is used with, fixed by the first `wait`.
    bound: Option<u64>,
}

/// A condition variable with Mesa semantics.
///
/// `signal` makes a waiter ready, nothing more. The signaler keeps running
/// (and keeps the lock), so by the time the waiter gets the lock back the
/// condition it waited for may no longer hold. Always wait in a loop:
///
/// ```ignore
/// lock.acquire();
/// while !ready() {
///     cond.wait(&lock);
/// }
/// ```
///
/// A condition is bound to the lock passed to its first `wait`, and using it
/// with any other lock after that is fatal.
pub struct Condition {
    kernel: Kernel,
    name: String,
    state: KernelCell<CondState>,
}

impl Condition {
    pub fn new(kernel: &Kernel, name: &str) -> Self {
        Self {
            kernel: kernel.clone(),
            name: name.to_string(),
            state: KernelCell::new(CondState {
                waiters: WaitList::new(),
                bound: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[track_caller]
    fn check(&self, op: &str, lock: &Lock, bind: bool) {
        if !lock.is_held_by_current_thread() {
            fail::die(format_args!(
                "{op} on condition \"{}\" without holding lock \"{}\"",
                self.name, lock.name
            ));
        }
        let bound = self.state.with(|s| match s.bound {
            None if bind => {
                s.bound = Some(lock.id);
                lock.id
            }
            None => lock.id,
            Some(id) => id,
        });
        if bound != lock.id {
            fail::die(format_args!(
                "{op} on condition \"{}\" with lock \"{}\", but it's bound to \
                 another lock",
                self.name, lock.name
            ));
        }
    }

    /// Releases `lock`, waits to be signaled, and reacquires `lock`. The
    /// release and the start of waiting happen atomically.
    pub fn wait(&self, lock: &Lock) {
        self.check("wait", lock, true);
        let k = &self.kernel;
        let old = k.set_level(IntLevel::Off);
        let me = k.current_thread();
        self.state.with(|s| s.waiters.append(me));
        lock.release();
        k.sleep();
        k.set_level(old);
        lock.acquire();
    }

    /// Wakes one waiter, if there is one.
    pub fn signal(&self, lock: &Lock) {
        self.check("signal", lock, false);
        let k = &self.kernel;
        let old = k.set_level(IntLevel::Off);
        if let Some(t) = self.state.with(|s| s.waiters.remove()) {
            k.ready_to_run(t);
        }
        k.set_level(old);
    }

    /// Wakes every waiter.
    pub fn broadcast(&self, lock: &Lock) {
        self.check("broadcast", lock, false);
        let k = &self.kernel;
        let old = k.set_level(IntLevel::Off);
        while let Some(t) = self.state.with(|s| s.waiters.remove()) {
            k.ready_to_run(t);
        }
        k.set_level(old);
    }

    /// Number of threads waiting right now.
    pub fn waiting(&self) -> usize {
        self.state.with(|s| s.waiters.len())
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
