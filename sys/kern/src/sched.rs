// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scheduler: ready queue and dispatch.

use std::sync::Arc;

use ringbuf::ringbuf_entry;
use waitlist::WaitList;

use crate::addrspace::AddressSpace;
use crate::arch::{self, Context};
use crate::config::Policy;
use crate::fail;
use crate::interrupt::IntLevel;
use crate::kernel::Kernel;
use crate::thread::{Priority, ThreadId, ThreadStatus};
use crate::trace::Trace;

/// The ready queue, and the policy that orders it.
#[derive(Debug)]
pub(crate) struct Scheduler {
    policy: Policy,
    /// Keyed by priority under `Policy::Priority`; all keys are equal under
    /// `Policy::Fifo`.
    ready: WaitList<ThreadId, u8>,
}

impl Scheduler {
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            ready: WaitList::new(),
        }
    }

    pub fn enqueue(&mut self, thread: ThreadId, priority: Priority) {
        match self.policy {
            Policy::Fifo => self.ready.append(thread),
            Policy::Priority => self.ready.sorted_insert(thread, priority.0),
        }
    }

    pub fn dequeue(&mut self) -> Option<ThreadId> {
        self.ready.remove()
    }

    pub fn len(&self) -> usize {
        self.ready.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.ready.iter().map(|(_, t)| *t)
    }
}

impl Kernel {
    /// Marks `thread` ready and puts it on the ready queue. Interrupts must be
    /// off.
    pub fn ready_to_run(&self, thread: ThreadId) {
        self.with_state(|s| {
            if s.intr.level != IntLevel::Off {
                fail::die(format_args!(
                    "ready_to_run({thread}) with interrupts on"
                ));
            }
            let t = s.threads.expect_mut(thread);
            t.status = ThreadStatus::Ready;
            let priority = t.priority;
            s.sched.enqueue(thread, priority);
            ringbuf_entry!(s.trace, Trace::Ready(thread));
        });
        log::trace!("putting thread {thread} on ready list");
    }

    /// Takes the next thread off the ready queue, if there is one. Its status
    /// is left alone; `run` takes care of that.
    pub fn find_next_to_run(&self) -> Option<ThreadId> {
        self.with_state(|s| s.sched.dequeue())
    }

    /// Number of threads waiting on the ready queue.
    pub fn ready_count(&self) -> usize {
        self.with_state(|s| s.sched.len())
    }

    /// Switches the CPU to `next`.
    ///
    /// Returns when something switches back to the calling thread, having
    /// cleaned up any thread that finished in the meantime. The caller must
    /// have interrupts off, and must already have put itself wherever it
    /// needs to be (ready queue, some wait list, or nowhere).
    pub fn run(&self, next: ThreadId) {
        let (old, space) = self.with_state(|s| {
            let old = s.current;
            (old, s.threads.expect(old).space.clone())
        });

        if let Some(space) = &space {
            space.save_user_state();
            space.save_state();
        }

        self.check_overflow();

        let (from, to) = self.with_state(|s| {
            s.current = next;
            let to = s.threads.expect_mut(next);
            to.status = ThreadStatus::Running;
            let to = to.context.as_ref().map(Context::handle);
            let from =
                s.threads.expect(old).context.as_ref().map(Context::handle);
            if old != next {
                s.stats.context_switches += 1;
            }
            ringbuf_entry!(s.trace, Trace::Dispatch { from: old, to: next });
            (from, to)
        });
        let (Some(from), Some(to)) = (from, to) else {
            fail::die(format_args!("switch from {old} to {next} without a context"));
        };

        log::debug!("switching from {old} to {next}");
        if log::log_enabled!(log::Level::Trace) {
            self.dump_ready();
        }
        arch::switch(&from, &to);
        log::trace!("now in thread {}", self.current_thread());

        self.after_switch();
    }

    /// Work that falls to whichever thread has just been switched to:
    /// reclaim a finished thread, if one is waiting, and restore our own
    /// address space, if we have one.
    pub(crate) fn after_switch(&self) {
        let (doomed, space) = self.with_state(|s| {
            let doomed = s.to_destroy.take().map(|t| {
                if t == s.current {
                    fail::die(format_args!("{t} reclaiming itself"));
                }
                ringbuf_entry!(s.trace, Trace::Destroyed(t));
                (t, s.threads.remove(t))
            });
            let space: Option<Arc<dyn AddressSpace>> =
                s.threads.expect(s.current).space.clone();
            (doomed, space)
        });

        if let Some((t, Some(mut tcb))) = doomed {
            log::debug!("reclaiming thread {t} \"{}\"", tcb.name);
            if let Some(host) = tcb.context.take().and_then(Context::retire) {
                self.with_state(|s| s.reaped.push(host));
            }
            // Dropped here, outside the state borrow, in case its address
            // space has opinions about being dropped.
            drop(tcb);
        }

        if let Some(space) = space {
            space.restore_user_state();
            space.restore_state();
        }
    }

    /// Logs the ready queue. Dispatch does this on its own when tracing.
    pub fn dump_ready(&self) {
        let list: Vec<String> = self.with_state(|s| {
            s.sched
                .iter()
                .map(|t| match s.threads.get(t) {
                    Some(tcb) => format!("{t} \"{}\"", tcb.name),
                    None => format!("{t} (stale)"),
                })
                .collect()
        });
        log::debug!(
            "ready list contents ({}): [{}]",
            self.ready_count(),
            list.join(", ")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::{Tcb, ThreadTable};

    fn ids(n: usize) -> Vec<ThreadId> {
        let (mut table, _) =
            ThreadTable::with_bootstrap(Tcb::new("main", Priority::DEFAULT));
        (0..n)
            .map(|i| table.insert(Tcb::new(&i.to_string(), Priority::DEFAULT)).unwrap())
            .collect()
    }

    #[test]
    fn priority_policy_orders_by_priority_then_arrival() {
        let t = ids(4);
        let mut s = Scheduler::new(Policy::Priority);
        for (id, p) in t.iter().zip([5, 1, 9, 1]) {
            s.enqueue(*id, Priority(p));
        }
        let order: Vec<_> = std::iter::from_fn(|| s.dequeue()).collect();
        assert_eq!(order, [t[1], t[3], t[0], t[2]]);
    }

    #[test]
    fn fifo_policy_ignores_priority() {
        let t = ids(3);
        let mut s = Scheduler::new(Policy::Fifo);
        for (id, p) in t.iter().zip([9, 1, 5]) {
            s.enqueue(*id, Priority(p));
        }
        assert_eq!(s.len(), 3);
        let order: Vec<_> = std::iter::from_fn(|| s.dequeue()).collect();
        assert_eq!(order, t);
    }
}
