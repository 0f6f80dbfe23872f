// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated threads.
//!
//! A thread is created with [`Kernel::new_thread`], which only makes a table
//! entry, and becomes runnable with [`Kernel::fork`], which gives it a stack
//! and an entry point. From then on it moves between `Ready`, `Running` and
//! `Blocked` until it calls [`Kernel::finish`] (or returns from its entry
//! point, which amounts to the same thing). A finished thread can't reclaim
//! its own stack while it is still running on it, so it leaves a note in the
//! kernel state, and whichever thread runs next does the reclaiming.

use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use ringbuf::ringbuf_entry;

use crate::addrspace::AddressSpace;
use crate::arch::{self, Context, Unwind};
use crate::fail;
use crate::interrupt::IntLevel;
use crate::kernel::{Kernel, Outcome};
use crate::trace::Trace;

/// Type used to track generation numbers.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct Generation(u8);

impl Generation {
    const MAX: u8 = (1 << (16 - ThreadId::INDEX_BITS)) - 1;

    pub fn next(self) -> Self {
        if self.0 == Self::MAX {
            Self(0)
        } else {
            Self(self.0 + 1)
        }
    }
}

/// Names a particular incarnation of a thread.
///
/// A `ThreadId` combines a slot index in the thread table with a generation
/// number. Slots are reused once a thread is destroyed, and the generation is
/// bumped each time, so a stale `ThreadId` doesn't accidentally name the slot's
/// new occupant.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct ThreadId(u16);

impl ThreadId {
    pub const INDEX_BITS: u32 = 10;
    pub const INDEX_MASK: u16 = (1 << Self::INDEX_BITS) - 1;

    /// Most threads that can exist at once.
    pub const MAX_THREADS: usize = 1 << Self::INDEX_BITS;

    fn for_index_and_gen(index: usize, gen: Generation) -> Self {
        ThreadId(
            (index as u16 & Self::INDEX_MASK)
                | (u16::from(gen.0) << Self::INDEX_BITS),
        )
    }

    pub fn index(&self) -> usize {
        usize::from(self.0 & Self::INDEX_MASK)
    }

    pub fn generation(&self) -> Generation {
        Generation((self.0 >> Self::INDEX_BITS) as u8)
    }
}

impl fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadId({}.{})", self.index(), self.generation().0)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index(), self.generation().0)
    }
}

/// Scheduling priority of a thread.
///
/// Lower numbers are more important: a priority-ordered ready queue runs
/// priority 1 before priority 5. Threads that never ask get
/// [`Priority::DEFAULT`], which sits in the middle of the conventional 0-99
/// range.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    pub const DEFAULT: Self = Self(50);

    /// Checks if `self` is strictly more important than `other`.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ThreadStatus {
    /// Constructed but not yet forked.
    JustCreated,
    Running,
    Ready,
    Blocked,
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ThreadStatus::JustCreated => "just created",
            ThreadStatus::Running => "running",
            ThreadStatus::Ready => "ready",
            ThreadStatus::Blocked => "blocked",
        })
    }
}

/// Entry point of a simulated thread.
pub type Entry = Box<dyn FnOnce(&Kernel) + Send + 'static>;

/// Internal representation of a thread.
pub(crate) struct Tcb {
    pub name: Arc<str>,
    pub status: ThreadStatus,
    pub priority: Priority,
    /// Set by `fork`; `None` until then.
    pub context: Option<Context>,
    pub forked: bool,
    pub space: Option<Arc<dyn AddressSpace>>,
}

impl Tcb {
    pub fn new(name: &str, priority: Priority) -> Self {
        Self {
            name: Arc::from(name),
            status: ThreadStatus::JustCreated,
            priority,
            context: None,
            forked: false,
            space: None,
        }
    }
}

struct Slot {
    generation: Generation,
    tcb: Option<Tcb>,
}

/// Generational arena of thread control blocks.
#[derive(Default)]
pub(crate) struct ThreadTable {
    slots: Vec<Slot>,
}

impl ThreadTable {
    /// Creates a table holding only the bootstrap thread.
    pub fn with_bootstrap(tcb: Tcb) -> (Self, ThreadId) {
        let table = Self {
            slots: vec![Slot {
                generation: Generation::default(),
                tcb: Some(tcb),
            }],
        };
        (table, ThreadId::for_index_and_gen(0, Generation::default()))
    }

    /// Files `tcb` in a free slot, or returns `None` if the table is full.
    pub fn insert(&mut self, tcb: Tcb) -> Option<ThreadId> {
        if let Some(index) = self.slots.iter().position(|s| s.tcb.is_none()) {
            let slot = &mut self.slots[index];
            slot.tcb = Some(tcb);
            return Some(ThreadId::for_index_and_gen(index, slot.generation));
        }
        if self.slots.len() >= ThreadId::MAX_THREADS {
            return None;
        }
        self.slots.push(Slot {
            generation: Generation::default(),
            tcb: Some(tcb),
        });
        Some(ThreadId::for_index_and_gen(
            self.slots.len() - 1,
            Generation::default(),
        ))
    }

    pub fn get(&self, id: ThreadId) -> Option<&Tcb> {
        let slot = self.slots.get(id.index())?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.tcb.as_ref()
    }

    pub fn get_mut(&mut self, id: ThreadId) -> Option<&mut Tcb> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.tcb.as_mut()
    }

    /// Takes a thread out of the table. Its slot gets a new generation, so
    /// `id` goes stale.
    pub fn remove(&mut self, id: ThreadId) -> Option<Tcb> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation() {
            return None;
        }
        let tcb = slot.tcb.take()?;
        slot.generation = slot.generation.next();
        Some(tcb)
    }

    /// Empties the table.
    pub fn drain(&mut self) -> impl Iterator<Item = Tcb> + '_ {
        self.slots.drain(..).filter_map(|s| s.tcb)
    }

    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.tcb.is_some()).count()
    }

    /// Looks up a thread that the caller knows must exist. A stale or bogus
    /// id here is a kernel bug.
    #[track_caller]
    pub fn expect(&self, id: ThreadId) -> &Tcb {
        match self.get(id) {
            Some(t) => t,
            None => fail::die(format_args!("no such thread {id}")),
        }
    }

    #[track_caller]
    pub fn expect_mut(&mut self, id: ThreadId) -> &mut Tcb {
        match self.get_mut(id) {
            Some(t) => t,
            None => fail::die(format_args!("no such thread {id}")),
        }
    }
}

thread_local! {
    /// The simulated thread this host thread is backing, if any.
    static ME: Cell<Option<ThreadId>> = const { Cell::new(None) };
}

/// Fraction of the configured stack that a thread may use before it's
/// considered to have overflowed. The rest is left for the host's own needs
/// (unwinding, mostly).
const STACK_BUDGET_PERCENT: usize = 75;

impl Kernel {
    /// Creates a thread with the default priority. It won't run until it's
    /// forked.
    pub fn new_thread(&self, name: &str) -> ThreadId {
        self.new_thread_with_priority(name, Priority::DEFAULT)
    }

    pub fn new_thread_with_priority(
        &self,
        name: &str,
        priority: Priority,
    ) -> ThreadId {
        let id = self.with_state(|s| s.threads.insert(Tcb::new(name, priority)));
        match id {
            Some(id) => {
                log::trace!("created thread {id} \"{name}\" at {priority:?}");
                id
            }
            None => fail::die(format_args!(
                "thread table full ({} threads) creating \"{name}\"",
                ThreadId::MAX_THREADS
            )),
        }
    }

    /// Gives `thread` a stack and an entry point, and makes it ready to run.
    ///
    /// The first time the thread is dispatched it enables interrupts and
    /// calls `entry`; if `entry` returns, the thread finishes. A thread can
    /// only be forked once.
    pub fn fork(
        &self,
        thread: ThreadId,
        entry: impl FnOnce(&Kernel) + Send + 'static,
    ) {
        let name = self.with_state(|s| {
            let t = s.threads.expect_mut(thread);
            if t.forked {
                fail::die(format_args!(
                    "thread {thread} \"{}\" forked twice",
                    t.name
                ));
            }
            t.forked = true;
            Arc::clone(&t.name)
        });
        log::debug!("forking thread {thread} \"{name}\"");

        let ctx = self.spawn_context(thread, &name, Box::new(entry));
        let ctx = match ctx {
            Ok(ctx) => ctx,
            Err(e) => fail::die(format_args!("can't fork \"{name}\": {e}")),
        };

        let old = self.set_level(IntLevel::Off);
        self.with_state(|s| {
            s.threads.expect_mut(thread).context = Some(ctx);
            ringbuf_entry!(s.trace, Trace::Forked(thread));
        });
        self.ready_to_run(thread);
        self.set_level(old);
    }

    /// Creates and forks a thread in one go.
    pub fn spawn(
        &self,
        name: &str,
        entry: impl FnOnce(&Kernel) + Send + 'static,
    ) -> ThreadId {
        self.spawn_with_priority(name, Priority::DEFAULT, entry)
    }

    pub fn spawn_with_priority(
        &self,
        name: &str,
        priority: Priority,
        entry: impl FnOnce(&Kernel) + Send + 'static,
    ) -> ThreadId {
        let id = self.new_thread_with_priority(name, priority);
        self.fork(id, entry);
        id
    }

    pub(crate) fn spawn_context(
        &self,
        thread: ThreadId,
        name: &str,
        entry: Entry,
    ) -> std::io::Result<Context> {
        let kernel = self.clone();
        Context::spawn(name, self.config().stack_size, move || {
            trampoline(kernel, thread, entry)
        })
    }

    /// Gives up the CPU if anything else is ready to run. Returns right away
    /// otherwise.
    pub fn yield_now(&self) {
        let old = self.set_level(IntLevel::Off);
        let me = self.assert_current("yield");
        self.with_state(|s| {
            if s.intr.in_handler {
                fail::die("interrupt handler tried to yield");
            }
        });

        if let Some(next) = self.find_next_to_run() {
            log::trace!("{me} yielding to {next}");
            self.ready_to_run(me);
            self.run(next);
        }
        self.set_level(old);
    }

    /// Blocks the calling thread, which must already have arranged for
    /// somebody to make it ready again, and runs something else.
    ///
    /// Interrupts must be off. If nothing is ready, the machine idles until
    /// something is (or halts, if nothing ever will be).
    pub fn sleep(&self) {
        let me = self.assert_current("sleep");
        self.with_state(|s| {
            if s.intr.level != IntLevel::Off {
                fail::die(format_args!("{me} slept with interrupts on"));
            }
            if s.intr.in_handler {
                fail::die("interrupt handler tried to block");
            }
            s.threads.expect_mut(me).status = ThreadStatus::Blocked;
            ringbuf_entry!(s.trace, Trace::Blocked(me));
        });
        log::trace!("{me} sleeping");

        let next = loop {
            if let Some(next) = self.find_next_to_run() {
                break next;
            }
            self.idle();
        };
        self.run(next);
    }

    /// Ends the calling thread. Never returns.
    ///
    /// The thread's frames are unwound first, while it still holds the CPU,
    /// so anything they own is dropped exactly as if its entry point had
    /// returned.
    pub fn finish(&self) -> ! {
        let me = self.assert_current("finish");
        if self.in_handler() {
            fail::die(format_args!("interrupt handler tried to finish {me}"));
        }
        arch::unwind(Unwind::Finished)
    }

    /// The part of finishing that happens once the thread's own frames are
    /// gone: mark it for reclamation and switch away for the last time.
    fn exit(&self) -> ! {
        self.set_level(IntLevel::Off);
        let me = self.assert_current("finish");
        self.with_state(|s| {
            if let Some(other) = s.to_destroy {
                fail::die(format_args!(
                    "{me} finishing while {other} awaits destruction"
                ));
            }
            s.to_destroy = Some(me);
            ringbuf_entry!(s.trace, Trace::Finished(me));
        });
        log::debug!("finishing thread {me}");
        self.sleep();
        fail::die(format_args!("finished thread {me} ran again"))
    }

    /// Checks the calling thread's stack for overflow, killing the run if it
    /// finds any.
    ///
    /// Best effort. Overflow itself is caught by a depth budget, measured from
    /// the thread's outermost frame, before the host notices. The guard words
    /// kept in that outermost frame are checked too, but they sit at the end
    /// of the stack that recursion moves away from, so they only catch stray
    /// writes into it.
    pub fn check_overflow(&self) {
        let budget = self.config().stack_size / 100 * STACK_BUDGET_PERCENT;
        let depth = arch::stack_depth();
        let fence_ok = arch::fence_intact();
        if fence_ok && depth.map_or(true, |d| d <= budget) {
            return;
        }
        let me = self.current_thread();
        let name = self.with_state(|s| Arc::clone(&s.threads.expect(me).name));
        if !fence_ok {
            fail::die(format_args!("stack fence of {me} \"{name}\" overwritten"));
        }
        fail::die(format_args!(
            "{me} \"{name}\" overflowed its stack ({} of {budget} bytes)",
            depth.unwrap_or(0)
        ))
    }

    pub fn current_thread(&self) -> ThreadId {
        self.with_state(|s| s.current)
    }

    pub fn thread_name(&self, thread: ThreadId) -> Option<Arc<str>> {
        self.with_state(|s| s.threads.get(thread).map(|t| Arc::clone(&t.name)))
    }

    pub fn thread_status(&self, thread: ThreadId) -> Option<ThreadStatus> {
        self.with_state(|s| s.threads.get(thread).map(|t| t.status))
    }

    pub fn priority(&self, thread: ThreadId) -> Option<Priority> {
        self.with_state(|s| s.threads.get(thread).map(|t| t.priority))
    }

    /// Changes a thread's priority. This takes effect the next time the
    /// thread is made ready; if it's sitting in the ready queue right now, it
    /// keeps its place.
    pub fn set_priority(&self, thread: ThreadId, priority: Priority) {
        self.with_state(|s| s.threads.expect_mut(thread).priority = priority);
    }

    /// Attaches (or, with `None`, detaches) a user address space.
    pub fn set_address_space(
        &self,
        thread: ThreadId,
        space: Option<Arc<dyn AddressSpace>>,
    ) {
        self.with_state(|s| s.threads.expect_mut(thread).space = space);
    }

    /// Number of threads that exist, including the current one and any that
    /// have finished but not yet been reclaimed.
    pub fn live_threads(&self) -> usize {
        self.with_state(|s| s.threads.live())
    }

    /// Returns the current thread, after checking that it's the one calling.
    #[track_caller]
    pub(crate) fn assert_current(&self, what: &str) -> ThreadId {
        let current = self.current_thread();
        let me = ME.with(Cell::get);
        if me != Some(current) {
            fail::die(format_args!(
                "{what} called from {me:?}, but {current} is running"
            ));
        }
        current
    }
}

/// Where every simulated thread starts: finishes the switch that brought us
/// here, turns interrupts on, and runs the entry point.
///
/// This is also where simulated threads end. A panic that gets this far kills
/// the run; the kernel's own unwinds (halting, or being reclaimed) just stop
/// the thread. [`Kernel::finish`] unwinds to here and then finishes, so by the
/// time a thread gives up the CPU for good, only these frames are left.
fn trampoline(kernel: Kernel, me: ThreadId, entry: Entry) {
    let fence = arch::Fence::new();
    arch::mark_stack(&fence);
    ME.with(|m| m.set(Some(me)));

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        kernel.after_switch();
        kernel.enable();
        entry(&kernel);
    }));
    let result = match result {
        Err(payload) if arch::is_finish(&*payload) => Ok(()),
        other => other,
    };
    let result = result.and_then(|()| {
        panic::catch_unwind(AssertUnwindSafe(|| {
            kernel.exit();
        }))
    });

    ME.with(|m| m.set(None));
    arch::clear_stack();
    drop(fence);

    if let Err(payload) = result {
        if !arch::is_unwind(&*payload) {
            let epitaph = fail::eulogize(&*payload);
            log::error!("thread {me} died: {epitaph}");
            kernel.end_run(Outcome::Died(epitaph));
        }
    }
}
