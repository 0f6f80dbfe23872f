// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Context switching on a hosted target.
//!
//! Every simulated thread runs on its own host thread, which spends most of
//! its life parked on a *baton*: a one-slot gate built from a `Mutex` and a
//! `Condvar`. Switching from `A` to `B` opens `B`'s gate and then parks `A`
//! on its own. Because the only thread that ever opens a gate is the one
//! currently running, and it parks itself immediately afterward, at most one
//! simulated thread is ever past its gate.
//!
//! A gate can also be opened with `Exit`, which makes the parked thread
//! unwind out of whatever it was doing (see [`Unwind`]). That's how finished
//! threads are reclaimed and how the whole simulation is torn down.
//!
//! A thread unwinding that way no longer holds the CPU, so it is *detached*:
//! if anything it drops on the way out reaches for kernel state, it is
//! parked for good instead (see [`abandon`]).

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::io;
use std::panic;
use std::ptr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Gate {
    Parked,
    Run,
    Exit,
}

/// What became of the host thread behind a context.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Host {
    Live,
    /// Returned, or about to.
    Gone,
    /// Parked forever by [`abandon`].
    Stuck,
}

#[derive(Debug)]
struct Baton {
    gate: Mutex<Gate>,
    wake: Condvar,
    host: Mutex<Host>,
    departed: Condvar,
}

impl Baton {
    fn new() -> Self {
        Self {
            gate: Mutex::new(Gate::Parked),
            wake: Condvar::new(),
            host: Mutex::new(Host::Live),
            departed: Condvar::new(),
        }
    }

    fn set_host(&self, to: Host) {
        let mut host =
            self.host.lock().unwrap_or_else(PoisonError::into_inner);
        *host = to;
        self.departed.notify_all();
    }

    fn wait_departed(&self) -> Host {
        let host = self.host.lock().unwrap_or_else(PoisonError::into_inner);
        *self
            .departed
            .wait_while(host, |h| *h == Host::Live)
            .unwrap_or_else(PoisonError::into_inner)
    }

    // Nothing panics while holding the gate lock, so poisoning can only come
    // from a bug elsewhere; carry on with the inner value regardless.
    fn lock(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open(&self, to: Gate) {
        let mut gate = self.lock();
        // Exit is sticky.
        if *gate != Gate::Exit {
            *gate = to;
        }
        self.wake.notify_one();
    }

    /// Blocks until the gate is opened, then closes it behind us. Returns the
    /// reason we were let through.
    fn park(&self) -> Gate {
        let mut gate = self.lock();
        loop {
            match *gate {
                Gate::Run => {
                    *gate = Gate::Parked;
                    return Gate::Run;
                }
                Gate::Exit => return Gate::Exit,
                Gate::Parked => {
                    gate = self
                        .wake
                        .wait(gate)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }
}

/// Marks the host thread as gone when the thread's outermost frame ends.
struct Departure(Arc<Baton>);

impl Drop for Departure {
    fn drop(&mut self) {
        self.0.set_host(Host::Gone);
    }
}

/// Saved execution state of one simulated thread: its host thread and the
/// gate that host thread waits on.
#[derive(Debug)]
pub struct Context {
    baton: Arc<Baton>,
    host: Option<JoinHandle<()>>,
}

/// A cheap handle to a [`Context`], suitable for passing to [`switch`] after
/// the kernel state that owns the `Context` has been released.
#[derive(Clone, Debug)]
pub struct ContextRef(Arc<Baton>);

impl Context {
    /// Creates a context whose first resume runs `body` on a fresh stack of
    /// at least `stack_size` bytes.
    ///
    /// The context starts out parked. If it is retired before ever being
    /// resumed, `body` is dropped without running.
    pub fn spawn(
        name: &str,
        stack_size: usize,
        body: impl FnOnce() + Send + 'static,
    ) -> io::Result<Self> {
        let baton = Arc::new(Baton::new());
        let gate = Arc::clone(&baton);
        let host = thread::Builder::new()
            .name(name.to_string())
            .stack_size(stack_size)
            .spawn(move || {
                let departure = Departure(gate);
                MINE.with(|m| {
                    *m.borrow_mut() = Some(Arc::clone(&departure.0));
                });
                if departure.0.park() == Gate::Exit {
                    // Whatever `body` captured is dropped without the CPU.
                    DETACHED.with(|d| d.set(true));
                    drop(body);
                    return;
                }
                body();
            })?;
        Ok(Self {
            baton,
            host: Some(host),
        })
    }

    pub fn handle(&self) -> ContextRef {
        ContextRef(Arc::clone(&self.baton))
    }

    /// Tells the context to unwind and exit the next time it looks at its
    /// gate, and hands back its host thread for joining.
    ///
    /// Retiring the context that is currently running is allowed; it will
    /// see `Exit` the next time it tries to park.
    pub fn retire(mut self) -> Option<Retired> {
        self.baton.open(Gate::Exit);
        let host = self.host.take()?;
        Some(Retired {
            baton: Arc::clone(&self.baton),
            host,
        })
    }
}

/// The host thread of a context that has been told to exit.
#[derive(Debug)]
pub struct Retired {
    baton: Arc<Baton>,
    host: JoinHandle<()>,
}

impl Retired {
    /// Waits for the host thread to exit, returning `Ok(true)` once it has.
    ///
    /// A thread that was abandoned never exits. It is left parked, and this
    /// returns `Ok(false)`.
    pub fn join(self) -> thread::Result<bool> {
        match self.baton.wait_departed() {
            Host::Stuck => Ok(false),
            Host::Live | Host::Gone => self.host.join().map(|()| true),
        }
    }
}

impl Drop for Context {
    // A context dropped without being retired would otherwise leave its
    // host thread parked forever.
    fn drop(&mut self) {
        self.baton.open(Gate::Exit);
    }
}

/// Lets `to` run without parking anybody. Used once, to start the bootstrap
/// thread from the host.
pub fn start(to: &ContextRef) {
    to.0.open(Gate::Run);
}

/// Transfers control from `from` to `to`, returning when something switches
/// back to `from`.
///
/// Switching to yourself is a no-op. If `from` is retired while parked, this
/// does not return; it unwinds with [`Unwind::Released`].
pub fn switch(from: &ContextRef, to: &ContextRef) {
    if Arc::ptr_eq(&from.0, &to.0) {
        return;
    }
    to.0.open(Gate::Run);
    if from.0.park() == Gate::Exit {
        unwind(Unwind::Released);
    }
}

/// Reasons a simulated thread leaves its code without returning.
///
/// These travel as unwind payloads and are recognized by the thread
/// trampoline, which distinguishes them from genuine panics.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Unwind {
    /// This thread is finishing. It still holds the CPU while its frames
    /// are dropped.
    Finished,
    /// This thread halted the machine.
    Halted,
    /// This thread's context was retired while it was parked.
    Released,
}

thread_local! {
    /// Gate of the context this host thread backs.
    static MINE: RefCell<Option<Arc<Baton>>> = const { RefCell::new(None) };
    /// Set once this host thread has given up the CPU for good.
    static DETACHED: Cell<bool> = const { Cell::new(false) };
}

pub fn unwind(why: Unwind) -> ! {
    if why != Unwind::Finished {
        DETACHED.with(|d| d.set(true));
    }
    // resume_unwind skips the panic hook, so these don't get printed.
    panic::resume_unwind(Box::new(why))
}

pub fn is_unwind(payload: &(dyn Any + Send)) -> bool {
    payload.is::<Unwind>()
}

pub fn is_finish(payload: &(dyn Any + Send)) -> bool {
    payload.downcast_ref::<Unwind>() == Some(&Unwind::Finished)
}

/// Whether the calling host thread has halted the machine or been released.
pub fn is_detached() -> bool {
    DETACHED.with(Cell::get)
}

/// Parks the calling host thread forever.
///
/// For a detached thread that tried to use kernel state while unwinding. It
/// can't be allowed to continue, and it can't panic either, since it's
/// already unwinding. Its context reports it as stuck rather than gone, so
/// nobody waits for it.
pub fn abandon() -> ! {
    log::warn!(
        "{:?} touched kernel state after giving up the CPU; parking it",
        thread::current().name().unwrap_or("unnamed thread")
    );
    MINE.with(|m| {
        if let Some(baton) = m.borrow().as_ref() {
            baton.set_host(Host::Stuck);
        }
    });
    loop {
        thread::park();
    }
}

/// Value written into the guard words at the base of every simulated
/// thread's stack.
pub const STACK_FENCEPOST: u32 = 0xdead_beef;

const FENCE_WORDS: usize = 4;

/// Guard words that a thread keeps in its outermost frame for its whole
/// life. If they ever read back as anything but [`STACK_FENCEPOST`],
/// something has scribbled over the stack.
///
/// The host's stacks grow down and the fence sits at the top, the end a
/// runaway recursion moves *away* from. So it catches stray writes through
/// dangling pointers into that frame, not overflow; overflow is caught by
/// measuring depth against the mark.
#[repr(C)]
#[derive(Debug)]
pub struct Fence([Cell<u32>; FENCE_WORDS]);

impl Fence {
    pub fn new() -> Self {
        Self(std::array::from_fn(|_| Cell::new(STACK_FENCEPOST)))
    }
}

impl Default for Fence {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Copy, Clone)]
struct StackMark {
    base: usize,
    fence: *const Fence,
}

thread_local! {
    static STACK: Cell<Option<StackMark>> = const { Cell::new(None) };
}

fn here() -> usize {
    let here = 0u8;
    std::hint::black_box(ptr::addr_of!(here)) as usize
}

/// Records `fence` as the base of the calling thread's stack. The fence must
/// stay in place (and unmoved) until [`clear_stack`] is called.
pub fn mark_stack(fence: &Fence) {
    let fence = fence as *const Fence;
    STACK.with(|s| {
        s.set(Some(StackMark {
            base: fence as usize,
            fence,
        }))
    });
}

pub fn clear_stack() {
    STACK.with(|s| s.set(None));
}

/// Number of bytes of stack the calling thread has used below its mark, or
/// `None` if the thread has no mark.
pub fn stack_depth() -> Option<usize> {
    let mark = STACK.with(Cell::get)?;
    Some(mark.base.abs_diff(here()))
}

/// Checks the calling thread's guard words. Threads without a mark pass.
pub fn fence_intact() -> bool {
    let Some(mark) = STACK.with(Cell::get) else {
        return true;
    };
    // Safety: `mark_stack` requires the fence to outlive the mark, and the
    // mark is thread-local, so the fence is a live object on our own stack.
    // Nothing holds a &mut to it; its words are cells.
    let fence = unsafe { &*mark.fence };
    fence.0.iter().all(|w| w.get() == STACK_FENCEPOST)
}

/// Overwrites one of the calling thread's guard words.
#[cfg(test)]
pub(crate) fn scribble_on_fence() {
    if let Some(mark) = STACK.with(Cell::get) {
        // Safety: as in `fence_intact`.
        let fence = unsafe { &*mark.fence };
        fence.0[FENCE_WORDS / 2].set(0);
    }
}
