// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The interrupt controller, and with it, virtual time.
//!
//! This is the only source of asynchrony in the machine. Device simulators
//! call [`Kernel::schedule`] to arrange for a handler to run some number of
//! ticks in the future. Those handlers are then run, synchronously and with
//! interrupts off, on whatever thread happens to be current when their time
//! comes.
//!
//! Time advances in exactly two ways:
//!
//! - Every time interrupts go from off to on, the clock is charged a fixed
//!   cost (`system_tick` in kernel mode, `user_tick` in user mode) and any
//!   handlers that have come due are run. This is [`Kernel::one_tick`].
//! - When nothing is ready to run, the machine doesn't tick along one step
//!   at a time; it jumps straight to the next pending interrupt. This is
//!   [`Kernel::idle`].
//!
//! A handler can't switch threads itself (it has no thread of its own), but
//! it can ask for the interrupted thread to yield once handlers are done,
//! with [`Kernel::yield_on_return`]. That deferred yield is the only way a
//! thread gets preempted.

use std::fmt;

use ringbuf::ringbuf_entry;
use waitlist::WaitList;

use crate::arch::{self, Unwind};
use crate::err::HaltReason;
use crate::fail;
use crate::kernel::{Kernel, Outcome};
use crate::time::Timestamp;
use crate::trace::Trace;

/// Whether interrupts are enabled.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IntLevel {
    Off,
    On,
}

/// What the simulated CPU is doing.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MachineStatus {
    /// Nothing to run; waiting for an interrupt.
    Idle,
    Kernel,
    User,
}

/// The device an interrupt comes from. Only used for tracing, and to let
/// the idle loop recognize the timer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum IntKind {
    Timer,
    Disk,
    ConsoleWrite,
    ConsoleRead,
    NetworkSend,
    NetworkRecv,
}

impl fmt::Display for IntKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IntKind::Timer => "timer",
            IntKind::Disk => "disk",
            IntKind::ConsoleWrite => "console write",
            IntKind::ConsoleRead => "console read",
            IntKind::NetworkSend => "network send",
            IntKind::NetworkRecv => "network recv",
        })
    }
}

/// An interrupt handler. Whatever argument it needs, it captures.
pub type Handler = Box<dyn FnOnce(&Kernel) + Send + 'static>;

/// An interrupt that has been scheduled but hasn't happened yet.
pub(crate) struct PendingInterrupt {
    pub handler: Handler,
    pub kind: IntKind,
}

/// Interrupt controller state.
pub(crate) struct Interrupts {
    pub level: IntLevel,
    pub status: MachineStatus,
    pub in_handler: bool,
    pub yield_on_return: bool,
    /// Ordered by fire time; interrupts due at the same tick fire in the
    /// order they were scheduled.
    pub pending: WaitList<PendingInterrupt, Timestamp>,
}

impl Interrupts {
    /// Interrupts start out off, with the machine in kernel mode.
    pub fn new() -> Self {
        Self {
            level: IntLevel::Off,
            status: MachineStatus::Kernel,
            in_handler: false,
            yield_on_return: false,
            pending: WaitList::new(),
        }
    }
}

impl Kernel {
    pub fn level(&self) -> IntLevel {
        self.with_state(|s| s.intr.level)
    }

    /// Sets the interrupt level, returning the old one.
    ///
    /// Turning interrupts off is how the kernel gets atomicity. Turning them
    /// back on advances the clock by one tick and runs anything that's come
    /// due (see [`Kernel::one_tick`]), so it may switch threads. Handlers must
    /// never turn interrupts on.
    pub fn set_level(&self, now: IntLevel) -> IntLevel {
        let old = self.with_state(|s| {
            if now == IntLevel::On && s.intr.in_handler {
                fail::die("interrupt handler tried to enable interrupts");
            }
            std::mem::replace(&mut s.intr.level, now)
        });
        if now == IntLevel::On && old == IntLevel::Off {
            self.one_tick();
        }
        old
    }

    pub fn enable(&self) {
        self.set_level(IntLevel::On);
    }

    pub fn status(&self) -> MachineStatus {
        self.with_state(|s| s.intr.status)
    }

    /// Switches the CPU between kernel and user mode. The CPU simulator does
    /// this around running user code.
    pub fn set_status(&self, status: MachineStatus) {
        self.with_state(|s| s.intr.status = status);
    }

    /// Current virtual time.
    pub fn now(&self) -> Timestamp {
        self.with_state(|s| Timestamp::from(s.stats.total_ticks))
    }

    /// Whether an interrupt handler is running right now.
    pub fn in_handler(&self) -> bool {
        self.with_state(|s| s.intr.in_handler)
    }

    /// Number of interrupts scheduled but not yet fired.
    pub fn pending_interrupts(&self) -> usize {
        self.with_state(|s| s.intr.pending.len())
    }

    /// Arranges for `handler` to run `from_now` ticks from now.
    ///
    /// Meant for device simulators. `from_now` must be at least 1: an
    /// interrupt can't happen in the past, or in the middle of the current
    /// tick.
    pub fn schedule(
        &self,
        handler: impl FnOnce(&Kernel) + Send + 'static,
        from_now: u64,
        kind: IntKind,
    ) {
        if from_now == 0 {
            fail::die(format_args!("{kind} interrupt scheduled 0 ticks from now"));
        }
        let at = self.with_state(|s| {
            let at = Timestamp::from(s.stats.total_ticks) + from_now;
            s.intr.pending.sorted_insert(
                PendingInterrupt {
                    handler: Box::new(handler),
                    kind,
                },
                at,
            );
            ringbuf_entry!(s.trace, Trace::Scheduled { kind, at });
            at
        });
        log::trace!("scheduling {kind} interrupt for {at}");
    }

    /// Advances the clock by one step, runs any handlers that have come due,
    /// and honors a deferred yield if one of them asked for it.
    ///
    /// Called whenever interrupts are re-enabled, and by the CPU simulator
    /// once per user instruction.
    pub fn one_tick(&self) {
        let old_status = self.with_state(|s| {
            let old = s.intr.status;
            let (cost, bucket) = if old == MachineStatus::Kernel {
                (self.config().system_tick, &mut s.stats.system_ticks)
            } else {
                (self.config().user_tick, &mut s.stats.user_ticks)
            };
            *bucket = bucket.saturating_add(cost);
            s.stats.total_ticks = s.stats.total_ticks.saturating_add(cost);
            s.intr.level = IntLevel::Off;
            old
        });
        log::trace!("== tick {} ==", self.now());

        while self.check_if_due(false) {}

        let yield_now = self.with_state(|s| {
            s.intr.level = IntLevel::On;
            std::mem::take(&mut s.intr.yield_on_return)
        });
        if yield_now {
            self.set_status(MachineStatus::Kernel);
            self.yield_now();
            self.set_status(old_status);
        }
    }

    /// Asks for the interrupted thread to yield once handlers are done.
    /// Only callable from inside a handler.
    pub fn yield_on_return(&self) {
        self.with_state(|s| {
            if !s.intr.in_handler {
                fail::die("yield_on_return called outside an interrupt handler");
            }
            s.intr.yield_on_return = true;
        });
    }

    /// Called when nothing is ready to run. Jumps the clock to the next
    /// pending interrupt and runs it, along with anything else due at the
    /// same time.
    ///
    /// If nothing is pending, nothing can ever become ready, and the machine
    /// halts.
    pub fn idle(&self) {
        self.set_status(MachineStatus::Idle);
        log::trace!("machine idling; checking for interrupts");
        if self.check_if_due(true) {
            while self.check_if_due(false) {}
            // There's nobody to yield to us; the caller is about to pick
            // whoever the handlers woke.
            self.with_state(|s| {
                s.intr.yield_on_return = false;
                s.intr.status = MachineStatus::Kernel;
            });
            return;
        }
        log::info!("no threads ready or runnable, and no pending interrupts");
        self.halt_with(HaltReason::Idle)
    }

    /// Stops the machine. Never returns; the host gets a report.
    pub fn halt(&self) -> ! {
        self.halt_with(HaltReason::Requested)
    }

    pub(crate) fn halt_with(&self, reason: HaltReason) -> ! {
        let stats = self.with_state(|s| {
            ringbuf_entry!(s.trace, Trace::Halt);
            s.stats.clone()
        });
        log::info!("machine halting ({reason:?})");
        log::info!("{stats}");
        self.end_run(Outcome::Halted(reason));
        arch::unwind(Unwind::Halted)
    }

    /// Fires the earliest pending interrupt if it's due, returning whether it
    /// did. Interrupts must be off.
    ///
    /// With `advance_clock`, an interrupt in the future is considered due and
    /// the clock is moved up to meet it, with the gap counted as idle time.
    ///
    /// The timer is special: if the machine is idle and the timer is the only
    /// thing pending, it's put back without firing. Otherwise a machine with
    /// nothing to do would run forever, kept awake by its own timer.
    pub fn check_if_due(&self, advance_clock: bool) -> bool {
        if log::log_enabled!(log::Level::Trace) {
            self.dump_state();
        }

        let due = self.with_state(|s| {
            if s.intr.level != IntLevel::Off {
                fail::die("checking interrupts with interrupts on");
            }
            // Peek first: taking it out and putting it back would move it
            // behind anything else due at the same tick.
            let when = s.intr.pending.first_key()?;
            let now = Timestamp::from(s.stats.total_ticks);
            if when > now {
                if !advance_clock {
                    return None;
                }
                s.stats.idle_ticks += when.since(now);
                s.stats.total_ticks = u64::from(when);
                ringbuf_entry!(s.trace, Trace::IdleUntil(when));
            }
            let (when, pending) = s.intr.pending.sorted_remove()?;
            if s.intr.status == MachineStatus::Idle
                && pending.kind == IntKind::Timer
                && s.intr.pending.is_empty()
            {
                s.intr.pending.sorted_insert(pending, when);
                return None;
            }

            s.stats.interrupts += 1;
            ringbuf_entry!(s.trace, Trace::Fired { kind: pending.kind, at: when });
            let old_status = s.intr.status;
            s.intr.in_handler = true;
            s.intr.status = MachineStatus::Kernel;
            Some((pending, old_status, when))
        });
        let Some((pending, old_status, when)) = due else {
            return false;
        };

        log::trace!("invoking {} interrupt handler at {when}", pending.kind);
        (pending.handler)(self);

        self.with_state(|s| {
            s.intr.status = old_status;
            s.intr.in_handler = false;
        });
        true
    }

    /// Logs the clock, the interrupt level, and everything pending.
    pub fn dump_state(&self) {
        let (now, level, pending) = self.with_state(|s| {
            let pending: Vec<String> = s
                .intr
                .pending
                .iter()
                .map(|(at, p)| format!("{} at {at}", p.kind))
                .collect();
            (Timestamp::from(s.stats.total_ticks), s.intr.level, pending)
        });
        log::trace!("time: {now}, interrupts {level:?}");
        if pending.is_empty() {
            log::trace!("pending interrupts: none");
        } else {
            log::trace!("pending interrupts: {}", pending.join(", "));
        }
    }

    /// Lets `ticks` ticks of virtual time pass on the calling thread, as if
    /// it were busy computing. Each tick gives pending interrupts (and so the
    /// timer) a chance to run. Interrupts must be on.
    pub fn burn_ticks(&self, ticks: u64) {
        if self.level() != IntLevel::On {
            fail::die("burning ticks with interrupts off");
        }
        for _ in 0..ticks {
            self.one_tick();
        }
    }
}
