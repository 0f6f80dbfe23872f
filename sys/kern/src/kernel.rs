// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel context.
//!
//! Everything a single simulation run needs (the thread table, the current
//! thread, the scheduler, the interrupt controller, statistics, the timer)
//! lives in one [`State`], owned by one [`Kernel`]. A `Kernel` is a cheap
//! handle; every simulated thread gets a clone, and so does every primitive
//! built on it. Nothing is global, so independent runs can share a process.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use ringbuf::ringbuf_entry;

use crate::arch::Retired;
use crate::cell::KernelCell;
use crate::config::Config;
use crate::err::HaltReason;
use crate::interrupt::Interrupts;
use crate::sched::Scheduler;
use crate::stats::Statistics;
use crate::thread::{Priority, Tcb, ThreadId, ThreadStatus, ThreadTable};
use crate::timer::Timer;
use crate::trace::{self, Trace, TraceRing};

/// Handle to a running simulation.
#[derive(Clone)]
pub struct Kernel {
    pub(crate) shared: Arc<Shared>,
}

pub(crate) struct Shared {
    pub(crate) config: Config,
    state: KernelCell<State>,
    next_object: AtomicU64,
    outcome: Mutex<Option<Outcome>>,
    ended: Condvar,
}

/// How a run ended, as reported to the host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Outcome {
    Halted(HaltReason),
    Died(String),
}

/// All mutable per-run kernel state.
pub(crate) struct State {
    pub threads: ThreadTable,
    pub current: ThreadId,
    /// A thread that has finished and is waiting for some other thread to
    /// reclaim it.
    pub to_destroy: Option<ThreadId>,
    pub sched: Scheduler,
    pub intr: Interrupts,
    pub stats: Statistics,
    pub rng: ChaCha8Rng,
    pub trace: TraceRing,
    pub timer: Option<Timer>,
    /// Host threads of reclaimed simulated threads, joined at teardown.
    pub reaped: Vec<Retired>,
}

impl State {
    /// Builds the machine in dependency order: statistics, interrupt
    /// controller, scheduler, then the bootstrap thread, which is already
    /// running.
    fn new(config: &Config) -> Self {
        let stats = Statistics::default();
        let intr = Interrupts::new();
        let sched = Scheduler::new(config.policy);

        let mut main = Tcb::new("main", Priority::DEFAULT);
        main.status = ThreadStatus::Running;
        main.forked = true;
        let (threads, current) = ThreadTable::with_bootstrap(main);

        let mut trace = trace::new_ring();
        ringbuf_entry!(trace, Trace::Boot);

        Self {
            threads,
            current,
            to_destroy: None,
            sched,
            intr,
            stats,
            rng: ChaCha8Rng::seed_from_u64(config.random_seed.unwrap_or(0)),
            trace,
            timer: None,
            reaped: Vec::new(),
        }
    }
}

impl Kernel {
    pub(crate) fn new(config: Config) -> Self {
        let state = State::new(&config);
        Self {
            shared: Arc::new(Shared {
                config,
                state: KernelCell::new(state),
                next_object: AtomicU64::new(1),
                outcome: Mutex::new(None),
                ended: Condvar::new(),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Runs `body` with the kernel state borrowed.
    ///
    /// To preserve uniqueness of the `&mut` reference passed into `body`, this
    /// will detect any attempt to call it recursively and panic. `body` must
    /// not switch threads or call back into anything that might.
    #[track_caller]
    pub(crate) fn with_state<R>(&self, body: impl FnOnce(&mut State) -> R) -> R {
        self.shared.state.with(body)
    }

    /// Hands out a number no other object in this run has. Primitives use
    /// these to tell one another apart.
    pub(crate) fn object_id(&self) -> u64 {
        self.shared.next_object.fetch_add(1, Ordering::Relaxed)
    }

    /// Draws a number uniformly from `range` using the machine's seeded
    /// generator.
    pub fn random(&self, range: Range<u64>) -> u64 {
        self.with_state(|s| s.rng.gen_range(range))
    }

    pub fn stats(&self) -> Statistics {
        self.with_state(|s| s.stats.clone())
    }

    /// Records how the run ended and wakes the host. Only the first outcome
    /// counts.
    pub(crate) fn end_run(&self, outcome: Outcome) {
        let mut slot = self
            .shared
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(outcome);
        }
        self.shared.ended.notify_all();
    }

    /// Blocks the host until some simulated thread ends the run.
    pub(crate) fn wait_for_end(&self) -> Outcome {
        let slot = self
            .shared
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut slot = self
            .shared
            .ended
            .wait_while(slot, |o| o.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        slot.take().unwrap_or(Outcome::Halted(HaltReason::Idle))
    }
}
