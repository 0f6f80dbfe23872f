// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated single-CPU kernel.
//!
//! This is the core of a teaching operating system that runs entirely in a
//! host process: a cooperative thread scheduler, a discrete-event interrupt
//! simulator that owns virtual time, and the synchronization primitives built
//! on those two. Everything else a teaching OS grows (file systems, paging,
//! networking) hangs off the execution and atomicity model defined here.
//!
//! A simulation is started with [`startup::run`], which boots a kernel, runs a
//! bootstrap thread, and returns a [`startup::Report`] once no work remains.
//!
//! # Design principles
//!
//! 1. One logical thread of control. Simulated threads are backed by host
//!    threads, but exactly one of them holds the CPU at any instant, and
//!    control only moves at a context switch.
//! 2. Interrupts off is the lock. Every shared kernel queue is mutated with the
//!    simulated interrupt level set to `Off`, and nothing finer-grained.
//! 3. Virtual time only moves under the interrupt controller's rules: a fixed
//!    charge each time interrupts are re-enabled, and a jump straight to the
//!    next pending event when the machine idles.
//! 4. Misuse is fatal. A precondition violation is a kernel bug; it kills the
//!    run and is reported to the host as an epitaph.
//! 5. No hidden globals. All per-run state lives in one [`Kernel`] context.

pub mod addrspace;
pub mod arch;
pub mod cell;
pub mod config;
pub mod err;
pub mod fail;
pub mod interrupt;
pub mod kernel;
pub mod monitor;
pub mod sched;
pub mod startup;
pub mod stats;
pub mod synch;
pub mod synchlist;
pub mod thread;
pub mod time;
pub mod timer;
pub mod trace;

pub use crate::addrspace::AddressSpace;
pub use crate::config::{Config, Policy};
pub use crate::err::{HaltReason, SimError};
pub use crate::interrupt::{IntKind, IntLevel, MachineStatus};
pub use crate::kernel::Kernel;
pub use crate::monitor::{ConditionH, Monitor};
pub use crate::startup::{run, Report};
pub use crate::stats::Statistics;
pub use crate::synch::{Condition, Lock, Semaphore};
pub use crate::synchlist::SynchList;
pub use crate::thread::{Priority, ThreadId, ThreadStatus};
pub use crate::time::Timestamp;
pub use crate::timer::Timer;
