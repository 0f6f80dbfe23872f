// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A periodic timer device.
//!
//! The timer is just a handler that keeps rescheduling itself with the
//! interrupt controller. The kernel installs one at boot when configured to,
//! with [`time_slice`] as its handler, which is what gives otherwise
//! cooperative threads the appearance of being preempted.

use std::sync::Arc;

use crate::interrupt::{IntKind, MachineStatus};
use crate::kernel::Kernel;

type TickHandler = dyn Fn(&Kernel) + Send + Sync + 'static;

/// Handle to an installed timer. The timer keeps running whether or not the
/// handle is kept; it lives as long as the machine does.
#[derive(Clone)]
pub struct Timer {
    inner: Arc<TimerInner>,
}

struct TimerInner {
    handler: Box<TickHandler>,
    randomize: bool,
}

impl Timer {
    /// Installs a timer that calls `handler` (from interrupt context) every
    /// `timer_ticks` ticks, or, with `randomize`, after a random interval
    /// drawn from `1..2 * timer_ticks` each time.
    pub fn new(
        kernel: &Kernel,
        handler: impl Fn(&Kernel) + Send + Sync + 'static,
        randomize: bool,
    ) -> Self {
        let inner = Arc::new(TimerInner {
            handler: Box::new(handler),
            randomize,
        });
        inner.arm(kernel);
        Timer { inner }
    }

    pub fn is_random(&self) -> bool {
        self.inner.randomize
    }
}

impl TimerInner {
    fn next_interval(&self, kernel: &Kernel) -> u64 {
        let ticks = kernel.config().timer_ticks;
        if self.randomize {
            kernel.random(1..ticks.saturating_mul(2))
        } else {
            ticks
        }
    }

    fn arm(self: &Arc<Self>, kernel: &Kernel) {
        let interval = self.next_interval(kernel);
        log::trace!("timer armed to go off in {interval} ticks");
        let this = Arc::clone(self);
        kernel.schedule(move |k| this.expired(k), interval, IntKind::Timer);
    }

    /// Reschedules first, so the next interrupt is pending even if the
    /// handler never returns.
    fn expired(self: Arc<Self>, kernel: &Kernel) {
        self.arm(kernel);
        (self.handler)(kernel);
    }
}

/// The usual timer handler: unless the machine is idle, make whoever was
/// interrupted give up the CPU.
pub fn time_slice(kernel: &Kernel) {
    if kernel.status() != MachineStatus::Idle {
        kernel.yield_on_return();
    }
}
