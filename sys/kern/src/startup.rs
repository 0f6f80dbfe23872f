// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup and teardown.

use ringbuf::RingbufEntry;

use crate::arch::{self, Context};
use crate::config::Config;
use crate::err::{HaltReason, SimError};
use crate::kernel::{Kernel, Outcome};
use crate::stats::Statistics;
use crate::timer::{self, Timer};
use crate::trace::{self, Trace};

/// What the host gets back from a run that ended normally.
#[derive(Clone, Debug)]
pub struct Report {
    pub reason: HaltReason,
    pub stats: Statistics,
    /// The last few kernel events, oldest first.
    pub trace: Vec<RingbufEntry<Trace>>,
}

/// Boots a machine configured by `config`, runs `main` as its first thread,
/// and blocks until the machine halts.
///
/// `main` starts with interrupts enabled, like every other thread. The run
/// ends when nothing is left to run and no interrupts are pending, when some
/// thread calls [`Kernel::halt`], or when something kills the kernel, which
/// is reported as [`SimError::Died`]. Either way, every simulated thread is
/// stopped and its host thread joined before this returns. The exception is
/// a thread whose destructors reached for kernel state after it was
/// stopped; that one is left parked.
pub fn run<F>(config: Config, main: F) -> Result<Report, SimError>
where
    F: FnOnce(&Kernel) + Send + 'static,
{
    config.validate()?;
    log::debug!("booting with {config:?}");

    let kernel = Kernel::new(config);

    if kernel.config().timer {
        let timer = Timer::new(
            &kernel,
            timer::time_slice,
            kernel.config().randomize(),
        );
        kernel.with_state(|s| s.timer = Some(timer));
    }

    let me = kernel.current_thread();
    let ctx = match kernel.spawn_context(me, "main", Box::new(main)) {
        Ok(ctx) => ctx,
        Err(source) => {
            teardown(&kernel);
            return Err(SimError::Spawn {
                name: "main".to_string(),
                source,
            });
        }
    };
    let first = ctx.handle();
    kernel.with_state(|s| s.threads.expect_mut(me).context = Some(ctx));

    arch::start(&first);
    let outcome = kernel.wait_for_end();

    let (stats, trace) = teardown(&kernel);
    match outcome {
        Outcome::Halted(reason) => Ok(Report {
            reason,
            stats,
            trace,
        }),
        Outcome::Died(epitaph) => Err(SimError::Died { epitaph }),
    }
}

/// Takes the machine apart in the reverse of the order it was built: timer,
/// pending interrupts, then threads. Every simulated thread is told to exit,
/// and every host thread is joined.
fn teardown(kernel: &Kernel) -> (Statistics, Vec<RingbufEntry<Trace>>) {
    let (timer, pending, contexts, mut hosts, stats, trace) =
        kernel.with_state(|s| {
            let pending: Vec<_> = s.intr.pending.drain().collect();
            let contexts: Vec<Context> =
                s.threads.drain().filter_map(|t| t.context).collect();
            s.to_destroy = None;
            (
                s.timer.take(),
                pending,
                contexts,
                std::mem::take(&mut s.reaped),
                s.stats.clone(),
                trace::snapshot(&s.trace),
            )
        });

    // Pending handlers and the timer may hold clones of the kernel; dropping
    // them here breaks the cycle through the kernel state.
    drop(timer);
    log::debug!("discarding {} pending interrupts", pending.len());
    drop(pending);

    hosts.extend(contexts.into_iter().filter_map(Context::retire));
    log::debug!("joining {} host threads", hosts.len());
    for host in hosts {
        match host.join() {
            Ok(true) => {}
            Ok(false) => log::warn!("leaving an abandoned host thread parked"),
            Err(_) => log::warn!("host thread panicked outside the kernel"),
        }
    }

    (stats, trace)
}
