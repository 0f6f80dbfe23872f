// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Performance counters for a simulation run.

use std::fmt;

/// Ticks charged each time interrupts are re-enabled in kernel mode.
pub const SYSTEM_TICK: u64 = 10;
/// Ticks charged each time interrupts are re-enabled in user mode.
pub const USER_TICK: u64 = 1;
/// Mean interval between timer interrupts.
pub const TIMER_TICKS: u64 = 100;

/// Counters kept by the kernel across a run.
///
/// `total_ticks` doubles as the machine's clock; the other tick counters
/// break it down by what the machine was doing when time advanced, and add
/// up to it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Statistics {
    pub total_ticks: u64,
    pub idle_ticks: u64,
    pub system_ticks: u64,
    pub user_ticks: u64,
    pub context_switches: u64,
    pub interrupts: u64,
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Ticks: total {}, idle {}, system {}, user {}",
            self.total_ticks, self.idle_ticks, self.system_ticks, self.user_ticks
        )?;
        write!(
            f,
            "Context switches: {}, interrupts: {}",
            self.context_switches, self.interrupts
        )
    }
}
