// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-run machine configuration.

use serde::Deserialize;

use crate::err::SimError;
use crate::stats::{SYSTEM_TICK, TIMER_TICKS, USER_TICK};

/// Order in which ready threads are dispatched.
#[derive(Copy, Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum Policy {
    /// First come, first served.
    #[default]
    Fifo,
    /// Most important first (lowest `Priority` value); first come, first
    /// served among equals.
    Priority,
}

/// How to build the simulated machine.
///
/// Every field has a default, so an empty TOML document is a valid
/// configuration.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct Config {
    pub policy: Policy,
    /// Whether to install the time-slicing timer.
    pub timer: bool,
    /// Seed for the machine's random number generator. Setting this also
    /// randomizes the timer interval.
    pub random_seed: Option<u64>,
    pub timer_ticks: u64,
    pub system_tick: u64,
    pub user_tick: u64,
    /// Stack size for each simulated thread, in bytes.
    pub stack_size: usize,
}

/// Largest tick cost or timer interval accepted. Random timer intervals run
/// up to twice the configured one, and that has to fit in a `u64`.
pub const MAX_TICKS: u64 = u64::MAX / 2;

/// Smallest stack we'll hand a simulated thread. Below this the host runtime
/// itself tends to run out.
pub const MIN_STACK_SIZE: usize = 64 * 1024;

impl Default for Config {
    fn default() -> Self {
        Self {
            policy: Policy::Fifo,
            timer: false,
            random_seed: None,
            timer_ticks: TIMER_TICKS,
            system_tick: SYSTEM_TICK,
            user_tick: USER_TICK,
            stack_size: 256 * 1024,
        }
    }
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self, SimError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SimError> {
        if self.timer_ticks == 0 {
            return Err(SimError::InvalidConfig("timer-ticks must be nonzero"));
        }
        if self.system_tick == 0 || self.user_tick == 0 {
            return Err(SimError::InvalidConfig(
                "system-tick and user-tick must be nonzero",
            ));
        }
        if [self.timer_ticks, self.system_tick, self.user_tick]
            .iter()
            .any(|&t| t > MAX_TICKS)
        {
            return Err(SimError::InvalidConfig("tick values are too large"));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(SimError::InvalidConfig("stack-size is too small"));
        }
        Ok(())
    }

    /// Whether the timer interval should be drawn at random.
    pub fn randomize(&self) -> bool {
        self.random_seed.is_some()
    }
}
