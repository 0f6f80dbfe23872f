// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Misuse of the kernel from inside a simulation is not an error in this
//! sense: it's a bug, it kills the run (see `fail`), and the host hears about
//! it as [`SimError::Died`]. The other variants cover things that go wrong
//! before or around a run.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    /// A simulated thread hit a fatal kernel assertion or panicked.
    #[error("kernel died: {epitaph}")]
    Died { epitaph: String },

    /// The host refused to give us a thread to back a simulated one.
    #[error("can't spawn host thread for `{name}`")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("can't parse configuration")]
    Config(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Why a run ended normally.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HaltReason {
    /// Nothing was ready to run and no interrupts were pending.
    Idle,
    /// Somebody called `Kernel::halt`.
    Requested,
}
