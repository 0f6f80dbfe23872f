// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for recording kernel failures such that they can be reported to
//! the host.
//!
//! A fatal condition on a simulated thread (a failed kernel assertion, a
//! detected stack overflow, or any other panic) unwinds that thread back to
//! its trampoline. The trampoline turns the panic payload into an *epitaph*,
//! a short UTF-8 description of what went wrong, and ends the run. Only the
//! first failure of a run gets an epitaph; anything after that is fallout.

use std::any::Any;
use std::fmt::Display;

/// Epitaphs longer than this are truncated.
pub const EPITAPH_LEN: usize = 128;

/// Kills the run with `msg` as the epitaph.
#[track_caller]
pub fn die(msg: impl Display) -> ! {
    die_impl(&msg)
}

#[track_caller]
#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    log::error!("kernel death: {msg}");
    panic!("{msg}")
}

/// Extracts an epitaph from a panic payload.
pub fn eulogize(payload: &(dyn Any + Send)) -> String {
    let msg = if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown failure"
    };
    truncate(msg).to_string()
}

fn truncate(msg: &str) -> &str {
    if msg.len() <= EPITAPH_LEN {
        return msg;
    }
    let mut end = EPITAPH_LEN;
    while !msg.is_char_boundary(end) {
        end -= 1;
    }
    &msg[..end]
}
