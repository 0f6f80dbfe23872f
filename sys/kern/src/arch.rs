// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, the context-switch machinery shows up right here in the `arch`
//! module, tailored for the current host.
//!
//! Each support module must define the same set of names:
//!
//! - `Context`, the saved state of a simulated thread, with `spawn`,
//!   `handle`, and `retire`, plus `ContextRef` handles to it and the
//!   `Retired` host threads that come back from retiring it.
//! - `start(to)`, which lets the first context run.
//! - `switch(from, to)`, which transfers control and returns once `from` is
//!   resumed again.
//! - `Unwind`, `unwind`, `is_unwind`, and `is_finish`, used to leave a
//!   simulated thread without running the rest of its code.
//! - `is_detached` and `abandon`, for threads that have given up the CPU for
//!   good.
//! - `Fence`, `mark_stack`, `clear_stack`, `stack_depth`, and `fence_intact`,
//!   used for overflow checks.

cfg_if::cfg_if! {
    if #[cfg(any(unix, windows))] {
        pub mod hosted;
        pub use hosted::*;
    } else {
        compile_error!("the simulated kernel needs a hosted target with threads");
    }
}
