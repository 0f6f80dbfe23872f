// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hook for user address spaces.

/// Machine state belonging to a user program, saved and restored by the
/// scheduler around every context switch of a thread that owns one.
///
/// Page-table formats and fault handling belong to whoever implements this;
/// the kernel only promises to call the hooks in order. Switching away from a
/// thread calls `save_user_state` then `save_state`; switching back calls
/// `restore_user_state` then `restore_state`.
///
/// Hooks are called with no kernel state borrowed, but with interrupts off.
/// They must not block.
pub trait AddressSpace: Send + Sync {
    fn save_state(&self);

    fn restore_state(&self);

    /// Saves the user-mode CPU registers. Threads that never run in user mode
    /// can leave this alone.
    fn save_user_state(&self) {}

    fn restore_user_state(&self) {}
}
