// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Single-borrower cell for kernel state.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::arch;

/// A RefCell-style container for state shared by every simulated thread,
/// where only a single borrow needs to happen at any given time.
///
/// Simulated threads live on different host threads, but only one of them
/// runs at a time and control only moves at a context switch. So the kernel
/// never needs a lock around its state; it needs to catch the bug where a
/// borrow is held across a switch (or across a call back into the kernel).
/// That's what this does: a second borrow while the first is outstanding is
/// a kernel bug, and panics.
///
/// A thread that has halted the machine or been released no longer runs,
/// even while its frames are being dropped. If it tries to borrow, it is
/// parked for good (see [`arch::abandon`]).
///
/// This only provides `mut` access. It does _not_ provide the many-reader
/// one-writer behavior of `RefCell`, only the one-writer part.
#[derive(Default)]
pub struct KernelCell<T> {
    borrowed: AtomicBool,
    cell: UnsafeCell<T>,
}

impl<T> KernelCell<T> {
    pub const fn new(contents: T) -> Self {
        Self {
            borrowed: AtomicBool::new(false),
            cell: UnsafeCell::new(contents),
        }
    }

    /// Gets mutable access to the contents of `self`.
    ///
    /// If a `KernelRef` for `self` still exists anywhere in the program, this
    /// will panic.
    #[track_caller]
    pub fn borrow_mut(&self) -> KernelRef<'_, T> {
        if arch::is_detached() {
            arch::abandon();
        }
        if self.borrowed.swap(true, Ordering::Acquire) {
            panic!("kernel state borrowed twice (held across a switch?)");
        }
        // Safety: the check above ensures that we are not producing an
        // aliasing &mut to our contents.
        unsafe {
            KernelRef {
                contents: &mut *self.cell.get(),
                borrow: &self.borrowed,
            }
        }
    }

    /// Runs `body` with the contents borrowed.
    #[track_caller]
    pub fn with<R>(&self, body: impl FnOnce(&mut T) -> R) -> R {
        body(&mut self.borrow_mut())
    }

    pub fn into_inner(self) -> T {
        self.cell.into_inner()
    }
}

// Safety: the borrow flag hands out at most one &mut at a time, and the
// Acquire/Release pair on it orders one host thread's accesses before the
// next's. Sending a &mut T between host threads is what that amounts to.
unsafe impl<T: Send> Sync for KernelCell<T> {}

impl<T> fmt::Debug for KernelCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelCell")
            .field("borrowed", &self.borrowed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

pub struct KernelRef<'a, T> {
    contents: &'a mut T,
    borrow: &'a AtomicBool,
}

impl<T> Drop for KernelRef<'_, T> {
    fn drop(&mut self) {
        self.borrow.store(false, Ordering::Release);
    }
}

impl<T> Deref for KernelRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &*self.contents
    }
}

impl<T> DerefMut for KernelRef<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.contents
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn borrow_is_released_on_drop() {
        let cell = KernelCell::new(1);
        *cell.borrow_mut() += 1;
        cell.with(|v| *v += 1);
        assert_eq!(cell.into_inner(), 3);
    }

    #[test]
    #[should_panic(expected = "borrowed twice")]
    fn second_borrow_panics() {
        let cell = KernelCell::new(());
        let _a = cell.borrow_mut();
        let _b = cell.borrow_mut();
    }
}
