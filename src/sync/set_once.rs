// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::UnsafeCell;
use core::fmt;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU8, Ordering};

const STATUS_UNSET: u8 = 0;
const STATUS_SETTING: u8 = 1;
const STATUS_SET: u8 = 2;

/// A write-once reference cell.
///
/// The first successful [`set`][SetOnce::set] publishes the value; every
/// later write attempt fails and leaves the cell untouched. Reads are
/// lock-free: a reader that observes the `SET` status also observes the
/// fully written value.
pub struct SetOnce<T> {
    status: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// The externally observable state of a [`SetOnce`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SetState {
    /// No write has started.
    Unset,
    /// A writer is between claiming the cell and publishing the value.
    Setting,
    /// The value is published.
    Set,
}

// Safety: access to the value cell is serialized by the status atomic: a
// single writer claims `SETTING`, and readers only touch the cell after
// observing `SET` with acquire ordering.
unsafe impl<T: Send + Sync> Sync for SetOnce<T> {}
// Safety: see above
unsafe impl<T: Send> Send for SetOnce<T> {}

// === impl SetOnce ===

impl<T> SetOnce<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            status: AtomicU8::new(STATUS_UNSET),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Attempts to publish `value`, returning it back if the cell was
    /// already claimed.
    ///
    /// # Errors
    ///
    /// Returns the value in the `Err` variant when the cell is (or is being)
    /// set; the cell is left unchanged in that case.
    pub fn set(&self, value: T) -> Result<(), T> {
        let claimed = self.status.compare_exchange(
            STATUS_UNSET,
            STATUS_SETTING,
            Ordering::Acquire,
            Ordering::Relaxed,
        );

        if claimed.is_err() {
            return Err(value);
        }

        // Safety: the CAS above made us the unique writer; no reader touches
        // the cell before observing STATUS_SET.
        unsafe {
            (*self.value.get()).as_mut_ptr().write(value);
        }

        self.status.store(STATUS_SET, Ordering::Release);
        Ok(())
    }

    /// Attempts to publish the value produced by `f`.
    ///
    /// `f` runs only when this call claims the cell; a losing call returns
    /// `false` without invoking it.
    pub fn set_with(&self, f: impl FnOnce() -> T) -> bool {
        let claimed = self.status.compare_exchange(
            STATUS_UNSET,
            STATUS_SETTING,
            Ordering::Acquire,
            Ordering::Relaxed,
        );

        if claimed.is_err() {
            return false;
        }

        // Safety: same as `set`, we are the unique writer.
        unsafe {
            (*self.value.get()).as_mut_ptr().write(f());
        }

        self.status.store(STATUS_SET, Ordering::Release);
        true
    }

    /// Returns the value if it is published.
    pub fn get(&self) -> Option<&T> {
        match self.status.load(Ordering::Acquire) {
            // Safety: STATUS_SET means the value was written and will never
            // change again.
            STATUS_SET => Some(unsafe { self.force_get() }),
            _ => None,
        }
    }

    /// Returns the value, spinning through an in-flight write.
    ///
    /// Returns `None` only when the cell is untouched. The window between a
    /// writer claiming the cell and publishing contains no user code, so the
    /// spin is bounded.
    pub fn wait(&self) -> Option<&T> {
        loop {
            match self.status.load(Ordering::Acquire) {
                STATUS_UNSET => return None,
                STATUS_SETTING => core::hint::spin_loop(),
                // Safety: STATUS_SET means the value was written and will
                // never change again.
                _ => return Some(unsafe { self.force_get() }),
            }
        }
    }

    /// Returns the current state of the cell.
    pub fn state(&self) -> SetState {
        match self.status.load(Ordering::Acquire) {
            STATUS_UNSET => SetState::Unset,
            STATUS_SETTING => SetState::Setting,
            _ => SetState::Set,
        }
    }

    /// Returns `true` if the value is published.
    pub fn is_set(&self) -> bool {
        self.status.load(Ordering::Acquire) == STATUS_SET
    }

    unsafe fn force_get(&self) -> &T {
        // Safety:
        // * `UnsafeCell`/inner deref: the value never changes after SET
        // * `MaybeUninit`/outer deref: the value was initialized
        unsafe { &*(*self.value.get()).as_ptr() }
    }
}

impl<T> Default for SetOnce<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for SetOnce<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_tuple("SetOnce");
        match self.get() {
            Some(value) => d.field(value),
            None => d.field(&format_args!("<unset>")),
        };
        d.finish()
    }
}

impl<T> Drop for SetOnce<T> {
    fn drop(&mut self) {
        if *self.status.get_mut() == STATUS_SET {
            // Safety: SET means the value was initialized; we have exclusive
            // access in drop.
            unsafe {
                (*self.value.get()).assume_init_drop();
            }
        }
    }
}
