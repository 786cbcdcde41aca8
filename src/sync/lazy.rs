// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! At-most-once supplier evaluation.

use core::cell::UnsafeCell;
use core::error::Error;
use core::fmt;
use core::mem::ManuallyDrop;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;

const STATUS_PENDING: u8 = 0;
const STATUS_EMPTY: u8 = 1;
const STATUS_RUNNING: u8 = 2;
const STATUS_READY: u8 = 3;
const STATUS_POISONED: u8 = 4;

union Data<T, F> {
    value: ManuallyDrop<T>,
    f: ManuallyDrop<F>,
    empty: (),
}

/// A memoized supplier: the wrapped closure runs at most once, on the first
/// [`get`][Lazy::get], even under contention.
///
/// A `Lazy` created through [`Lazy::uninit`] carries no supplier; it is
/// resolved by the first [`get_or_init`][Lazy::get_or_init] instead.
pub struct Lazy<T, F = fn() -> T> {
    status: AtomicU8,
    data: UnsafeCell<Data<T, F>>,
}

/// Error returned by [`CloseableLazy::get`] after the cell was closed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LazyClosed(pub(crate) ());

/// A [`Lazy`] with an attached close function.
///
/// [`close`][CloseableLazy::close] runs the close function exactly once and
/// only if the value was actually created; afterwards
/// [`get`][CloseableLazy::get] fails with [`LazyClosed`]. Creation and
/// closing are serialized, so a close can never interleave with an in-flight
/// first `get`.
pub struct CloseableLazy<T, F = fn() -> T, D = fn(&T)> {
    lazy: Lazy<T, F>,
    // the gate doubles as the close-fn slot: `None` means closed
    gate: Mutex<Option<D>>,
    closed: AtomicBool,
}

// Safety: initialization is serialized by the status atomic (single RUNNING
// owner); after READY the value is immutable.
unsafe impl<T: Send + Sync, F: Send> Sync for Lazy<T, F> {}
// Safety: see above
unsafe impl<T: Send, F: Send> Send for Lazy<T, F> {}

// === impl Lazy ===

impl<T, F> Lazy<T, F> {
    /// Creates a lazy that will resolve by running `f`.
    pub const fn new(f: F) -> Self {
        Self {
            status: AtomicU8::new(STATUS_PENDING),
            data: UnsafeCell::new(Data {
                f: ManuallyDrop::new(f),
            }),
        }
    }

    /// Creates a lazy with no supplier; resolve it with
    /// [`get_or_init`][Lazy::get_or_init].
    pub const fn uninit() -> Self {
        Self {
            status: AtomicU8::new(STATUS_EMPTY),
            data: UnsafeCell::new(Data { empty: () }),
        }
    }

    /// Returns the value if it has already been created.
    pub fn try_get(&self) -> Option<&T> {
        if self.status.load(Ordering::Acquire) == STATUS_READY {
            // Safety: READY means the value was written and will never
            // change again.
            Some(unsafe { self.force_get() })
        } else {
            None
        }
    }

    /// Returns `true` if the value has been created.
    pub fn is_resolved(&self) -> bool {
        self.status.load(Ordering::Acquire) == STATUS_READY
    }

    unsafe fn force_get(&self) -> &T {
        // Safety: only called after observing READY with acquire ordering;
        // the value field is initialized and immutable from then on.
        unsafe { &(*self.data.get()).value }
    }

    /// Attempts to claim the cell for initialization, transitioning `from`
    /// to RUNNING.
    fn claim(&self, from: u8) -> bool {
        self.status
            .compare_exchange(from, STATUS_RUNNING, Ordering::Acquire, Ordering::Acquire)
            .is_ok()
    }

    /// Runs `init` as the unique initializer and publishes the value.
    ///
    /// Must only be called by the thread that [`claim`][Self::claim]ed the
    /// cell.
    fn finish_init(&self, init: impl FnOnce() -> T) -> &T {
        let guard = PoisonGuard {
            status: &self.status,
        };
        let value = init();
        core::mem::forget(guard);

        // Safety: the claim made us the unique writer; no one reads the
        // cell before observing READY.
        unsafe {
            (*self.data.get()).value = ManuallyDrop::new(value);
        }
        self.status.store(STATUS_READY, Ordering::Release);
        // Safety: we just published the value.
        unsafe { self.force_get() }
    }

    /// Takes the stored supplier out of the cell.
    ///
    /// Must only be called by the thread that claimed the cell from the
    /// PENDING state.
    unsafe fn take_supplier(&self) -> F {
        // Safety: the PENDING -> RUNNING claim made us the unique owner of
        // the supplier slot.
        unsafe { ManuallyDrop::take(&mut (*self.data.get()).f) }
    }
}

impl<T, F: FnOnce() -> T> Lazy<T, F> {
    /// Returns the value, running the supplier if this is the first access.
    ///
    /// Blocks (spins) while another thread is running the supplier.
    ///
    /// # Panics
    ///
    /// Panics if the lazy was created with [`Lazy::uninit`] (use
    /// [`get_or_init`][Lazy::get_or_init]), or if a previous initialization
    /// attempt panicked.
    pub fn get(&self) -> &T {
        loop {
            match self.status.load(Ordering::Acquire) {
                // Safety: READY means the value is initialized and immutable.
                STATUS_READY => return unsafe { self.force_get() },
                STATUS_RUNNING => core::hint::spin_loop(),
                STATUS_POISONED => panic!("Lazy instance has previously been poisoned"),
                STATUS_EMPTY => panic!("Lazy::uninit has no supplier; use get_or_init"),
                _ => {
                    if self.claim(STATUS_PENDING) {
                        // Safety: we hold the PENDING claim.
                        let f = unsafe { self.take_supplier() };
                        return self.finish_init(f);
                    }
                }
            }
        }
    }

    /// Resolves this lazy and returns the value by move.
    ///
    /// # Panics
    ///
    /// Panics if the lazy was created with [`Lazy::uninit`] and never
    /// resolved, or if a previous initialization attempt panicked.
    pub fn into_value(mut self) -> T {
        let status = *self.status.get_mut();
        let this = ManuallyDrop::new(self);
        // Safety: `this` is never dropped, so reading the data out cannot
        // lead to a double free.
        let data = unsafe { ptr::read(&this.data) }.into_inner();

        match status {
            // Safety: READY implies the value field is initialized.
            STATUS_READY => ManuallyDrop::into_inner(unsafe { data.value }),
            // Safety: PENDING implies the supplier field is initialized, and
            // `&mut self` rules out a concurrent initializer.
            STATUS_PENDING => ManuallyDrop::into_inner(unsafe { data.f })(),
            STATUS_EMPTY => panic!("Lazy::uninit has no supplier; use get_or_init"),
            _ => panic!("Lazy instance has previously been poisoned"),
        }
    }

    /// Returns a lazy producing `g` applied to this lazy's value.
    ///
    /// The mapped result is memoized independently; resolving the returned
    /// lazy resolves this one.
    pub fn map<U, G: FnOnce(T) -> U>(self, g: G) -> Lazy<U, impl FnOnce() -> U> {
        Lazy::new(move || g(self.into_value()))
    }
}

impl<T> Lazy<T> {
    /// Returns the value, running `init` if the value has not been created
    /// and no supplier was stored.
    ///
    /// When the lazy was created with a supplier, the stored supplier wins
    /// and `init` is dropped unused.
    ///
    /// # Panics
    ///
    /// Panics if a previous initialization attempt panicked.
    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> &T {
        loop {
            match self.status.load(Ordering::Acquire) {
                // Safety: READY means the value is initialized and immutable.
                STATUS_READY => return unsafe { self.force_get() },
                STATUS_RUNNING => core::hint::spin_loop(),
                STATUS_POISONED => panic!("Lazy instance has previously been poisoned"),
                STATUS_EMPTY => {
                    if self.claim(STATUS_EMPTY) {
                        return self.finish_init(init);
                    }
                }
                _ => {
                    if self.claim(STATUS_PENDING) {
                        // Safety: we hold the PENDING claim.
                        let f = unsafe { self.take_supplier() };
                        return self.finish_init(f);
                    }
                }
            }
        }
    }
}

impl<T, F> Drop for Lazy<T, F> {
    fn drop(&mut self) {
        match *self.status.get_mut() {
            // Safety: PENDING implies the supplier field is initialized.
            STATUS_PENDING => unsafe { ManuallyDrop::drop(&mut self.data.get_mut().f) },
            // Safety: READY implies the value field is initialized.
            STATUS_READY => unsafe { ManuallyDrop::drop(&mut self.data.get_mut().value) },
            _ => {}
        }
    }
}

impl<T: fmt::Debug, F> fmt::Debug for Lazy<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_tuple("Lazy");
        match self.try_get() {
            Some(value) => d.field(value),
            None => d.field(&format_args!("<unresolved>")),
        };
        d.finish()
    }
}

struct PoisonGuard<'a> {
    status: &'a AtomicU8,
}

impl Drop for PoisonGuard<'_> {
    fn drop(&mut self) {
        self.status.store(STATUS_POISONED, Ordering::Relaxed);
    }
}

// === impl CloseableLazy ===

impl<T, F: FnOnce() -> T, D: FnOnce(&T)> CloseableLazy<T, F, D> {
    /// Creates a closeable lazy from a supplier and a close function.
    pub fn new(f: F, close: D) -> Self {
        Self {
            lazy: Lazy::new(f),
            gate: Mutex::new(Some(close)),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the value, running the supplier on first access.
    ///
    /// # Errors
    ///
    /// Returns [`LazyClosed`] once [`close`][CloseableLazy::close] was
    /// called.
    ///
    /// # Panics
    ///
    /// Panics if a previous initialization attempt panicked.
    pub fn get(&self) -> Result<&T, LazyClosed> {
        let gate = self.gate.lock().expect("closeable lazy gate poisoned");
        if gate.is_none() {
            return Err(LazyClosed(()));
        }
        let value = self.lazy.get();
        drop(gate);
        Ok(value)
    }

    /// Closes the cell, running the close function iff the value was
    /// created. Returns `true` if this call performed the close.
    ///
    /// # Panics
    ///
    /// Panics if a `get` on another thread panicked mid-initialization.
    pub fn close(&self) -> bool {
        let mut gate = self.gate.lock().expect("closeable lazy gate poisoned");
        let Some(close) = gate.take() else {
            return false;
        };
        self.closed.store(true, Ordering::Release);
        if let Some(value) = self.lazy.try_get() {
            close(value);
        }
        true
    }

    /// Returns `true` once the cell was closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl<T: fmt::Debug, F, D> fmt::Debug for CloseableLazy<T, F, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseableLazy")
            .field("value", &self.lazy)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

// === impl LazyClosed ===

impl fmt::Display for LazyClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("lazy value was closed")
    }
}

impl Error for LazyClosed {}
