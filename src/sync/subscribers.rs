// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::mem;
use core::panic::AssertUnwindSafe;

use bitflags::bitflags;
use static_assertions::const_assert_eq;

use crate::loom::cell::UnsafeCell;
use crate::loom::hint;
use crate::loom::sync::atomic::{AtomicU8, Ordering};

/// A one-shot fan-out of a context value to any number of subscribers.
///
/// Subscribers queue up in FIFO order until [`fire`][Subscribers::fire]
/// latches the context and drains the queue on the firing thread. A
/// subscriber added after the fan-out runs immediately, inline, with the
/// latched context. Either way every subscriber runs exactly once, with
/// exactly the same context.
///
/// Subscriber panics are caught and reported; they never propagate back into
/// the firing thread.
///
/// A subscriber must not subscribe to the same handler from inside its
/// callback: the late-subscribe path waits for the in-flight fan-out, which
/// on the firing thread is the caller itself.
///
/// # Implementation Notes
///
/// The queue and context cells carry no lock of their own: the `ADDING` and
/// `NOTIFYING` states of the state machine act as the exclusive claim on
/// them. Transient states (`ADDING`, and `NOTIFYING` as observed by a late
/// subscriber waiting for the context) are spin-waited; the windows contain
/// only a queue push or the context latch.
pub struct Subscribers<C> {
    state: AtomicU8,
    actions: UnsafeCell<Vec<Action<C>>>,
    context: UnsafeCell<Option<C>>,
}

type Action<C> = Box<dyn FnOnce(&C) + Send>;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct State: u8 {
        /// Accepting subscribers; the fan-out has not started.
        const COLLECTING = 0b00;
        /// A subscriber holds the queue for a push.
        const ADDING     = 0b01;
        /// The fan-out claimed the handler; the context is being latched and
        /// the queue drained.
        const NOTIFYING  = 0b10;
        /// The fan-out ran; the latched context is published.
        const EXPIRED    = 0b11;
    }
}
// COLLECTING must be zero, it is the initial state
const_assert_eq!(State::COLLECTING.bits(), 0);

// Safety: the queue and context cells are only touched by the thread that
// holds the ADDING/NOTIFYING claim, or read-only after EXPIRED is published.
unsafe impl<C: Send> Send for Subscribers<C> {}
// Safety: see above
unsafe impl<C: Send + Sync> Sync for Subscribers<C> {}

// === impl Subscribers ===

impl<C> Subscribers<C> {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(State::COLLECTING.bits()),
            actions: UnsafeCell::new(Vec::new()),
            context: UnsafeCell::new(None),
        }
    }

    /// Adds a subscriber.
    ///
    /// Before the fan-out the action is queued; afterwards it runs
    /// immediately on the calling thread with the latched context.
    #[expect(clippy::missing_panics_doc, reason = "internal assertion")]
    pub fn subscribe(&self, action: Action<C>) {
        loop {
            if self.current_state().contains(State::NOTIFYING) {
                // The fan-out has started without us; wait for the context
                // to be published, then run inline.
                while self.current_state() != State::EXPIRED {
                    hint::spin_loop();
                }

                self.context.with(|ptr| {
                    // Safety: EXPIRED (read with acquire ordering) means the
                    // context was latched and is immutable from now on.
                    let context = unsafe { (*ptr).as_ref() }
                        .expect("latched context must be present once expired");
                    run_action(action, context);
                });
                return;
            }

            if self
                .compare_exchange(State::COLLECTING, State::ADDING)
                .is_ok()
            {
                self.actions.with_mut(|ptr| {
                    // Safety: we hold the ADDING claim, no one else touches
                    // the queue.
                    unsafe { (*ptr).push(action) };
                });

                if self.compare_exchange(State::ADDING, State::COLLECTING).is_err() {
                    panic!("subscriber state machine invariant violated: ADDING changed under us");
                }
                return;
            }

            // another subscriber holds the queue, try again
            hint::spin_loop();
        }
    }

    /// Latches the context produced by `supplier` and runs every queued
    /// subscriber in subscription order on the calling thread.
    ///
    /// Returns `true` if this call performed the fan-out, `false` if the
    /// fan-out already happened (the supplier is not invoked then).
    #[expect(clippy::missing_panics_doc, reason = "internal assertion")]
    pub fn fire(&self, supplier: impl FnOnce() -> C) -> bool {
        loop {
            match self.compare_exchange(State::COLLECTING, State::NOTIFYING) {
                Ok(_) => break,
                Err(actual) if actual.contains(State::NOTIFYING) => return false,
                // a subscriber is mid-push, wait it out
                Err(_) => hint::spin_loop(),
            }
        }

        self.context.with_mut(|ptr| {
            // Safety: we hold the NOTIFYING claim; late subscribers spin
            // until EXPIRED before reading.
            unsafe { *ptr = Some(supplier()) };
        });

        let actions = self.actions.with_mut(|ptr| {
            // Safety: we hold the NOTIFYING claim, no one else touches the
            // queue.
            unsafe { mem::take(&mut *ptr) }
        });

        tracing::trace!(subscribers = actions.len(), "fan-out");

        self.context.with(|ptr| {
            // Safety: we latched the context above and hold the only claim.
            let context = unsafe { (*ptr).as_ref() }.expect("context latched above");
            for action in actions {
                run_action(action, context);
            }
        });

        if self.compare_exchange(State::NOTIFYING, State::EXPIRED).is_err() {
            panic!("subscriber state machine invariant violated: NOTIFYING changed under us");
        }
        true
    }

    /// Returns `true` once the fan-out ran and the context is published.
    pub fn is_expired(&self) -> bool {
        self.current_state() == State::EXPIRED
    }

    #[inline(always)]
    fn compare_exchange(&self, curr: State, new: State) -> Result<State, State> {
        self.state
            .compare_exchange(curr.bits(), new.bits(), Ordering::AcqRel, Ordering::Acquire)
            .map(State::from_bits_retain)
            .map_err(State::from_bits_retain)
    }

    #[inline(always)]
    fn current_state(&self) -> State {
        State::from_bits_retain(self.state.load(Ordering::Acquire))
    }
}

impl<C> Default for Subscribers<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for Subscribers<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscribers")
            .field("state", &self.current_state())
            .finish_non_exhaustive()
    }
}

fn run_action<C>(action: Action<C>, context: &C) {
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| action(context)));
    if result.is_err() {
        // subscriber errors must not corrupt the notifier
        tracing::warn!("subscriber panicked during notification");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;
    use std::sync::Arc;
    use std::sync::Mutex;

    #[test]
    fn fifo_order() {
        loom::model(|| {
            let order = Arc::new(Mutex::new(Vec::new()));
            let subs = Subscribers::new();

            for i in 0..4 {
                let order = order.clone();
                subs.subscribe(Box::new(move |base: &i32| {
                    order.lock().unwrap().push(base + i);
                }));
            }

            assert!(subs.fire(|| 10));
            assert_eq!(*order.lock().unwrap(), vec![10, 11, 12, 13]);
        });
    }

    #[test]
    fn second_fire_loses() {
        loom::model(|| {
            let subs = Subscribers::<i32>::new();
            assert!(subs.fire(|| 1));
            assert!(!subs.fire(|| panic!("supplier of a losing fire must not run")));
        });
    }

    #[test]
    fn late_subscriber_runs_inline_with_latched_context() {
        loom::model(|| {
            let subs = Subscribers::new();
            assert!(subs.fire(|| 99));
            assert!(subs.is_expired());

            let seen = Arc::new(Mutex::new(None));
            let seen2 = seen.clone();
            subs.subscribe(Box::new(move |ctx: &i32| {
                *seen2.lock().unwrap() = Some(*ctx);
            }));

            assert_eq!(*seen.lock().unwrap(), Some(99));
        });
    }

    #[test]
    fn panicking_subscriber_does_not_poison() {
        loom::model(|| {
            let ran = Arc::new(Mutex::new(false));
            let ran2 = ran.clone();

            let subs = Subscribers::new();
            subs.subscribe(Box::new(|_: &()| panic!("boom")));
            subs.subscribe(Box::new(move |_: &()| {
                *ran2.lock().unwrap() = true;
            }));

            assert!(subs.fire(|| ()));
            assert!(*ran.lock().unwrap());
            assert!(subs.is_expired());
        });
    }

    #[test]
    fn concurrent_subscribe_and_fire_exactly_once() {
        loom::model(|| {
            loom::lazy_static! {
                static ref COUNT: std::sync::atomic::AtomicUsize =
                    std::sync::atomic::AtomicUsize::new(0);
            }
            COUNT.store(0, std::sync::atomic::Ordering::SeqCst);

            let subs = Arc::new(Subscribers::new());

            let subscriber = {
                let subs = subs.clone();
                loom::thread::spawn(move || {
                    subs.subscribe(Box::new(|ctx: &usize| {
                        COUNT.fetch_add(*ctx, std::sync::atomic::Ordering::SeqCst);
                    }));
                })
            };

            let firer = {
                let subs = subs.clone();
                loom::thread::spawn(move || {
                    subs.fire(|| 1);
                })
            };

            subscriber.join().unwrap();
            firer.join().unwrap();

            // whether the subscriber was queued or ran inline, it ran once
            assert_eq!(COUNT.load(std::sync::atomic::Ordering::SeqCst), 1);
        });
    }
}
