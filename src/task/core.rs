// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::{Cancelled, Failure};
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicBool, Ordering};
use crate::sync::{Awaiter, Permit, Subscribers};
use crate::task::state;
use crate::task::state::{StateCell, TaskState};

/// The shared core behind a [`Task`][crate::Task] handle.
///
/// A core is either *live* (created running, carrying the full completion
/// machinery) or *done* (created in a terminal state, a flyweight that
/// answers every query without synchronization).
pub(super) enum Core<T> {
    Live(Live<T>),
    Done(Done<T>),
}

/// The live task core.
///
/// The three outcome slots are plain cells; the state machine is their lock.
/// A slot is written exactly once, by the thread that won the
/// `RUNNING -> *ing` transition, strictly before the stable terminal state
/// is published. Readers must observe a terminal state (spinning out the
/// valid bit if needed) before touching a slot.
pub(super) struct Live<T> {
    pub(super) state: StateCell,
    result: UnsafeCell<Option<T>>,
    failure: UnsafeCell<Option<Failure>>,
    cause: UnsafeCell<Option<Cancelled>>,
    consumed: AtomicBool,
    pub(super) awaiter: Awaiter,
    pub(super) on_success: Subscribers<()>,
    pub(super) on_failure: Subscribers<Failure>,
    pub(super) on_cancelled: Subscribers<Cancelled>,
    pub(super) on_completion: Subscribers<()>,
}

/// A pre-completed core.
pub(super) struct Done<T> {
    pub(super) outcome: Outcome<T>,
    consumed: AtomicBool,
}

/// The terminal outcome of a computation.
pub(super) enum Outcome<T> {
    Success(T),
    Failed(Failure),
    Cancelled(Cancelled),
}

// Safety: the outcome slots are written once, by the single thread holding
// the transient-state claim, before the stable state is published with
// release ordering; afterwards they are immutable and may be shared.
unsafe impl<T: Send> Send for Core<T> {}
// Safety: see above
unsafe impl<T: Send + Sync> Sync for Core<T> {}

// === impl Core ===

impl<T> Core<T> {
    pub(super) fn live() -> Self {
        Core::Live(Live {
            state: StateCell::new_running(),
            result: UnsafeCell::new(None),
            failure: UnsafeCell::new(None),
            cause: UnsafeCell::new(None),
            consumed: AtomicBool::new(false),
            awaiter: Awaiter::new(),
            on_success: Subscribers::new(),
            on_failure: Subscribers::new(),
            on_cancelled: Subscribers::new(),
            on_completion: Subscribers::new(),
        })
    }

    pub(super) fn done(outcome: Outcome<T>) -> Self {
        Core::Done(Done {
            outcome,
            consumed: AtomicBool::new(false),
        })
    }

    /// The live core, for callers that are only ever handed live-backed
    /// handles (completers).
    ///
    /// # Panics
    ///
    /// Panics when called on a done core; completers are never bound to one.
    pub(super) fn as_live(&self) -> &Live<T> {
        match self {
            Core::Live(live) => live,
            Core::Done(_) => unreachable!("a completer can only be bound to a live task"),
        }
    }

    pub(super) fn task_state(&self) -> TaskState {
        match self {
            Core::Live(live) => TaskState::from_bits(live.state.load()),
            Core::Done(done) => match &done.outcome {
                Outcome::Success(_) => TaskState::Success,
                Outcome::Failed(_) => TaskState::Failed,
                Outcome::Cancelled(_) => TaskState::Cancelled,
            },
        }
    }

    /// Applies `f` to the result value if the task succeeded.
    pub(super) fn with_result<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        match self {
            Core::Live(live) => live.with_result(f),
            Core::Done(done) => match &done.outcome {
                Outcome::Success(value) => Some(f(value)),
                _ => None,
            },
        }
    }

    /// Returns (a clone of) the failure if the task failed.
    pub(super) fn failure(&self) -> Option<Failure> {
        match self {
            Core::Live(live) => live.with_failure(Failure::clone),
            Core::Done(done) => match &done.outcome {
                Outcome::Failed(failure) => Some(failure.clone()),
                _ => None,
            },
        }
    }

    /// Returns (a clone of) the cancellation cause if the task was
    /// cancelled.
    pub(super) fn cancellation_cause(&self) -> Option<Cancelled> {
        match self {
            Core::Live(live) => live.with_cause(Cancelled::clone),
            Core::Done(done) => match &done.outcome {
                Outcome::Cancelled(cause) => Some(cause.clone()),
                _ => None,
            },
        }
    }

    /// Consumes the stored failure: the first caller after the task failed
    /// gets `true`, everyone else `false`.
    pub(super) fn consume_failure(&self) -> bool {
        let consumed = match self {
            Core::Live(live) => {
                if !live.task_state().is_failed() {
                    return false;
                }
                &live.consumed
            }
            Core::Done(done) => {
                if !matches!(done.outcome, Outcome::Failed(_)) {
                    return false;
                }
                &done.consumed
            }
        };
        consumed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `true` while the task failed and nobody consumed the failure yet.
    pub(super) fn has_unconsumed_failure(&self) -> bool {
        match self {
            Core::Live(live) => {
                live.task_state().is_failed() && !live.consumed.load(Ordering::Acquire)
            }
            Core::Done(done) => {
                matches!(done.outcome, Outcome::Failed(_))
                    && !done.consumed.load(Ordering::Acquire)
            }
        }
    }
}

// === impl Live ===

impl<T> Live<T> {
    pub(super) fn task_state(&self) -> TaskState {
        TaskState::from_bits(self.state.load())
    }

    pub(super) fn is_done(&self) -> bool {
        self.task_state().is_done()
    }

    /// Runs the termination protocol for the success outcome.
    ///
    /// Returns the observed state when the completion race was already lost;
    /// the value is dropped in that case, without side effects.
    pub(super) fn try_succeed(&self, value: T) -> Result<(), u8> {
        self.state.begin(state::SUCCEEDING)?;

        self.result.with_mut(|ptr| {
            // Safety: winning `begin` makes us the unique slot writer.
            unsafe { *ptr = Some(value) };
        });
        self.awaiter.signal_all(&Permit::Master);
        self.state.commit(state::SUCCEEDING, state::SUCCESS);

        tracing::trace!("task succeeded");
        self.on_success.fire(|| ());
        self.on_completion.fire(|| ());
        Ok(())
    }

    /// Runs the termination protocol for the failure outcome.
    pub(super) fn try_fail(&self, failure: Failure) -> Result<(), u8> {
        self.state.begin(state::FAILING)?;

        let context = failure.clone();
        self.failure.with_mut(|ptr| {
            // Safety: winning `begin` makes us the unique slot writer.
            unsafe { *ptr = Some(failure) };
        });
        self.awaiter.signal_all(&Permit::Master);
        self.state.commit(state::FAILING, state::FAILED);

        tracing::trace!("task failed");
        self.on_failure.fire(|| context);
        self.on_completion.fire(|| ());
        Ok(())
    }

    /// Runs the termination protocol for the cancellation outcome.
    pub(super) fn try_cancel(&self, cause: Cancelled) -> Result<(), u8> {
        self.state.begin(state::CANCELLING)?;

        let context = cause.clone();
        self.cause.with_mut(|ptr| {
            // Safety: winning `begin` makes us the unique slot writer.
            unsafe { *ptr = Some(cause) };
        });
        self.awaiter.signal_all(&Permit::Master);
        self.state.commit(state::CANCELLING, state::CANCELLED);

        tracing::trace!("task cancelled");
        self.on_cancelled.fire(|| context);
        self.on_completion.fire(|| ());
        Ok(())
    }

    /// Applies `f` to the stored result if success won, spinning out the
    /// publishing window if necessary.
    pub(super) fn with_result<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        if self.state.load() & state::SUCCESS_MASK == 0 {
            return None;
        }
        self.state.await_valid();

        Some(self.result.with(|ptr| {
            // Safety: the stable SUCCESS state was published after the slot
            // write; the slot is immutable from now on.
            f(unsafe { (*ptr).as_ref() }.expect("result written before SUCCESS"))
        }))
    }

    pub(super) fn with_failure<R>(&self, f: impl FnOnce(&Failure) -> R) -> Option<R> {
        if self.state.load() & state::FAILED_MASK == 0 {
            return None;
        }
        self.state.await_valid();

        Some(self.failure.with(|ptr| {
            // Safety: the stable FAILED state was published after the slot
            // write; the slot is immutable from now on.
            f(unsafe { (*ptr).as_ref() }.expect("failure written before FAILED"))
        }))
    }

    pub(super) fn with_cause<R>(&self, f: impl FnOnce(&Cancelled) -> R) -> Option<R> {
        if self.state.load() & state::CANCEL_MASK == 0 {
            return None;
        }
        self.state.await_valid();

        Some(self.cause.with(|ptr| {
            // Safety: the stable CANCELLED state was published after the
            // slot write; the slot is immutable from now on.
            f(unsafe { (*ptr).as_ref() }.expect("cause written before CANCELLED"))
        }))
    }
}
