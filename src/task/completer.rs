// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use std::sync::Arc;

use crate::error::{AlreadyBound, Cancelled, Failure, Payload, SignalError};
use crate::sync::SetOnce;
use crate::task::core::Core;
use crate::task::state;

/// The producer-side handle of a [`Task`][crate::Task].
///
/// A completer starts out unbound; handing it to
/// [`Task::blocking`][crate::Task::blocking] pairs it with a freshly created
/// task. It is single-use: a second binding attempt fails, and only the
/// first signal observably completes the task (later signals report that
/// they lost, they do not disturb the outcome).
pub struct Completer<T> {
    core: SetOnce<Arc<Core<T>>>,
}

// === impl Completer ===

impl<T> Completer<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: SetOnce::new(),
        }
    }

    pub(super) fn bind(&self, core: Arc<Core<T>>) -> Result<(), AlreadyBound> {
        self.core.set(core).map_err(|_| AlreadyBound(()))
    }

    /// Returns `true` once the completer is associated with a task.
    pub fn is_bound(&self) -> bool {
        self.core.is_set()
    }

    /// Signals that the computation produced `value`.
    ///
    /// Returns `true` if this signal won the completion race, `false` if the
    /// task had already succeeded or failed through another signal (the
    /// value is dropped, the outcome is untouched).
    ///
    /// # Errors
    ///
    /// - [`SignalError::Unbound`] when the completer was never handed to a
    ///   task factory.
    /// - [`SignalError::Cancelled`] when the task was cancelled by a third
    ///   party; the cause carries the canceller's payload.
    #[tracing::instrument(level = "trace", skip_all)]
    pub fn signal_success(&self, value: T) -> Result<bool, SignalError> {
        let live = self.bound_core()?.as_live();
        match live.try_succeed(value) {
            Ok(()) => Ok(true),
            Err(observed) => Self::lost(live, observed),
        }
    }

    /// Signals that the computation failed.
    ///
    /// Same contract as [`signal_success`][Completer::signal_success].
    ///
    /// # Errors
    ///
    /// See [`signal_success`][Completer::signal_success].
    #[tracing::instrument(level = "trace", skip_all)]
    pub fn signal_failure(&self, failure: Failure) -> Result<bool, SignalError> {
        let live = self.bound_core()?.as_live();
        match live.try_fail(failure) {
            Ok(()) => Ok(true),
            Err(observed) => Self::lost(live, observed),
        }
    }

    /// Cancels the paired task from the producer side.
    ///
    /// Returns `true` if the cancellation won the completion race.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::Unbound`] when the completer was never handed
    /// to a task factory. Losing to a concurrent cancellation is *not* an
    /// error here; the call just returns `false`.
    pub fn signal_cancelled(&self, payload: Option<Payload>) -> Result<bool, SignalError> {
        let live = self.bound_core()?.as_live();
        Ok(live.try_cancel(Cancelled::new(payload)).is_ok())
    }

    /// Like [`signal_success`][Completer::signal_success], but swallows the
    /// cancelled-by-third-party case (reported as `false`).
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::Unbound`] when the completer was never handed
    /// to a task factory; only the cancelled case is suppressed.
    pub fn try_signal_success(&self, value: T) -> Result<bool, SignalError> {
        match self.signal_success(value) {
            Err(SignalError::Cancelled(_)) => Ok(false),
            other => other,
        }
    }

    /// Like [`signal_failure`][Completer::signal_failure], but swallows the
    /// cancelled-by-third-party case (reported as `false`).
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::Unbound`] when the completer was never handed
    /// to a task factory; only the cancelled case is suppressed.
    pub fn try_signal_failure(&self, failure: Failure) -> Result<bool, SignalError> {
        match self.signal_failure(failure) {
            Err(SignalError::Cancelled(_)) => Ok(false),
            other => other,
        }
    }

    /// Returns `true` if the paired task was cancelled.
    ///
    /// An unbound completer reports `false`.
    pub fn is_cancelled(&self) -> bool {
        self.core
            .get()
            .is_some_and(|core| core.task_state().is_cancelled())
    }

    /// Returns the cancellation cause of the paired task, if it was
    /// cancelled.
    pub fn cancellation_cause(&self) -> Option<Cancelled> {
        self.core.get()?.cancellation_cause()
    }

    /// Resolves the bound core, spinning through an in-flight bind so that a
    /// signal racing the task factory still lands.
    fn bound_core(&self) -> Result<&Arc<Core<T>>, SignalError> {
        self.core.wait().ok_or(SignalError::Unbound)
    }

    /// Maps a lost completion race to the caller-visible report: an error
    /// for cancellation, a plain `false` for a lost signal race.
    fn lost(live: &super::core::Live<T>, observed: u8) -> Result<bool, SignalError> {
        if observed & state::CANCEL_MASK != 0 {
            let cause = live
                .with_cause(Cancelled::clone)
                .expect("cancelled task has a cause");
            Err(SignalError::Cancelled(cause))
        } else {
            Ok(false)
        }
    }
}

impl<T> Default for Completer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer")
            .field("bound", &self.is_bound())
            .finish()
    }
}
