// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The error surface of the crate.
//!
//! Errors are small dedicated types, one per failure kind, so that callers
//! can match on exactly the conditions an operation documents instead of
//! fishing in a catch-all enum.

use core::any::Any;
use core::error::Error;
use core::fmt;
use std::sync::Arc;

/// An arbitrary user-supplied object attached to a cancellation.
///
/// The payload travels inside the [`Cancelled`] cause and is surfaced to
/// every observer of the cancellation. Use [`Cancelled::payload_as`] to get
/// it back out.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// The cause of a cancellation, carrying the optional user payload.
///
/// A `Cancelled` value is created by whoever requests the cancellation and is
/// handed unchanged to every subscriber and every checker that observes the
/// cancelled outcome.
#[derive(Clone)]
pub struct Cancelled {
    payload: Option<Payload>,
}

/// A cheaply cloneable wrapper around the error a producer signalled.
///
/// Cloning a `Failure` shares the underlying error instance, which is how a
/// single failure can be surfaced to any number of observers (and forwarded
/// through [`Task::chain`][crate::Task::chain] without copying).
#[derive(Clone)]
pub struct Failure(Arc<dyn Error + Send + Sync>);

/// Error returned by [`Task::check_success`][crate::Task::check_success].
#[derive(Debug, Clone)]
pub enum CheckError {
    /// The task failed; the stored failure is consumed by this observation.
    Failed(Failure),
    /// The task was cancelled.
    Cancelled(Cancelled),
}

/// Error raised by the blocking `wait*` family.
///
/// Terminal task failures are *not* reported through waits; a wait returning
/// `Ok` only means the task is done, whatever the outcome. Use
/// [`Task::check_failure`][crate::Task::check_failure] afterwards.
#[derive(Debug, Clone)]
pub enum WaitError {
    /// The deadline passed before the task completed. The task state is
    /// untouched.
    TimedOut,
    /// The waiting thread was interrupted through
    /// [`interrupt::Interrupt`][crate::interrupt::Interrupt]. The interrupt
    /// flag has been consumed.
    Interrupted,
    /// The cancel condition passed to the wait fired before the task
    /// completed. The task state is untouched.
    Cancelled(Cancelled),
    /// The cancel condition passed to the wait already had its action bound
    /// elsewhere.
    ConditionBound,
}

/// Error returned by [`Completer`][crate::Completer] signals.
#[derive(Debug, Clone)]
pub enum SignalError {
    /// The completer is not associated with any task.
    Unbound,
    /// The paired task was cancelled by a third party while the signal was
    /// attempted.
    Cancelled(Cancelled),
}

/// The completer is already bound to a task.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AlreadyBound(pub(crate) ());

/// The task has not (or not successfully) completed.
///
/// Carries the state observed at the time of the call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NotSuccess {
    pub(crate) state: crate::task::TaskState,
}

// === impl Cancelled ===

impl Cancelled {
    pub(crate) fn new(payload: Option<Payload>) -> Self {
        Self { payload }
    }

    /// Returns the user payload attached to the cancellation, if any.
    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    /// Downcasts the payload to a concrete type.
    ///
    /// Returns `None` when there is no payload or the payload is of a
    /// different type.
    pub fn payload_as<P: Send + Sync + 'static>(&self) -> Option<&P> {
        self.payload.as_ref()?.downcast_ref()
    }
}

impl fmt::Debug for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancelled")
            .field("payload", &self.payload.as_ref().map(|_| "..."))
            .finish()
    }
}

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("task cancelled")
    }
}

impl Error for Cancelled {}

// === impl Failure ===

impl Failure {
    /// Wraps a concrete error.
    pub fn new<E: Error + Send + Sync + 'static>(err: E) -> Self {
        Self(Arc::new(err))
    }

    /// Creates a failure from a plain message.
    pub fn msg(msg: impl Into<String>) -> Self {
        Self(Arc::new(Msg(msg.into())))
    }

    /// Returns a reference to the wrapped error.
    pub fn get(&self) -> &(dyn Error + Send + Sync + 'static) {
        &*self.0
    }

    /// Returns `true` if the wrapped error is of type `E`.
    pub fn is<E: Error + Send + Sync + 'static>(&self) -> bool {
        self.0.downcast_ref::<E>().is_some()
    }

    /// Downcasts the wrapped error to a concrete type.
    pub fn downcast_ref<E: Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.0.downcast_ref()
    }

    /// Returns `true` if both failures share the same underlying error
    /// instance.
    pub fn same_instance(&self, other: &Failure) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Converts a caught panic payload into a failure, preserving string
    /// panic messages.
    pub fn from_panic(panic: Box<dyn Any + Send>) -> Self {
        let msg = panic
            .downcast_ref::<&'static str>()
            .map(|s| (*s).to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panicked".to_string());
        Failure::msg(msg)
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Error for Failure {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.0.as_ref())
    }
}

#[derive(Debug)]
struct Msg(String);

impl fmt::Display for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl Error for Msg {}

// === impl CheckError ===

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckError::Failed(failure) => write!(f, "task failed: {failure}"),
            CheckError::Cancelled(cancelled) => fmt::Display::fmt(cancelled, f),
        }
    }
}

impl Error for CheckError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CheckError::Failed(failure) => Some(failure),
            CheckError::Cancelled(cancelled) => Some(cancelled),
        }
    }
}

// === impl WaitError ===

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitError::TimedOut => f.write_str("wait timed out"),
            WaitError::Interrupted => f.write_str("wait interrupted"),
            WaitError::Cancelled(cancelled) => write!(f, "wait aborted: {cancelled}"),
            WaitError::ConditionBound => {
                f.write_str("cancel condition is already bound to another operation")
            }
        }
    }
}

impl Error for WaitError {}

// === impl SignalError ===

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalError::Unbound => f.write_str("completer is not associated with any task"),
            SignalError::Cancelled(cancelled) => {
                write!(f, "paired task was cancelled: {cancelled}")
            }
        }
    }
}

impl Error for SignalError {}

// === impl AlreadyBound ===

impl fmt::Display for AlreadyBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("completer is already bound to a task")
    }
}

impl Error for AlreadyBound {}

// === impl NotSuccess ===

impl NotSuccess {
    /// The task state observed by the failed call.
    pub fn state(&self) -> crate::task::TaskState {
        self.state
    }
}

impl fmt::Display for NotSuccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task has no result (state: {:?})", self.state)
    }
}

impl Error for NotSuccess {}
