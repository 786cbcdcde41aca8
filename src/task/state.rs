// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use crate::loom::hint;
use crate::loom::sync::atomic::{AtomicU8, Ordering};

/// State bitfield. Two orthogonal dimensions are encoded: the chosen outcome
/// (cancel/success/failed mask) and whether the outcome fields are published
/// (the valid bit). `RUNNING` carries only the valid bit: the task is fully
/// observable, there just is no outcome yet.
pub(crate) const VALID: u8 = 0b0001;
pub(crate) const CANCEL_MASK: u8 = 0b0010;
pub(crate) const SUCCESS_MASK: u8 = 0b0100;
pub(crate) const FAILED_MASK: u8 = 0b1000;

pub(crate) const RUNNING: u8 = VALID;
pub(crate) const CANCELLING: u8 = CANCEL_MASK;
pub(crate) const CANCELLED: u8 = CANCEL_MASK | VALID;
pub(crate) const SUCCEEDING: u8 = SUCCESS_MASK;
pub(crate) const SUCCESS: u8 = SUCCESS_MASK | VALID;
pub(crate) const FAILING: u8 = FAILED_MASK;
pub(crate) const FAILED: u8 = FAILED_MASK | VALID;

/// The lifecycle state of a [`Task`][crate::Task].
///
/// The three `*ing` states are transient: they are the window between an
/// outcome winning the completion race and its fields being published. That
/// window contains no user code and no syscalls, so observers may busy-wait
/// it out.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskState {
    /// No outcome has been chosen yet.
    Running,
    /// Success won the race; the result is being published.
    Succeeding,
    /// Terminal: completed successfully.
    Success,
    /// Failure won the race; the failure is being published.
    Failing,
    /// Terminal: completed with a failure.
    Failed,
    /// Cancellation won the race; the cause is being published.
    Cancelling,
    /// Terminal: cancelled.
    Cancelled,
}

/// The atomic state cell implementing the termination protocol.
pub(crate) struct StateCell(AtomicU8);

// === impl TaskState ===

impl TaskState {
    pub(crate) fn from_bits(bits: u8) -> Self {
        match bits {
            RUNNING => TaskState::Running,
            SUCCEEDING => TaskState::Succeeding,
            SUCCESS => TaskState::Success,
            FAILING => TaskState::Failing,
            FAILED => TaskState::Failed,
            CANCELLING => TaskState::Cancelling,
            CANCELLED => TaskState::Cancelled,
            _ => unreachable!("invalid task state bits {bits:#06b}"),
        }
    }

    /// `true` once an outcome has been chosen (including the publishing
    /// window).
    #[must_use]
    pub fn is_done(&self) -> bool {
        !matches!(self, TaskState::Running)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self, TaskState::Running)
    }

    #[must_use]
    pub fn is_successful(&self) -> bool {
        matches!(self, TaskState::Succeeding | TaskState::Success)
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, TaskState::Failing | TaskState::Failed)
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskState::Cancelling | TaskState::Cancelled)
    }
}

// === impl StateCell ===

impl StateCell {
    pub(crate) fn new_running() -> Self {
        Self(AtomicU8::new(RUNNING))
    }

    #[inline]
    pub(crate) fn load(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }

    /// Attempts to win the completion race by transitioning
    /// `RUNNING -> transient`.
    ///
    /// Returns the observed state when the race was already lost.
    #[inline]
    pub(crate) fn begin(&self, transient: u8) -> Result<(), u8> {
        debug_assert!(transient & VALID == 0, "transient states carry no valid bit");
        self.0
            .compare_exchange(RUNNING, transient, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
    }

    /// Publishes the stable terminal state `transient -> stable`.
    ///
    /// # Panics
    ///
    /// A failed transition here means two completions won the same race;
    /// that is an implementation bug and fatal.
    #[inline]
    pub(crate) fn commit(&self, transient: u8, stable: u8) {
        debug_assert_eq!(transient | VALID, stable);
        if self
            .0
            .compare_exchange(transient, stable, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            panic!("task state machine invariant violated: transient state changed under us");
        }
    }

    /// Spins until the valid bit is set, returning the observed state.
    ///
    /// Safe to call in any state: the window between a transient state and
    /// its stable counterpart contains only a field write and a CAS.
    #[inline]
    pub(crate) fn await_valid(&self) -> u8 {
        loop {
            let bits = self.load();
            if bits & VALID != 0 {
                return bits;
            }
            hint::spin_loop();
        }
    }
}

impl fmt::Debug for StateCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StateCell")
            .field(&TaskState::from_bits(self.load()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_matches_predicates() {
        assert!(TaskState::from_bits(RUNNING).is_running());
        assert!(!TaskState::from_bits(RUNNING).is_done());

        for bits in [SUCCEEDING, SUCCESS] {
            let state = TaskState::from_bits(bits);
            assert!(state.is_successful());
            assert!(state.is_done());
            assert!(!state.is_cancelled());
            assert!(!state.is_failed());
        }

        for bits in [FAILING, FAILED] {
            assert!(TaskState::from_bits(bits).is_failed());
        }

        for bits in [CANCELLING, CANCELLED] {
            assert!(TaskState::from_bits(bits).is_cancelled());
        }
    }

    #[test]
    fn only_one_begin_wins() {
        crate::loom::model(|| {
            let cell = StateCell::new_running();
            assert_eq!(cell.begin(SUCCEEDING), Ok(()));
            assert_eq!(cell.begin(CANCELLING), Err(SUCCEEDING));

            cell.commit(SUCCEEDING, SUCCESS);
            assert_eq!(cell.begin(CANCELLING), Err(SUCCESS));
            assert_eq!(cell.await_valid(), SUCCESS);
        });
    }
}
