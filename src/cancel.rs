// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use std::sync::Arc;

use crate::error::{Cancelled, Payload};
use crate::executor::{Executor, Job};
use crate::loom::hint;
use crate::loom::sync::atomic::{AtomicU8, Ordering};
use crate::sync::{PermitToken, SetOnce, Subscribers};

// State encoding: the low bit marks an in-flight attempt, the high bit marks
// that a cancellation has won (the "expired" half of the space). TESTING may
// fall back to IDLE when the action vetoes; nothing ever leaves the expired
// half.
const IDLE: u8 = 0b00;
const TESTING: u8 = 0b01;
const EXECUTING: u8 = 0b10;
const EXECUTED: u8 = 0b11;
const EXPIRED_MASK: u8 = 0b10;

/// A one-shot cancellation signal.
///
/// A condition starts idle. Some party binds the **cancel action** — the
/// predicate that decides whether a requested cancellation takes effect and
/// carries it out — exactly once; blocking waits that accept a condition
/// bind it for themselves. Any observer may then call
/// [`cancel`][CancelCondition::cancel]: the first call whose action approves
/// wins, publishes the [`Cancelled`] cause, and notifies the subscribers.
/// Everything after that reports "already cancelled" (`false`).
///
/// Without a bound action, `cancel` is a no-op returning `false`.
///
/// Handles are cheap to clone; all clones observe the same condition.
#[derive(Clone)]
pub struct CancelCondition {
    inner: Arc<Inner>,
}

type Action = Box<dyn Fn(&Cancelled) -> bool + Send + Sync>;

struct Inner {
    state: AtomicU8,
    action: SetOnce<Action>,
    cause: SetOnce<Cancelled>,
    subscribers: Subscribers<Cancelled>,
    token: PermitToken,
}

// === impl CancelCondition ===

impl CancelCondition {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(IDLE),
                action: SetOnce::new(),
                cause: SetOnce::new(),
                subscribers: Subscribers::new(),
                token: PermitToken::new(),
            }),
        }
    }

    /// Creates a condition with `action` already bound.
    pub fn new_bound(action: impl Fn(&Cancelled) -> bool + Send + Sync + 'static) -> Self {
        let condition = Self::new();
        let bound = condition.bind_action(action);
        debug_assert!(bound, "a fresh condition always accepts an action");
        condition
    }

    /// Creates a condition whose cancellation cancels `task`.
    ///
    /// The cancellation succeeds exactly when the task cancellation wins the
    /// task's completion race.
    pub fn for_task<T>(task: &crate::Task<T>) -> Self
    where
        T: Send + Sync + 'static,
    {
        let task = task.clone();
        Self::new_bound(move |cause| task.cancel_opt(cause.payload().cloned()))
    }

    /// Binds the cancel action.
    ///
    /// The action slot is write-once: the first bind wins and `false` is
    /// returned for every later attempt, without state change.
    pub fn bind_action(&self, action: impl Fn(&Cancelled) -> bool + Send + Sync + 'static) -> bool {
        self.inner.action.set_with(|| Box::new(action))
    }

    /// Requests cancellation without a payload.
    pub fn cancel(&self) -> bool {
        self.cancel_opt(None)
    }

    /// Requests cancellation, attaching `payload` to the cause.
    pub fn cancel_with(&self, payload: Payload) -> bool {
        self.cancel_opt(Some(payload))
    }

    /// Returns `true` once a cancellation has won.
    ///
    /// The cause is published before the subscribers run; see
    /// [`cancellation_cause`][CancelCondition::cancellation_cause].
    pub fn is_cancelled(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) & EXPIRED_MASK != 0
    }

    /// Returns the cancellation cause once a cancellation has won.
    pub fn cancellation_cause(&self) -> Option<Cancelled> {
        if !self.is_cancelled() {
            return None;
        }
        Some(self.published_cause())
    }

    /// Runs `f` with the cause when (or if) the condition cancels.
    ///
    /// Subscribers registered before the cancellation run on the cancelling
    /// thread, in subscription order, after the cause is published; late
    /// subscribers run inline. Each runs exactly once.
    pub fn on_cancelled(&self, f: impl FnOnce(&Cancelled) + Send + 'static) -> &Self {
        self.inner.subscribers.subscribe(Box::new(f));
        self
    }

    /// Like [`on_cancelled`][CancelCondition::on_cancelled], but `f` is
    /// submitted to `executor` instead of running on the notifying thread.
    pub fn on_cancelled_async(
        &self,
        executor: Arc<dyn Executor>,
        f: impl FnOnce(&Cancelled) + Send + 'static,
    ) -> &Self {
        self.inner.subscribers.subscribe(Box::new(move |cause: &Cancelled| {
            let cause = cause.clone();
            let job: Job = Box::new(move || f(&cause));
            if executor.execute(job).is_err() {
                tracing::warn!("executor rejected an asynchronous subscriber");
            }
        }));
        self
    }

    /// The token identifying this condition's keyed permit.
    pub(crate) fn token(&self) -> PermitToken {
        self.inner.token.clone()
    }

    /// The published cause of a cancellation that is known to have won (or
    /// to be winning: the publishing window is spun out).
    ///
    /// Callers must only invoke this after their own evidence of the
    /// cancellation (an expired state, or a wake by this condition's
    /// permit); the window until publication contains no user code.
    pub(crate) fn published_cause(&self) -> Cancelled {
        loop {
            if let Some(cause) = self.inner.cause.get() {
                return cause.clone();
            }
            hint::spin_loop();
        }
    }

    fn cancel_opt(&self, payload: Option<Payload>) -> bool {
        let Some(action) = self.inner.action.get() else {
            return false;
        };

        loop {
            match self.inner.state.compare_exchange(
                IDLE,
                TESTING,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) if observed & EXPIRED_MASK != 0 => return false,
                // another attempt is mid-test; it may yet fall back to IDLE
                Err(_) => hint::spin_loop(),
            }
        }

        let cause = Cancelled::new(payload);
        if action(&cause) {
            self.transition(TESTING, EXECUTING);
            if self.inner.cause.set(cause.clone()).is_err() {
                panic!("cancel condition invariant violated: cause published twice");
            }
            self.inner.subscribers.fire(|| cause);
            self.transition(EXECUTING, EXECUTED);
            tracing::trace!("cancel condition executed");
            true
        } else {
            self.transition(TESTING, IDLE);
            false
        }
    }

    fn transition(&self, from: u8, to: u8) {
        if self
            .inner
            .state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            panic!("cancel condition invariant violated: state changed under the winning cancel");
        }
    }
}

impl Default for CancelCondition {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelCondition")
            .field("bound", &self.inner.action.is_set())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn cancel_without_action_is_a_no_op() {
        loom::model(|| {
            let condition = CancelCondition::new();
            assert!(!condition.cancel());
            assert!(!condition.is_cancelled());
            assert_eq!(condition.cancellation_cause().map(|_| ()), None);
        });
    }

    #[test]
    fn action_binds_at_most_once() {
        loom::model(|| {
            let condition = CancelCondition::new();
            assert!(condition.bind_action(|_| true));
            assert!(!condition.bind_action(|_| panic!("second bind must be rejected")));
        });
    }

    #[test]
    fn cancel_succeeds_at_most_once() {
        loom::model(|| {
            let condition = CancelCondition::new_bound(|_| true);

            assert!(condition.cancel_with(Arc::new("reason")));
            assert!(condition.is_cancelled());
            assert_eq!(
                condition
                    .cancellation_cause()
                    .unwrap()
                    .payload_as::<&str>(),
                Some(&"reason")
            );

            // already cancelled
            assert!(!condition.cancel());
        });
    }

    #[test]
    fn vetoing_action_leaves_the_condition_idle() {
        loom::model(|| {
            let attempts = Arc::new(AtomicUsize::new(0));
            let condition = {
                let attempts = attempts.clone();
                CancelCondition::new_bound(move |_| {
                    attempts.fetch_add(1, std::sync::atomic::Ordering::Relaxed) >= 1
                })
            };

            assert!(!condition.cancel());
            assert!(!condition.is_cancelled());
            // the second attempt is approved
            assert!(condition.cancel());
            assert!(condition.is_cancelled());
        });
    }

    #[test]
    fn subscribers_see_the_cause_exactly_once() {
        loom::model(|| {
            let log = Arc::new(Mutex::new(Vec::new()));
            let condition = CancelCondition::new_bound(|_| true);

            {
                let log = log.clone();
                condition.on_cancelled(move |cause| {
                    log.lock().unwrap().push(cause.payload_as::<u32>().copied());
                });
            }

            assert!(condition.cancel_with(Arc::new(5_u32)));

            // late subscriber runs inline with the same cause
            {
                let log = log.clone();
                condition.on_cancelled(move |cause| {
                    log.lock().unwrap().push(cause.payload_as::<u32>().copied());
                });
            }

            assert_eq!(*log.lock().unwrap(), vec![Some(5), Some(5)]);
        });
    }

    #[test]
    fn for_task_cancels_the_task() {
        loom::model(|| {
            let task = crate::Task::<u32>::waiting();
            let condition = CancelCondition::for_task(&task);

            assert!(condition.cancel_with(Arc::new("stop")));
            assert!(task.is_cancelled());
            assert_eq!(
                task.cancellation_cause().unwrap().payload_as::<&str>(),
                Some(&"stop")
            );

            // the task is already done, a second cancel cannot win
            let second = CancelCondition::for_task(&task);
            assert!(!second.cancel());
        });
    }

    #[test]
    fn racing_cancels_one_winner() {
        loom::model(|| {
            let condition = CancelCondition::new_bound(|_| true);

            let a = {
                let condition = condition.clone();
                loom::thread::spawn(move || condition.cancel())
            };
            let b = {
                let condition = condition.clone();
                loom::thread::spawn(move || condition.cancel())
            };

            let (a, b) = (a.join().unwrap(), b.join().unwrap());
            assert!(a ^ b, "exactly one cancel must win");
            assert!(condition.is_cancelled());
        });
    }
}
