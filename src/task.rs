// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The consumer-side task handle and its factories.
//!
//! A [`Task`] terminates in exactly one of three outcomes: success, failure
//! or cancellation. The outcomes race; one CAS on the state cell decides the
//! winner and everything else (outcome slots, waiter wakeups, subscriber
//! fan-out) hangs off that decision. See the module documentation of
//! [`core`](self) internals for the slot-publication rules.

mod completer;
mod core;
mod state;

use ::core::error::Error;
use ::core::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use static_assertions::assert_impl_all;

use crate::cancel::CancelCondition;
use crate::error::{
    AlreadyBound, Cancelled, CheckError, Failure, NotSuccess, Payload, WaitError,
};
use crate::executor::{Executor, Job};
use crate::sync::Permit;
use crate::task::core::{Core, Outcome};
use crate::time;

pub use completer::Completer;
pub use state::TaskState;

/// A handle to a computation that will terminate in exactly one of success,
/// failure or cancellation.
///
/// Handles are cheap to clone; all clones observe the same computation.
/// Every method is safe to call from any thread at any time.
pub struct Task<T> {
    core: Arc<Core<T>>,
}

assert_impl_all!(Task<u32>: Send, Sync);
assert_impl_all!(Completer<u32>: Send, Sync);

// === impl Task ===

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("state", &self.state()).finish()
    }
}

impl<T> Task<T> {
    /// Creates a task that is already completed with `value`.
    pub fn succeeded(value: T) -> Self {
        Self {
            core: Arc::new(Core::done(Outcome::Success(value))),
        }
    }

    /// Creates a task that has already failed with `failure`.
    pub fn failed_with(failure: Failure) -> Self {
        Self {
            core: Arc::new(Core::done(Outcome::Failed(failure))),
        }
    }

    /// Creates a task that is already cancelled, without a payload.
    pub fn cancelled() -> Self {
        Self {
            core: Arc::new(Core::done(Outcome::Cancelled(Cancelled::new(None)))),
        }
    }

    /// Creates a task that is already cancelled, carrying `payload`.
    pub fn cancelled_with(payload: Payload) -> Self {
        Self {
            core: Arc::new(Core::done(Outcome::Cancelled(Cancelled::new(Some(
                payload,
            ))))),
        }
    }

    /// Creates a running task that never completes on its own.
    ///
    /// The only way such a task terminates is through `cancel*`. Useful as
    /// the far end of a [`chain`][Task::chain] and in tests.
    pub fn waiting() -> Self {
        Self {
            core: Arc::new(Core::live()),
        }
    }

    /// Creates a running task paired with `completer`.
    ///
    /// # Errors
    ///
    /// Returns [`AlreadyBound`] when the completer is already paired with
    /// another task.
    pub fn blocking(completer: &Completer<T>) -> Result<Self, AlreadyBound> {
        let core = Arc::new(Core::live());
        completer.bind(core.clone())?;
        Ok(Self { core })
    }

    /// The current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.core.task_state()
    }

    /// `true` once an outcome has been chosen.
    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn is_successful(&self) -> bool {
        self.state().is_successful()
    }

    pub fn is_failed(&self) -> bool {
        self.state().is_failed()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state().is_cancelled()
    }

    // --- waiting ---

    /// Blocks until the task is done.
    ///
    /// Terminal failures are not raised here; a returned `Ok` only means the
    /// task is done. Returns `&self` so checks can be chained:
    /// `task.wait()?.result()`.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::Interrupted`] when the thread is interrupted.
    pub fn wait(&self) -> Result<&Self, WaitError> {
        self.wait_master(None, true)?;
        Ok(self)
    }

    /// Blocks until the task is done, ignoring interruption.
    ///
    /// The interrupt flag is left untouched, so the interruption stays
    /// observable after the wait returns.
    #[expect(clippy::missing_panics_doc, reason = "internal assertion")]
    pub fn wait_uninterruptibly(&self) -> &Self {
        self.wait_master(None, false)
            .expect("uninterruptible untimed wait cannot fail");
        self
    }

    /// Blocks until the task is done or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::TimedOut`] or [`WaitError::Interrupted`]. The
    /// task state is untouched by a timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<&Self, WaitError> {
        self.wait_master(Some(Instant::now() + timeout), true)?;
        Ok(self)
    }

    /// Like [`wait_timeout`][Task::wait_timeout], ignoring interruption.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::TimedOut`] when the timeout elapses first.
    pub fn wait_timeout_uninterruptibly(&self, timeout: Duration) -> Result<&Self, WaitError> {
        self.wait_master(Some(Instant::now() + timeout), false)?;
        Ok(self)
    }

    fn wait_master(&self, deadline: Option<Instant>, interruptible: bool) -> Result<(), WaitError> {
        let live = match &*self.core {
            Core::Done(_) => return Ok(()),
            Core::Live(live) => live,
        };

        // register interest before the done-check, closing the race with a
        // completion landing in between
        let waiter = live.awaiter.subscribe(&Permit::Master);
        if live.is_done() {
            return Ok(());
        }

        waiter.wait(deadline, interruptible).map(|_| ())
    }

    // --- checks ---

    /// Re-raises the stored failure, at most once across all observers.
    ///
    /// The first call after a failure returns the failure and marks it
    /// consumed; any other call (including on running, successful or
    /// cancelled tasks) returns `Ok`.
    ///
    /// # Errors
    ///
    /// The stored failure, for the one consuming observer.
    #[expect(clippy::missing_panics_doc, reason = "internal assertion")]
    pub fn check_failure(&self) -> Result<(), Failure> {
        if self.core.consume_failure() {
            Err(self
                .core
                .failure()
                .expect("a consumed failure must be stored"))
        } else {
            Ok(())
        }
    }

    /// Like [`check_failure`][Task::check_failure], but only consumes and
    /// re-raises failures whose underlying error is of type `E`.
    ///
    /// # Errors
    ///
    /// The stored failure, when it wraps an `E` and this call consumed it.
    pub fn check_failure_of<E: Error + Send + Sync + 'static>(&self) -> Result<(), Failure> {
        let Some(failure) = self.core.failure() else {
            return Ok(());
        };
        if failure.is::<E>() && self.core.consume_failure() {
            Err(failure)
        } else {
            Ok(())
        }
    }

    /// Checks that the task did not fail or get cancelled.
    ///
    /// # Errors
    ///
    /// - [`CheckError::Cancelled`] whenever the task was cancelled.
    /// - [`CheckError::Failed`] for the observer that consumes the failure.
    #[expect(clippy::missing_panics_doc, reason = "internal assertion")]
    pub fn check_success(&self) -> Result<(), CheckError> {
        if let Some(cause) = self.core.cancellation_cause() {
            return Err(CheckError::Cancelled(cause));
        }
        if self.core.consume_failure() {
            return Err(CheckError::Failed(
                self.core
                    .failure()
                    .expect("a consumed failure must be stored"),
            ));
        }
        Ok(())
    }

    /// Returns the stored failure without consuming it.
    pub fn failure(&self) -> Option<Failure> {
        self.core.failure()
    }

    /// Returns the stored failure if its underlying error is of type `E`,
    /// without consuming it.
    pub fn failure_of<E: Error + Send + Sync + 'static>(&self) -> Option<Failure> {
        self.core.failure().filter(Failure::is::<E>)
    }

    /// `true` while the task failed and no checker consumed the failure.
    pub fn has_unconsumed_failure(&self) -> bool {
        self.core.has_unconsumed_failure()
    }

    /// Returns the result value if (and only if) the task succeeded.
    ///
    /// Running, failed and cancelled tasks all report `None`.
    pub fn finished_result(&self) -> Option<T>
    where
        T: Clone,
    {
        self.core.with_result(T::clone)
    }

    /// Returns the result value of a successful task.
    ///
    /// # Errors
    ///
    /// Returns [`NotSuccess`] carrying the observed state when the task is
    /// not (yet) successful.
    pub fn result(&self) -> Result<T, NotSuccess>
    where
        T: Clone,
    {
        self.core.with_result(T::clone).ok_or(NotSuccess {
            state: self.state(),
        })
    }

    /// Returns the cancellation cause of a cancelled task.
    pub fn cancellation_cause(&self) -> Option<Cancelled> {
        self.core.cancellation_cause()
    }

    // --- cancellation ---

    /// Cancels the task without a payload.
    ///
    /// Returns `true` if the cancellation won the completion race; `false`
    /// when the task is already done (in any outcome).
    pub fn cancel(&self) -> bool {
        self.cancel_opt(None)
    }

    /// Cancels the task, attaching `payload` to the cause.
    pub fn cancel_with(&self, payload: Payload) -> bool {
        self.cancel_opt(Some(payload))
    }

    /// Cancels the task if it is still running.
    ///
    /// Equivalent to [`cancel`][Task::cancel] for this task family, which is
    /// running from construction until done.
    pub fn cancel_if_running(&self) -> bool {
        self.cancel_opt(None)
    }

    /// Cancels the task if it has not started yet.
    ///
    /// Tasks of this family start immediately, so this never succeeds; it
    /// exists for parity with startable task families.
    pub fn cancel_if_not_started(&self) -> bool {
        false
    }

    pub(crate) fn cancel_opt(&self, payload: Option<Payload>) -> bool {
        match &*self.core {
            Core::Done(_) => false,
            Core::Live(live) => live.try_cancel(Cancelled::new(payload)).is_ok(),
        }
    }
}

impl<T: Send + Sync + 'static> Task<T> {
    // --- waiting with a cancel condition ---

    /// Blocks until the task is done or `condition` cancels.
    ///
    /// The condition's action slot is bound to this wait; a condition can
    /// only ever be bound once.
    ///
    /// # Errors
    ///
    /// - [`WaitError::Cancelled`] when the condition fired (before or during
    ///   the wait). The task state is untouched.
    /// - [`WaitError::ConditionBound`] when the condition is already bound.
    /// - [`WaitError::Interrupted`] when the thread is interrupted.
    pub fn wait_with(&self, condition: &CancelCondition) -> Result<&Self, WaitError> {
        self.wait_cond(None, condition, true)?;
        Ok(self)
    }

    /// Like [`wait_with`][Task::wait_with], ignoring interruption.
    ///
    /// # Errors
    ///
    /// See [`wait_with`][Task::wait_with], minus the interruption case.
    pub fn wait_with_uninterruptibly(
        &self,
        condition: &CancelCondition,
    ) -> Result<&Self, WaitError> {
        self.wait_cond(None, condition, false)?;
        Ok(self)
    }

    /// Blocks until the task is done, `timeout` elapses, or `condition`
    /// cancels.
    ///
    /// # Errors
    ///
    /// See [`wait_with`][Task::wait_with], plus [`WaitError::TimedOut`].
    pub fn wait_timeout_with(
        &self,
        timeout: Duration,
        condition: &CancelCondition,
    ) -> Result<&Self, WaitError> {
        self.wait_cond(Some(Instant::now() + timeout), condition, true)?;
        Ok(self)
    }

    /// Like [`wait_timeout_with`][Task::wait_timeout_with], ignoring
    /// interruption.
    ///
    /// # Errors
    ///
    /// See [`wait_with`][Task::wait_with], plus [`WaitError::TimedOut`],
    /// minus the interruption case.
    pub fn wait_timeout_with_uninterruptibly(
        &self,
        timeout: Duration,
        condition: &CancelCondition,
    ) -> Result<&Self, WaitError> {
        self.wait_cond(Some(Instant::now() + timeout), condition, false)?;
        Ok(self)
    }

    fn wait_cond(
        &self,
        deadline: Option<Instant>,
        condition: &CancelCondition,
        interruptible: bool,
    ) -> Result<(), WaitError> {
        // a condition that fired before the call aborts without parking
        if condition.is_cancelled() {
            return Err(WaitError::Cancelled(condition.published_cause()));
        }

        // the out-parameter contract: the wait owns the condition's action
        // slot, even when the task turns out to be done already
        self.bind_wait_action(condition)?;

        let live = match &*self.core {
            Core::Done(_) => return Ok(()),
            Core::Live(live) => live,
        };

        let waiter = live.awaiter.subscribe(&Permit::Keyed(condition.token()));
        if live.is_done() {
            return Ok(());
        }
        // a cancel landing between binding and subscribing signalled into
        // the void; re-check before parking
        if condition.is_cancelled() {
            return Err(WaitError::Cancelled(condition.published_cause()));
        }

        match waiter.wait(deadline, interruptible)? {
            Permit::Master => Ok(()),
            Permit::Keyed(_) => Err(WaitError::Cancelled(condition.published_cause())),
        }
    }

    fn bind_wait_action(&self, condition: &CancelCondition) -> Result<(), WaitError> {
        let bound = match &*self.core {
            // nothing to wake; the cancel merely expires the condition
            Core::Done(_) => condition.bind_action(|_| true),
            Core::Live(_) => {
                let weak = Arc::downgrade(&self.core);
                let token = condition.token();
                condition.bind_action(move |_cause| {
                    if let Some(core) = weak.upgrade()
                        && let Core::Live(live) = &*core
                    {
                        live.awaiter.signal_all(&Permit::Keyed(token.clone()));
                    }
                    true
                })
            }
        };

        if bound {
            Ok(())
        } else {
            Err(WaitError::ConditionBound)
        }
    }

    // --- subscriptions ---

    /// Runs `f` with the result value when (or if) the task succeeds.
    ///
    /// Subscribers added before completion run on the completing thread in
    /// subscription order; subscribers added afterwards run immediately on
    /// the calling thread. Either way `f` runs at most once, and panics in
    /// `f` are isolated from the notifier.
    ///
    /// A subscriber runs on whatever thread completes the task and must not
    /// subscribe to the same channel from inside its callback; use the
    /// `_async` variants to hand long or re-entrant work to an executor.
    pub fn on_success(&self, f: impl FnOnce(&T) + Send + 'static) -> &Self {
        match &*self.core {
            Core::Done(done) => {
                if let Outcome::Success(value) = &done.outcome {
                    run_isolated(|| f(value));
                }
            }
            Core::Live(live) => {
                let weak = Arc::downgrade(&self.core);
                live.on_success.subscribe(Box::new(move |_: &()| {
                    if let Some(core) = weak.upgrade() {
                        core.with_result(|value| f(value));
                    }
                }));
            }
        }
        self
    }

    /// Runs `f` (ignoring the value) when the task succeeds.
    pub fn on_success_run(&self, f: impl FnOnce() + Send + 'static) -> &Self {
        self.on_success(move |_| f())
    }

    /// Like [`on_success`][Task::on_success], but `f` is submitted to
    /// `executor` instead of running on the notifying thread.
    ///
    /// A rejection by the executor at notification time is reported through
    /// logging, never to the notifier.
    pub fn on_success_async(
        &self,
        executor: Arc<dyn Executor>,
        f: impl FnOnce(&T) + Send + 'static,
    ) -> &Self {
        match &*self.core {
            Core::Done(done) => {
                if matches!(done.outcome, Outcome::Success(_)) {
                    let task = self.clone();
                    submit(&executor, Box::new(move || {
                        task.core.with_result(|value| f(value));
                    }));
                }
            }
            Core::Live(live) => {
                let weak = Arc::downgrade(&self.core);
                live.on_success.subscribe(Box::new(move |_: &()| {
                    let Some(core) = weak.upgrade() else { return };
                    submit(&executor, Box::new(move || {
                        core.with_result(|value| f(value));
                    }));
                }));
            }
        }
        self
    }

    /// Runs `f` with the failure when (or if) the task fails.
    ///
    /// Delivery rules are those of [`on_success`][Task::on_success].
    pub fn on_failure(&self, f: impl FnOnce(&Failure) + Send + 'static) -> &Self {
        match &*self.core {
            Core::Done(done) => {
                if let Outcome::Failed(failure) = &done.outcome {
                    run_isolated(|| f(failure));
                }
            }
            Core::Live(live) => {
                live.on_failure.subscribe(Box::new(f));
            }
        }
        self
    }

    /// Asynchronous variant of [`on_failure`][Task::on_failure].
    pub fn on_failure_async(
        &self,
        executor: Arc<dyn Executor>,
        f: impl FnOnce(&Failure) + Send + 'static,
    ) -> &Self {
        match &*self.core {
            Core::Done(done) => {
                if let Outcome::Failed(failure) = &done.outcome {
                    let failure = failure.clone();
                    submit(&executor, Box::new(move || f(&failure)));
                }
            }
            Core::Live(live) => {
                live.on_failure.subscribe(Box::new(move |failure: &Failure| {
                    let failure = failure.clone();
                    submit(&executor, Box::new(move || f(&failure)));
                }));
            }
        }
        self
    }

    /// Runs `f` with the cancellation cause when (or if) the task is
    /// cancelled.
    ///
    /// Delivery rules are those of [`on_success`][Task::on_success].
    pub fn on_cancelled(&self, f: impl FnOnce(&Cancelled) + Send + 'static) -> &Self {
        match &*self.core {
            Core::Done(done) => {
                if let Outcome::Cancelled(cause) = &done.outcome {
                    run_isolated(|| f(cause));
                }
            }
            Core::Live(live) => {
                live.on_cancelled.subscribe(Box::new(f));
            }
        }
        self
    }

    /// Asynchronous variant of [`on_cancelled`][Task::on_cancelled].
    pub fn on_cancelled_async(
        &self,
        executor: Arc<dyn Executor>,
        f: impl FnOnce(&Cancelled) + Send + 'static,
    ) -> &Self {
        match &*self.core {
            Core::Done(done) => {
                if let Outcome::Cancelled(cause) = &done.outcome {
                    let cause = cause.clone();
                    submit(&executor, Box::new(move || f(&cause)));
                }
            }
            Core::Live(live) => {
                live.on_cancelled.subscribe(Box::new(move |cause: &Cancelled| {
                    let cause = cause.clone();
                    submit(&executor, Box::new(move || f(&cause)));
                }));
            }
        }
        self
    }

    /// Runs `f` with the task handle once the task is done, whatever the
    /// outcome.
    ///
    /// Fires after the outcome-specific channel of the winning outcome.
    pub fn on_completion(&self, f: impl FnOnce(&Task<T>) + Send + 'static) -> &Self {
        match &*self.core {
            Core::Done(_) => run_isolated(|| f(self)),
            Core::Live(live) => {
                let weak = Arc::downgrade(&self.core);
                live.on_completion.subscribe(Box::new(move |_: &()| {
                    if let Some(core) = weak.upgrade() {
                        f(&Task { core });
                    }
                }));
            }
        }
        self
    }

    /// Asynchronous variant of [`on_completion`][Task::on_completion].
    pub fn on_completion_async(
        &self,
        executor: Arc<dyn Executor>,
        f: impl FnOnce(&Task<T>) + Send + 'static,
    ) -> &Self {
        match &*self.core {
            Core::Done(_) => {
                let task = self.clone();
                submit(&executor, Box::new(move || f(&task)));
            }
            Core::Live(live) => {
                let weak = Arc::downgrade(&self.core);
                live.on_completion.subscribe(Box::new(move |_: &()| {
                    let Some(core) = weak.upgrade() else { return };
                    submit(&executor, Box::new(move || f(&Task { core })));
                }));
            }
        }
        self
    }

    // --- composition ---

    /// Composes a new task that completes with `f` applied to this task's
    /// result.
    ///
    /// - success: `f` runs on the completing thread; its return value
    ///   completes the outer task. A panic in `f` fails the outer task.
    /// - failure: the same failure instance is forwarded.
    /// - cancellation propagates in both directions, payload included.
    #[expect(clippy::missing_panics_doc, reason = "internal assertion")]
    pub fn chain<U, F>(&self, f: F) -> Task<U>
    where
        T: Clone,
        U: Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let completer = Arc::new(Completer::new());
        let outer = Task::blocking(&completer).expect("fresh completer is unbound");

        let forward = completer.clone();
        self.on_success(move |value: &T| {
            let value = value.clone();
            match std::panic::catch_unwind(AssertUnwindSafe(move || f(value))) {
                Ok(mapped) => {
                    let _ = forward.try_signal_success(mapped);
                }
                Err(panic) => {
                    let _ = forward.try_signal_failure(Failure::from_panic(panic));
                }
            }
        });

        let forward = completer.clone();
        self.on_failure(move |failure| {
            let _ = forward.try_signal_failure(failure.clone());
        });

        self.wire_cancellation(&outer);
        outer
    }

    /// Like [`chain`][Task::chain], but the mapping and forwarding steps are
    /// submitted to `executor`.
    #[expect(clippy::missing_panics_doc, reason = "internal assertion")]
    pub fn chain_async<U, F>(&self, executor: Arc<dyn Executor>, f: F) -> Task<U>
    where
        T: Clone,
        U: Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let completer = Arc::new(Completer::new());
        let outer = Task::blocking(&completer).expect("fresh completer is unbound");

        let forward = completer.clone();
        self.on_success_async(executor.clone(), move |value: &T| {
            let value = value.clone();
            match std::panic::catch_unwind(AssertUnwindSafe(move || f(value))) {
                Ok(mapped) => {
                    let _ = forward.try_signal_success(mapped);
                }
                Err(panic) => {
                    let _ = forward.try_signal_failure(Failure::from_panic(panic));
                }
            }
        });

        let forward = completer.clone();
        self.on_failure_async(executor, move |failure| {
            let _ = forward.try_signal_failure(failure.clone());
        });

        self.wire_cancellation(&outer);
        outer
    }

    /// Cancellation wiring shared by the chain variants: inner cancellation
    /// cancels the outer task, outer cancellation reaches back into the
    /// inner one.
    ///
    /// Both directions hold weak handles. Strong ones would tie the two
    /// cores into a cycle through their queued callbacks, keeping a chain
    /// whose handles were all dropped alive forever. A dead upgrade means
    /// nobody can observe the peer anymore, so skipping the propagation is
    /// indistinguishable.
    fn wire_cancellation<U: Send + Sync + 'static>(&self, outer: &Task<U>) {
        let outer_weak = Arc::downgrade(&outer.core);
        self.on_cancelled(move |cause| {
            if let Some(core) = outer_weak.upgrade() {
                Task { core }.cancel_opt(cause.payload().cloned());
            }
        });

        let inner_weak = Arc::downgrade(&self.core);
        outer.on_cancelled(move |cause| {
            if let Some(core) = inner_weak.upgrade() {
                Task { core }.cancel_opt(cause.payload().cloned());
            }
        });
    }

    // --- time-based factories ---

    /// Creates a task that succeeds with `value` once `after` has elapsed.
    ///
    /// Scheduled on the [global timer][crate::time::global]; if the timer
    /// has been shut down the task fails immediately with the scheduling
    /// error.
    #[expect(clippy::missing_panics_doc, reason = "internal assertion")]
    pub fn succeed_after(value: T, after: Duration) -> Task<T> {
        let completer = Arc::new(Completer::new());
        let task = Task::blocking(&completer).expect("fresh completer is unbound");

        let signal = completer.clone();
        if let Err(err) = time::global().schedule_once(after, move || {
            let _ = signal.try_signal_success(value);
        }) {
            let _ = completer.try_signal_failure(Failure::new(err));
        }
        task
    }

    /// Creates a task that fails with `failure` once `after` has elapsed.
    #[expect(clippy::missing_panics_doc, reason = "internal assertion")]
    pub fn fail_after(failure: Failure, after: Duration) -> Task<T> {
        let completer = Arc::new(Completer::new());
        let task = Task::blocking(&completer).expect("fresh completer is unbound");

        let signal = completer.clone();
        if let Err(err) = time::global().schedule_once(after, move || {
            let _ = signal.try_signal_failure(failure);
        }) {
            let _ = completer.try_signal_failure(Failure::new(err));
        }
        task
    }

    /// Creates a task that cancels itself (with `payload`, if any) once
    /// `after` has elapsed.
    #[expect(clippy::missing_panics_doc, reason = "internal assertion")]
    pub fn cancel_after(payload: Option<Payload>, after: Duration) -> Task<T> {
        let completer = Arc::new(Completer::new());
        let task = Task::blocking(&completer).expect("fresh completer is unbound");

        let target = task.clone();
        if let Err(err) = time::global().schedule_once(after, move || {
            target.cancel_opt(payload);
        }) {
            let _ = completer.try_signal_failure(Failure::new(err));
        }
        task
    }
}

impl Task<()> {
    /// Creates a task that succeeds (with `()`) once `after` has elapsed.
    pub fn delay(after: Duration) -> Task<()> {
        Task::succeed_after((), after)
    }
}

/// Runs an inline subscriber with the same panic isolation the queued path
/// has.
fn run_isolated(f: impl FnOnce()) {
    if std::panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::warn!("subscriber panicked during notification");
    }
}

fn submit(executor: &Arc<dyn Executor>, job: Job) {
    if executor.execute(job).is_err() {
        tracing::warn!("executor rejected an asynchronous subscriber");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SignalError;
    #[cfg(not(loom))]
    use std::sync::Mutex;
    #[cfg(not(loom))]
    use std::sync::atomic::{AtomicUsize, Ordering};
    #[cfg(not(loom))]
    use std::sync::mpsc;
    #[cfg(not(loom))]
    use std::time::Duration;

    #[cfg(not(loom))]
    fn trace() -> tracing::subscriber::DefaultGuard {
        use tracing_subscriber::EnvFilter;
        use tracing_subscriber::util::SubscriberInitExt;
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_names(true)
            .set_default()
    }

    #[cfg(not(loom))]
    fn boom() -> Failure {
        Failure::msg("boom")
    }

    #[cfg(not(loom))]
    #[test]
    fn completer_success() {
        let _trace = trace();

        let completer = Arc::new(Completer::new());
        let task = Task::blocking(&completer).unwrap();

        let producer = {
            let completer = completer.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                completer.signal_success(42).unwrap()
            })
        };

        assert_eq!(task.wait().unwrap().result(), Ok(42));
        assert_eq!(task.state(), TaskState::Success);
        assert!(producer.join().unwrap());
    }

    #[cfg(not(loom))]
    #[test]
    fn completer_failure() {
        let completer: Completer<()> = Completer::new();
        let task = Task::blocking(&completer).unwrap();

        assert!(completer.signal_failure(boom()).unwrap());
        task.wait().unwrap();

        assert_eq!(task.state(), TaskState::Failed);
        let failure = task.check_failure().unwrap_err();
        assert_eq!(failure.to_string(), "boom");
        assert!(!task.has_unconsumed_failure());
        // the failure is consumed; later checks pass
        assert!(task.check_failure().is_ok());
        // but the non-consuming accessor still sees it
        assert!(task.failure().is_some());
    }

    #[cfg(not(loom))]
    #[test]
    fn second_bind_fails() {
        let completer = Completer::<u32>::new();
        let _task = Task::blocking(&completer).unwrap();
        assert_eq!(Task::blocking(&completer).unwrap_err(), AlreadyBound(()));
    }

    #[cfg(not(loom))]
    #[test]
    fn signal_on_unbound_completer() {
        let completer = Completer::new();
        assert!(matches!(
            completer.signal_success(1),
            Err(SignalError::Unbound)
        ));
        assert!(matches!(
            completer.try_signal_failure(boom()),
            Err(SignalError::Unbound)
        ));
    }

    #[test]
    fn cancellation_races_completion() {
        crate::loom::model(|| {
            let completer = Arc::new(Completer::new());
            let task = Task::blocking(&completer).unwrap();

            let signaller = {
                let completer = completer.clone();
                crate::loom::thread::spawn(move || completer.signal_success(1))
            };
            let canceller = {
                let task = task.clone();
                crate::loom::thread::spawn(move || task.cancel_with(Arc::new("stop")))
            };

            let signalled = signaller.join().unwrap();
            let cancelled = canceller.join().unwrap();

            match task.state() {
                TaskState::Success => {
                    assert_eq!(task.result(), Ok(1));
                    assert!(signalled.unwrap());
                    assert!(!cancelled);
                }
                TaskState::Cancelled => {
                    assert!(cancelled);
                    let err = signalled.unwrap_err();
                    let SignalError::Cancelled(cause) = err else {
                        panic!("signal must report the cancellation, got {err:?}");
                    };
                    assert_eq!(cause.payload_as::<&str>(), Some(&"stop"));
                    assert_eq!(
                        task.cancellation_cause().unwrap().payload_as::<&str>(),
                        Some(&"stop")
                    );
                }
                other => panic!("no other outcome is permissible, got {other:?}"),
            }
        });
    }

    #[cfg(not(loom))]
    #[test]
    fn wait_with_cancel_condition() {
        let _trace = trace();

        let completer = Completer::<u32>::new();
        let task = Task::blocking(&completer).unwrap();
        let condition = CancelCondition::new();

        {
            let condition = condition.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                assert!(condition.cancel());
            });
        }

        let err = task.wait_with(&condition).unwrap_err();
        assert!(matches!(err, WaitError::Cancelled(_)));

        // the task itself is untouched
        assert_eq!(task.state(), TaskState::Running);
        assert!(!task.is_cancelled());
        assert!(condition.is_cancelled());
    }

    #[cfg(not(loom))]
    #[test]
    fn wait_with_pre_cancelled_condition_does_not_park() {
        let condition = CancelCondition::new_bound(|_| true);
        assert!(condition.cancel());

        let task = Task::<u32>::waiting();
        let err = task.wait_with(&condition).unwrap_err();
        assert!(matches!(err, WaitError::Cancelled(_)));
        assert!(task.is_running());
    }

    #[cfg(not(loom))]
    #[test]
    fn condition_binds_at_most_once() {
        let task = Task::<u32>::waiting();
        let condition = CancelCondition::new();

        let err = task
            .wait_timeout_with(Duration::from_millis(10), &condition)
            .unwrap_err();
        assert!(matches!(err, WaitError::TimedOut));

        // the first wait owns the action slot for good
        let err = task.wait_with(&condition).unwrap_err();
        assert!(matches!(err, WaitError::ConditionBound));
    }

    #[cfg(not(loom))]
    #[test]
    fn chain_maps_success() {
        let _trace = trace();

        let task = Task::succeed_after(10, Duration::from_millis(5)).chain(|x| x * 2);
        assert_eq!(task.wait().unwrap().result(), Ok(20));
    }

    #[cfg(not(loom))]
    #[test]
    fn chain_propagates_cancellation_to_inner() {
        let inner = Task::<u32>::waiting();
        let outer = inner.chain(|x| x);

        assert!(outer.cancel_with(Arc::new("x")));
        assert!(inner.is_cancelled());
        assert_eq!(
            inner.cancellation_cause().unwrap().payload_as::<&str>(),
            Some(&"x")
        );
    }

    #[cfg(not(loom))]
    #[test]
    fn chain_propagates_cancellation_to_outer() {
        let inner = Task::<u32>::waiting();
        let outer = inner.chain(|x| x);

        assert!(inner.cancel());
        assert!(outer.wait().unwrap().is_cancelled());
    }

    #[cfg(not(loom))]
    #[test]
    fn chain_forwards_the_failure_instance() {
        let failure = boom();
        let inner = Task::<u32>::failed_with(failure.clone());
        let outer = inner.chain(|x| x);

        let forwarded = outer.wait().unwrap().failure().unwrap();
        assert!(forwarded.same_instance(&failure));
    }

    #[cfg(not(loom))]
    #[test]
    fn chain_panic_fails_outer() {
        let outer = Task::succeeded(1).chain(|_: i32| -> i32 { panic!("mapper exploded") });

        outer.wait_uninterruptibly();
        assert!(outer.is_failed());
        assert_eq!(outer.failure().unwrap().to_string(), "mapper exploded");
    }

    #[cfg(not(loom))]
    #[test]
    fn delay_then_timeout_then_completion() {
        let _trace = trace();

        let task = Task::delay(Duration::from_millis(100));
        let err = task.wait_timeout(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, WaitError::TimedOut));

        task.wait_timeout(Duration::from_secs(5)).unwrap();
        assert!(task.is_successful());
    }

    #[cfg(not(loom))]
    #[test]
    fn fail_after_and_cancel_after() {
        let failing = Task::<u32>::fail_after(boom(), Duration::from_millis(5));
        failing.wait_uninterruptibly();
        assert!(failing.is_failed());

        let cancelling =
            Task::<u32>::cancel_after(Some(Arc::new(7_u32)), Duration::from_millis(5));
        cancelling.wait_uninterruptibly();
        assert!(cancelling.is_cancelled());
        assert_eq!(
            cancelling.cancellation_cause().unwrap().payload_as::<u32>(),
            Some(&7)
        );
    }

    #[cfg(not(loom))]
    #[test]
    fn finished_result_is_present_only_on_success() {
        assert_eq!(Task::<u32>::waiting().finished_result(), None);
        assert_eq!(Task::<u32>::failed_with(boom()).finished_result(), None);
        assert_eq!(Task::<u32>::cancelled().finished_result(), None);
        assert_eq!(Task::succeeded(3).finished_result(), Some(3));

        let err = Task::<u32>::waiting().result().unwrap_err();
        assert_eq!(err.state(), TaskState::Running);
    }

    #[cfg(not(loom))]
    #[test]
    fn cancelling_a_done_task_is_a_no_op() {
        let task = Task::succeeded(1);
        assert!(!task.cancel());
        assert!(!task.cancel_if_running());
        assert!(!task.cancel_if_not_started());
        assert_eq!(task.state(), TaskState::Success);

        let cancelled = Task::<u32>::cancelled();
        assert!(!cancelled.cancel());
        assert_eq!(cancelled.state(), TaskState::Cancelled);
    }

    #[cfg(not(loom))]
    #[test]
    fn done_task_answers_without_waiting() {
        let task: Task<()> = Task::failed_with(boom());
        task.wait_uninterruptibly();
        assert!(task.check_success().is_err());
        assert!(task.has_unconsumed_failure());
        assert!(task.check_failure().is_err());
        assert!(!task.has_unconsumed_failure());
    }

    #[cfg(not(loom))]
    #[test]
    fn check_success_reports_cancellation_every_time() {
        let task = Task::<u32>::cancelled_with(Arc::new("why"));
        for _ in 0..2 {
            let err = task.check_success().unwrap_err();
            let CheckError::Cancelled(cause) = err else {
                panic!("expected the cancellation");
            };
            assert_eq!(cause.payload_as::<&str>(), Some(&"why"));
        }
    }

    #[cfg(not(loom))]
    #[test]
    fn check_failure_of_filters_by_type() {
        #[derive(Debug)]
        struct Specific;
        impl std::fmt::Display for Specific {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.pad("specific")
            }
        }
        impl std::error::Error for Specific {}

        let task = Task::<u32>::failed_with(boom());
        // a foreign type neither raises nor consumes
        assert!(task.check_failure_of::<Specific>().is_ok());
        assert!(task.has_unconsumed_failure());

        let specific = Task::<u32>::failed_with(Failure::new(Specific));
        assert!(specific.failure_of::<Specific>().is_some());
        assert!(specific.check_failure_of::<Specific>().is_err());
        assert!(!specific.has_unconsumed_failure());
    }

    #[cfg(not(loom))]
    #[test]
    fn subscribers_fire_exactly_once_each() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let completer = Completer::new();
        let task = Task::blocking(&completer).unwrap();

        for i in 0..3 {
            let log = log.clone();
            task.on_success(move |value: &u32| {
                log.lock().unwrap().push((i, *value));
            });
        }
        {
            let log = log.clone();
            task.on_completion(move |task: &Task<u32>| {
                assert!(task.is_successful());
                log.lock().unwrap().push((99, 0));
            });
        }

        assert!(completer.signal_success(5).unwrap());

        // post-completion subscription runs inline
        {
            let log = log.clone();
            task.on_success(move |value: &u32| {
                log.lock().unwrap().push((3, *value));
            });
        }

        let log = log.lock().unwrap();
        assert_eq!(*log, vec![(0, 5), (1, 5), (2, 5), (99, 0), (3, 5)]);
    }

    #[cfg(not(loom))]
    #[test]
    fn failure_subscribers_get_the_cause() {
        let completer = Completer::<u32>::new();
        let task = Task::blocking(&completer).unwrap();

        let (tx, rx) = mpsc::channel();
        task.on_failure(move |failure| {
            tx.send(failure.to_string()).unwrap();
        });
        task.on_cancelled(|_| panic!("must not fire on failure"));

        assert!(completer.signal_failure(boom()).unwrap());
        assert_eq!(rx.recv().unwrap(), "boom");
    }

    #[cfg(not(loom))]
    #[test]
    fn async_subscriber_runs_on_executor() {
        let _trace = trace();

        let completer = Completer::new();
        let task = Task::blocking(&completer).unwrap();

        let (tx, rx) = mpsc::channel();
        task.on_success_async(crate::executor::default(), move |value: &u32| {
            tx.send(*value).unwrap();
        });

        assert!(completer.signal_success(11).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 11);
    }

    #[cfg(not(loom))]
    #[test]
    fn panicking_subscriber_does_not_corrupt_the_task() {
        let ran = Arc::new(AtomicUsize::new(0));
        let completer = Completer::new();
        let task = Task::blocking(&completer).unwrap();

        task.on_success(|_: &u32| panic!("misbehaving subscriber"));
        {
            let ran = ran.clone();
            task.on_success(move |_| {
                ran.fetch_add(1, Ordering::Relaxed);
            });
        }

        assert!(completer.signal_success(1).unwrap());
        assert_eq!(ran.load(Ordering::Relaxed), 1);
        assert_eq!(task.state(), TaskState::Success);
    }

    #[cfg(not(loom))]
    #[test]
    fn interrupt_aborts_wait() {
        let task = Task::<u32>::waiting();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let task = task.clone();
            std::thread::spawn(move || {
                tx.send(crate::interrupt::Interrupt::current()).unwrap();
                task.wait().map(|_| ())
            })
        };

        rx.recv().unwrap().interrupt();
        assert!(matches!(
            waiter.join().unwrap(),
            Err(WaitError::Interrupted)
        ));
        assert!(task.is_running());
    }
}
