// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cmp::{Ordering as CmpOrdering, Reverse};
use core::fmt;
use core::panic::AssertUnwindSafe;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::cancel::CancelCondition;
use crate::executor::Job;
use crate::time::ScheduleError;

const ENTRY_PENDING: u8 = 0;
const ENTRY_CANCELLED: u8 = 1;
const ENTRY_FIRED: u8 = 2;

/// A one-shot timer backed by a single worker thread.
///
/// Jobs are held in a deadline-ordered heap; the worker sleeps until the
/// earliest deadline and runs due jobs on its own thread. Jobs must be
/// short: time-based tasks only ever signal a completer from here.
///
/// Lifecycle: [`shutdown`][Timer::shutdown] stops intake but lets already
/// scheduled jobs fire; [`force_shutdown`][Timer::force_shutdown] drops them.
/// Both are terminal. Dropping the timer is equivalent to `shutdown`.
pub struct Timer {
    shared: Arc<Shared>,
}

/// A handle onto one scheduled job.
#[derive(Clone)]
pub struct ScheduleHandle {
    at: Instant,
    state: Arc<AtomicU8>,
}

struct Shared {
    queue: Mutex<Queue>,
    // worker wake-ups (new entries, shutdown)
    wake: Condvar,
    // observers of the Terminated transition
    terminated: Condvar,
}

struct Queue {
    entries: BinaryHeap<Reverse<Entry>>,
    phase: Phase,
    next_seq: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Phase {
    Accepting,
    Draining,
    Terminated,
}

struct Entry {
    at: Instant,
    seq: u64,
    state: Arc<AtomicU8>,
    job: Job,
}

// === impl Timer ===

impl Timer {
    /// Starts a timer with a dedicated worker thread named `name`.
    ///
    /// # Panics
    ///
    /// Panics if the worker thread cannot be spawned.
    pub fn spawn(name: &str) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                entries: BinaryHeap::new(),
                phase: Phase::Accepting,
                next_seq: 0,
            }),
            wake: Condvar::new(),
            terminated: Condvar::new(),
        });

        let worker_shared = shared.clone();
        std::thread::Builder::new()
            .name(name.into())
            .spawn(move || run_worker(&worker_shared))
            .expect("failed to spawn timer thread");

        Self { shared }
    }

    /// Schedules `job` to run once, `after` from now, on the worker thread.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::Shutdown`] once the timer stopped accepting.
    pub fn schedule_once(
        &self,
        after: Duration,
        job: impl FnOnce() + Send + 'static,
    ) -> Result<ScheduleHandle, ScheduleError> {
        let mut queue = self.shared.lock_queue();
        if queue.phase != Phase::Accepting {
            return Err(ScheduleError::Shutdown);
        }

        let at = Instant::now() + after;
        let state = Arc::new(AtomicU8::new(ENTRY_PENDING));
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.entries.push(Reverse(Entry {
            at,
            seq,
            state: state.clone(),
            job: Box::new(job),
        }));
        drop(queue);

        self.shared.wake.notify_one();
        tracing::trace!(?after, "scheduled one-shot job");
        Ok(ScheduleHandle { at, state })
    }

    /// Like [`schedule_once`][Timer::schedule_once], additionally wiring the
    /// schedule's cancellation to `condition`: when the condition cancels,
    /// the job is descheduled.
    ///
    /// # Errors
    ///
    /// - [`ScheduleError::Shutdown`] once the timer stopped accepting.
    /// - [`ScheduleError::ConditionBound`] when the condition is already
    ///   bound elsewhere (the job is descheduled again in that case).
    pub fn schedule_once_bound(
        &self,
        after: Duration,
        condition: &CancelCondition,
        job: impl FnOnce() + Send + 'static,
    ) -> Result<ScheduleHandle, ScheduleError> {
        let handle = self.schedule_once(after, job)?;

        let bind_handle = handle.clone();
        if !condition.bind_action(move |_cause| bind_handle.cancel()) {
            handle.cancel();
            return Err(ScheduleError::ConditionBound);
        }
        Ok(handle)
    }

    /// Stops accepting new jobs. Already scheduled jobs still fire.
    ///
    /// Terminal; the worker exits once the queue drains.
    pub fn shutdown(&self) {
        let mut queue = self.shared.lock_queue();
        if queue.phase == Phase::Accepting {
            queue.phase = Phase::Draining;
        }
        drop(queue);
        self.shared.wake.notify_all();
        tracing::debug!("timer shutting down");
    }

    /// Stops accepting new jobs and drops every pending one.
    pub fn force_shutdown(&self) {
        let mut queue = self.shared.lock_queue();
        if queue.phase != Phase::Terminated {
            queue.phase = Phase::Draining;
        }
        queue.entries.clear();
        drop(queue);
        self.shared.wake.notify_all();
        tracing::debug!("timer force-shut down");
    }

    /// Blocks until the worker has exited, up to `timeout`.
    ///
    /// Returns `true` if the worker terminated in time. Note that without a
    /// prior `shutdown` call the worker never exits.
    #[expect(clippy::missing_panics_doc, reason = "internal assertion")]
    pub fn await_shutdown(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut queue = self.shared.lock_queue();
        loop {
            if queue.phase == Phase::Terminated {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _timeout) = self
                .shared
                .terminated
                .wait_timeout(queue, deadline - now)
                .expect("timer queue poisoned");
            queue = guard;
        }
    }

    /// Returns `true` while jobs are accepted.
    pub fn is_accepting(&self) -> bool {
        self.shared.lock_queue().phase == Phase::Accepting
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

// === impl Shared ===

impl Shared {
    fn lock_queue(&self) -> std::sync::MutexGuard<'_, Queue> {
        self.queue.lock().expect("timer queue poisoned")
    }
}

fn run_worker(shared: &Shared) {
    let mut queue = shared.lock_queue();
    loop {
        // drop cancelled entries eagerly so they neither delay the sleep nor
        // keep a drained queue alive
        while let Some(Reverse(head)) = queue.entries.peek() {
            if head.state.load(Ordering::Acquire) == ENTRY_CANCELLED {
                queue.entries.pop();
            } else {
                break;
            }
        }

        let now = Instant::now();
        match queue.entries.peek() {
            Some(Reverse(head)) if head.at <= now => {
                let Reverse(entry) = queue.entries.pop().expect("peeked entry");
                let claimed = entry.state.compare_exchange(
                    ENTRY_PENDING,
                    ENTRY_FIRED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                if claimed.is_err() {
                    continue;
                }

                // run the job without the lock so schedulers are not blocked
                drop(queue);
                if std::panic::catch_unwind(AssertUnwindSafe(entry.job)).is_err() {
                    tracing::warn!("scheduled job panicked");
                }
                queue = shared.lock_queue();
            }
            Some(Reverse(head)) => {
                let sleep = head.at - now;
                let (guard, _timeout) = shared
                    .wake
                    .wait_timeout(queue, sleep)
                    .expect("timer queue poisoned");
                queue = guard;
            }
            None if queue.phase == Phase::Draining => {
                queue.phase = Phase::Terminated;
                drop(queue);
                shared.terminated.notify_all();
                tracing::debug!("timer worker exited");
                return;
            }
            None => {
                queue = shared.wake.wait(queue).expect("timer queue poisoned");
            }
        }
    }
}

// === impl ScheduleHandle ===

impl ScheduleHandle {
    /// The time remaining until the job is due (zero once due).
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Deschedules the job.
    ///
    /// Returns `true` if the job will not run, `false` when it already ran
    /// (or was cancelled before).
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(
                ENTRY_PENDING,
                ENTRY_CANCELLED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Returns `true` once the job was descheduled.
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == ENTRY_CANCELLED
    }
}

impl fmt::Debug for ScheduleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleHandle")
            .field("remaining", &self.remaining())
            .field("state", &self.state.load(Ordering::Acquire))
            .finish()
    }
}

// === impl Entry ===

// deadline order, sequence number as the tie breaker so ordering is total
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn fires_in_deadline_order() {
        let timer = Timer::spawn("test-timer");
        let (tx, rx) = mpsc::channel();

        for (delay_ms, tag) in [(60_u64, "late"), (10, "early"), (35, "middle")] {
            let tx = tx.clone();
            timer
                .schedule_once(Duration::from_millis(delay_ms), move || {
                    tx.send(tag).unwrap();
                })
                .unwrap();
        }

        let timeout = Duration::from_secs(5);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), "early");
        assert_eq!(rx.recv_timeout(timeout).unwrap(), "middle");
        assert_eq!(rx.recv_timeout(timeout).unwrap(), "late");
    }

    #[test]
    fn cancelled_jobs_do_not_fire() {
        let timer = Timer::spawn("test-timer");
        let (tx, rx) = mpsc::channel::<&str>();

        let doomed = {
            let tx = tx.clone();
            timer
                .schedule_once(Duration::from_millis(30), move || {
                    tx.send("doomed").unwrap();
                })
                .unwrap()
        };
        timer
            .schedule_once(Duration::from_millis(60), move || {
                tx.send("survivor").unwrap();
            })
            .unwrap();

        assert!(doomed.cancel());
        assert!(doomed.is_cancelled());
        // cancelling twice reports false
        assert!(!doomed.cancel());

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "survivor");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn handle_reports_remaining_time() {
        let timer = Timer::spawn("test-timer");
        let handle = timer
            .schedule_once(Duration::from_secs(60), || {})
            .unwrap();

        let remaining = handle.remaining();
        assert!(remaining > Duration::from_secs(55));
        assert!(remaining <= Duration::from_secs(60));
        handle.cancel();
    }

    #[test]
    fn shutdown_rejects_but_drains() {
        let timer = Timer::spawn("test-timer");
        let (tx, rx) = mpsc::channel();

        timer
            .schedule_once(Duration::from_millis(20), move || {
                tx.send(()).unwrap();
            })
            .unwrap();

        timer.shutdown();
        assert!(!timer.is_accepting());
        assert_eq!(
            timer.schedule_once(Duration::ZERO, || {}).unwrap_err(),
            ScheduleError::Shutdown
        );

        // the already scheduled job still fires, then the worker exits
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(timer.await_shutdown(Duration::from_secs(5)));
    }

    #[test]
    fn force_shutdown_drops_pending_jobs() {
        let timer = Timer::spawn("test-timer");
        timer
            .schedule_once(Duration::from_secs(60), || panic!("must never run"))
            .unwrap();

        timer.force_shutdown();
        assert!(timer.await_shutdown(Duration::from_secs(5)));
    }

    #[test]
    fn condition_bound_schedule_descheduled_by_cancel() {
        let timer = Timer::spawn("test-timer");
        let condition = CancelCondition::new();

        let handle = timer
            .schedule_once_bound(Duration::from_secs(60), &condition, || {
                panic!("must never run")
            })
            .unwrap();

        assert!(condition.cancel());
        assert!(handle.is_cancelled());

        // the condition is single-use for binding
        let other = CancelCondition::new_bound(|_| true);
        assert_eq!(
            timer
                .schedule_once_bound(Duration::ZERO, &other, || {})
                .unwrap_err(),
            ScheduleError::ConditionBound
        );
    }
}
