// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::Thread;
use std::time::Instant;

use crate::error::WaitError;
use crate::interrupt::Interrupt;

/// A gate for threads waiting on one of two signals: the **master permit**,
/// which wakes every waiter, or a **keyed permit**, which wakes only the
/// waiters registered under the same [`PermitToken`].
///
/// # Implementation Notes
///
/// Waiters pass through a mutex-guarded registry to announce and retract
/// interest; signaling acquires the mutex briefly to mark and unpark the
/// matching entries. The parked thread itself never holds the lock while
/// blocked, so the critical sections stay short.
///
/// Registration is split from blocking ([`subscribe`][Awaiter::subscribe]
/// returns a [`Waiter`] that is parked separately) so that a caller can
/// register interest *before* checking the condition it is about to wait
/// for, closing the check-then-park race.
pub struct Awaiter {
    waiters: Mutex<Vec<Entry>>,
}

/// An identity token naming one keyed permit.
///
/// Tokens compare by identity: only clones of the same token are equal.
#[derive(Clone)]
pub struct PermitToken(Arc<()>);

/// A permit to wake waiters of an [`Awaiter`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Permit {
    /// The well-known sentinel that matches every waiter.
    Master,
    /// Matches only waiters registered under the same token.
    Keyed(PermitToken),
}

/// A registered waiter, returned by [`Awaiter::subscribe`].
///
/// Dropping the waiter without blocking retracts the registration.
#[must_use = "a Waiter does nothing unless blocked on"]
pub struct Waiter<'a> {
    awaiter: &'a Awaiter,
    slot: Arc<Slot>,
    key: Option<PermitToken>,
}

struct Entry {
    key: Option<PermitToken>,
    slot: Arc<Slot>,
}

const SLOT_PENDING: u8 = 0;
const SLOT_MASTER: u8 = 1;
const SLOT_KEYED: u8 = 2;

struct Slot {
    state: AtomicU8,
    thread: Thread,
}

// === impl PermitToken ===

impl PermitToken {
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(()))
    }
}

impl Default for PermitToken {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for PermitToken {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for PermitToken {}

impl fmt::Debug for PermitToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PermitToken({:p})", Arc::as_ptr(&self.0))
    }
}

// === impl Permit ===

impl Permit {
    fn matches(&self, waiter_key: Option<&PermitToken>) -> bool {
        match self {
            Permit::Master => true,
            Permit::Keyed(token) => waiter_key == Some(token),
        }
    }

    fn slot_state(&self) -> u8 {
        match self {
            Permit::Master => SLOT_MASTER,
            Permit::Keyed(_) => SLOT_KEYED,
        }
    }
}

// === impl Awaiter ===

impl Awaiter {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Registers the calling thread as a waiter for `permit` (and, always,
    /// for the master permit).
    pub fn subscribe(&self, permit: &Permit) -> Waiter<'_> {
        let key = match permit {
            Permit::Master => None,
            Permit::Keyed(token) => Some(token.clone()),
        };
        let slot = Arc::new(Slot {
            state: AtomicU8::new(SLOT_PENDING),
            thread: std::thread::current(),
        });

        self.lock().push(Entry {
            key: key.clone(),
            slot: slot.clone(),
        });

        Waiter {
            awaiter: self,
            slot,
            key,
        }
    }

    /// Wakes every waiter the permit matches; returns how many were woken.
    ///
    /// Signaling is idempotent: waiters already woken (or not yet
    /// registered) are unaffected.
    pub fn signal_all(&self, permit: &Permit) -> usize {
        let mut woken = 0;
        self.lock().retain(|entry| {
            if permit.matches(entry.key.as_ref()) {
                entry.slot.state.store(permit.slot_state(), Ordering::Release);
                entry.slot.thread.unpark();
                woken += 1;
                false
            } else {
                true
            }
        });

        tracing::trace!(?permit, woken, "signal_all");
        woken
    }

    /// The number of currently registered waiters.
    pub fn waiter_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Entry>> {
        self.waiters.lock().expect("awaiter registry poisoned")
    }
}

impl Default for Awaiter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Awaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Awaiter")
            .field("waiters", &self.waiter_count())
            .finish()
    }
}

// === impl Waiter ===

impl Waiter<'_> {
    /// Parks the calling thread until it is signaled, the deadline passes,
    /// or (when `interruptible`) the thread's interrupt flag is raised.
    ///
    /// Returns the permit that caused the wake.
    ///
    /// # Errors
    ///
    /// - [`WaitError::TimedOut`] when `deadline` passed first.
    /// - [`WaitError::Interrupted`] when the interrupt flag was observed (it
    ///   is consumed). An interruption that races with a concurrent signal
    ///   may win; callers are expected to re-check their condition.
    pub fn wait(
        mut self,
        deadline: Option<Instant>,
        interruptible: bool,
    ) -> Result<Permit, WaitError> {
        let interrupt = if interruptible {
            Some(Interrupt::current())
        } else {
            None
        };

        loop {
            if let Some(permit) = self.wake_permit() {
                return Ok(permit);
            }

            if let Some(interrupt) = &interrupt
                && interrupt.take()
            {
                self.deregister();
                return Err(WaitError::Interrupted);
            }

            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        self.deregister();
                        // a signal may have marked us while we deregistered
                        return self.wake_permit().ok_or(WaitError::TimedOut);
                    }
                    std::thread::park_timeout(deadline - now);
                }
                None => std::thread::park(),
            }
        }
    }

    fn wake_permit(&self) -> Option<Permit> {
        match self.slot.state.load(Ordering::Acquire) {
            SLOT_MASTER => Some(Permit::Master),
            SLOT_KEYED => Some(Permit::Keyed(
                self.key.clone().expect("keyed wake of a master-only waiter"),
            )),
            _ => None,
        }
    }

    fn deregister(&mut self) {
        self.awaiter
            .lock()
            .retain(|entry| !Arc::ptr_eq(&entry.slot, &self.slot));
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        // cheap when the signaler already removed the entry
        self.deregister();
    }
}

impl fmt::Debug for Waiter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("key", &self.key)
            .field("state", &self.slot.state.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn master_permit_wakes_every_waiter() {
        let awaiter = Arc::new(Awaiter::new());
        let woken = Arc::new(AtomicUsize::new(0));
        let token = PermitToken::new();

        let threads: Vec<_> = (0..3)
            .map(|i| {
                let awaiter = awaiter.clone();
                let woken = woken.clone();
                let permit = if i == 0 {
                    Permit::Master
                } else {
                    Permit::Keyed(token.clone())
                };
                std::thread::spawn(move || {
                    let waiter = awaiter.subscribe(&permit);
                    let by = waiter.wait(None, false).unwrap();
                    assert_eq!(by, Permit::Master);
                    woken.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();

        while awaiter.waiter_count() < 3 {
            std::thread::yield_now();
        }

        assert_eq!(awaiter.signal_all(&Permit::Master), 3);
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(woken.load(Ordering::Relaxed), 3);
        assert_eq!(awaiter.waiter_count(), 0);
    }

    #[test]
    fn keyed_permit_wakes_only_matching_waiters() {
        let awaiter = Arc::new(Awaiter::new());
        let token = PermitToken::new();
        let other = PermitToken::new();

        let keyed = {
            let awaiter = awaiter.clone();
            let token = token.clone();
            std::thread::spawn(move || {
                let waiter = awaiter.subscribe(&Permit::Keyed(token.clone()));
                assert_eq!(waiter.wait(None, false).unwrap(), Permit::Keyed(token));
            })
        };

        while awaiter.waiter_count() < 1 {
            std::thread::yield_now();
        }

        // a foreign key wakes no one
        assert_eq!(awaiter.signal_all(&Permit::Keyed(other)), 0);
        assert_eq!(awaiter.signal_all(&Permit::Keyed(token)), 1);
        keyed.join().unwrap();
    }

    #[test]
    fn signal_before_park_is_not_lost() {
        let awaiter = Awaiter::new();
        let waiter = awaiter.subscribe(&Permit::Master);

        // the signal lands between registration and parking
        assert_eq!(awaiter.signal_all(&Permit::Master), 1);
        assert_eq!(waiter.wait(None, false).unwrap(), Permit::Master);
    }

    #[test]
    fn timeout_expires() {
        let awaiter = Awaiter::new();
        let waiter = awaiter.subscribe(&Permit::Master);

        let begin = Instant::now();
        let result = waiter.wait(Some(begin + Duration::from_millis(50)), false);
        assert!(matches!(result, Err(WaitError::TimedOut)));
        assert!(begin.elapsed() >= Duration::from_millis(50));
        assert_eq!(awaiter.waiter_count(), 0);
    }

    #[test]
    fn interrupt_aborts_wait() {
        let awaiter = Arc::new(Awaiter::new());

        let (tx, rx) = std::sync::mpsc::channel();
        let handle = {
            let awaiter = awaiter.clone();
            std::thread::spawn(move || {
                tx.send(Interrupt::current()).unwrap();
                let waiter = awaiter.subscribe(&Permit::Master);
                waiter.wait(None, true)
            })
        };

        rx.recv().unwrap().interrupt();
        assert!(matches!(handle.join().unwrap(), Err(WaitError::Interrupted)));
    }

    #[test]
    fn uninterruptible_wait_keeps_the_flag() {
        let awaiter = Arc::new(Awaiter::new());

        let (tx, rx) = std::sync::mpsc::channel();
        let handle = {
            let awaiter = awaiter.clone();
            std::thread::spawn(move || {
                tx.send(Interrupt::current()).unwrap();
                let waiter = awaiter.subscribe(&Permit::Master);
                let permit = waiter.wait(None, false).unwrap();
                // the flag survives the wait
                (permit, crate::interrupt::is_interrupted())
            })
        };

        let interrupt = rx.recv().unwrap();
        interrupt.interrupt();
        // the unpark from the interrupt must not wake the waiter for good
        std::thread::sleep(Duration::from_millis(20));
        awaiter.signal_all(&Permit::Master);

        let (permit, flag_set) = handle.join().unwrap();
        assert_eq!(permit, Permit::Master);
        assert!(flag_set);
    }

    #[test]
    fn dropping_a_waiter_retracts_registration() {
        let awaiter = Awaiter::new();
        let waiter = awaiter.subscribe(&Permit::Master);
        assert_eq!(awaiter.waiter_count(), 1);
        drop(waiter);
        assert_eq!(awaiter.waiter_count(), 0);
    }
}
