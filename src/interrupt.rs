// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cooperative per-thread interruption.
//!
//! Rust threads cannot be interrupted from the outside, so interruption is a
//! library-level contract: a thread obtains its [`Interrupt`] handle with
//! [`Interrupt::current`] and hands it to whoever may want to abort its
//! blocking waits. [`Interrupt::interrupt`] raises the flag and unparks the
//! target thread.
//!
//! The interruptible `wait*` methods in this crate consume the flag and
//! return [`WaitError::Interrupted`][crate::error::WaitError::Interrupted];
//! the uninterruptible variants ignore the flag and leave it set, so the
//! interruption stays visible to the caller once the wait returns.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::Thread;

/// A handle onto one thread's interrupt flag.
///
/// Handles are cheap to clone and may be sent to other threads; all clones
/// refer to the same flag.
#[derive(Debug, Clone)]
pub struct Interrupt {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    flag: AtomicBool,
    thread: Thread,
}

std::thread_local! {
    static CURRENT: Interrupt = Interrupt {
        shared: Arc::new(Shared {
            flag: AtomicBool::new(false),
            thread: std::thread::current(),
        }),
    };
}

// === impl Interrupt ===

impl Interrupt {
    /// Returns the calling thread's interrupt handle.
    pub fn current() -> Interrupt {
        CURRENT.with(Interrupt::clone)
    }

    /// Raises the interrupt flag and unparks the target thread.
    ///
    /// Idempotent; interrupting an already interrupted thread has no
    /// additional effect.
    pub fn interrupt(&self) {
        self.shared.flag.store(true, Ordering::Release);
        self.shared.thread.unpark();
        tracing::trace!(thread = ?self.shared.thread.id(), "interrupted");
    }

    /// Returns `true` if the flag is raised, without consuming it.
    pub fn is_interrupted(&self) -> bool {
        self.shared.flag.load(Ordering::Acquire)
    }

    /// Consumes the flag, returning whether it was raised.
    pub(crate) fn take(&self) -> bool {
        self.shared.flag.swap(false, Ordering::AcqRel)
    }
}

/// Returns `true` if the calling thread's interrupt flag is raised.
pub fn is_interrupted() -> bool {
    Interrupt::current().is_interrupted()
}

/// Consumes the calling thread's interrupt flag, returning whether it was
/// raised.
pub fn take_interrupt() -> bool {
    Interrupt::current().take()
}
