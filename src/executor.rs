// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Caller-supplied executors for asynchronous callback delivery.
//!
//! The library owns no worker pool: subscribers run on the notifying thread
//! unless an [`Executor`] is handed to one of the `*_async` subscription
//! methods. [`default`] provides a process-wide fallback executor that runs
//! each job on a freshly spawned thread.

use core::error::Error;
use core::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::sync::Lazy;

/// A unit of work handed to an [`Executor`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that can run jobs on behalf of the library.
pub trait Executor: Send + Sync {
    /// Submits `job` for execution.
    ///
    /// # Errors
    ///
    /// Returns [`Rejected`] when the executor does not accept work (shut
    /// down, at capacity, or otherwise unable).
    fn execute(&self, job: Job) -> Result<(), Rejected>;
}

/// The executor refused the job.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Rejected(pub(crate) ());

/// The process-wide fallback executor: one detached thread per job.
///
/// Shutdown is terminal; afterwards every submission is rejected.
pub struct DefaultExecutor {
    accepting: AtomicBool,
}

static DEFAULT: Lazy<Arc<DefaultExecutor>> = Lazy::new(|| Arc::new(DefaultExecutor::new()));

/// Returns the lazily-initialized process-wide default executor.
pub fn default() -> Arc<dyn Executor> {
    DEFAULT.get().clone()
}

/// Shuts the process-wide default executor down. Terminal: later
/// submissions are rejected.
pub fn shutdown_default() {
    DEFAULT.get().shutdown();
}

// === impl DefaultExecutor ===

impl DefaultExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            accepting: AtomicBool::new(true),
        }
    }

    /// Stops accepting jobs. Terminal; jobs already spawned are unaffected.
    pub fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
        tracing::debug!("default executor shut down");
    }

    /// Returns `true` while jobs are accepted.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }
}

impl Executor for DefaultExecutor {
    fn execute(&self, job: Job) -> Result<(), Rejected> {
        if !self.is_accepting() {
            return Err(Rejected(()));
        }

        std::thread::Builder::new()
            .name("ktask-worker".into())
            .spawn(job)
            .map(|_handle| ())
            .map_err(|_| Rejected(()))
    }
}

impl Default for DefaultExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DefaultExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultExecutor")
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

// === impl Rejected ===

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("executor rejected the job")
    }
}

impl Error for Rejected {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn runs_jobs_on_another_thread() {
        let executor = DefaultExecutor::new();
        let (tx, rx) = mpsc::channel();

        let caller = std::thread::current().id();
        executor
            .execute(Box::new(move || {
                tx.send(std::thread::current().id()).unwrap();
            }))
            .unwrap();

        let worker = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(caller, worker);
    }

    #[test]
    fn shutdown_is_terminal() {
        let executor = DefaultExecutor::new();
        assert!(executor.is_accepting());

        executor.shutdown();
        assert!(!executor.is_accepting());
        assert_eq!(
            executor.execute(Box::new(|| panic!("must not run"))),
            Err(Rejected(()))
        );
    }
}
