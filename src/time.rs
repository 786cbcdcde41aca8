// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! One-shot scheduling without a thread per timer.

mod timer;

use core::error::Error;
use core::fmt;

use crate::sync::Lazy;

pub use timer::{ScheduleHandle, Timer};

/// Error returned when a job cannot be scheduled.
#[derive(Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ScheduleError {
    /// The timer was shut down; scheduling is terminal-rejected.
    Shutdown,
    /// The cancel condition passed to the schedule is already bound
    /// elsewhere.
    ConditionBound,
}

static GLOBAL: Lazy<Timer> = Lazy::new(|| Timer::spawn("ktask-timer"));

/// Returns the lazily-initialized process-wide timer.
///
/// All time-based task factories ([`Task::delay`][crate::Task::delay] and
/// friends) schedule here. The global timer is never dropped; shutting it
/// down is permitted but terminal for the whole process.
pub fn global() -> &'static Timer {
    GLOBAL.get()
}

// === impl ScheduleError ===

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleError::Shutdown => f.write_str("timer was shut down"),
            ScheduleError::ConditionBound => {
                f.write_str("cancel condition is already bound to another operation")
            }
        }
    }
}

impl Error for ScheduleError {}
