// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Building blocks for one-shot concurrent computations driven by OS threads.
//!
//! The central abstraction is the [`Task`]/[`Completer`] pair: a [`Completer`]
//! is the producer-side handle that signals success or failure exactly once,
//! while the paired [`Task`] is the consumer-side handle that can be waited
//! on, queried and subscribed to from any number of threads. Either side (or
//! any third party holding the task handle) may cancel; the three terminal
//! outcomes race and exactly one wins.
//!
//! ```
//! use std::time::Duration;
//! use ktask::{Completer, Task};
//!
//! let completer = Completer::new();
//! let task = Task::blocking(&completer).unwrap();
//!
//! std::thread::spawn(move || {
//!     completer.signal_success(42).unwrap();
//! });
//!
//! let value = task.wait().unwrap().result().unwrap();
//! assert_eq!(value, 42);
//! ```
//!
//! There is no runtime in here: waiting threads park themselves and are
//! unparked by whoever completes the task. Callbacks registered through the
//! `on_*` family run on the completing thread unless an [`Executor`] is
//! supplied through the `_async` variants. Time-based tasks ([`Task::delay`]
//! and friends) share the single worker thread of [`time::global`].

mod cancel;
pub mod error;
pub mod executor;
pub mod interrupt;
mod loom;
pub mod sync;
pub mod task;
pub mod time;

pub use cancel::CancelCondition;
pub use error::{Cancelled, Failure, Payload};
pub use executor::Executor;
pub use task::{Completer, Task, TaskState};
