// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The leaf synchronization primitives everything else is built from.

mod awaiter;
mod lazy;
mod set_once;
mod subscribers;

pub use awaiter::{Awaiter, Permit, PermitToken, Waiter};
pub use lazy::{CloseableLazy, Lazy, LazyClosed};
pub use set_once::{SetOnce, SetState};
pub use subscribers::Subscribers;
