// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Synchronization and communication primitives.
//!
//! Everything here is single-threaded and cancel-safe under the runtime's
//! drop-based cancellation: effects commit inside `poll`, and a future that
//! consumed a wakeup without committing re-signals it from its `Drop` impl so
//! no token, permit or buffer slot is ever lost to a cancelled waiter.

mod broadcast;
mod channel;
mod event;
mod parking_lot;
mod semaphore;
mod shared;
mod value;
mod wait_list;

pub use broadcast::{BroadcastChannel, BroadcastReader};
pub use channel::Channel;
pub use event::Event;
pub use parking_lot::ParkingLot;
pub use semaphore::{Semaphore, SemaphoreGuard};
pub use shared::{RepeatableShared, Shared};
pub use value::Value;
