// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::wait_list::{WaitList, Waiter};
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

/// The bare waiting primitive: tasks park, someone else unparks them.
///
/// Unpark tokens are not buffered. `unpark_one` on an empty lot is a no-op,
/// so a parker that arrives later waits for the next token. A parked future
/// that gets its token and is then cancelled hands the token to the next
/// parker instead of losing it.
#[derive(Default)]
pub struct ParkingLot {
    waiters: WaitList,
}

// === impl ParkingLot ===

impl ParkingLot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks the caller until an unpark token arrives.
    pub fn park(&self) -> Park<'_> {
        Park {
            lot: self,
            waiter: Waiter::new(),
        }
    }

    /// Unparks the oldest parked task. Returns whether one was waiting.
    pub fn unpark_one(&self) -> bool {
        self.waiters.wake_one()
    }

    /// Unparks every parked task.
    pub fn unpark_all(&self) -> usize {
        self.waiters.wake_all()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

/// Future returned by [`ParkingLot::park`].
pub struct Park<'a> {
    lot: &'a ParkingLot,
    waiter: Waiter,
}

// === impl Park ===

impl Future for Park<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = &mut *self;
        this.waiter.poll_wait(&this.lot.waiters, cx)
    }
}

impl Drop for Park<'_> {
    fn drop(&mut self) {
        if self.waiter.cancel() {
            // we were unparked but never resumed; pass the token on
            self.lot.waiters.wake_one();
        }
    }
}
