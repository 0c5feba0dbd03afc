// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::wait_list::{WaitList, Waiter};
use core::cell::Cell;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

/// One-shot latch. Waiters suspend until [`set`][Event::set] is called;
/// afterwards every wait, past or future, resolves immediately.
#[derive(Default)]
pub struct Event {
    set: Cell<bool>,
    waiters: WaitList,
}

// === impl Event ===

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the event, releasing all current and future waiters. Idempotent.
    pub fn set(&self) {
        if self.set.replace(true) {
            return;
        }
        self.waiters.wake_all();
    }

    pub fn is_set(&self) -> bool {
        self.set.get()
    }

    /// Resolves once the event has fired.
    pub fn wait(&self) -> Wait<'_> {
        Wait {
            event: self,
            waiter: Waiter::new(),
        }
    }
}

/// Future returned by [`Event::wait`].
pub struct Wait<'a> {
    event: &'a Event,
    waiter: Waiter,
}

// === impl Wait ===

impl Future for Wait<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = &mut *self;
        if this.event.set.get() {
            this.waiter.cancel();
            return Poll::Ready(());
        }
        // latched events never un-set, so a consumed wakeup cannot be lost;
        // no re-signal needed on drop
        this.waiter.poll_wait(&this.event.waiters, cx)
    }
}
