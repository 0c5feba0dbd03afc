// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cancellation state shared between a task and everything that can cancel it.
//!
//! Cancellation is a request, not an interrupt: [`CancelState::request`]
//! records the request and wakes the task, and the task's poll wrapper
//! delivers it by dropping the future at its next suspension point, provided
//! no [`ShieldGuard`] is alive. Dropping the future runs destructors in
//! reverse order, which is what makes cancellation synchronous and final.
//!
//! Futures that need to survive a pending request hold a shield:
//! [`non_cancellable`] wraps an arbitrary future in one, and
//! [`until_cancelled`] turns a pending request into a value so that cleanup
//! work can run before the task winds down.

use crate::task;
use core::cell::{Cell, RefCell};
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use pin_project::pin_project;
use std::rc::Rc;

/// Per-task cancellation record.
///
/// Shared as `Rc<CancelState>` between the owning task, its shield guards,
/// and anyone holding a cancel handle to the task.
#[derive(Debug, Default)]
pub(crate) struct CancelState {
    requested: Cell<bool>,
    shield: Cell<u32>,
    waker: RefCell<Option<Waker>>,
}

// === impl CancelState ===

impl CancelState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records a cancellation request and wakes the task so its poll wrapper
    /// can act on it. Idempotent.
    ///
    /// The task is woken even while shielded: shielded futures such as
    /// [`UntilCancelled`] observe the request without being dropped.
    pub(crate) fn request(&self) {
        if !self.requested.replace(true) {
            tracing::trace!("cancellation requested");
        }
        self.wake();
    }

    pub(crate) fn is_requested(&self) -> bool {
        self.requested.get()
    }

    /// Whether the poll wrapper should drop the future instead of polling it.
    pub(crate) fn should_drop(&self) -> bool {
        self.requested.get() && self.shield.get() == 0
    }

    /// Installs the waker that [`request`][Self::request] uses to reschedule
    /// the task. Called by the poll wrapper on every poll.
    pub(crate) fn set_waker(&self, waker: Waker) {
        *self.waker.borrow_mut() = Some(waker);
    }

    /// Discards the stored waker. The waker keeps the task alive, so a
    /// completed task must drop it or the two hold each other forever.
    pub(crate) fn clear_waker(&self) {
        self.waker.borrow_mut().take();
    }

    fn wake(&self) {
        let waker = self.waker.borrow_mut().take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn shield_enter(&self) {
        self.shield.set(self.shield.get() + 1);
    }

    fn shield_exit(&self) {
        let remaining = self.shield.get() - 1;
        self.shield.set(remaining);
        if remaining == 0 && self.requested.get() {
            // the pending request becomes deliverable again
            self.wake();
        }
    }
}

/// RAII shield against cancellation delivery.
///
/// While at least one guard is alive the task's future is polled normally
/// even when cancellation has been requested. Dropping the last guard with a
/// request pending reschedules the task so the request can be delivered.
pub(crate) struct ShieldGuard {
    cancel: Rc<CancelState>,
}

// === impl ShieldGuard ===

impl ShieldGuard {
    pub(crate) fn new(cancel: Rc<CancelState>) -> Self {
        cancel.shield_enter();
        Self { cancel }
    }

    /// Shields the current task, if any. Outside a task there is nothing to
    /// shield against and `None` is returned.
    pub(crate) fn for_current_task() -> Option<Self> {
        task::current_cancel().map(Self::new)
    }
}

impl Drop for ShieldGuard {
    fn drop(&mut self) {
        self.cancel.shield_exit();
    }
}

/// Wraps `future` so that it always runs to completion, even if the
/// surrounding task is cancelled while it is in flight.
///
/// The cancellation request stays pending and is delivered at the first
/// unshielded suspension point after the wrapped future completes.
pub fn non_cancellable<F: Future>(future: F) -> NonCancellable<F> {
    NonCancellable {
        future,
        guard: None,
        started: false,
    }
}

/// Future returned by [`non_cancellable`].
#[pin_project]
pub struct NonCancellable<F> {
    #[pin]
    future: F,
    guard: Option<ShieldGuard>,
    started: bool,
}

// === impl NonCancellable ===

impl<F: Future> Future for NonCancellable<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if !*this.started {
            *this.started = true;
            *this.guard = ShieldGuard::for_current_task();
        }

        let output = core::task::ready!(this.future.poll(cx));
        // release the shield before returning so a pending request can be
        // delivered at the caller's next suspension point
        *this.guard = None;
        Poll::Ready(output)
    }
}

/// Suspends until the surrounding task is cancelled, then runs `cleanup` to
/// completion before resolving.
///
/// The returned future holds a shield for its whole lifetime, so the task is
/// never dropped while it is pending; instead the cancellation request is
/// surfaced as the future resolving. Code after the `.await` runs until the
/// next unshielded suspension point, at which the task winds down as usual.
///
/// Outside a task the future never resolves.
pub fn until_cancelled<F: Future>(cleanup: F) -> UntilCancelled<F> {
    UntilCancelled {
        cleanup,
        guard: None,
        state: UntilState::Waiting,
    }
}

/// Future returned by [`until_cancelled`].
#[pin_project]
pub struct UntilCancelled<F> {
    #[pin]
    cleanup: F,
    guard: Option<ShieldGuard>,
    state: UntilState,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum UntilState {
    Waiting,
    Cleanup,
    Done,
}

// === impl UntilCancelled ===

impl<F: Future> Future for UntilCancelled<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if *this.state == UntilState::Waiting {
            if this.guard.is_none() {
                *this.guard = ShieldGuard::for_current_task();
            }
            let requested = task::current_cancel().is_some_and(|cancel| cancel.is_requested());
            if !requested {
                // CancelState::request wakes the task waker directly, so no
                // extra registration is needed; outside a task we just park
                return Poll::Pending;
            }
            tracing::trace!("cancellation observed, running cleanup");
            *this.state = UntilState::Cleanup;
        }

        debug_assert_eq!(*this.state, UntilState::Cleanup);
        let output = core::task::ready!(this.cleanup.poll(cx));
        *this.state = UntilState::Done;
        *this.guard = None;
        Poll::Ready(output)
    }
}
