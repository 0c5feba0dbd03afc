// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Futures whose output is shared between multiple awaiters.
//!
//! [`Shared`] wraps a one-shot future: however many handles await it, the
//! inner future runs once and every awaiter receives a clone of the output.
//! [`RepeatableShared`] does the same for a producer that can be asked again:
//! awaiters of the same round share one execution, and once every one of
//! them has taken the result the next round may begin.
//!
//! Every awaiter parks on a wait list *and* the one not currently nested in
//! the inner poll drives the inner future with its own waker. When a driver
//! is cancelled the remaining awaiters are woken so one of them re-polls the
//! inner future and re-registers a live waker with it.

use super::wait_list::{WaitList, Waiter};
use core::cell::{Cell, RefCell};
use core::future::Future;
use core::panic::AssertUnwindSafe;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::rc::Rc;

enum SharedState<F: Future> {
    Running(Pin<Box<F>>),
    Value(F::Output),
    /// The driver rethrew the original payload; everyone else gets a
    /// summary panic.
    Panicked,
    /// Every handle was dropped while the future was still running.
    Poisoned,
}

struct SharedInner<F: Future> {
    state: RefCell<SharedState<F>>,
    waiters: WaitList,
    /// True while some handle is inside the inner future's poll; guards
    /// against re-entrant driving.
    driving: Cell<bool>,
    handles: Cell<usize>,
}

/// A clonable future. All clones resolve with the same output; the wrapped
/// future runs at most once.
///
/// Awaiting a handle consumes it, so keep a clone around if the result is
/// needed elsewhere. If every handle is dropped before completion the
/// wrapped future is dropped too (its cancellation); awaiting a clone taken
/// out beforehand then panics.
pub struct Shared<F: Future> {
    inner: Rc<SharedInner<F>>,
    waiter: Waiter,
}

// === impl Shared ===

impl<F: Future> Shared<F> {
    pub fn new(future: F) -> Self {
        Self {
            inner: Rc::new(SharedInner {
                state: RefCell::new(SharedState::Running(Box::pin(future))),
                waiters: WaitList::new(),
                driving: Cell::new(false),
                handles: Cell::new(1),
            }),
            waiter: Waiter::new(),
        }
    }

    /// Whether the wrapped future has produced its output.
    pub fn is_ready(&self) -> bool {
        matches!(&*self.inner.state.borrow(), SharedState::Value(_))
    }
}

impl<F: Future> Clone for Shared<F> {
    fn clone(&self) -> Self {
        self.inner.handles.set(self.inner.handles.get() + 1);
        Self {
            inner: Rc::clone(&self.inner),
            waiter: Waiter::new(),
        }
    }
}

impl<F: Future> Drop for Shared<F> {
    fn drop(&mut self) {
        let handles = self.inner.handles.get() - 1;
        self.inner.handles.set(handles);
        self.waiter.cancel();

        if matches!(&*self.inner.state.borrow(), SharedState::Running(_)) {
            if handles == 0 {
                // last handle gone: dropping the inner future cancels it
                *self.inner.state.borrow_mut() = SharedState::Poisoned;
            } else {
                // we may have been the driver; wake the others so one of
                // them takes over
                self.inner.waiters.wake_all();
            }
        }
    }
}

impl<F> Future for Shared<F>
where
    F: Future + 'static,
    F::Output: Clone,
{
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        let this = &mut *self;
        let inner = &this.inner;
        loop {
            match &*inner.state.borrow() {
                SharedState::Value(value) => {
                    let value = value.clone();
                    this.waiter.cancel();
                    return Poll::Ready(value);
                }
                SharedState::Panicked => panic!("shared future panicked"),
                SharedState::Poisoned => {
                    panic!("shared future was dropped before completing")
                }
                SharedState::Running(_) => {}
            }

            // stay registered so completion (or a driver hand-over) finds us
            if this.waiter.poll_wait(&inner.waiters, cx).is_ready() {
                continue;
            }
            if inner.driving.get() {
                return Poll::Pending;
            }

            inner.driving.set(true);
            let poll = {
                let mut state = inner.state.borrow_mut();
                let SharedState::Running(future) = &mut *state else {
                    unreachable!()
                };
                std::panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(cx)))
            };
            inner.driving.set(false);

            match poll {
                Ok(Poll::Pending) => return Poll::Pending,
                Ok(Poll::Ready(value)) => {
                    let replaced = core::mem::replace(
                        &mut *inner.state.borrow_mut(),
                        SharedState::Value(value),
                    );
                    drop(replaced);
                    inner.waiters.wake_all();
                    // loop around to take our copy
                }
                Err(payload) => {
                    let replaced = core::mem::replace(
                        &mut *inner.state.borrow_mut(),
                        SharedState::Panicked,
                    );
                    drop(replaced);
                    this.waiter.cancel();
                    inner.waiters.wake_all();
                    std::panic::resume_unwind(payload);
                }
            }
        }
    }
}

enum RoundState<Fut: Future> {
    /// No execution in flight; the next awaiter starts one.
    Idle,
    Running(Pin<Box<Fut>>),
    Value(Fut::Output),
}

struct RepInner<P, Fut: Future> {
    producer: RefCell<P>,
    state: RefCell<RoundState<Fut>>,
    round: Cell<u64>,
    /// Awaiters of the current round that have not taken the value yet.
    outstanding: Cell<usize>,
    waiters: WaitList,
    driving: Cell<bool>,
}

/// A shareable computation that can be asked again and again.
///
/// Every [`next`][RepeatableShared::next] call joins the round currently in
/// flight (starting one if idle) and receives a clone of its result. A new
/// round only begins after every awaiter of the previous one has taken its
/// copy, so no awaiter can be starved by eager re-askers; callers arriving
/// while a finished round is being handed out wait for the following round.
///
/// If the round's future panics, the round is abandoned: the driver rethrows
/// the panic and the remaining awaiters restart the producer.
pub struct RepeatableShared<P, Fut: Future> {
    inner: Rc<RepInner<P, Fut>>,
}

// === impl RepeatableShared ===

impl<P, Fut> Clone for RepeatableShared<P, Fut>
where
    Fut: Future,
{
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<P, Fut> RepeatableShared<P, Fut>
where
    P: FnMut() -> Fut,
    Fut: Future,
{
    pub fn new(producer: P) -> Self {
        Self {
            inner: Rc::new(RepInner {
                producer: RefCell::new(producer),
                state: RefCell::new(RoundState::Idle),
                round: Cell::new(0),
                outstanding: Cell::new(0),
                waiters: WaitList::new(),
                driving: Cell::new(false),
            }),
        }
    }

    /// Joins the current round, starting one if none is in flight.
    pub fn next(&self) -> Next<'_, P, Fut> {
        Next {
            shared: self,
            joined: None,
            waiter: Waiter::new(),
        }
    }

    /// The number of fully retired rounds so far.
    pub fn round(&self) -> u64 {
        self.inner.round.get()
    }
}

/// Future returned by [`RepeatableShared::next`].
pub struct Next<'a, P, Fut: Future> {
    shared: &'a RepeatableShared<P, Fut>,
    /// The round this awaiter belongs to, fixed at the first poll that finds
    /// the round joinable.
    joined: Option<u64>,
    waiter: Waiter,
}

// === impl Next ===

impl<P, Fut> Future for Next<'_, P, Fut>
where
    P: FnMut() -> Fut,
    Fut: Future,
    Fut::Output: Clone,
{
    type Output = Fut::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Fut::Output> {
        let this = &mut *self;
        let inner = &this.shared.inner;
        loop {
            let round = inner.round.get();

            if matches!(&*inner.state.borrow(), RoundState::Value(_)) {
                if this.joined == Some(round) {
                    let value = {
                        let state = inner.state.borrow();
                        let RoundState::Value(value) = &*state else {
                            unreachable!()
                        };
                        value.clone()
                    };
                    this.joined = None;
                    this.waiter.cancel();
                    let remaining = inner.outstanding.get() - 1;
                    inner.outstanding.set(remaining);
                    if remaining == 0 {
                        advance_round(inner);
                    }
                    return Poll::Ready(value);
                }
                // a finished round we did not join: wait for the next one
                if this.waiter.poll_wait(&inner.waiters, cx).is_pending() {
                    return Poll::Pending;
                }
                continue;
            }

            // Idle or Running: joinable
            if this.joined.is_none() {
                this.joined = Some(round);
                inner.outstanding.set(inner.outstanding.get() + 1);
            }

            if matches!(&*inner.state.borrow(), RoundState::Idle) {
                let future = Box::pin((inner.producer.borrow_mut())());
                *inner.state.borrow_mut() = RoundState::Running(future);
                tracing::trace!(round, "round started");
            }

            if this.waiter.poll_wait(&inner.waiters, cx).is_ready() {
                continue;
            }
            if inner.driving.get() {
                return Poll::Pending;
            }

            inner.driving.set(true);
            let poll = {
                let mut state = inner.state.borrow_mut();
                let RoundState::Running(future) = &mut *state else {
                    unreachable!()
                };
                std::panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(cx)))
            };
            inner.driving.set(false);

            match poll {
                Ok(Poll::Pending) => return Poll::Pending,
                Ok(Poll::Ready(value)) => {
                    *inner.state.borrow_mut() = RoundState::Value(value);
                    inner.waiters.wake_all();
                    // loop around to take our copy
                }
                Err(payload) => {
                    // abandon the round; surviving awaiters restart it
                    *inner.state.borrow_mut() = RoundState::Idle;
                    this.waiter.cancel();
                    if let Some(joined) = this.joined.take() {
                        debug_assert_eq!(joined, round);
                        inner.outstanding.set(inner.outstanding.get() - 1);
                    }
                    inner.waiters.wake_all();
                    std::panic::resume_unwind(payload);
                }
            }
        }
    }
}

impl<P, Fut: Future> Drop for Next<'_, P, Fut> {
    fn drop(&mut self) {
        let inner = &self.shared.inner;
        self.waiter.cancel();

        if let Some(round) = self.joined.take() {
            if round == inner.round.get() {
                let remaining = inner.outstanding.get() - 1;
                inner.outstanding.set(remaining);
                if remaining == 0 {
                    // last awaiter gone: retire the round, finished or not
                    advance_round(inner);
                    return;
                }
            }
        }
        if matches!(&*inner.state.borrow(), RoundState::Running(_)) {
            // we may have been the driver
            inner.waiters.wake_all();
        }
    }
}

fn advance_round<P, Fut: Future>(inner: &RepInner<P, Fut>) {
    *inner.state.borrow_mut() = RoundState::Idle;
    inner.round.set(inner.round.get() + 1);
    // release awaiters that arrived too late for the finished round
    inner.waiters.wake_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nursery::{JoinMode, nursery};
    use crate::runner::run;
    use crate::test_util::TestLoop;
    use core::time::Duration;

    #[test]
    fn all_awaiters_share_one_execution() {
        let lp = TestLoop::new();
        let handle = lp.clone();
        let runs = Rc::new(Cell::new(0));
        let counter = Rc::clone(&runs);

        let (a, b) = run(&lp, async move {
            let work = Shared::new(async move {
                counter.set(counter.get() + 1);
                handle.sleep(Duration::from_millis(5)).await;
                42u32
            });
            crate::all_of((work.clone(), work)).await
        });

        assert_eq!((a, b), (42, 42));
        assert_eq!(runs.get(), 1, "the wrapped future must run exactly once");
        assert_eq!(lp.now(), Duration::from_millis(5));
    }

    #[test]
    fn late_awaiter_gets_the_stored_value() {
        let lp = TestLoop::new();
        let handle = lp.clone();

        run(&lp, async move {
            let work = Shared::new(async { 7u32 });
            let replay = work.clone();
            assert_eq!(work.await, 7);
            assert!(replay.is_ready());
            // resolves at once, long after the original completed
            handle.sleep(Duration::from_millis(1)).await;
            assert_eq!(replay.await, 7);
        });
    }

    #[test]
    fn panic_reaches_the_driver() {
        let lp = TestLoop::new();
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            run(&lp, async {
                let work = Shared::new(async {
                    panic!("shared blew up");
                });
                work.await
            });
        }));
        let payload = result.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"shared blew up"));
    }

    #[test]
    fn cancelled_driver_hands_over_driving() {
        let lp = TestLoop::new();
        let handle = lp.clone();
        let out = Rc::new(Cell::new(0u32));

        let seen = Rc::clone(&out);
        run(&lp, async move {
            let work = Shared::new({
                let lp = handle.clone();
                async move {
                    lp.sleep(Duration::from_millis(5)).await;
                    9u32
                }
            });
            nursery(|n| {
                // the first awaiter drives, then is cancelled at 1ms
                let driver = work.clone();
                let timeout = handle.sleep(Duration::from_millis(1));
                n.start(async move {
                    crate::any_of((driver, timeout)).await;
                });

                let follower = work;
                let seen = Rc::clone(&seen);
                n.start(async move {
                    seen.set(follower.await);
                });
                async { JoinMode::Join }
            })
            .await;
        });

        assert_eq!(out.get(), 9);
        assert_eq!(lp.now(), Duration::from_millis(5));
    }

    #[test]
    fn repeatable_rounds_share_then_restart() {
        let lp = TestLoop::new();
        let handle = lp.clone();
        let runs = Rc::new(Cell::new(0u32));

        let counter = Rc::clone(&runs);
        let (first_pair, second) = run(&lp, async move {
            let lp = handle.clone();
            let rep = RepeatableShared::new(move || {
                let lp = lp.clone();
                let counter = Rc::clone(&counter);
                async move {
                    counter.set(counter.get() + 1);
                    lp.sleep(Duration::from_millis(1)).await;
                    counter.get()
                }
            });

            let pair = crate::all_of((rep.next(), rep.next())).await;
            let second = rep.next().await;
            (pair, second)
        });

        assert_eq!(first_pair, (1, 1), "same round shares one execution");
        assert_eq!(second, 2, "a later awaiter starts a fresh round");
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn rounds_retire_when_abandoned() {
        let lp = TestLoop::new();
        let handle = lp.clone();

        run(&lp, async move {
            let lp = handle.clone();
            let rep = RepeatableShared::new(move || {
                let lp = lp.clone();
                async move {
                    lp.sleep(Duration::from_millis(10)).await;
                    1u32
                }
            });

            // the only awaiter of round zero is cancelled mid-flight
            let timeout = handle.sleep(Duration::from_millis(1));
            crate::any_of((rep.next(), timeout)).await;
            assert_eq!(rep.round(), 1, "the abandoned round is retired");
        });
    }
}
