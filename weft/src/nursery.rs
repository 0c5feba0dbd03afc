// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Structured task groups.
//!
//! A nursery ties the lifetime of spawned tasks to a scope: [`nursery`]
//! takes a body closure, hands it a [`Nursery`] handle to start children
//! with, and does not resolve until every child has finished. The body's
//! return value picks the join policy: [`JoinMode::Join`] waits for the
//! children, [`JoinMode::Cancel`] cancels whatever is still running.
//!
//! Failure is collective. The first child panic cancels the body and all
//! siblings, and is rethrown once the scope has fully wound down. Cancelling
//! the surrounding task likewise cancels the whole scope; the nursery shields
//! itself so it can wind its children down synchronously before the task is
//! allowed to go away. A nursery that is dropped with children still alive
//! indicates a scope that escaped its task, which breaks every guarantee this
//! module makes, so the process is aborted.

use crate::cancel::ShieldGuard;
use crate::executor::Executor;
use crate::task::{self, Completion, RawTask, TaskRef};
use core::any::Any;
use core::cell::{Cell, RefCell};
use core::future::Future;
use core::panic::{AssertUnwindSafe, Location};
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use std::rc::Rc;

/// What to do with children still running when the nursery body returns.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum JoinMode {
    /// Wait for every child to finish on its own.
    Join,
    /// Cancel the remaining children and wait for them to wind down.
    Cancel,
}

/// Opens a task scope around `body`.
///
/// The returned future resolves once the body has returned *and* every child
/// it started has finished. It must be awaited inside a task.
pub fn nursery<B, Fut>(body: B) -> NurseryFuture<B, Fut>
where
    B: FnOnce(Nursery) -> Fut,
    Fut: Future<Output = JoinMode> + 'static,
{
    NurseryFuture {
        state: State::Unpolled(Some(body)),
    }
}

struct Shared {
    executor: Executor,
    children: RefCell<Vec<TaskRef>>,
    pending: Cell<usize>,
    cancelled: Cell<bool>,
    closed: Cell<bool>,
    failure: RefCell<Option<Box<dyn Any + Send>>>,
    joiner: RefCell<Option<Waker>>,
}

/// Handle for starting children in an open nursery. Clonable; children may
/// hold one and start siblings.
#[derive(Clone)]
pub struct Nursery {
    shared: Rc<Shared>,
}

// === impl Shared ===

impl Shared {
    /// Cancels the scope: the body is dropped at the joiner's next poll and
    /// every live child gets a cancellation delivered in one batch.
    fn cancel(&self) {
        if self.cancelled.replace(true) {
            return;
        }
        tracing::trace!(children = self.pending.get(), "cancelling nursery");
        self.wake_joiner();

        let snapshot: Vec<TaskRef> = self.children.borrow().clone();
        self.executor.capture(|| {
            for child in snapshot {
                child.cancel();
            }
        });
    }

    fn record_failure(&self, payload: Box<dyn Any + Send>) {
        // first failure wins; later ones are already winding down
        let mut failure = self.failure.borrow_mut();
        if failure.is_none() {
            *failure = Some(payload);
        }
    }

    fn child_complete(&self, child: &TaskRef, completion: Completion) {
        self.children
            .borrow_mut()
            .retain(|other| other.id() != child.id());
        self.pending.set(self.pending.get() - 1);

        if completion == Completion::Panicked {
            if let Some(payload) = child.take_panic() {
                self.record_failure(payload);
            }
            self.cancel();
        }

        self.wake_joiner();
    }

    fn wake_joiner(&self) {
        let waker = self.joiner.borrow_mut().take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

// === impl Nursery ===

impl Nursery {
    /// Starts a child task running `future`.
    ///
    /// The child begins executing at the next executor turn. If the nursery
    /// is already winding down, the child is cancelled before its first poll
    /// and only its destructors run.
    ///
    /// # Panics
    ///
    /// Panics if the nursery has already been joined.
    #[track_caller]
    pub fn start<F>(&self, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        assert!(
            !self.shared.closed.get(),
            "Nursery::start called on a closed nursery",
        );
        let shared = Rc::clone(&self.shared);
        let child = task::spawn(
            &self.shared.executor,
            future,
            Location::caller(),
            Some(Box::new(move |child, completion| {
                shared.child_complete(&child, completion);
            })),
        );
        self.shared.pending.set(self.shared.pending.get() + 1);
        self.shared
            .children
            .borrow_mut()
            .push(Rc::clone(&child) as TaskRef);

        if self.shared.cancelled.get() {
            Rc::clone(&child).cancel();
        }
        (child as TaskRef).schedule();
    }

    /// Starts a child and waits for it to report that it is up.
    ///
    /// `f` receives a [`TaskStarted`] token; calling
    /// [`started`][TaskStarted::started] resolves the returned future with
    /// the reported value while the child keeps running. The child finishing
    /// (or being cancelled) without reporting is a startup failure and panics
    /// the awaiting task.
    #[track_caller]
    pub fn start_with<T, F, Fut>(&self, f: F) -> Starting<T>
    where
        T: 'static,
        F: FnOnce(TaskStarted<T>) -> Fut,
        Fut: Future<Output = ()> + 'static,
    {
        let state = Rc::new(StartState {
            value: RefCell::new(None),
            waker: RefCell::new(None),
            done: Cell::new(false),
        });

        // moved into the child future at construction, so even a child that
        // is dropped before its first poll signals the waiter
        let guard = FinishGuard(Rc::clone(&state));
        let body = f(TaskStarted {
            state: Rc::clone(&state),
        });
        self.start(async move {
            let _guard = guard;
            body.await;
        });

        Starting { state }
    }

    /// Cancels the whole scope, children and body alike.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    /// Number of children that have not finished yet.
    pub fn active(&self) -> usize {
        self.shared.pending.get()
    }
}

/// Token handed to [`Nursery::start_with`] children for reporting startup.
pub struct TaskStarted<T> {
    state: Rc<StartState<T>>,
}

struct StartState<T> {
    value: RefCell<Option<T>>,
    waker: RefCell<Option<Waker>>,
    done: Cell<bool>,
}

struct FinishGuard<T>(Rc<StartState<T>>);

/// Future returned by [`Nursery::start_with`].
pub struct Starting<T> {
    state: Rc<StartState<T>>,
}

// === impl TaskStarted ===

impl<T> TaskStarted<T> {
    /// Reports that the child is up, resolving the waiter with `value`.
    pub fn started(self, value: T) {
        *self.state.value.borrow_mut() = Some(value);
        wake_start_waiter(&self.state);
    }
}

impl<T> Drop for FinishGuard<T> {
    fn drop(&mut self) {
        self.0.done.set(true);
        wake_start_waiter(&self.0);
    }
}

fn wake_start_waiter<T>(state: &StartState<T>) {
    let waker = state.waker.borrow_mut().take();
    if let Some(waker) = waker {
        waker.wake();
    }
}

impl<T> Future for Starting<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        if let Some(value) = self.state.value.borrow_mut().take() {
            return Poll::Ready(value);
        }
        assert!(
            !self.state.done.get(),
            "child task finished without reporting startup",
        );
        *self.state.waker.borrow_mut() = Some(cx.waker().clone());
        Poll::Pending
    }
}

enum State<B, Fut> {
    /// Body closure stashed until the first poll binds us to a task.
    Unpolled(Option<B>),
    Body {
        shared: Rc<Shared>,
        body: Pin<Box<Fut>>,
        _guard: ShieldGuard,
    },
    Joining {
        shared: Rc<Shared>,
        _guard: ShieldGuard,
    },
    Done,
}

/// Future returned by [`nursery`].
#[must_use = "a nursery does nothing until awaited"]
pub struct NurseryFuture<B, Fut> {
    state: State<B, Fut>,
}

// === impl NurseryFuture ===

// all pinned state lives behind `Box::pin`, so the future itself is free
// to move even when the body closure is not
impl<B, Fut> Unpin for NurseryFuture<B, Fut> {}

static_assertions::assert_impl_all!(
    NurseryFuture<core::marker::PhantomPinned, core::future::Pending<JoinMode>>: Unpin
);

impl<B, Fut> Future for NurseryFuture<B, Fut>
where
    B: FnOnce(Nursery) -> Fut,
    Fut: Future<Output = JoinMode> + 'static,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();

        if let State::Unpolled(body) = &mut this.state {
            let Some(ctx) = task::current() else {
                panic!("a nursery must be awaited inside a task");
            };
            let Some(body) = body.take() else {
                panic!("NurseryFuture polled after completion");
            };
            let shared = Rc::new(Shared {
                executor: ctx.executor,
                children: RefCell::new(Vec::new()),
                pending: Cell::new(0),
                cancelled: Cell::new(false),
                closed: Cell::new(false),
                failure: RefCell::new(None),
                joiner: RefCell::new(None),
            });
            let handle = Nursery {
                shared: Rc::clone(&shared),
            };
            this.state = State::Body {
                body: Box::pin(body(handle)),
                _guard: ShieldGuard::new(ctx.cancel),
                shared,
            };
        }

        let advance = if let State::Body { shared, body, .. } = &mut this.state {
            // cancelling the surrounding task cancels the scope
            if !shared.cancelled.get()
                && task::current_cancel().is_some_and(|cancel| cancel.is_requested())
            {
                shared.cancel();
            }

            if shared.cancelled.get() {
                // dropping the body is its cancellation
                true
            } else {
                let poll = std::panic::catch_unwind(AssertUnwindSafe(|| body.as_mut().poll(cx)));
                match poll {
                    Ok(Poll::Pending) => {
                        *shared.joiner.borrow_mut() = Some(cx.waker().clone());
                        return Poll::Pending;
                    }
                    Ok(Poll::Ready(mode)) => {
                        tracing::trace!(?mode, children = shared.pending.get(), "body returned");
                        if mode == JoinMode::Cancel {
                            shared.cancel();
                        }
                        true
                    }
                    Err(payload) => {
                        // a panicking body fails the scope like a panicking
                        // child: cancel everyone, rethrow after the join
                        shared.record_failure(payload);
                        shared.cancel();
                        true
                    }
                }
            }
        } else {
            false
        };

        if advance {
            let State::Body { shared, _guard, .. } =
                core::mem::replace(&mut this.state, State::Done)
            else {
                unreachable!()
            };
            this.state = State::Joining { shared, _guard };
        }

        if let State::Joining { shared, .. } = &mut this.state {
            // the shield keeps the task alive through the join, so an
            // external cancellation arrives here as a plain poll and must
            // still be turned into a scope cancellation
            if !shared.cancelled.get()
                && task::current_cancel().is_some_and(|cancel| cancel.is_requested())
            {
                shared.cancel();
            }
            if shared.pending.get() > 0 {
                *shared.joiner.borrow_mut() = Some(cx.waker().clone());
                return Poll::Pending;
            }
            shared.closed.set(true);
            let failure = shared.failure.borrow_mut().take();
            this.state = State::Done;
            if let Some(payload) = failure {
                std::panic::resume_unwind(payload);
            }
            return Poll::Ready(());
        }

        panic!("NurseryFuture polled after completion");
    }
}

impl<B, Fut> Drop for NurseryFuture<B, Fut> {
    fn drop(&mut self) {
        let shared = match &self.state {
            State::Body { shared, .. } | State::Joining { shared, .. } => shared,
            State::Unpolled(_) | State::Done => return,
        };
        if shared.pending.get() > 0 {
            // children would outlive their scope; no safe way to continue
            tracing::error!(
                children = shared.pending.get(),
                "nursery dropped with live children, aborting",
            );
            std::process::abort();
        }
        shared.closed.set(true);
    }
}
