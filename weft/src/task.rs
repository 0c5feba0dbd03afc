// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The runtime's unit of execution.
//!
//! A [`Task`] owns a pinned future, its cancellation record and a reference
//! to the executor it is scheduled on. Polling happens through the type-erased
//! [`RawTask`] trait so nurseries and the runner can hold heterogeneous
//! children as [`TaskRef`]s; the typed [`Task<F>`] handle is what lets the
//! runner extract the root future's output without downcasting.
//!
//! Every poll is wrapped: the wrapper first checks whether a cancellation
//! request is deliverable, and if so drops the future instead of polling it.
//! That drop *is* the cancellation; destructors run in reverse order and the
//! task completes with [`Completion::Cancelled`]. Panics are caught at the
//! same boundary and stored for whoever joins the task.

use crate::cancel::CancelState;
use crate::executor::Executor;
use crate::waker::{self, RcWake};
use bitflags::bitflags;
use core::any::Any;
use core::cell::{Cell, RefCell};
use core::fmt;
use core::future::Future;
use core::num::NonZeroU64;
use core::panic::{AssertUnwindSafe, Location};
use core::pin::Pin;
use core::task::{Context, Poll};
use std::rc::Rc;

/// Uniquely identifies a task for the lifetime of the thread.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) struct Id(NonZeroU64);

bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    struct TaskState: u8 {
        /// A poll callback for this task sits in the executor queue.
        const SCHEDULED = 1 << 0;
        /// The task's poll wrapper is on the call stack.
        const POLLING = 1 << 1;
        /// The task finished (value, cancellation, or panic) and will never
        /// be polled again.
        const COMPLETE = 1 << 2;
    }
}

/// How a task finished. The payload, if any, stays in the task and is
/// fetched separately.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Completion {
    Value,
    Cancelled,
    Panicked,
}

/// Called exactly once when the task completes. Receives the completed task
/// so callers need not capture a handle (which would form an `Rc` cycle).
pub(crate) type ParentCallback = Box<dyn FnOnce(TaskRef, Completion)>;

/// Type-erased, reference-counted task handle.
pub(crate) type TaskRef = Rc<dyn RawTask>;

/// Operations available on a task regardless of its future's type.
pub(crate) trait RawTask {
    fn id(&self) -> Id;

    /// Runs one iteration of the poll wrapper. No-op once complete.
    fn poll(self: Rc<Self>);

    /// Enqueues a poll on the task's executor, at most once at a time.
    fn schedule(self: Rc<Self>);

    /// Requests cancellation and arranges for it to be delivered. Idempotent;
    /// no-op once complete.
    fn cancel(self: Rc<Self>);

    fn is_complete(&self) -> bool;

    /// Removes and returns the stored panic payload, if the task panicked.
    fn take_panic(&self) -> Option<Box<dyn Any + Send>>;
}

struct Header {
    id: Id,
    state: Cell<TaskState>,
    cancel: Rc<CancelState>,
    executor: Executor,
    span: tracing::Span,
}

enum Stage<F: Future> {
    /// Still running.
    Pending(Pin<Box<F>>),
    /// Completed; output not yet claimed.
    Ready(F::Output),
    /// Panicked; payload not yet claimed.
    Panicked(Box<dyn Any + Send>),
    /// The future was dropped in response to a cancellation request.
    Cancelled,
    /// Output or payload has been claimed.
    Consumed,
}

pub(crate) struct Task<F: Future> {
    header: Header,
    stage: RefCell<Stage<F>>,
    parent: RefCell<Option<ParentCallback>>,
}

/// What the runner finds in the root task after the event loop stops.
pub(crate) enum Outcome<T> {
    Value(T),
    Cancelled,
    Panicked(Box<dyn Any + Send>),
    Pending,
}

/// Ambient state a task makes available to the futures it polls.
#[derive(Clone)]
pub(crate) struct TaskContext {
    pub(crate) cancel: Rc<CancelState>,
    pub(crate) executor: Executor,
}

std::thread_local! {
    /// Stack, not a slot: batched cancellation polls children from inside the
    /// parent's poll, so contexts nest.
    static CONTEXT: RefCell<Vec<TaskContext>> = const { RefCell::new(Vec::new()) };
}

/// The context of the innermost task currently being polled, if any.
pub(crate) fn current() -> Option<TaskContext> {
    CONTEXT.with(|stack| stack.borrow().last().cloned())
}

pub(crate) fn current_cancel() -> Option<Rc<CancelState>> {
    CONTEXT.with(|stack| stack.borrow().last().map(|ctx| Rc::clone(&ctx.cancel)))
}

struct ContextGuard;

impl ContextGuard {
    fn enter(ctx: TaskContext) -> Self {
        CONTEXT.with(|stack| stack.borrow_mut().push(ctx));
        Self
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CONTEXT.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

// === impl Id ===

impl Id {
    fn next() -> Self {
        std::thread_local! {
            static NEXT: Cell<u64> = const { Cell::new(1) };
        }
        let raw = NEXT.with(|next| {
            let raw = next.get();
            next.set(raw + 1);
            raw
        });
        Self(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    pub(crate) fn as_u64(self) -> u64 {
        self.0.get()
    }
}

/// Creates a task around `future`, bound to `executor`. The task is not
/// scheduled; the caller decides when the first poll happens.
pub(crate) fn spawn<F>(
    executor: &Executor,
    future: F,
    location: &'static Location<'static>,
    parent: Option<ParentCallback>,
) -> Rc<Task<F>>
where
    F: Future + 'static,
{
    let id = Id::next();
    let span = tracing::trace_span!(
        "task",
        task.id = id.as_u64(),
        task.output = %core::any::type_name::<F::Output>(),
        task.spawned_at = %location,
    );
    tracing::trace!(parent: &span, "spawned");

    Rc::new(Task {
        header: Header {
            id,
            state: Cell::new(TaskState::empty()),
            cancel: Rc::new(CancelState::new()),
            executor: executor.clone(),
            span,
        },
        stage: RefCell::new(Stage::Pending(Box::pin(future))),
        parent: RefCell::new(parent),
    })
}

// === impl Task ===

impl<F: Future> Task<F> {
    /// Claims the task's outcome. Only meaningful once; subsequent calls see
    /// [`Outcome::Pending`] or a consumed stage.
    pub(crate) fn take_output(&self) -> Outcome<F::Output> {
        let taken = core::mem::replace(&mut *self.stage.borrow_mut(), Stage::Consumed);
        match taken {
            Stage::Ready(value) => Outcome::Value(value),
            Stage::Panicked(payload) => Outcome::Panicked(payload),
            Stage::Cancelled => Outcome::Cancelled,
            Stage::Pending(future) => {
                // hand the future back so "pending" stays observable
                *self.stage.borrow_mut() = Stage::Pending(future);
                Outcome::Pending
            }
            Stage::Consumed => Outcome::Pending,
        }
    }

    fn complete(&self, completion: Completion) -> ParentCallback {
        let state = self.header.state.get();
        self.header.state.set(
            (state - (TaskState::SCHEDULED | TaskState::POLLING)) | TaskState::COMPLETE,
        );
        // the stored waker holds an `Rc` of this task; keeping it past
        // completion would leak the control block
        self.header.cancel.clear_waker();
        tracing::trace!(?completion, "task complete");
        self.parent
            .borrow_mut()
            .take()
            .unwrap_or_else(|| Box::new(|_, _| {}))
    }
}

impl<F> RawTask for Task<F>
where
    F: Future + 'static,
{
    fn id(&self) -> Id {
        self.header.id
    }

    fn poll(self: Rc<Self>) {
        let state = self.header.state.get();
        if state.contains(TaskState::COMPLETE) {
            return;
        }
        if state.contains(TaskState::POLLING) {
            // the future cancelled its own task from inside `poll` (batched
            // scope cancellation does this); deliver once the current poll
            // has unwound
            self.header.state.set(state - TaskState::SCHEDULED);
            self.schedule();
            return;
        }
        self.header
            .state
            .set((state - TaskState::SCHEDULED) | TaskState::POLLING);

        let _enter = self.header.span.enter();

        if self.header.cancel.should_drop() {
            // this drop is the cancellation: destructors run here
            let dropped = core::mem::replace(&mut *self.stage.borrow_mut(), Stage::Cancelled);
            drop(dropped);
            let parent = self.complete(Completion::Cancelled);
            drop(_enter);
            parent(self.clone(), Completion::Cancelled);
            return;
        }

        let waker = waker::waker(Rc::clone(&self));
        self.header.cancel.set_waker(waker.clone());
        let mut cx = Context::from_waker(&waker);

        let _ctx = ContextGuard::enter(TaskContext {
            cancel: Rc::clone(&self.header.cancel),
            executor: self.header.executor.clone(),
        });

        let poll = {
            let mut stage = self.stage.borrow_mut();
            let Stage::Pending(future) = &mut *stage else {
                debug_assert!(false, "incomplete task has no future");
                return;
            };
            std::panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)))
        };
        drop(_ctx);

        let completion = match poll {
            Ok(Poll::Pending) => {
                self.header
                    .state
                    .set(self.header.state.get() - TaskState::POLLING);
                return;
            }
            Ok(Poll::Ready(value)) => {
                let dropped = core::mem::replace(&mut *self.stage.borrow_mut(), Stage::Ready(value));
                drop(dropped);
                Completion::Value
            }
            Err(payload) => {
                tracing::trace!("task panicked");
                let dropped =
                    core::mem::replace(&mut *self.stage.borrow_mut(), Stage::Panicked(payload));
                drop(dropped);
                Completion::Panicked
            }
        };

        let parent = self.complete(completion);
        drop(_enter);
        parent(self.clone(), completion);
    }

    fn schedule(self: Rc<Self>) {
        let state = self.header.state.get();
        if state.intersects(TaskState::COMPLETE | TaskState::SCHEDULED) {
            return;
        }
        self.header.state.set(state | TaskState::SCHEDULED);
        let this = Rc::clone(&self);
        self.header.executor.run_soon(move || this.poll());
    }

    fn cancel(self: Rc<Self>) {
        if self.header.state.get().contains(TaskState::COMPLETE) {
            return;
        }
        let _enter = self.header.span.enter();
        self.header.cancel.request();
        // cover tasks that were never polled and hold no waker yet
        drop(_enter);
        self.schedule();
    }

    fn is_complete(&self) -> bool {
        self.header.state.get().contains(TaskState::COMPLETE)
    }

    fn take_panic(&self) -> Option<Box<dyn Any + Send>> {
        let mut stage = self.stage.borrow_mut();
        if matches!(*stage, Stage::Panicked(_)) {
            let Stage::Panicked(payload) = core::mem::replace(&mut *stage, Stage::Consumed) else {
                unreachable!()
            };
            Some(payload)
        } else {
            None
        }
    }
}

impl<F> RcWake for Task<F>
where
    F: Future + 'static,
{
    fn wake_by_ref(self: &Rc<Self>) {
        Rc::clone(self).schedule();
    }
}

impl<F: Future> fmt::Debug for Task<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.header.id)
            .field("state", &self.header.state.get())
            .finish_non_exhaustive()
    }
}

/// A future that resolves immediately with `value`.
pub fn just<T>(value: T) -> Just<T> {
    Just(Some(value))
}

/// A future that resolves immediately with `()`.
pub fn noop() -> Just<()> {
    just(())
}

/// Future returned by [`just`] and [`noop`].
#[derive(Debug)]
pub struct Just<T>(Option<T>);

// === impl Just ===

// `Just` never pins its contents.
impl<T> Unpin for Just<T> {}

impl<T> Future for Just<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<T> {
        Poll::Ready(self.get_mut().0.take().expect("Just polled after completion"))
    }
}

/// Suspends once, handing control back to the executor, then resolves.
///
/// This is a full suspension point: a pending cancellation request is
/// delivered here.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`].
#[derive(Debug)]
pub struct YieldNow {
    yielded: bool,
}

// === impl YieldNow ===

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::LoopId;

    fn caller() -> &'static Location<'static> {
        Location::caller()
    }

    fn harness() -> Executor {
        Executor::new(LoopId::new(7))
    }

    #[test]
    fn runs_to_completion() {
        let exec = harness();
        let task = spawn(&exec, async { 6 * 7 }, caller(), None);

        Rc::clone(&task).schedule();
        exec.drain();

        assert!(task.is_complete());
        assert!(matches!(task.take_output(), Outcome::Value(42)));
    }

    #[test]
    fn yield_now_suspends_exactly_once() {
        let exec = harness();
        let polls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&polls);
        let task = spawn(
            &exec,
            async move {
                counter.set(counter.get() + 1);
                yield_now().await;
                counter.set(counter.get() + 1);
            },
            caller(),
            None,
        );

        Rc::clone(&task).schedule();
        exec.drain();

        assert!(task.is_complete());
        assert_eq!(polls.get(), 2);
    }

    #[test]
    fn cancellation_drops_the_future() {
        struct SetOnDrop(Rc<Cell<bool>>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }

        let exec = harness();
        let dropped = Rc::new(Cell::new(false));
        let flag = Rc::clone(&dropped);
        let task = spawn(
            &exec,
            async move {
                let _guard = SetOnDrop(flag);
                core::future::pending::<()>().await;
            },
            caller(),
            None,
        );

        Rc::clone(&task).schedule();
        exec.drain();
        assert!(!task.is_complete());

        Rc::clone(&task).cancel();
        exec.drain();

        assert!(task.is_complete());
        assert!(dropped.get());
        assert!(matches!(task.take_output(), Outcome::Cancelled));
    }

    #[test]
    fn completion_releases_the_task_allocation() {
        let exec = harness();
        let task = spawn(&exec, async { 11u32 }, caller(), None);
        let weak = Rc::downgrade(&task);

        Rc::clone(&task).schedule();
        exec.drain();
        assert!(task.is_complete());

        drop(task);
        assert!(weak.upgrade().is_none(), "completed tasks must not leak");
    }

    #[test]
    fn cancel_is_idempotent() {
        let exec = harness();
        let task = spawn(&exec, core::future::pending::<()>(), caller(), None);

        Rc::clone(&task).schedule();
        exec.drain();

        Rc::clone(&task).cancel();
        Rc::clone(&task).cancel();
        exec.drain();
        Rc::clone(&task).cancel();

        assert!(task.is_complete());
    }

    #[test]
    fn panic_is_captured() {
        let exec = harness();
        let task = spawn(
            &exec,
            async {
                panic!("boom");
            },
            caller(),
            None,
        );

        Rc::clone(&task).schedule();
        exec.drain();

        assert!(task.is_complete());
        let payload = task.take_panic().unwrap();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));
    }

    #[test]
    fn parent_callback_fires_once() {
        let exec = harness();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        let task = spawn(
            &exec,
            async { 1u32 },
            caller(),
            Some(Box::new(move |_task, completion| {
                log.borrow_mut().push(completion);
            })),
        );

        Rc::clone(&task).schedule();
        exec.drain();

        assert_eq!(*seen.borrow(), vec![Completion::Value]);
    }

    #[test]
    fn non_cancellable_defers_delivery() {
        struct Gate(Rc<Cell<bool>>);
        impl Future for Gate {
            type Output = ();
            fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
                if self.0.get() { Poll::Ready(()) } else { Poll::Pending }
            }
        }

        let exec = harness();
        let open = Rc::new(Cell::new(false));
        let cleaned = Rc::new(Cell::new(false));
        let gate = Gate(Rc::clone(&open));
        let flag = Rc::clone(&cleaned);
        let task = spawn(
            &exec,
            async move {
                crate::non_cancellable(async {
                    gate.await;
                    flag.set(true);
                })
                .await;
                core::future::pending::<()>().await;
            },
            caller(),
            None,
        );

        Rc::clone(&task).schedule();
        exec.drain();

        // cancel while the shielded section is parked on the gate
        Rc::clone(&task).cancel();
        exec.drain();
        assert!(!task.is_complete());
        assert!(!cleaned.get());

        open.set(true);
        Rc::clone(&task).schedule();
        exec.drain();

        assert!(task.is_complete());
        assert!(cleaned.get(), "shielded section must run to completion");
        assert!(matches!(task.take_output(), Outcome::Cancelled));
    }

    #[test]
    fn until_cancelled_runs_cleanup() {
        let exec = harness();
        let order = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&order);
        let task = spawn(
            &exec,
            async move {
                log.borrow_mut().push("start");
                crate::until_cancelled(async {
                    log.borrow_mut().push("cleanup");
                })
                .await;
                log.borrow_mut().push("after");
            },
            caller(),
            None,
        );

        Rc::clone(&task).schedule();
        exec.drain();
        assert_eq!(*order.borrow(), vec!["start"]);

        Rc::clone(&task).cancel();
        exec.drain();

        assert!(task.is_complete());
        assert_eq!(*order.borrow(), vec!["start", "cleanup", "after"]);
    }
}
