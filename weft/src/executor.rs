// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Non-nesting deferred callback scheduler.
//!
//! An [`Executor`] owns a FIFO queue of callbacks bound to one event-loop
//! identity. Its core guarantee is that callbacks never nest: a callback runs
//! to completion before the next one starts, which gives cooperative tasks
//! deterministic scheduling semantics. A thread-local tracks the executor
//! that is currently draining so that [`Executor::run_soon`] can coalesce
//! work scheduled from inside a callback instead of draining re-entrantly,
//! even across distinct executors on the same thread.

use crate::runner::LoopId;
use core::cell::{Cell, RefCell};
use core::fmt;
use std::collections::VecDeque;
use std::rc::Rc;

type Callback = Box<dyn FnOnce()>;

/// Cheaply clonable handle to a callback queue bound to one event loop.
#[derive(Clone)]
pub struct Executor {
    inner: Rc<Inner>,
}

struct Inner {
    queue: RefCell<VecDeque<Callback>>,
    loop_id: LoopId,
    /// Set while this executor's drain loop is on the call stack.
    draining: Cell<bool>,
    /// Set while a "drain me" callback for this executor sits in another
    /// executor's queue, so we enqueue ourselves at most once.
    enqueued: Cell<bool>,
}

std::thread_local! {
    /// The executor currently draining on this thread, if any.
    static ACTIVE: RefCell<Option<Executor>> = const { RefCell::new(None) };
}

// === impl Executor ===

static_assertions::assert_not_impl_any!(Executor: Send, Sync);

impl Executor {
    /// Creates a fresh executor bound to the given event-loop identity.
    pub fn new(loop_id: LoopId) -> Self {
        Self {
            inner: Rc::new(Inner {
                queue: RefCell::new(VecDeque::new()),
                loop_id,
                draining: Cell::new(false),
                enqueued: Cell::new(false),
            }),
        }
    }

    /// The identity of the event loop this executor is bound to.
    pub fn loop_id(&self) -> LoopId {
        self.inner.loop_id
    }

    /// Appends a callback without arranging for it to run.
    pub fn schedule(&self, callback: impl FnOnce() + 'static) {
        tracing::trace!(loop_id = ?self.inner.loop_id, "Executor::schedule");
        self.inner.queue.borrow_mut().push_back(Box::new(callback));
    }

    /// Appends a callback and makes sure the drain loop will reach it.
    ///
    /// If this executor is already draining, the callback simply joins the
    /// queue. If *another* executor is draining on this thread, this executor
    /// enqueues itself as a single callback there, preserving the non-nesting
    /// guarantee across executors. Otherwise the queue is drained right away.
    pub fn run_soon(&self, callback: impl FnOnce() + 'static) {
        self.schedule(callback);

        let active = ACTIVE.with(|active| active.borrow().clone());
        match active {
            Some(active) if Rc::ptr_eq(&active.inner, &self.inner) => {
                // our own drain loop will pop the callback
            }
            Some(active) => {
                if !self.inner.enqueued.replace(true) {
                    tracing::trace!(
                        from = ?active.inner.loop_id,
                        to = ?self.inner.loop_id,
                        "deferring drain to the active executor",
                    );
                    let this = self.clone();
                    active.schedule(move || {
                        this.inner.enqueued.set(false);
                        this.drain();
                    });
                }
            }
            None => self.drain(),
        }
    }

    /// Pops and invokes callbacks until the queue is empty.
    ///
    /// Re-entrant calls are no-ops; callbacks scheduled while draining are
    /// appended and picked up by the loop that is already running.
    pub fn drain(&self) {
        if self.inner.draining.replace(true) {
            return;
        }
        let previous = ACTIVE.with(|active| active.borrow_mut().replace(self.clone()));

        loop {
            let callback = self.inner.queue.borrow_mut().pop_front();
            let Some(callback) = callback else { break };
            callback();
        }

        ACTIVE.with(|active| *active.borrow_mut() = previous);
        self.inner.draining.set(false);
    }

    /// Runs `f` with the ready queue redirected to a local queue, then runs
    /// the locally captured callbacks before restoring the original queue.
    ///
    /// Callbacks scheduled *by* the captured callbacks land in the restored
    /// main queue. Nurseries use this to cancel all children in one batch
    /// without racing child-list mutation.
    pub fn capture(&self, f: impl FnOnce()) {
        let saved = core::mem::take(&mut *self.inner.queue.borrow_mut());
        f();
        let captured = core::mem::replace(&mut *self.inner.queue.borrow_mut(), saved);

        tracing::trace!(callbacks = captured.len(), "Executor::capture batch");
        for callback in captured {
            callback();
        }
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.inner.queue.borrow().len()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Queued callbacks become no-ops: dropping them releases whatever
        // task handles they captured without resuming anything.
        let leftover = self.queue.borrow().len();
        if leftover > 0 {
            tracing::debug!(
                loop_id = ?self.loop_id,
                leftover,
                "executor dropped with callbacks still queued",
            );
        }
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("loop_id", &self.inner.loop_id)
            .field("queued", &self.inner.queue.borrow().len())
            .field("draining", &self.inner.draining.get())
            .finish()
    }
}
