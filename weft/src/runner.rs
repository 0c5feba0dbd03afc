// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Drives a root future on top of a host-provided event loop.
//!
//! The runtime owns no clock and no I/O. [`run`] spawns the root future as a
//! task, hands control to [`EventLoop::run`], and relies on host awaitables
//! (timers, I/O readiness) to wake tasks through their [`Waker`]s. When the
//! root task completes, the runner stops the loop and extracts the output.
//!
//! [`Waker`]: core::task::Waker

use crate::executor::Executor;
use crate::task::{self, Outcome, RawTask};
use core::cell::RefCell;
use core::fmt;
use core::future::Future;
use core::panic::Location;
use std::rc::Rc;

/// Identity of a host event loop.
///
/// Two loops with the same id are the same loop; executors use this to tell
/// whether work is being scheduled across loops.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct LoopId(u64);

// === impl LoopId ===

impl LoopId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LoopId({})", self.0)
    }
}

/// The host's event loop, as seen by the runtime.
///
/// Implementations provide whatever awaitables make sense for the host
/// (timers, frame callbacks, sockets); the runtime only needs to start and
/// stop the loop. `stop` may be called before `run`, in which case the next
/// `run` must return immediately.
pub trait EventLoop {
    fn id(&self) -> LoopId;

    /// Blocks until [`stop`][EventLoop::stop] is called.
    fn run(&self);

    /// Makes the current (or next) [`run`][EventLoop::run] return once the
    /// host reaches a safe point.
    fn stop(&self);

    /// Whether the loop is currently inside [`run`][EventLoop::run].
    fn is_running(&self) -> bool;
}

std::thread_local! {
    /// Loops currently inside [`run`] on this thread.
    static RUNNING: RefCell<Vec<LoopId>> = const { RefCell::new(Vec::new()) };
}

struct RunningGuard(LoopId);

impl RunningGuard {
    fn enter(id: LoopId) -> Self {
        RUNNING.with(|running| {
            let mut running = running.borrow_mut();
            assert!(
                !running.contains(&id),
                "run() called re-entrantly on event loop {id:?}",
            );
            running.push(id);
        });
        Self(id)
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        RUNNING.with(|running| running.borrow_mut().retain(|id| *id != self.0));
    }
}

/// Runs `future` as the root task of `event_loop` and returns its output.
///
/// Blocks the calling thread until the future completes. If the future
/// panics, the panic is resumed on the caller. If the host loop stops before
/// the future completes, the runner attempts one cancellation round to wind
/// the task tree down; a task that refuses to finish even then is a bug in
/// the program, and the runner panics rather than leak it.
///
/// # Panics
///
/// Panics when called re-entrantly for the same event loop, and when the
/// loop stops with the root task still pending (see above).
#[track_caller]
pub fn run<L, F>(event_loop: &L, future: F) -> F::Output
where
    L: EventLoop + Clone + 'static,
    F: Future + 'static,
{
    let location = Location::caller();
    let _guard = RunningGuard::enter(event_loop.id());

    let executor = Executor::new(event_loop.id());
    let stopper = event_loop.clone();
    let task = task::spawn(
        &executor,
        future,
        location,
        Some(Box::new(move |_task, _completion| stopper.stop())),
    );

    Rc::clone(&task).schedule();
    executor.drain();

    if !task.is_complete() {
        event_loop.run();
        executor.drain();
    }

    if !task.is_complete() {
        tracing::debug!("event loop stopped early, cancelling the root task");
        Rc::clone(&task).cancel();
        executor.drain();
    }

    match task.take_output() {
        Outcome::Value(value) => value,
        Outcome::Panicked(payload) => std::panic::resume_unwind(payload),
        Outcome::Cancelled | Outcome::Pending => {
            panic!("event loop stopped before the awaitable completed")
        }
    }
}
