// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Test harness: a deterministic event loop with virtual time.
//!
//! [`TestLoop`] implements [`EventLoop`] over a timer heap and a virtual
//! clock. `run` repeatedly pops the earliest timer, jumps the clock to its
//! deadline and fires its waker; when no timers remain (or `stop` was
//! called) it returns. Tests therefore run instantly while still exercising
//! real scheduling order.

use crate::runner::{EventLoop, LoopId};
use core::cell::{Cell, RefCell};
use core::cmp::{Ordering, Reverse};
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use core::time::Duration;
use std::collections::BinaryHeap;
use std::rc::Rc;
use tracing_subscriber::util::SubscriberInitExt;

pub(crate) fn trace_init() -> tracing::subscriber::DefaultGuard {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .set_default()
}

struct TimerEntry {
    deadline: Duration,
    seq: u64,
    waker: Waker,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

struct Inner {
    id: LoopId,
    now: Cell<Duration>,
    next_seq: Cell<u64>,
    timers: RefCell<BinaryHeap<Reverse<TimerEntry>>>,
    stop: Cell<bool>,
    running: Cell<bool>,
}

/// Deterministic virtual-time event loop for tests.
#[derive(Clone)]
pub(crate) struct TestLoop {
    inner: Rc<Inner>,
}

// === impl TestLoop ===

impl TestLoop {
    pub(crate) fn new() -> Self {
        std::thread_local! {
            static NEXT_ID: Cell<u64> = const { Cell::new(1) };
        }
        let id = NEXT_ID.with(|next| {
            let id = next.get();
            next.set(id + 1);
            id
        });
        Self {
            inner: Rc::new(Inner {
                id: LoopId::new(id),
                now: Cell::new(Duration::ZERO),
                next_seq: Cell::new(0),
                timers: RefCell::new(BinaryHeap::new()),
                stop: Cell::new(false),
                running: Cell::new(false),
            }),
        }
    }

    /// The current virtual time.
    pub(crate) fn now(&self) -> Duration {
        self.inner.now.get()
    }

    /// Suspends for `duration` of virtual time.
    pub(crate) fn sleep(&self, duration: Duration) -> Sleep {
        Sleep {
            lp: self.clone(),
            duration,
            deadline: None,
        }
    }

    fn arm(&self, deadline: Duration, waker: Waker) {
        let seq = self.inner.next_seq.get();
        self.inner.next_seq.set(seq + 1);
        self.inner.timers.borrow_mut().push(Reverse(TimerEntry {
            deadline,
            seq,
            waker,
        }));
    }
}

impl EventLoop for TestLoop {
    fn id(&self) -> LoopId {
        self.inner.id
    }

    fn run(&self) {
        self.inner.running.set(true);
        loop {
            if self.inner.stop.replace(false) {
                break;
            }
            let entry = self.inner.timers.borrow_mut().pop();
            let Some(Reverse(entry)) = entry else { break };
            self.inner.now.set(self.inner.now.get().max(entry.deadline));
            // waking outside any drain runs the task immediately
            entry.waker.wake();
        }
        self.inner.running.set(false);
    }

    fn stop(&self) {
        self.inner.stop.set(true);
    }

    fn is_running(&self) -> bool {
        self.inner.running.get()
    }
}

/// Future returned by [`TestLoop::sleep`].
pub(crate) struct Sleep {
    lp: TestLoop,
    duration: Duration,
    deadline: Option<Duration>,
}

// === impl Sleep ===

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let deadline = match self.deadline {
            Some(deadline) => deadline,
            None => {
                let deadline = self.lp.now() + self.duration;
                self.deadline = Some(deadline);
                deadline
            }
        };
        if self.lp.now() >= deadline {
            Poll::Ready(())
        } else {
            self.lp.arm(deadline, cx.waker().clone());
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::run;

    #[test]
    fn timers_fire_in_deadline_order() {
        let _trace = trace_init();
        let lp = TestLoop::new();
        let handle = lp.clone();
        let order = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&order);

        run(&lp, async move {
            let short = handle.sleep(Duration::from_millis(1));
            let long = handle.sleep(Duration::from_millis(4));
            crate::all_of((
                async {
                    long.await;
                    log.borrow_mut().push("long");
                },
                async {
                    short.await;
                    log.borrow_mut().push("short");
                },
            ))
            .await;
        });

        assert_eq!(*order.borrow(), vec!["short", "long"]);
        assert_eq!(lp.now(), Duration::from_millis(4));
    }

    #[test]
    fn zero_duration_sleep_is_ready_at_once() {
        let lp = TestLoop::new();
        let handle = lp.clone();
        run(&lp, async move {
            handle.sleep(Duration::ZERO).await;
        });
        assert_eq!(lp.now(), Duration::ZERO);
    }
}
