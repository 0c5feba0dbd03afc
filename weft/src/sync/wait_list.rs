// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! FIFO waiter queue underlying every primitive in this module.
//!
//! A [`Waiter`] enqueues a node on first poll and consumes its wakeup on a
//! later poll. A woken node keeps its place in the queue until the wakeup is
//! consumed, so a latecomer that checks [`WaitList::is_empty`] cannot slip in
//! during the wake-to-poll window.
//!
//! The crucial edge case sits between wakeup and consumption: a waiter that
//! was woken and then dropped before it could act has swallowed a signal
//! someone else was meant to get. [`Waiter::cancel`] reports exactly this
//! case so the owning primitive can re-issue the signal.

use core::cell::{Cell, RefCell};
use core::task::{Context, Poll, Waker};
use std::collections::VecDeque;
use std::rc::Rc;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum NodeState {
    /// In the queue, waiting for a signal.
    Queued,
    /// Signalled; the wakeup has not been consumed yet.
    Woken,
    /// The waiter went away; skip this node when waking.
    Cancelled,
}

struct WaitNode {
    state: Cell<NodeState>,
    waker: RefCell<Option<Waker>>,
}

/// Queue of parked waiters, woken in FIFO order.
#[derive(Default)]
pub(crate) struct WaitList {
    queue: RefCell<VecDeque<Rc<WaitNode>>>,
}

// === impl WaitList ===

impl WaitList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Wakes the oldest waiter not yet signalled. Returns whether one was
    /// found. The node stays queued until the waiter consumes the wakeup.
    pub(crate) fn wake_one(&self) -> bool {
        let target = {
            let mut queue = self.queue.borrow_mut();
            while let Some(front) = queue.front() {
                if front.state.get() != NodeState::Cancelled {
                    break;
                }
                queue.pop_front();
            }
            queue
                .iter()
                .find(|node| node.state.get() == NodeState::Queued)
                .cloned()
        };
        let Some(node) = target else { return false };
        node.state.set(NodeState::Woken);
        // take the waker out before invoking it; waking can re-enter
        // this list through an executor drain
        let waker = node.waker.borrow_mut().take();
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    /// Wakes every parked waiter.
    pub(crate) fn wake_all(&self) -> usize {
        let pending: Vec<Rc<WaitNode>> = {
            let mut queue = self.queue.borrow_mut();
            queue.retain(|node| node.state.get() != NodeState::Cancelled);
            queue
                .iter()
                .filter(|node| node.state.get() == NodeState::Queued)
                .cloned()
                .collect()
        };
        let mut woken = 0;
        for node in pending {
            node.state.set(NodeState::Woken);
            let waker = node.waker.borrow_mut().take();
            if let Some(waker) = waker {
                waker.wake();
            }
            woken += 1;
        }
        woken
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue
            .borrow()
            .iter()
            .all(|node| node.state.get() == NodeState::Cancelled)
    }
}

/// One waiter's handle into a [`WaitList`]. Owned by the waiting future.
#[derive(Default)]
pub(crate) struct Waiter {
    node: Option<Rc<WaitNode>>,
}

// === impl Waiter ===

impl Waiter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Parks on `list` until woken. Enqueues on first call, refreshes the
    /// waker on subsequent calls, resolves once the wakeup arrives.
    pub(crate) fn poll_wait(&mut self, list: &WaitList, cx: &mut Context<'_>) -> Poll<()> {
        if let Some(node) = self.node.take() {
            match node.state.get() {
                NodeState::Woken => {
                    // consuming the wakeup gives up our place in the queue
                    list.queue
                        .borrow_mut()
                        .retain(|queued| !Rc::ptr_eq(queued, &node));
                    return Poll::Ready(());
                }
                NodeState::Queued => {
                    *node.waker.borrow_mut() = Some(cx.waker().clone());
                    self.node = Some(node);
                    return Poll::Pending;
                }
                NodeState::Cancelled => {
                    // fall through and re-enqueue
                }
            }
        }

        let node = Rc::new(WaitNode {
            state: Cell::new(NodeState::Queued),
            waker: RefCell::new(Some(cx.waker().clone())),
        });
        list.queue.borrow_mut().push_back(Rc::clone(&node));
        self.node = Some(node);
        Poll::Pending
    }

    /// Whether this waiter currently has a node in a list (queued or woken).
    pub(crate) fn is_registered(&self) -> bool {
        self.node.is_some()
    }

    /// Detaches from the list. Returns `true` if this waiter had consumed a
    /// wakeup it never acted on; the caller must then re-signal the list.
    pub(crate) fn cancel(&mut self) -> bool {
        let Some(node) = self.node.take() else {
            return false;
        };
        match node.state.get() {
            NodeState::Woken => {
                // the node still sits in the queue; mark it so wakes skip it
                node.state.set(NodeState::Cancelled);
                true
            }
            NodeState::Queued => {
                node.state.set(NodeState::Cancelled);
                node.waker.borrow_mut().take();
                false
            }
            NodeState::Cancelled => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::Wake;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn counting() -> (Arc<CountingWaker>, Waker) {
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(Arc::clone(&counter));
        (counter, waker)
    }

    #[test]
    fn wakes_in_fifo_order() {
        let list = WaitList::new();
        let (count_a, waker_a) = counting();
        let (count_b, waker_b) = counting();
        let mut cx_a = Context::from_waker(&waker_a);
        let mut cx_b = Context::from_waker(&waker_b);

        let mut a = Waiter::new();
        let mut b = Waiter::new();
        assert!(a.poll_wait(&list, &mut cx_a).is_pending());
        assert!(b.poll_wait(&list, &mut cx_b).is_pending());

        assert!(list.wake_one());
        assert_eq!(count_a.0.load(Ordering::Relaxed), 1);
        assert_eq!(count_b.0.load(Ordering::Relaxed), 0);
        assert!(a.poll_wait(&list, &mut cx_a).is_ready());

        assert!(list.wake_one());
        assert!(b.poll_wait(&list, &mut cx_b).is_ready());
        assert!(!list.wake_one());
    }

    #[test]
    fn cancelled_waiters_are_skipped() {
        let list = WaitList::new();
        let (_count_a, waker_a) = counting();
        let (_count_b, waker_b) = counting();
        let mut cx_a = Context::from_waker(&waker_a);
        let mut cx_b = Context::from_waker(&waker_b);

        let mut a = Waiter::new();
        let mut b = Waiter::new();
        assert!(a.poll_wait(&list, &mut cx_a).is_pending());
        assert!(b.poll_wait(&list, &mut cx_b).is_pending());

        assert!(!a.cancel(), "queued waiter consumed nothing");
        assert!(list.wake_one());
        assert!(b.poll_wait(&list, &mut cx_b).is_ready());
    }

    #[test]
    fn woken_waiters_hold_their_place_until_they_resume() {
        let list = WaitList::new();
        let (_count, waker) = counting();
        let mut cx = Context::from_waker(&waker);

        let mut waiter = Waiter::new();
        assert!(waiter.poll_wait(&list, &mut cx).is_pending());
        assert!(list.wake_one());

        // the wakeup is not consumed yet, so the list must not look empty
        assert!(!list.is_empty());
        assert!(!list.wake_one(), "a woken node cannot be woken again");

        assert!(waiter.poll_wait(&list, &mut cx).is_ready());
        assert!(list.is_empty());
    }

    #[test]
    fn dropping_a_woken_waiter_reports_the_lost_signal() {
        let list = WaitList::new();
        let (_count, waker) = counting();
        let mut cx = Context::from_waker(&waker);

        let mut waiter = Waiter::new();
        assert!(waiter.poll_wait(&list, &mut cx).is_pending());
        assert!(list.wake_one());

        assert!(waiter.cancel(), "the signal was consumed but never acted on");
    }
}
