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

/// Counting semaphore.
///
/// [`release`][Semaphore::release] hands its permit directly to the oldest
/// waiter instead of returning it to the pool, so waiters are served in FIFO
/// order and a release can never be overtaken by a latecomer calling
/// [`try_acquire`][Semaphore::try_acquire]. If a waiter is cancelled after
/// the hand-off but before resuming, its `Drop` re-releases the permit.
///
/// With an initial count of one this is a mutex; see [`lock`][Semaphore::lock].
pub struct Semaphore {
    permits: Cell<usize>,
    waiters: WaitList,
}

// === impl Semaphore ===

impl Semaphore {
    #[must_use]
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Cell::new(permits),
            waiters: WaitList::new(),
        }
    }

    /// Permits currently in the pool (not counting ones in hand-off).
    pub fn available(&self) -> usize {
        self.permits.get()
    }

    /// Takes a permit if one is available.
    pub fn try_acquire(&self) -> bool {
        let permits = self.permits.get();
        if permits > 0 && self.waiters.is_empty() {
            self.permits.set(permits - 1);
            true
        } else {
            false
        }
    }

    /// Takes a permit, suspending until one is available. The caller is
    /// responsible for releasing it.
    pub fn acquire(&self) -> Acquire<'_> {
        Acquire {
            semaphore: self,
            waiter: Waiter::new(),
        }
    }

    /// Returns one permit, waking the oldest waiter if any.
    pub fn release(&self) {
        if !self.waiters.wake_one() {
            self.permits.set(self.permits.get() + 1);
        }
    }

    /// Acquires a permit held by an RAII guard; releasing happens on drop.
    pub fn lock(&self) -> Lock<'_> {
        Lock {
            acquire: self.acquire(),
        }
    }
}

/// Future returned by [`Semaphore::acquire`].
pub struct Acquire<'a> {
    semaphore: &'a Semaphore,
    waiter: Waiter,
}

// === impl Acquire ===

impl Future for Acquire<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = &mut *self;
        if this.waiter.is_registered() {
            // resolving here means a released permit was handed straight to
            // us; checking the pool instead could double-acquire
            return this.waiter.poll_wait(&this.semaphore.waiters, cx);
        }
        if this.semaphore.try_acquire() {
            return Poll::Ready(());
        }
        this.waiter.poll_wait(&this.semaphore.waiters, cx)
    }
}

impl Drop for Acquire<'_> {
    fn drop(&mut self) {
        if self.waiter.cancel() {
            // we held a handed-off permit without ever resuming
            self.semaphore.release();
        }
    }
}

/// Future returned by [`Semaphore::lock`].
pub struct Lock<'a> {
    acquire: Acquire<'a>,
}

// === impl Lock ===

impl<'a> Future for Lock<'a> {
    type Output = SemaphoreGuard<'a>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<SemaphoreGuard<'a>> {
        let this = &mut *self;
        core::task::ready!(Pin::new(&mut this.acquire).poll(cx));
        Poll::Ready(SemaphoreGuard {
            semaphore: this.acquire.semaphore,
        })
    }
}

/// Permit held until dropped.
#[must_use = "dropping the guard releases the permit immediately"]
pub struct SemaphoreGuard<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nursery::{JoinMode, nursery};
    use crate::runner::run;
    use crate::test_util::TestLoop;
    use core::cell::RefCell;
    use core::time::Duration;
    use std::rc::Rc;

    #[test]
    fn try_acquire_exhausts_the_pool() {
        let sem = Semaphore::new(2);
        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());

        sem.release();
        assert_eq!(sem.available(), 1);
        assert!(sem.try_acquire());
    }

    #[test]
    fn lock_serializes_critical_sections() {
        let lp = TestLoop::new();
        let handle = lp.clone();
        let trace = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&trace);

        run(&lp, async move {
            let sem = Rc::new(Semaphore::new(1));
            nursery(|n| {
                for name in ["a", "b"] {
                    let sem = Rc::clone(&sem);
                    let log = Rc::clone(&log);
                    let lp = handle.clone();
                    n.start(async move {
                        let _guard = sem.lock().await;
                        log.borrow_mut().push(format!("{name} enter"));
                        lp.sleep(Duration::from_millis(2)).await;
                        log.borrow_mut().push(format!("{name} exit"));
                    });
                }
                async { JoinMode::Join }
            })
            .await;
        });

        assert_eq!(
            *trace.borrow(),
            vec!["a enter", "a exit", "b enter", "b exit"],
        );
        assert_eq!(lp.now(), Duration::from_millis(4));
    }

    #[test]
    fn release_hands_off_in_fifo_order() {
        let lp = TestLoop::new();
        let handle = lp.clone();
        let order = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&order);

        run(&lp, async move {
            let sem = Rc::new(Semaphore::new(0));
            nursery(|n| {
                for name in ["first", "second"] {
                    let sem = Rc::clone(&sem);
                    let log = Rc::clone(&log);
                    n.start(async move {
                        sem.acquire().await;
                        log.borrow_mut().push(name);
                    });
                }
                let sem = Rc::clone(&sem);
                let pause = handle.sleep(Duration::from_millis(1));
                async move {
                    pause.await;
                    sem.release();
                    sem.release();
                    JoinMode::Join
                }
            })
            .await;
        });

        assert_eq!(*order.borrow(), vec!["first", "second"]);
    }

    #[test]
    fn cancelled_acquirer_returns_the_permit() {
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        let sem = Semaphore::new(0);
        let mut first = sem.acquire();
        let mut second = sem.acquire();
        assert!(Pin::new(&mut first).poll(&mut cx).is_pending());
        assert!(Pin::new(&mut second).poll(&mut cx).is_pending());

        // the permit is handed to `first`, which is cancelled before it can
        // resume; the permit must reach `second`
        sem.release();
        drop(first);

        assert!(Pin::new(&mut second).poll(&mut cx).is_ready());
        assert_eq!(sem.available(), 0);
    }
}
