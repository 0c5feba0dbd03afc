// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::wait_list::{WaitList, Waiter};
use core::cell::{Cell, RefCell};
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::rc::Rc;

/// An observable cell.
///
/// Writers mutate the value through [`set`][Value::set], [`replace`][Value::replace]
/// or [`update`][Value::update]; observers suspend until the value changes,
/// reaches a target, or satisfies a predicate. Observers are level-triggered:
/// they look at the value itself on every wakeup, so intermediate states that
/// are overwritten in the same turn may be skipped but a final state is never
/// missed.
///
/// Only mutations that actually change the value (per `PartialEq`) notify
/// observers.
pub struct Value<T> {
    inner: Rc<Inner<T>>,
}

struct Inner<T> {
    current: RefCell<T>,
    /// Bumped on every observed change; lets `until_changed` detect changes
    /// it did not witness.
    version: Cell<u64>,
    watchers: WaitList,
}

// === impl Value ===

impl<T> Clone for Value<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> Value<T> {
    pub fn new(initial: T) -> Self {
        Self {
            inner: Rc::new(Inner {
                current: RefCell::new(initial),
                version: Cell::new(0),
                watchers: WaitList::new(),
            }),
        }
    }

    /// Reads the current value.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.inner.current.borrow().clone()
    }

    /// Inspects the current value without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.current.borrow())
    }

    /// Stores `value`, notifying observers if it differs from the current
    /// one.
    pub fn set(&self, value: T)
    where
        T: PartialEq,
    {
        let changed = {
            let mut current = self.inner.current.borrow_mut();
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        };
        if changed {
            self.changed();
        }
    }

    /// Stores `value` and returns the previous one, notifying observers on
    /// change.
    pub fn replace(&self, value: T) -> T
    where
        T: PartialEq,
    {
        let (old, changed) = {
            let mut current = self.inner.current.borrow_mut();
            let changed = *current != value;
            (core::mem::replace(&mut *current, value), changed)
        };
        if changed {
            self.changed();
        }
        old
    }

    /// Mutates the value in place, notifying observers if the mutation
    /// changed it.
    pub fn update(&self, f: impl FnOnce(&mut T))
    where
        T: Clone + PartialEq,
    {
        let changed = {
            let mut current = self.inner.current.borrow_mut();
            let before = current.clone();
            f(&mut current);
            *current != before
        };
        if changed {
            self.changed();
        }
    }

    /// Resolves with the new value at the next change after this call.
    pub fn until_changed(&self) -> UntilChanged<'_, T> {
        UntilChanged {
            value: self,
            baseline: self.inner.version.get(),
            waiter: Waiter::new(),
        }
    }

    /// Resolves once the value equals `target`; immediately if it already
    /// does.
    pub fn until_equals(&self, target: T) -> UntilMatches<'_, T, impl Fn(&T) -> bool>
    where
        T: PartialEq,
    {
        self.until_matches(move |current| *current == target)
    }

    /// Resolves with a copy of the value once `predicate` holds for it;
    /// immediately if it already does.
    pub fn until_matches<P>(&self, predicate: P) -> UntilMatches<'_, T, P>
    where
        P: Fn(&T) -> bool,
    {
        UntilMatches {
            value: self,
            predicate,
            waiter: Waiter::new(),
        }
    }

    fn changed(&self) {
        self.inner.version.set(self.inner.version.get() + 1);
        self.inner.watchers.wake_all();
    }
}

/// Future returned by [`Value::until_changed`].
pub struct UntilChanged<'a, T> {
    value: &'a Value<T>,
    baseline: u64,
    waiter: Waiter,
}

// === impl UntilChanged ===

impl<T: Clone> Future for UntilChanged<'_, T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = &mut *self;
        loop {
            if this.value.inner.version.get() != this.baseline {
                this.waiter.cancel();
                return Poll::Ready(this.value.get());
            }
            if this
                .waiter
                .poll_wait(&this.value.inner.watchers, cx)
                .is_pending()
            {
                return Poll::Pending;
            }
        }
    }
}

/// Future returned by [`Value::until_matches`] and [`Value::until_equals`].
pub struct UntilMatches<'a, T, P> {
    value: &'a Value<T>,
    predicate: P,
    waiter: Waiter,
}

// === impl UntilMatches ===

// the predicate is only ever called, never pinned
impl<T, P> Unpin for UntilMatches<'_, T, P> {}

static_assertions::assert_impl_all!(
    UntilMatches<'static, u32, core::marker::PhantomPinned>: Unpin
);

impl<T, P> Future for UntilMatches<'_, T, P>
where
    T: Clone,
    P: Fn(&T) -> bool,
{
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = &mut *self;
        loop {
            if this.value.with(|current| (this.predicate)(current)) {
                this.waiter.cancel();
                return Poll::Ready(this.value.get());
            }
            if this
                .waiter
                .poll_wait(&this.value.inner.watchers, cx)
                .is_pending()
            {
                return Poll::Pending;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nursery::{JoinMode, nursery};
    use crate::runner::run;
    use crate::test_util::TestLoop;
    use core::time::Duration;

    #[test]
    fn set_to_equal_value_does_not_notify() {
        let value = Value::new(3u32);
        value.set(3);
        assert_eq!(value.inner.version.get(), 0);
        value.set(4);
        assert_eq!(value.inner.version.get(), 1);
    }

    #[test]
    fn until_changed_sees_the_next_write() {
        let lp = TestLoop::new();
        let handle = lp.clone();

        let seen = run(&lp, async move {
            let value = Value::new(0u32);
            let seen = Rc::new(Cell::new(0));
            nursery(|n| {
                let watched = value.clone();
                let out = Rc::clone(&seen);
                n.start(async move {
                    out.set(watched.until_changed().await);
                });
                let value = value.clone();
                let pause = handle.sleep(Duration::from_millis(1));
                async move {
                    pause.await;
                    value.set(17);
                    JoinMode::Join
                }
            })
            .await;
            seen.get()
        });

        assert_eq!(seen, 17);
    }

    #[test]
    fn until_equals_resolves_immediately_when_already_there() {
        let lp = TestLoop::new();
        run(&lp, async move {
            let value = Value::new("ready");
            value.until_equals("ready").await;
        });
        assert_eq!(lp.now(), Duration::ZERO);
    }

    #[test]
    fn until_matches_ignores_intermediate_values() {
        let lp = TestLoop::new();
        let handle = lp.clone();

        let hit = run(&lp, async move {
            let value = Value::new(0u32);
            let hit = Rc::new(Cell::new(0));
            nursery(|n| {
                let watched = value.clone();
                let out = Rc::clone(&hit);
                n.start(async move {
                    out.set(watched.until_matches(|v| *v >= 10).await);
                });
                let value = value.clone();
                let lp = handle.clone();
                async move {
                    for step in [2u32, 5, 12] {
                        lp.sleep(Duration::from_millis(1)).await;
                        value.set(step);
                    }
                    JoinMode::Join
                }
            })
            .await;
            hit.get()
        });

        assert_eq!(hit, 12);
    }

    #[test]
    fn update_notifies_only_on_real_change() {
        let value = Value::new(vec![1u32]);
        value.update(|v| v.push(2));
        assert_eq!(value.inner.version.get(), 1);
        value.update(|_| {});
        assert_eq!(value.inner.version.get(), 1);
        assert_eq!(value.get(), vec![1, 2]);
    }
}
