// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::sync::wait_list::{WaitList, Waiter};
use core::cell::{Cell, RefCell};
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

/// Fan-out channel: every value reaches every reader.
///
/// Values are reference-counted, so fan-out never clones the payload. Each
/// [`BroadcastReader`] has its own queue and consumes at its own pace; with a
/// bounded capacity the *slowest* reader applies backpressure to senders.
/// Readers only see values sent after they [`subscribe`][BroadcastChannel::subscribe]d.
/// Dropping a reader unsubscribes it and releases any backpressure it was
/// causing.
pub struct BroadcastChannel<T> {
    inner: Rc<Inner<T>>,
}

struct Inner<T> {
    readers: RefCell<Vec<Weak<ReaderInner<T>>>>,
    capacity: Option<usize>,
    closed: Cell<bool>,
    senders: WaitList,
}

struct ReaderInner<T> {
    queue: RefCell<VecDeque<Rc<T>>>,
    waiters: WaitList,
}

// === impl BroadcastChannel ===

impl<T> Clone for BroadcastChannel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> BroadcastChannel<T> {
    /// Creates a broadcast channel where each reader buffers at most
    /// `capacity` unread values.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn bounded(capacity: usize) -> Self {
        assert!(capacity > 0, "broadcast capacity must be at least 1");
        Self::with_capacity(Some(capacity))
    }

    /// Creates a broadcast channel without backpressure.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            inner: Rc::new(Inner {
                readers: RefCell::new(Vec::new()),
                capacity,
                closed: Cell::new(false),
                senders: WaitList::new(),
            }),
        }
    }

    /// Registers a new reader. It receives values sent from now on.
    pub fn subscribe(&self) -> BroadcastReader<T> {
        let reader = Rc::new(ReaderInner {
            queue: RefCell::new(VecDeque::new()),
            waiters: WaitList::new(),
        });
        self.inner.readers.borrow_mut().push(Rc::downgrade(&reader));
        BroadcastReader {
            channel: self.clone(),
            reader,
        }
    }

    /// Delivers `value` to every current reader, suspending while any
    /// reader's buffer is full. Resolves to `false` if the channel is closed
    /// before delivery.
    pub fn send(&self, value: T) -> Send<'_, T> {
        Send {
            channel: self,
            value: Some(value),
            waiter: Waiter::new(),
        }
    }

    /// Closes the channel: readers drain their queues and then see the end;
    /// pending and future sends fail. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.replace(true) {
            return;
        }
        self.inner.senders.wake_all();
        for reader in self.inner.live_readers() {
            reader.waiters.wake_all();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Readers currently subscribed.
    pub fn readers(&self) -> usize {
        self.inner.live_readers().len()
    }
}

impl<T> Inner<T> {
    /// Upgrades the reader registry, pruning readers that went away.
    fn live_readers(&self) -> Vec<Rc<ReaderInner<T>>> {
        let mut readers = self.readers.borrow_mut();
        readers.retain(|weak| weak.strong_count() > 0);
        readers.iter().filter_map(Weak::upgrade).collect()
    }

    fn has_backpressure(&self) -> bool {
        let Some(capacity) = self.capacity else {
            return false;
        };
        self.live_readers()
            .iter()
            .any(|reader| reader.queue.borrow().len() >= capacity)
    }
}

/// Future returned by [`BroadcastChannel::send`].
pub struct Send<'a, T> {
    channel: &'a BroadcastChannel<T>,
    value: Option<T>,
    waiter: Waiter,
}

// === impl Send ===

// the value travels by ownership, never by address
impl<T> Unpin for Send<'_, T> {}

static_assertions::assert_impl_all!(Send<'static, core::marker::PhantomPinned>: Unpin);

impl<T> Future for Send<'_, T> {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        let this = &mut *self;
        let inner = &this.channel.inner;
        let mut woken = false;
        loop {
            if inner.closed.get() {
                this.value = None;
                this.waiter.cancel();
                return Poll::Ready(false);
            }
            // a sender woken by a draining reader goes first; newcomers
            // queue up behind it
            if !inner.has_backpressure() && (woken || inner.senders.is_empty()) {
                let value = Rc::new(this.value.take().expect("Send polled after completion"));
                for reader in inner.live_readers() {
                    reader.queue.borrow_mut().push_back(Rc::clone(&value));
                    reader.waiters.wake_one();
                }
                this.waiter.cancel();
                if !inner.has_backpressure() {
                    // still room; let the next sender through
                    inner.senders.wake_one();
                }
                return Poll::Ready(true);
            }
            if this.waiter.poll_wait(&inner.senders, cx).is_pending() {
                return Poll::Pending;
            }
            woken = true;
        }
    }
}

impl<T> Drop for Send<'_, T> {
    fn drop(&mut self) {
        if self.waiter.cancel() {
            self.channel.inner.senders.wake_one();
        }
    }
}

/// One reader's view of a [`BroadcastChannel`].
pub struct BroadcastReader<T> {
    channel: BroadcastChannel<T>,
    reader: Rc<ReaderInner<T>>,
}

// === impl BroadcastReader ===

impl<T> BroadcastReader<T> {
    /// Receives the oldest undelivered value, or `None` once the channel is
    /// closed and this reader has drained its queue.
    pub fn recv(&self) -> Recv<'_, T> {
        Recv {
            reader: self,
            waiter: Waiter::new(),
        }
    }

    /// Values buffered for this reader.
    pub fn len(&self) -> usize {
        self.reader.queue.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reader.queue.borrow().is_empty()
    }
}

impl<T> Drop for BroadcastReader<T> {
    fn drop(&mut self) {
        // the registry entry dies with our Rc; a full queue disappearing may
        // unblock senders
        let backed_up = self
            .channel
            .inner
            .capacity
            .is_some_and(|capacity| self.reader.queue.borrow().len() >= capacity);
        if backed_up {
            self.channel.inner.senders.wake_all();
        }
    }
}

/// Future returned by [`BroadcastReader::recv`].
pub struct Recv<'a, T> {
    reader: &'a BroadcastReader<T>,
    waiter: Waiter,
}

// === impl Recv ===

impl<T> Future for Recv<'_, T> {
    type Output = Option<Rc<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Rc<T>>> {
        let this = &mut *self;
        let inner = &this.reader.channel.inner;
        loop {
            let (value, was_full) = {
                let mut queue = this.reader.reader.queue.borrow_mut();
                let was_full = inner
                    .capacity
                    .is_some_and(|capacity| queue.len() >= capacity);
                (queue.pop_front(), was_full)
            };
            if let Some(value) = value {
                if was_full {
                    inner.senders.wake_one();
                }
                this.waiter.cancel();
                return Poll::Ready(Some(value));
            }
            if inner.closed.get() {
                this.waiter.cancel();
                return Poll::Ready(None);
            }
            if this
                .waiter
                .poll_wait(&this.reader.reader.waiters, cx)
                .is_pending()
            {
                return Poll::Pending;
            }
        }
    }
}

impl<T> Drop for Recv<'_, T> {
    fn drop(&mut self) {
        if self.waiter.cancel() {
            self.reader.reader.waiters.wake_one();
        }
    }
}
