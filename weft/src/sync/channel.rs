// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::{TryRecvError, TrySendError};
use crate::sync::wait_list::{WaitList, Waiter};
use core::cell::{Cell, RefCell};
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::collections::VecDeque;
use std::rc::Rc;

/// Multi-producer multi-consumer FIFO channel.
///
/// Cloning the channel clones a handle to the same buffer; any handle may
/// send, receive or [`close`][Channel::close]. A bounded channel applies
/// backpressure: senders suspend while the buffer is full. Values travel in
/// strict send order.
///
/// Cancel safety: a value only leaves the sender when it enters the buffer,
/// both inside a single `poll`. A cancelled [`send`][Channel::send] either
/// delivered its value or still owns it (and drops it); a cancelled
/// [`recv`][Channel::recv] either returned a value or took nothing. Wakeups
/// consumed by a cancelled waiter are re-signalled to the next one.
pub struct Channel<T> {
    inner: Rc<Inner<T>>,
}

struct Inner<T> {
    buffer: RefCell<VecDeque<T>>,
    capacity: Option<usize>,
    closed: Cell<bool>,
    /// Senders waiting for buffer space.
    senders: WaitList,
    /// Receivers waiting for a value.
    receivers: WaitList,
}

// === impl Channel ===

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> Channel<T> {
    /// Creates a channel holding at most `capacity` values.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero. A rendezvous hand-off cannot be
    /// expressed in this runtime, where a cancelled receiver must not be
    /// able to strand a value outside any buffer.
    #[must_use]
    pub fn bounded(capacity: usize) -> Self {
        assert!(capacity > 0, "channel capacity must be at least 1");
        Self::with_capacity(Some(capacity))
    }

    /// Creates a channel with no backpressure; `send` never suspends.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            inner: Rc::new(Inner {
                buffer: RefCell::new(VecDeque::new()),
                capacity,
                closed: Cell::new(false),
                senders: WaitList::new(),
                receivers: WaitList::new(),
            }),
        }
    }

    /// Sends `value`, suspending while the buffer is full. Resolves to
    /// `true` once the value is buffered, or `false` (dropping the value) if
    /// the channel is closed first.
    pub fn send(&self, value: T) -> Send<'_, T> {
        Send {
            channel: self,
            value: Some(value),
            waiter: Waiter::new(),
        }
    }

    /// Receives the oldest value, suspending while the buffer is empty.
    /// Resolves to `None` once the channel is closed and drained.
    pub fn recv(&self) -> Recv<'_, T> {
        Recv {
            channel: self,
            waiter: Waiter::new(),
        }
    }

    /// Non-suspending send. Fails with [`TrySendError::Full`] while senders
    /// are parked, even if a slot just opened up: freed slots belong to the
    /// oldest waiting sender.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        if self.inner.closed.get() {
            return Err(TrySendError::Closed(value));
        }
        if self.is_full() || !self.inner.senders.is_empty() {
            return Err(TrySendError::Full(value));
        }
        self.inner.buffer.borrow_mut().push_back(value);
        self.inner.receivers.wake_one();
        Ok(())
    }

    /// Non-suspending receive.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        let value = self.inner.buffer.borrow_mut().pop_front();
        match value {
            Some(value) => {
                self.inner.senders.wake_one();
                Ok(value)
            }
            None if self.inner.closed.get() => Err(TryRecvError::Closed),
            None => Err(TryRecvError::Empty),
        }
    }

    /// Closes the channel. Buffered values can still be received; pending
    /// and future sends fail. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.replace(true) {
            return;
        }
        tracing::trace!(buffered = self.len(), "channel closed");
        self.inner.senders.wake_all();
        self.inner.receivers.wake_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    pub fn len(&self) -> usize {
        self.inner.buffer.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.buffer.borrow().is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.inner.capacity
    }

    /// Whether the buffer is at capacity. Always `false` for unbounded
    /// channels.
    pub fn is_full(&self) -> bool {
        self.inner
            .capacity
            .is_some_and(|capacity| self.inner.buffer.borrow().len() >= capacity)
    }
}

/// Future returned by [`Channel::send`].
pub struct Send<'a, T> {
    channel: &'a Channel<T>,
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
            // a freed slot belongs to the sender it woke; a newcomer may
            // only commit when nobody is parked ahead of it
            if !this.channel.is_full() && (woken || inner.senders.is_empty()) {
                let value = this.value.take().expect("Send polled after completion");
                inner.buffer.borrow_mut().push_back(value);
                inner.receivers.wake_one();
                this.waiter.cancel();
                if !this.channel.is_full() {
                    // room to spare; let the next sender through
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
            // a slot was promised to us; offer it to the next sender
            self.channel.inner.senders.wake_one();
        }
    }
}

/// Future returned by [`Channel::recv`].
pub struct Recv<'a, T> {
    channel: &'a Channel<T>,
    waiter: Waiter,
}

// === impl Recv ===

impl<T> Future for Recv<'_, T> {
    type Output = Option<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = &mut *self;
        let inner = &this.channel.inner;
        loop {
            let value = inner.buffer.borrow_mut().pop_front();
            if let Some(value) = value {
                inner.senders.wake_one();
                this.waiter.cancel();
                return Poll::Ready(Some(value));
            }
            if inner.closed.get() {
                this.waiter.cancel();
                return Poll::Ready(None);
            }
            if this.waiter.poll_wait(&inner.receivers, cx).is_pending() {
                return Poll::Pending;
            }
        }
    }
}

impl<T> Drop for Recv<'_, T> {
    fn drop(&mut self) {
        if self.waiter.cancel() {
            // a value arrived for us; let another receiver take it
            self.channel.inner.receivers.wake_one();
        }
    }
}
