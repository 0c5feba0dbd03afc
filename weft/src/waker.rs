// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`Waker`]s backed by [`Rc`] reference counting.
//!
//! The runtime is single-threaded, so its wakers never leave the event-loop
//! thread. That lets us impersonate the [`RawWaker`] contract with plain
//! (non-atomic) reference counting: the waker's data pointer is an `Rc` in
//! disguise, and the vtable functions resurrect it just long enough to clone,
//! wake, or release it.

use core::task::{RawWaker, RawWakerVTable, Waker};
use std::rc::Rc;

/// A value that can be woken through an [`Rc`] handle.
pub(crate) trait RcWake: 'static {
    fn wake_by_ref(self: &Rc<Self>);
}

/// Builds a [`Waker`] whose wake operations forward to `rc`.
///
/// The returned waker (and all of its clones) must stay on the thread it was
/// created on; sending it elsewhere would race the non-atomic reference
/// count. All runtime wakers are confined to the event-loop thread, which
/// upholds this.
pub(crate) fn waker<W: RcWake>(rc: Rc<W>) -> Waker {
    // Safety: the vtable functions below maintain the Rc reference count
    // correctly, and the waker never leaves this thread (see above).
    unsafe { Waker::from_raw(raw_waker(rc)) }
}

fn raw_waker<W: RcWake>(rc: Rc<W>) -> RawWaker {
    RawWaker::new(Rc::into_raw(rc).cast::<()>(), vtable::<W>())
}

fn vtable<W: RcWake>() -> &'static RawWakerVTable {
    &RawWakerVTable::new(
        clone_raw::<W>,
        wake_raw::<W>,
        wake_by_ref_raw::<W>,
        drop_raw::<W>,
    )
}

/// # Safety
///
/// `ptr` must have been produced by [`raw_waker`] with the same `W`.
unsafe fn clone_raw<W: RcWake>(ptr: *const ()) -> RawWaker {
    // Safety: per the function contract, `ptr` is a live `Rc<W>`; we
    // increment its count without consuming the original reference.
    let rc = unsafe { Rc::from_raw(ptr.cast::<W>()) };
    let cloned = Rc::clone(&rc);
    core::mem::forget(rc);
    raw_waker(cloned)
}

/// # Safety
///
/// `ptr` must have been produced by [`raw_waker`] with the same `W`. Consumes
/// the reference.
unsafe fn wake_raw<W: RcWake>(ptr: *const ()) {
    // Safety: per the function contract; dropping `rc` releases the waker's
    // reference after waking.
    let rc = unsafe { Rc::from_raw(ptr.cast::<W>()) };
    W::wake_by_ref(&rc);
}

/// # Safety
///
/// `ptr` must have been produced by [`raw_waker`] with the same `W`.
unsafe fn wake_by_ref_raw<W: RcWake>(ptr: *const ()) {
    // Safety: per the function contract; `forget` keeps the waker's
    // reference alive.
    let rc = unsafe { Rc::from_raw(ptr.cast::<W>()) };
    W::wake_by_ref(&rc);
    core::mem::forget(rc);
}

/// # Safety
///
/// `ptr` must have been produced by [`raw_waker`] with the same `W`. Consumes
/// the reference.
unsafe fn drop_raw<W: RcWake>(ptr: *const ()) {
    // Safety: per the function contract; releases the waker's reference.
    drop(unsafe { Rc::from_raw(ptr.cast::<W>()) });
}
