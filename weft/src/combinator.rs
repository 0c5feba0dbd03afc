// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Futures that multiplex other futures.
//!
//! [`any_of`] resolves when the first branch resolves and drops the rest,
//! [`all_of`] waits for every branch, and [`most_of`] waits for every branch
//! but resolves early with partial results if the surrounding task is
//! cancelled. Each comes in a tuple form (up to six heterogeneous branches)
//! and an iterator form over homogeneous branches. [`then`] sequences two
//! futures where the second is built from the first's output.
//!
//! Dropping a combinator drops its unfinished branches, which is how branch
//! cancellation composes with task cancellation: no extra protocol needed.

use crate::cancel::ShieldGuard;
use crate::task;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use pin_project::pin_project;

/// A future that may already have resolved, keeping its output until taken.
#[pin_project(project = MaybeDoneProj, project_replace = MaybeDoneProjReplace)]
pub enum MaybeDone<F: Future> {
    Pending(#[pin] F),
    Done(F::Output),
    Taken,
}

// === impl MaybeDone ===

impl<F: Future> MaybeDone<F> {
    /// Polls the inner future if it is still pending. Returns whether an
    /// output is now stored.
    fn poll_done(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> bool {
        if let MaybeDoneProj::Pending(future) = self.as_mut().project() {
            match future.poll(cx) {
                Poll::Ready(output) => self.set(Self::Done(output)),
                Poll::Pending => return false,
            }
        }
        !matches!(*self, Self::Pending(_))
    }

    /// Removes the stored output, dropping the future if it never resolved.
    fn take(mut self: Pin<&mut Self>) -> Option<F::Output> {
        match self.as_mut().project_replace(Self::Taken) {
            MaybeDoneProjReplace::Done(output) => Some(output),
            MaybeDoneProjReplace::Pending(_) | MaybeDoneProjReplace::Taken => None,
        }
    }
}

/// Resolves as soon as any branch resolves, dropping the others.
///
/// The output mirrors the input tuple with each position `Some` if that
/// branch resolved in the final poll round and `None` if it was dropped
/// unfinished. Simultaneously ready branches all report `Some`.
pub fn any_of<T: FutureTuple>(futures: T) -> T::AnyOf {
    futures.any_of()
}

/// Resolves once every branch has resolved, yielding all outputs.
pub fn all_of<T: FutureTuple>(futures: T) -> T::AllOf {
    futures.all_of()
}

/// Like [`all_of`], but if the surrounding task is cancelled it resolves
/// early with the outputs collected so far (`None` for unfinished branches)
/// instead of being dropped.
///
/// The combinator shields the task while it runs so the partial results can
/// be delivered; the pending cancellation lands at the next unshielded
/// suspension point afterwards.
pub fn most_of<T: FutureTuple>(futures: T) -> T::MostOf {
    futures.most_of()
}

/// Heterogeneous bundles of futures accepted by the tuple combinators.
pub trait FutureTuple {
    type AnyOf: Future;
    type AllOf: Future;
    type MostOf: Future;

    fn any_of(self) -> Self::AnyOf;
    fn all_of(self) -> Self::AllOf;
    fn most_of(self) -> Self::MostOf;
}

macro_rules! tuple_combinators {
    ($AnyOf:ident, $AllOf:ident, $MostOf:ident => $(($F:ident, $f:ident)),+) => {
        /// Future returned by [`any_of`] for this tuple arity.
        #[pin_project]
        pub struct $AnyOf<$($F: Future),+> {
            $( #[pin] $f: MaybeDone<$F>, )+
        }

        /// Future returned by [`all_of`] for this tuple arity.
        #[pin_project]
        pub struct $AllOf<$($F: Future),+> {
            $( #[pin] $f: MaybeDone<$F>, )+
        }

        /// Future returned by [`most_of`] for this tuple arity.
        #[pin_project]
        pub struct $MostOf<$($F: Future),+> {
            $( #[pin] $f: MaybeDone<$F>, )+
            guard: Option<ShieldGuard>,
            started: bool,
        }

        impl<$($F: Future),+> FutureTuple for ($($F,)+) {
            type AnyOf = $AnyOf<$($F),+>;
            type AllOf = $AllOf<$($F),+>;
            type MostOf = $MostOf<$($F),+>;

            fn any_of(self) -> Self::AnyOf {
                let ($($f,)+) = self;
                $AnyOf { $($f: MaybeDone::Pending($f),)+ }
            }

            fn all_of(self) -> Self::AllOf {
                let ($($f,)+) = self;
                $AllOf { $($f: MaybeDone::Pending($f),)+ }
            }

            fn most_of(self) -> Self::MostOf {
                let ($($f,)+) = self;
                $MostOf {
                    $($f: MaybeDone::Pending($f),)+
                    guard: None,
                    started: false,
                }
            }
        }

        impl<$($F: Future),+> Future for $AnyOf<$($F),+> {
            type Output = ($(Option<$F::Output>,)+);

            fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
                let mut this = self.project();
                let mut any_done = false;
                $( any_done |= this.$f.as_mut().poll_done(cx); )+
                if any_done {
                    Poll::Ready(($( this.$f.as_mut().take(), )+))
                } else {
                    Poll::Pending
                }
            }
        }

        impl<$($F: Future),+> Future for $AllOf<$($F),+> {
            type Output = ($($F::Output,)+);

            fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
                let mut this = self.project();
                let mut all_done = true;
                $( all_done &= this.$f.as_mut().poll_done(cx); )+
                if all_done {
                    Poll::Ready((
                        $( this.$f.as_mut().take().expect("branch reported done"), )+
                    ))
                } else {
                    Poll::Pending
                }
            }
        }

        impl<$($F: Future),+> Future for $MostOf<$($F),+> {
            type Output = ($(Option<$F::Output>,)+);

            fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
                let mut this = self.project();
                if !*this.started {
                    *this.started = true;
                    *this.guard = ShieldGuard::for_current_task();
                }

                let mut all_done = true;
                $( all_done &= this.$f.as_mut().poll_done(cx); )+

                let cancelled =
                    task::current_cancel().is_some_and(|cancel| cancel.is_requested());
                if all_done || cancelled {
                    *this.guard = None;
                    Poll::Ready(($( this.$f.as_mut().take(), )+))
                } else {
                    Poll::Pending
                }
            }
        }
    };
}

tuple_combinators!(AnyOf1, AllOf1, MostOf1 => (F1, f1));
tuple_combinators!(AnyOf2, AllOf2, MostOf2 => (F1, f1), (F2, f2));
tuple_combinators!(AnyOf3, AllOf3, MostOf3 => (F1, f1), (F2, f2), (F3, f3));
tuple_combinators!(AnyOf4, AllOf4, MostOf4 => (F1, f1), (F2, f2), (F3, f3), (F4, f4));
tuple_combinators!(AnyOf5, AllOf5, MostOf5 => (F1, f1), (F2, f2), (F3, f3), (F4, f4), (F5, f5));
tuple_combinators!(AnyOf6, AllOf6, MostOf6 => (F1, f1), (F2, f2), (F3, f3), (F4, f4), (F5, f5), (F6, f6));

/// Pins each element of an already-pinned slice.
fn iter_pin_mut<F: Future>(
    slice: Pin<&mut [MaybeDone<F>]>,
) -> impl Iterator<Item = Pin<&mut MaybeDone<F>>> {
    // Safety: the slice is pinned and never moved out of, so its elements
    // are structurally pinned.
    unsafe { slice.get_unchecked_mut() }
        .iter_mut()
        // Safety: see above
        .map(|f| unsafe { Pin::new_unchecked(f) })
}

/// Homogeneous [`any_of`]: resolves when the first branch resolves.
pub fn any_of_iter<I>(futures: I) -> AnyOfIter<I::Item>
where
    I: IntoIterator,
    I::Item: Future,
{
    AnyOfIter {
        futures: futures
            .into_iter()
            .map(MaybeDone::Pending)
            .collect::<Box<[_]>>()
            .into(),
    }
}

/// Homogeneous [`all_of`]: resolves once every branch has resolved.
pub fn all_of_iter<I>(futures: I) -> AllOfIter<I::Item>
where
    I: IntoIterator,
    I::Item: Future,
{
    AllOfIter {
        futures: futures
            .into_iter()
            .map(MaybeDone::Pending)
            .collect::<Box<[_]>>()
            .into(),
    }
}

/// Homogeneous [`most_of`]: waits for every branch, resolving early with
/// partial results if the task is cancelled.
pub fn most_of_iter<I>(futures: I) -> MostOfIter<I::Item>
where
    I: IntoIterator,
    I::Item: Future,
{
    MostOfIter {
        futures: futures
            .into_iter()
            .map(MaybeDone::Pending)
            .collect::<Box<[_]>>()
            .into(),
        guard: None,
        started: false,
    }
}

/// Future returned by [`any_of_iter`].
pub struct AnyOfIter<F: Future> {
    futures: Pin<Box<[MaybeDone<F>]>>,
}

/// Future returned by [`all_of_iter`].
pub struct AllOfIter<F: Future> {
    futures: Pin<Box<[MaybeDone<F>]>>,
}

/// Future returned by [`most_of_iter`].
pub struct MostOfIter<F: Future> {
    futures: Pin<Box<[MaybeDone<F>]>>,
    guard: Option<ShieldGuard>,
    started: bool,
}

// === impl AnyOfIter ===

impl<F: Future> Future for AnyOfIter<F> {
    type Output = Vec<Option<F::Output>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut any_done = false;
        for branch in iter_pin_mut(self.futures.as_mut()) {
            any_done |= branch.poll_done(cx);
        }
        if any_done {
            Poll::Ready(
                iter_pin_mut(self.futures.as_mut())
                    .map(MaybeDone::take)
                    .collect(),
            )
        } else {
            Poll::Pending
        }
    }
}

// === impl AllOfIter ===

impl<F: Future> Future for AllOfIter<F> {
    type Output = Vec<F::Output>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut all_done = true;
        for branch in iter_pin_mut(self.futures.as_mut()) {
            all_done &= branch.poll_done(cx);
        }
        if all_done {
            Poll::Ready(
                iter_pin_mut(self.futures.as_mut())
                    .map(|branch| branch.take().expect("branch reported done"))
                    .collect(),
            )
        } else {
            Poll::Pending
        }
    }
}

// === impl MostOfIter ===

impl<F: Future> Future for MostOfIter<F> {
    type Output = Vec<Option<F::Output>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.started {
            self.started = true;
            self.guard = ShieldGuard::for_current_task();
        }

        let mut all_done = true;
        for branch in iter_pin_mut(self.futures.as_mut()) {
            all_done &= branch.poll_done(cx);
        }

        let cancelled = task::current_cancel().is_some_and(|cancel| cancel.is_requested());
        if all_done || cancelled {
            self.guard = None;
            Poll::Ready(
                iter_pin_mut(self.futures.as_mut())
                    .map(MaybeDone::take)
                    .collect(),
            )
        } else {
            Poll::Pending
        }
    }
}

/// Runs `first`, feeds its output to `cont`, then runs the resulting future.
///
/// Cancellation composes naturally: dropping the sequence drops whichever
/// stage is in flight.
pub fn then<A, B, F>(first: A, cont: F) -> Then<A, B, F>
where
    A: Future,
    B: Future,
    F: FnOnce(A::Output) -> B,
{
    Then::First { first, cont }
}

/// Future returned by [`then`].
#[pin_project(project = ThenProj, project_replace = ThenProjReplace)]
pub enum Then<A: Future, B, F> {
    First {
        #[pin]
        first: A,
        cont: F,
    },
    Second {
        #[pin]
        second: B,
    },
    Done,
}

// === impl Then ===

impl<A, B, F> Future for Then<A, B, F>
where
    A: Future,
    B: Future,
    F: FnOnce(A::Output) -> B,
{
    type Output = B::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            match self.as_mut().project() {
                ThenProj::First { first, .. } => {
                    let output = core::task::ready!(first.poll(cx));
                    let ThenProjReplace::First { cont, .. } =
                        self.as_mut().project_replace(Self::Done)
                    else {
                        unreachable!()
                    };
                    self.set(Self::Second {
                        second: cont(output),
                    });
                }
                ThenProj::Second { second } => {
                    let output = core::task::ready!(second.poll(cx));
                    self.set(Self::Done);
                    return Poll::Ready(output);
                }
                ThenProj::Done => panic!("Then polled after completion"),
            }
        }
    }
}
