// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Single-threaded structured-concurrency runtime for cooperative multitasking.
//!
//! `weft` drives a tree of tasks on top of a host-provided event loop. Tasks
//! are ordinary futures; they are scheduled through a non-nesting deferred
//! [`Executor`][executor::Executor], grouped into [nurseries][nursery] that
//! guarantee every child is joined or cancelled before the scope exits, and
//! multiplexed with [combinators][combinator]. Synchronization primitives
//! (channels, semaphores, events, observable values, parking lots) integrate
//! with the same cancellation protocol: cancellation is always *requested*,
//! delivered at the next unshielded suspension point, and confirmed by
//! dropping the future.
//!
//! The runtime assumes nothing about its host beyond the
//! [`EventLoop`] trait; timers and I/O are host-defined awaitables.

pub mod cancel;
pub mod combinator;
pub mod error;
pub mod executor;
pub mod nursery;
pub mod runner;
pub mod sync;
pub mod task;
#[cfg(test)]
mod test_util;
mod waker;

pub use cancel::{NonCancellable, UntilCancelled, non_cancellable, until_cancelled};
pub use combinator::{
    Then, all_of, all_of_iter, any_of, any_of_iter, most_of, most_of_iter, then,
};
pub use nursery::{JoinMode, Nursery, nursery};
pub use runner::{EventLoop, LoopId, run};
pub use task::{just, noop, yield_now};
