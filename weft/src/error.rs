// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// Error returned by a non-blocking send when the value could not be
/// enqueued. The rejected value is handed back to the caller.
#[derive(Debug, Eq, PartialEq)]
pub enum TrySendError<T> {
    /// The channel buffer is at capacity.
    Full(T),
    /// The channel has been closed.
    Closed(T),
}

impl<T> TrySendError<T> {
    /// Returns the value that could not be sent.
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(value) | Self::Closed(value) => value,
        }
    }
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("channel is full"),
            Self::Closed(_) => f.write_str("channel is closed"),
        }
    }
}

impl<T: fmt::Debug> core::error::Error for TrySendError<T> {}

/// Error returned by a non-blocking receive when no value was available.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TryRecvError {
    /// The channel buffer is currently empty.
    Empty,
    /// The channel has been closed and fully drained.
    Closed,
}

impl fmt::Display for TryRecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("channel is empty"),
            Self::Closed => f.write_str("channel is closed"),
        }
    }
}

impl core::error::Error for TryRecvError {}
