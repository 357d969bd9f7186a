//! Errors returned by [`BoundedQueue`](super::BoundedQueue).
//!
//! Full and empty are wait states for the blocking calls, not errors. Only the
//! non-blocking variants report them.

use std::fmt;

use thiserror::Error;

/// Error from constructing a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CapacityError {
    /// A queue must be able to hold at least one item.
    #[error("queue capacity must be greater than 0")]
    Zero,
}

/// Error from a blocking dequeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DequeueError {
    /// The queue is closed and every remaining item has been drained.
    #[error("queue is closed and drained")]
    Closed,

    /// The deadline passed before an item arrived.
    #[error("timed out waiting for an item")]
    Timeout,
}

/// Error from a non-blocking dequeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TryDequeueError {
    /// Nothing to take right now.
    #[error("queue is empty")]
    Empty,

    /// The queue is closed and every remaining item has been drained.
    #[error("queue is closed and drained")]
    Closed,
}

impl From<TryDequeueError> for DequeueError {
    fn from(err: TryDequeueError) -> Self {
        match err {
            TryDequeueError::Closed => Self::Closed,
            // An empty queue only surfaces from a blocking call once its deadline is gone.
            TryDequeueError::Empty => Self::Timeout,
        }
    }
}

/// Error from a blocking enqueue. Hands the rejected item back.
#[derive(PartialEq, Eq, Clone, Copy)]
pub enum EnqueueError<T> {
    /// The queue was closed before the item could be stored.
    Closed(T),

    /// The deadline passed before space became available.
    Timeout(T),
}

/// Error from a non-blocking enqueue. Hands the rejected item back.
#[derive(PartialEq, Eq, Clone, Copy)]
pub enum TryEnqueueError<T> {
    /// No free slot right now.
    Full(T),

    /// The queue is closed.
    Closed(T),
}

impl<T> EnqueueError<T> {
    /// Recovers the item that was not enqueued.
    pub fn into_inner(self) -> T {
        match self {
            Self::Closed(item) | Self::Timeout(item) => item,
        }
    }

    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }

    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl<T> TryEnqueueError<T> {
    /// Recovers the item that was not enqueued.
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(item) | Self::Closed(item) => item,
        }
    }

    pub const fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }

    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

// The item is opaque here, so none of these impls put bounds on `T`.

impl<T> fmt::Debug for EnqueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed(_) => f.write_str("Closed(..)"),
            Self::Timeout(_) => f.write_str("Timeout(..)"),
        }
    }
}

impl<T> fmt::Display for EnqueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed(_) => f.write_str("enqueue on a closed queue"),
            Self::Timeout(_) => f.write_str("timed out waiting for free space"),
        }
    }
}

impl<T> std::error::Error for EnqueueError<T> {}

impl<T> fmt::Debug for TryEnqueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("Full(..)"),
            Self::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<T> fmt::Display for TryEnqueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("queue is full"),
            Self::Closed(_) => f.write_str("enqueue on a closed queue"),
        }
    }
}

impl<T> std::error::Error for TryEnqueueError<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_error_returns_item() {
        let err = EnqueueError::Closed(String::from("payload"));
        assert!(err.is_closed());
        assert!(!err.is_timeout());
        assert_eq!(err.into_inner(), "payload");

        let err = TryEnqueueError::Full(7u32);
        assert!(err.is_full());
        assert_eq!(err.into_inner(), 7);
    }

    #[test]
    fn test_debug_hides_item() {
        struct Opaque;

        assert_eq!(format!("{:?}", EnqueueError::Timeout(Opaque)), "Timeout(..)");
        assert_eq!(format!("{:?}", TryEnqueueError::Closed(Opaque)), "Closed(..)");
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(CapacityError::Zero.to_string(), "queue capacity must be greater than 0");
        assert_eq!(DequeueError::Closed.to_string(), "queue is closed and drained");
        assert_eq!(TryDequeueError::Empty.to_string(), "queue is empty");
        assert_eq!(TryEnqueueError::Full(()).to_string(), "queue is full");
    }

    #[test]
    fn test_conversions() {
        assert_eq!(DequeueError::from(TryDequeueError::Closed), DequeueError::Closed);
    }
}
