//! Synchronization primitives for in-process communication.
//!
//! This module provides the blocking bounded queue shared between producer
//! and consumer threads within the same process.

pub mod bounded;
pub mod error;
mod waiter;

pub use bounded::{BoundedQueue, Timeout};
pub use error::{CapacityError, DequeueError, EnqueueError, TryDequeueError, TryEnqueueError};
