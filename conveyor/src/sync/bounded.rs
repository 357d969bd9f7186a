//! Bounded MPMC queue for in-process (inter-thread) communication.
//!
//! A fixed-capacity FIFO shared by any number of producer and consumer
//! threads. The data path is the lock-free ring in [`crate::mpmc`]; callers
//! that have to wait for space or for an item park instead of spinning.
//!
//! # Overview
//!
//! - [`BoundedQueue::enqueue`] / [`BoundedQueue::dequeue`] block while the
//!   queue is full / empty.
//! - [`BoundedQueue::try_enqueue`] / [`BoundedQueue::try_dequeue`] make a single
//!   attempt and return immediately.
//! - [`BoundedQueue::enqueue_timeout`] / [`BoundedQueue::dequeue_timeout`] give
//!   up after a deadline without touching the queue.
//! - [`BoundedQueue::close`] unblocks everyone. Consumers keep draining what
//!   is left and then see [`DequeueError::Closed`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use conveyor::sync::BoundedQueue;
//!
//! let queue = Arc::new(BoundedQueue::new(16)?);
//!
//! let producer = {
//!     let queue = Arc::clone(&queue);
//!     std::thread::spawn(move || {
//!         for i in 0..100u32 {
//!             queue.enqueue(i).expect("queue closed");
//!         }
//!         queue.close();
//!     })
//! };
//!
//! let mut received = Vec::new();
//! while let Ok(item) = queue.dequeue() {
//!     received.push(item);
//! }
//! producer.join().unwrap();
//!
//! assert_eq!(received, (0..100).collect::<Vec<_>>());
//! # Ok::<(), conveyor::sync::CapacityError>(())
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use minstant::Instant;

use super::error::{CapacityError, DequeueError, EnqueueError, TryDequeueError, TryEnqueueError};
use super::waiter::WaitSet;
use crate::mpmc::ring::Ring;
use crate::trace::{debug, trace};

/// Timeout specification for blocking operations.
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    /// Wait indefinitely.
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl Timeout {
    fn deadline(self) -> Option<Instant> {
        match self {
            Self::Infinite => None,
            // A deadline the clock cannot represent never arrives.
            Self::Duration(d) => u64::try_from(d.as_nanos())
                .ok()
                .and_then(|_| Instant::now().checked_add(d)),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

/// Fixed-capacity, thread-safe FIFO queue.
///
/// Share it between threads with an `Arc`. Every operation takes `&self`.
///
/// # Guarantees
///
/// - At most [`capacity`](Self::capacity) items are resident at any time.
/// - Items already stored leave in the order they were stored.
/// - Each stored item is handed to exactly one successful dequeue, or dropped
///   with the queue if nobody takes it.
/// - A blocked caller is woken when the opposite operation makes progress or
///   when the queue is closed.
pub struct BoundedQueue<T> {
    ring: Ring<T>,
    closed: AtomicBool,
    /// Enqueuers between their closed check and the end of their push.
    /// Consumers only report `Closed` once this is zero.
    in_flight: AtomicUsize,
    /// Dequeuers parked on an empty queue.
    not_empty: WaitSet,
    /// Enqueuers parked on a full queue.
    not_full: WaitSet,
}

impl<T> BoundedQueue<T> {
    /// Creates an empty queue that holds at most `capacity` items.
    ///
    /// # Errors
    ///
    /// Returns [`CapacityError::Zero`] if `capacity == 0`.
    pub fn new(capacity: usize) -> Result<Self, CapacityError> {
        if capacity == 0 {
            return Err(CapacityError::Zero);
        }

        Ok(Self {
            ring: Ring::with_capacity(capacity),
            closed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            not_empty: WaitSet::new(),
            not_full: WaitSet::new(),
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Current number of items. Advisory: may be stale as soon as it returns.
    ///
    /// Includes items whose enqueue is still in progress on another thread.
    #[inline]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Attempts to enqueue without waiting.
    ///
    /// # Errors
    ///
    /// - [`TryEnqueueError::Full`] if there is no free slot right now.
    /// - [`TryEnqueueError::Closed`] if the queue is closed.
    ///
    /// Both hand the item back.
    pub fn try_enqueue(&self, item: T) -> Result<(), TryEnqueueError<T>> {
        self.put(item)?;
        self.after_push();
        Ok(())
    }

    /// Enqueues, waiting as long as it takes for a free slot.
    ///
    /// # Errors
    ///
    /// Returns [`EnqueueError::Closed`] with the item if the queue is closed
    /// before the item could be stored.
    pub fn enqueue(&self, item: T) -> Result<(), EnqueueError<T>> {
        self.enqueue_until(item, None)
    }

    /// Enqueues, waiting at most `timeout` for a free slot.
    ///
    /// # Errors
    ///
    /// - [`EnqueueError::Closed`] if the queue is closed first.
    /// - [`EnqueueError::Timeout`] if no slot frees up in time. The queue is
    ///   left untouched.
    pub fn enqueue_timeout(
        &self,
        item: T,
        timeout: impl Into<Timeout>,
    ) -> Result<(), EnqueueError<T>> {
        self.enqueue_until(item, timeout.into().deadline())
    }

    fn enqueue_until(&self, item: T, deadline: Option<Instant>) -> Result<(), EnqueueError<T>> {
        let mut item = match self.try_enqueue(item) {
            Ok(()) => return Ok(()),
            Err(TryEnqueueError::Closed(item)) => return Err(EnqueueError::Closed(item)),
            Err(TryEnqueueError::Full(item)) => item,
        };

        let mut registration = self.not_full.register();
        loop {
            item = match self.put(item) {
                Ok(()) => {
                    // Notifying takes wait-set locks, including the one held here.
                    drop(registration);
                    self.after_push();
                    return Ok(());
                }
                Err(TryEnqueueError::Closed(item)) => return Err(EnqueueError::Closed(item)),
                Err(TryEnqueueError::Full(item)) => item,
            };

            trace!(capacity = self.capacity(), "enqueue parked on full queue");
            if !registration.park(deadline) {
                return Err(EnqueueError::Timeout(item));
            }
        }
    }

    /// Single push attempt. Wakes nobody unless the queue was closed meanwhile.
    #[inline]
    fn put(&self, item: T) -> Result<(), TryEnqueueError<T>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        let outcome = if self.closed.load(Ordering::SeqCst) {
            Err(TryEnqueueError::Closed(item))
        } else {
            self.ring.push(item).map_err(TryEnqueueError::Full)
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            // Dequeuers may be parked waiting for this push to settle.
            self.not_empty.notify_all();
        }
        outcome
    }

    /// Attempts to dequeue without waiting.
    ///
    /// Makes a single attempt and never parks or spins, so a polling caller
    /// gets control back to yield between attempts.
    ///
    /// # Errors
    ///
    /// - [`TryDequeueError::Empty`] if there is nothing to take right now.
    /// - [`TryDequeueError::Closed`] if the queue is closed and drained.
    pub fn try_dequeue(&self) -> Result<T, TryDequeueError> {
        let item = self.take()?;
        self.after_pop();
        Ok(item)
    }

    /// Single pop attempt without waking anyone.
    #[inline]
    fn take(&self) -> Result<T, TryDequeueError> {
        if let Some(item) = self.ring.pop() {
            return Ok(item);
        }

        if !self.closed.load(Ordering::SeqCst) || self.in_flight.load(Ordering::SeqCst) > 0 {
            return Err(TryDequeueError::Empty);
        }

        // Every push that saw the queue open has finished; anything it stored
        // is visible now.
        self.ring.pop().ok_or(TryDequeueError::Closed)
    }

    /// Dequeues the oldest item, waiting as long as it takes for one.
    ///
    /// # Errors
    ///
    /// Returns [`DequeueError::Closed`] once the queue is closed and drained.
    pub fn dequeue(&self) -> Result<T, DequeueError> {
        self.dequeue_until(None)
    }

    /// Dequeues the oldest item, waiting at most `timeout` for one.
    ///
    /// # Errors
    ///
    /// - [`DequeueError::Closed`] once the queue is closed and drained.
    /// - [`DequeueError::Timeout`] if nothing arrives in time.
    pub fn dequeue_timeout(&self, timeout: impl Into<Timeout>) -> Result<T, DequeueError> {
        self.dequeue_until(timeout.into().deadline())
    }

    fn dequeue_until(&self, deadline: Option<Instant>) -> Result<T, DequeueError> {
        match self.try_dequeue() {
            Err(TryDequeueError::Empty) => {}
            done => return done.map_err(DequeueError::from),
        }

        let mut registration = self.not_empty.register();
        loop {
            match self.take() {
                Ok(item) => {
                    drop(registration);
                    self.after_pop();
                    return Ok(item);
                }
                Err(TryDequeueError::Closed) => return Err(DequeueError::Closed),
                Err(TryDequeueError::Empty) => {}
            }

            trace!("dequeue parked on empty queue");
            if !registration.park(deadline) {
                return Err(DequeueError::Timeout);
            }
        }
    }

    /// Closes the queue and wakes every blocked caller.
    ///
    /// Later enqueues fail with `Closed`. Items already stored stay available
    /// to dequeuers until drained. Returns `true` for the call that closed the
    /// queue and `false` if it was already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.not_empty.notify_all();
        self.not_full.notify_all();
        debug!(remaining = self.len(), "queue closed");
        true
    }

    /// Wakes a parked dequeuer for the item just stored, and passes the wake-up
    /// on to a parked enqueuer when there is still room.
    #[inline]
    fn after_push(&self) {
        self.not_empty.notify_one();
        if self.not_full.has_waiters() && !self.ring.is_full() {
            self.not_full.notify_one();
        }
    }

    /// Mirror of [`after_push`](Self::after_push) for the consumer side.
    #[inline]
    fn after_pop(&self) {
        self.not_full.notify_one();
        if self.not_empty.has_waiters() && !self.ring.is_empty() {
            self.not_empty.notify_one();
        }
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
