//! Core lock-free MPMC ring buffer algorithm.
//!
//! A bounded ring with per-slot stamps, usable by any number of producers and
//! consumers at once. Both sides are lock-free and never wait on each other:
//! when the slot a caller needs is still being written or read by another
//! thread, the call reports full/empty instead of spinning.
//!
//! # Algorithm
//!
//! Positions are stamps made of a lap number in the high bits and a slot index
//! in the low bits. `one_lap` is the smallest power of two greater than the
//! capacity, so the index never overflows into the lap bits.
//!
//! - Each slot has an atomic stamp.
//! - A slot is free for the producer at position `p` when `slot.stamp == p`.
//! - Producers reserve `p` with a CAS on `head`, write, then publish with
//!   `slot.stamp = p + 1`.
//! - A slot is ready for the consumer at position `c` when `slot.stamp == c + 1`.
//! - Consumers reserve `c` with a CAS on `tail`, read, then release the slot
//!   for the next lap with `slot.stamp = c + one_lap`.
//!
//! Because `one_lap >= 2`, "written at this lap" (`p + 1`) and "free at the
//! next lap" (`p + one_lap`) are distinct even for a single-slot ring.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{self, AtomicUsize, Ordering};

/// A slot in the ring with the stamp that guards it.
pub(crate) struct Slot<T> {
    /// - Initial: `index` (free for lap 0)
    /// - After producer write at position `p`: `p + 1`
    /// - After consumer read at position `c`: `c + one_lap`
    stamp: AtomicUsize,

    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    const fn new(stamp: usize) -> Self {
        Self {
            stamp: AtomicUsize::new(stamp),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// Producer-side state: next position to write.
#[repr(C)]
#[repr(align(64))]
struct ProducerState {
    head: AtomicUsize,
}

/// Consumer-side state: next position to read.
#[repr(C)]
#[repr(align(64))]
struct ConsumerState {
    tail: AtomicUsize,
}

/// Heap-backed bounded MPMC ring.
pub(crate) struct Ring<T> {
    producer: ProducerState,
    consumer: ConsumerState,
    buffer: Box<[Slot<T>]>,
    capacity: usize,
    one_lap: usize,
}

impl<T> Ring<T> {
    /// Creates an empty ring with room for exactly `capacity` items.
    ///
    /// `capacity` must be non-zero; the public queue checks this before
    /// calling in.
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        debug_assert!(capacity > 0, "ring capacity must be non-zero");

        let buffer = (0..capacity).map(Slot::new).collect::<Box<[_]>>();

        Self {
            producer: ProducerState {
                head: AtomicUsize::new(0),
            },
            consumer: ConsumerState {
                tail: AtomicUsize::new(0),
            },
            buffer,
            capacity,
            one_lap: (capacity + 1).next_power_of_two(),
        }
    }

    #[inline]
    pub(crate) const fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    const fn index(&self, stamp: usize) -> usize {
        stamp & (self.one_lap - 1)
    }

    /// Position following `stamp`, wrapping to index 0 of the next lap.
    #[inline]
    const fn advance(&self, stamp: usize) -> usize {
        let index = self.index(stamp);
        if index + 1 < self.capacity {
            stamp + 1
        } else {
            (stamp & !(self.one_lap - 1)).wrapping_add(self.one_lap)
        }
    }

    /// Attempts to push an item onto the ring.
    ///
    /// Safe to call from any number of threads concurrently.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the ring is full, or if the next slot is still
    /// being read by a consumer that has already reserved it.
    #[inline]
    pub(crate) fn push(&self, item: T) -> Result<(), T> {
        let mut head = self.producer.head.load(Ordering::Relaxed);

        loop {
            let slot = &self.buffer[self.index(head)];
            let stamp = slot.stamp.load(Ordering::Acquire);

            if stamp == head {
                // Slot is free at this lap; try to reserve it.
                match self.producer.head.compare_exchange_weak(
                    head,
                    self.advance(head),
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: The CAS gave this thread exclusive ownership of
                        // position `head`. The stamp check shows the previous
                        // occupant was read out, so the cell holds no live value.
                        unsafe {
                            (*slot.value.get()).write(item);
                        }
                        slot.stamp.store(head.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => head = current,
                }
            } else if stamp.wrapping_add(self.one_lap) == head.wrapping_add(1) {
                // Slot still holds the previous lap's item: either the ring is
                // full or a consumer is mid-read. Neither is waited on here.
                return Err(item);
            } else if stamp.wrapping_add(self.one_lap) == head {
                // The previous lap's producer has reserved the slot but not
                // published yet, so its item still has to be read out first.
                return Err(item);
            } else {
                // Another producer moved head past us.
                head = self.producer.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Attempts to pop the oldest item from the ring.
    ///
    /// Safe to call from any number of threads concurrently. Returns `None`
    /// if the ring is empty, or if the oldest position is reserved by a
    /// producer that has not published its write yet.
    #[inline]
    pub(crate) fn pop(&self) -> Option<T> {
        let mut tail = self.consumer.tail.load(Ordering::Relaxed);

        loop {
            let slot = &self.buffer[self.index(tail)];
            let stamp = slot.stamp.load(Ordering::Acquire);

            if stamp == tail.wrapping_add(1) {
                match self.consumer.tail.compare_exchange_weak(
                    tail,
                    self.advance(tail),
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: The CAS gave this thread exclusive ownership of
                        // position `tail`, and the stamp shows the producer
                        // finished writing the value.
                        let item = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.stamp
                            .store(tail.wrapping_add(self.one_lap), Ordering::Release);
                        return Some(item);
                    }
                    Err(current) => tail = current,
                }
            } else if stamp == tail {
                // Not written for this lap yet.
                return None;
            } else if stamp.wrapping_add(self.one_lap) == tail.wrapping_add(1) {
                // The previous lap's consumer is mid-read, so nothing has been
                // written for this lap yet.
                return None;
            } else {
                // Another consumer moved tail past us.
                tail = self.consumer.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Number of reserved positions between tail and head.
    ///
    /// Counts items whose write is still in flight. The value is a snapshot
    /// and may be stale as soon as it is returned.
    pub(crate) fn len(&self) -> usize {
        loop {
            let head = self.producer.head.load(Ordering::SeqCst);
            let tail = self.consumer.tail.load(Ordering::SeqCst);

            // Retry if head moved while tail was read, so the pair is consistent.
            if self.producer.head.load(Ordering::SeqCst) == head {
                let hix = self.index(head);
                let tix = self.index(tail);

                return if hix > tix {
                    hix - tix
                } else if hix < tix {
                    self.capacity - tix + hix
                } else if head == tail {
                    0
                } else {
                    self.capacity
                };
            }
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        let tail = self.consumer.tail.load(Ordering::SeqCst);
        let head = self.producer.head.load(Ordering::SeqCst);
        head == tail
    }

    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        let head = self.producer.head.load(Ordering::SeqCst);
        let tail = self.consumer.tail.load(Ordering::SeqCst);
        tail.wrapping_add(self.one_lap) == head
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        // No other handle exists, so every reserved position has been published.
        atomic::fence(Ordering::Acquire);

        let len = self.len();
        let tail = *self.consumer.tail.get_mut();
        let tix = self.index(tail);

        for offset in 0..len {
            let index = if tix + offset < self.capacity {
                tix + offset
            } else {
                tix + offset - self.capacity
            };

            // SAFETY: Positions between tail and head hold initialized values
            // that no consumer has read, and `&mut self` rules out concurrent access.
            unsafe {
                self.buffer[index].value.get_mut().assume_init_drop();
            }
        }
    }
}

// SAFETY: Ring owns its `T`s and moves them between threads.
unsafe impl<T: Send> Send for Ring<T> {}

// SAFETY: Ring is Sync because concurrent access is mediated by atomics:
// - Producers and consumers reserve positions via CAS on head/tail
// - Per-slot stamps (Release/Acquire) hand each value from writer to reader
unsafe impl<T: Send> Sync for Ring<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_single_thread_fifo() {
        let ring: Ring<u64> = Ring::with_capacity(8);

        assert!(ring.push(1).is_ok());
        assert!(ring.push(2).is_ok());
        assert!(ring.push(3).is_ok());
        assert_eq!(ring.len(), 3);

        assert_eq!(ring.pop(), Some(1));
        assert_eq!(ring.pop(), Some(2));
        assert_eq!(ring.pop(), Some(3));
        assert_eq!(ring.pop(), None);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_ring_full() {
        let ring: Ring<u64> = Ring::with_capacity(4);

        for i in 0..4 {
            assert!(ring.push(i).is_ok());
        }
        assert!(ring.is_full());
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.push(5), Err(5));

        assert_eq!(ring.pop(), Some(0));
        assert!(ring.push(5).is_ok());
        assert_eq!(ring.push(6), Err(6));
    }

    #[test]
    fn test_capacity_one_alternates() {
        let ring: Ring<u32> = Ring::with_capacity(1);

        for i in 0..100 {
            assert!(ring.push(i).is_ok());
            assert_eq!(ring.push(i + 1000), Err(i + 1000));
            assert_eq!(ring.len(), 1);
            assert_eq!(ring.pop(), Some(i));
            assert_eq!(ring.pop(), None);
        }
    }

    #[test]
    fn test_non_power_of_two_wraps() {
        let ring: Ring<usize> = Ring::with_capacity(3);

        for round in 0..10 {
            for i in 0..3 {
                assert!(ring.push(round * 10 + i).is_ok());
            }
            assert!(ring.is_full());
            for i in 0..3 {
                assert_eq!(ring.pop(), Some(round * 10 + i));
            }
            assert!(ring.is_empty());
        }
    }

    #[test]
    fn test_len_across_wrap() {
        let ring: Ring<u8> = Ring::with_capacity(5);

        for i in 0..4 {
            ring.push(i).unwrap();
        }
        for _ in 0..3 {
            ring.pop().unwrap();
        }
        for i in 0..3 {
            ring.push(i).unwrap();
        }
        // tail index 3, head index wrapped to 2
        assert_eq!(ring.len(), 4);
    }

    #[test]
    fn test_drop_releases_resident_items() {
        struct Counted(Arc<AtomicUsize>);

        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        {
            let ring = Ring::with_capacity(4);
            for _ in 0..4 {
                assert!(ring.push(Counted(Arc::clone(&drops))).is_ok());
            }
            // Move tail off index 0 so the drop walk wraps.
            drop(ring.pop());
            drop(ring.pop());
            assert!(ring.push(Counted(Arc::clone(&drops))).is_ok());
            assert_eq!(drops.load(Ordering::SeqCst), 2);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_pop_does_not_wait_for_stalled_consumer() {
        let ring: Ring<u32> = Ring::with_capacity(1);
        ring.push(7).unwrap();

        // Another consumer reserves position 0 but has not released the slot.
        ring.consumer.tail.store(ring.advance(0), Ordering::SeqCst);

        assert_eq!(ring.pop(), None);
        assert_eq!(ring.push(8), Err(8));

        // That consumer finishes its read.
        let slot = &ring.buffer[0];
        // SAFETY: position 0 was published above and nobody else reads it.
        let item = unsafe { (*slot.value.get()).assume_init_read() };
        assert_eq!(item, 7);
        slot.stamp.store(ring.one_lap, Ordering::Release);

        assert_eq!(ring.pop(), None);
        assert!(ring.push(8).is_ok());
        assert_eq!(ring.pop(), Some(8));
    }

    #[test]
    fn test_push_does_not_wait_for_stalled_producer() {
        let ring: Ring<u32> = Ring::with_capacity(1);

        // Another producer reserves position 0 but has not published.
        ring.producer.head.store(ring.advance(0), Ordering::SeqCst);

        assert_eq!(ring.push(8), Err(8));
        assert_eq!(ring.pop(), None);

        // That producer finishes its write.
        let slot = &ring.buffer[0];
        // SAFETY: position 0 is reserved above and nobody else writes it.
        unsafe {
            (*slot.value.get()).write(7);
        }
        slot.stamp.store(1, Ordering::Release);

        assert_eq!(ring.push(8), Err(8));
        assert_eq!(ring.pop(), Some(7));
        assert!(ring.push(8).is_ok());
        assert_eq!(ring.pop(), Some(8));
    }

    #[test]
    fn test_multiple_producers_multiple_consumers() {
        let ring: Arc<Ring<u64>> = Arc::new(Ring::with_capacity(16));
        let producers = 4;
        let consumers = 4;
        let per_producer = 2_000u64;
        let total = producers as u64 * per_producer;

        let popped = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for p in 0..producers {
            let ring = Arc::clone(&ring);
            handles.push(thread::spawn(move || {
                for i in 0..per_producer {
                    let mut value = p as u64 * per_producer + i;
                    while let Err(returned) = ring.push(value) {
                        value = returned;
                        thread::yield_now();
                    }
                }
                Vec::new()
            }));
        }

        for _ in 0..consumers {
            let ring = Arc::clone(&ring);
            let popped = Arc::clone(&popped);
            handles.push(thread::spawn(move || {
                let mut seen = Vec::new();
                while popped.load(Ordering::SeqCst) < total as usize {
                    if let Some(value) = ring.pop() {
                        popped.fetch_add(1, Ordering::SeqCst);
                        seen.push(value);
                    } else {
                        thread::yield_now();
                    }
                }
                seen
            }));
        }

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();

        assert_eq!(all, (0..total).collect::<Vec<_>>());
        assert!(ring.is_empty());
    }
}
