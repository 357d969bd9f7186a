//! Parking for callers blocked on a full or empty queue.
//!
//! The ring itself never blocks. A caller that has to wait registers in a
//! [`WaitSet`], re-checks the ring while holding the set's lock, and parks on
//! the condvar. Notifiers only take the lock when someone is registered.
//!
//! Registration and notification are ordered with `SeqCst` fences: either the
//! waiter's re-check observes the notifier's push/pop, or the notifier observes
//! the waiter's registration and wakes it. Because the waiter holds the lock
//! from registration until it parks, the notifier's `notify_one` cannot slip
//! in between the re-check and the park.

use std::sync::atomic::{self, AtomicUsize, Ordering};

use minstant::Instant;
use parking_lot::{Condvar, Mutex, MutexGuard};

pub(crate) struct WaitSet {
    waiters: AtomicUsize,
    lock: Mutex<()>,
    cond: Condvar,
}

impl WaitSet {
    pub(crate) fn new() -> Self {
        Self {
            waiters: AtomicUsize::new(0),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Registers the calling thread as a waiter.
    ///
    /// The caller must re-check its condition after registering and before
    /// every [`Registration::park`].
    pub(crate) fn register(&self) -> Registration<'_> {
        let guard = self.lock.lock();
        self.waiters.fetch_add(1, Ordering::SeqCst);
        atomic::fence(Ordering::SeqCst);
        Registration { set: self, guard }
    }

    #[inline]
    pub(crate) fn has_waiters(&self) -> bool {
        atomic::fence(Ordering::SeqCst);
        self.waiters.load(Ordering::Relaxed) > 0
    }

    /// Wakes one registered waiter, if any.
    #[inline]
    pub(crate) fn notify_one(&self) {
        if self.has_waiters() {
            let _guard = self.lock.lock();
            self.cond.notify_one();
        }
    }

    /// Wakes every registered waiter.
    pub(crate) fn notify_all(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }
}

/// A registered waiter. Deregisters on drop.
pub(crate) struct Registration<'a> {
    set: &'a WaitSet,
    guard: MutexGuard<'a, ()>,
}

impl Registration<'_> {
    /// Parks until notified or until `deadline`.
    ///
    /// Returns `false` without parking if the deadline has already passed.
    /// Spurious wake-ups return `true`; callers re-check and park again.
    pub(crate) fn park(&mut self, deadline: Option<Instant>) -> bool {
        match deadline {
            None => {
                self.set.cond.wait(&mut self.guard);
                true
            }
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                self.set.cond.wait_for(&mut self.guard, deadline - now);
                true
            }
        }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.set.waiters.fetch_sub(1, Ordering::SeqCst);
    }
}
