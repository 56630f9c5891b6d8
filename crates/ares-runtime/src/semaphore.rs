//! Counting semaphore used by latches, barriers and queue gating.
//!
//! The count is signed: latches are created with a negative count so that a
//! fixed number of releases must land before a single waiter gets through.
//! An optional cap keeps the count from growing past a maximum, which is what
//! the two-party barrier relies on.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A blocking counting semaphore.
///
/// `acquire` blocks until the count is positive, then decrements it.
/// `release` increments the count (up to the cap, if one is set) and wakes
/// one waiter. The semaphore is identity-bound to its waiters and is
/// deliberately not `Clone`; share it behind an `Arc` instead.
pub struct Semaphore {
    count: Mutex<i64>,
    available: Condvar,
    /// 0 means unbounded.
    max_count: i64,
}

impl Semaphore {
    /// Create a semaphore with the given initial count and no cap.
    ///
    /// The count may be negative, in which case `-count + 1` releases are
    /// needed before the first acquire can succeed.
    pub fn new(count: i64) -> Self {
        Self::with_max(count, 0)
    }

    /// Create a semaphore whose count never grows past `max_count`.
    ///
    /// A `max_count` of 0 means unbounded.
    pub fn with_max(count: i64, max_count: i64) -> Self {
        Self {
            count: Mutex::new(count),
            available: Condvar::new(),
            max_count,
        }
    }

    /// Block until the count is positive, then decrement it.
    pub fn acquire(&self) {
        let mut count = self.count.lock();
        while *count <= 0 {
            self.available.wait(&mut count);
        }
        *count -= 1;
    }

    /// As `acquire`, but give up once `timeout` has elapsed.
    ///
    /// Returns `true` if a permit was taken, `false` on timeout.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count <= 0 {
            if self.available.wait_until(&mut count, deadline).timed_out() && *count <= 0 {
                return false;
            }
        }
        *count -= 1;
        true
    }

    /// Take a permit only if one is immediately available.
    pub fn try_acquire(&self) -> bool {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    /// Increment the count and wake one waiter.
    ///
    /// If a cap is set and already reached, the count is left unchanged but
    /// a waiter is still woken.
    pub fn release(&self) {
        let mut count = self.count.lock();
        if self.max_count == 0 || *count < self.max_count {
            *count += 1;
        }
        self.available.notify_one();
    }

    /// Current count. Only meaningful for tests and diagnostics.
    pub fn count(&self) -> i64 {
        *self.count.lock()
    }
}
