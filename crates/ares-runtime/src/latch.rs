//! One-shot countdown latch, the join point behind futures and parallel
//! loops.
//!
//! A latch created for `n` units of work unblocks its single awaiter only
//! after all `n` `count_down` calls have landed. Internally this is a
//! semaphore starting at `-(n - 1)`: the n-th release brings the count to 1
//! and lets the one `wait` through.

use std::time::Duration;

use crate::semaphore::Semaphore;

/// A one-shot countdown latch.
///
/// Exactly one `wait` call is expected per latch; the latch is not reusable
/// after it has been satisfied. Share across threads behind an `Arc`; the
/// C ABI in [`crate::ffi`] does precisely that so that the releasing and the
/// awaiting side can each drop their handle in any order.
pub struct Latch {
    sem: Semaphore,
}

impl Latch {
    /// Create a latch requiring `count` calls to `count_down`.
    ///
    /// `count` of 0 is treated as an already-satisfied latch.
    pub fn new(count: u32) -> Self {
        Self {
            sem: Semaphore::new(1 - i64::from(count)),
        }
    }

    /// Record one unit of completed work.
    pub fn count_down(&self) {
        self.sem.release();
    }

    /// Block until all required `count_down` calls have occurred.
    pub fn wait(&self) {
        self.sem.acquire();
    }

    /// As `wait`, but give up after `timeout`. Returns `true` if the latch
    /// was satisfied in time.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.sem.acquire_timeout(timeout)
    }
}
