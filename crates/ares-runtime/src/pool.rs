//! Priority thread pool executing queued work items.
//!
//! A fixed set of worker threads consumes a single global queue ordered by
//! (priority, submission order): a higher priority value is eligible to run
//! before lower-priority items queued earlier, and items of equal priority
//! run FIFO. Lowered parallel loops queue their bodies here, as does the
//! task-launch path at default priority.
//!
//! # Shutdown
//!
//! Dropping the pool signals the workers, drains the queue, and joins every
//! worker thread.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::error::RuntimeError;

/// A unit of work for the pool.
type BoxedJob = Box<dyn FnOnce() + Send + 'static>;

/// Queue entry carrying the priority and a FIFO tie-break sequence.
struct QueuedJob {
    priority: u32,
    seq: u64,
    job: BoxedJob,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority first, then earlier submission.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Shared state for the thread pool.
struct PoolInner {
    queue: Mutex<BinaryHeap<QueuedJob>>,
    job_available: Condvar,
    shutdown: AtomicBool,
    active_jobs: AtomicUsize,
    next_seq: AtomicU64,
    num_workers: usize,
}

impl PoolInner {
    fn pop_job(&self) -> Option<BoxedJob> {
        self.queue.lock().pop().map(|q| q.job)
    }
}

/// A fixed-size thread pool with a priority-ordered queue.
pub struct ThreadPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    /// Create a pool sized to `std::thread::available_parallelism()`.
    pub fn new() -> Self {
        let num_workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::with_workers(num_workers)
    }

    /// Create a pool with a specific number of workers.
    ///
    /// Panics if the OS refuses to spawn a worker; use
    /// [`ThreadPool::try_with_workers`] to handle that case.
    pub fn with_workers(num_workers: usize) -> Self {
        match Self::try_with_workers(num_workers) {
            Ok(pool) => pool,
            Err(err) => panic!("{}", err),
        }
    }

    /// Create a pool with a specific number of workers, surfacing spawn
    /// failures.
    pub fn try_with_workers(num_workers: usize) -> Result<Self, RuntimeError> {
        assert!(num_workers > 0, "thread pool must have at least 1 worker");

        let inner = Arc::new(PoolInner {
            queue: Mutex::new(BinaryHeap::new()),
            job_available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            active_jobs: AtomicUsize::new(0),
            next_seq: AtomicU64::new(0),
            num_workers,
        });

        let mut workers = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let inner = Arc::clone(&inner);
            let worker = thread::Builder::new()
                .name(format!("ares-pool-{}", worker_id))
                .spawn(move || {
                    worker_loop(inner);
                })
                .map_err(|e| RuntimeError::SpawnFailed(e.to_string()))?;
            workers.push(worker);
        }

        Ok(Self {
            inner,
            workers: Mutex::new(workers),
        })
    }

    /// Queue a job at the given priority.
    ///
    /// Higher values run first; equal priorities run in submission order.
    pub fn execute_with_priority<F>(&self, priority: u32, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        self.inner.active_jobs.fetch_add(1, Ordering::AcqRel);
        self.inner.queue.lock().push(QueuedJob {
            priority,
            seq,
            job: Box::new(job),
        });
        self.inner.job_available.notify_one();
    }

    /// Queue a job at the default priority (0).
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.execute_with_priority(0, job);
    }

    /// Number of worker threads.
    pub fn num_workers(&self) -> usize {
        self.inner.num_workers
    }

    /// Number of queued-or-running jobs.
    pub fn active_jobs(&self) -> usize {
        self.inner.active_jobs.load(Ordering::Relaxed)
    }

    /// Whether the pool is shutting down.
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.job_available.notify_all();

        let mut workers = self.workers.lock();
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Worker thread loop: drain the queue, park on the condvar when idle.
fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        if let Some(job) = inner.pop_job() {
            job();
            inner.active_jobs.fetch_sub(1, Ordering::AcqRel);
            continue;
        }

        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }

        let mut queue = inner.queue.lock();
        // Re-check with the lock held so a notify between the pop and the
        // wait is not lost.
        if queue.is_empty() && !inner.shutdown.load(Ordering::Acquire) {
            inner
                .job_available
                .wait_for(&mut queue, std::time::Duration::from_millis(1));
        }
    }
}

/// Global thread pool instance, consumed by the C ABI in [`crate::ffi`].
static GLOBAL_POOL: std::sync::OnceLock<ThreadPool> = std::sync::OnceLock::new();

/// Get the global thread pool, lazily initialized on first access.
pub fn global_pool() -> &'static ThreadPool {
    GLOBAL_POOL.get_or_init(ThreadPool::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latch::Latch;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicI32;
    use std::time::Duration;

    #[test]
    fn test_pool_basic() {
        let pool = ThreadPool::with_workers(2);
        let latch = Arc::new(Latch::new(1));
        let latch2 = Arc::clone(&latch);
        pool.execute(move || latch2.count_down());
        latch.wait();
    }

    #[test]
    fn test_pool_many_jobs() {
        let pool = ThreadPool::with_workers(4);
        let counter = Arc::new(AtomicI32::new(0));
        let latch = Arc::new(Latch::new(1000));

        for _ in 0..1000 {
            let counter = Arc::clone(&counter);
            let latch = Arc::clone(&latch);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::Relaxed);
                latch.count_down();
            });
        }

        latch.wait();
        assert_eq!(counter.load(Ordering::Relaxed), 1000);
    }

    #[test]
    fn test_priority_before_fifo() {
        // One worker so execution order equals queue order. Park it while
        // the queue is filled, then observe the drain order.
        let pool = ThreadPool::with_workers(1);
        let gate = Arc::new(Latch::new(1));
        let order = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(Latch::new(4));

        {
            let gate = Arc::clone(&gate);
            pool.execute_with_priority(10, move || gate.wait());
        }

        for (priority, tag) in [(0u32, "low-1"), (5, "high"), (0, "low-2")] {
            let order = Arc::clone(&order);
            let done = Arc::clone(&done);
            pool.execute_with_priority(priority, move || {
                order.lock().push(tag);
                done.count_down();
            });
        }

        {
            let done = Arc::clone(&done);
            pool.execute_with_priority(0, move || done.count_down());
        }

        gate.count_down();
        done.wait();

        assert_eq!(&*order.lock(), &["high", "low-1", "low-2"]);
    }

    #[test]
    fn test_pool_shutdown_drains_queue() {
        let counter = Arc::new(AtomicI32::new(0));
        {
            let pool = ThreadPool::with_workers(2);
            for _ in 0..50 {
                let counter = Arc::clone(&counter);
                pool.execute(move || {
                    thread::sleep(Duration::from_micros(100));
                    counter.fetch_add(1, Ordering::Relaxed);
                });
            }
            // Drop joins the workers after the queue drains.
        }
        assert_eq!(counter.load(Ordering::Relaxed), 50);
    }

    #[test]
    fn test_pool_num_workers() {
        let pool = ThreadPool::with_workers(8);
        assert_eq!(pool.num_workers(), 8);
    }

    #[test]
    fn test_global_pool() {
        let latch = Arc::new(Latch::new(1));
        let latch2 = Arc::clone(&latch);
        global_pool().execute(move || latch2.count_down());
        latch.wait();
    }
}
