//! Work-item envelopes and the safe task API.
//!
//! The `#[repr(C)]` envelopes here are the contract between the runtime and
//! code emitted by the lowering passes: a queued body function receives a
//! pointer to its envelope, reads its loop index and captured-argument
//! pointer from it, and hands the envelope back to `__ares_finish_func`
//! when done. The task-launch path uses a `TaskArg`-prefixed structure laid
//! out by the pass, with the return slot and parameters trailing the header.
//!
//! `Runtime` is the Rust-facing counterpart: the same latch/pool mechanics
//! without raw pointers, usable without generated code and in tests.

use std::ffi::c_void;
use std::ops::Range;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::TaskError;
use crate::latch::Latch;
use crate::pool::ThreadPool;
use crate::RuntimeConfig;

/// ABI signature of queued body and wrapper functions.
///
/// The single argument is the envelope pointer (parallel-for path) or the
/// `TaskArg`-prefixed argument structure (task path).
pub type QueuedFn = unsafe extern "C" fn(*mut c_void);

/// Per-iteration envelope for parallel-for bodies.
///
/// `synch` holds one counted reference to the loop's shared latch,
/// reclaimed by `__ares_finish_func`. `args` points at the heap-allocated
/// captured-variables structure shared by all iterations.
#[repr(C)]
pub struct FuncArg {
    pub synch: *const Latch,
    pub index: u32,
    pub args: *mut c_void,
}

/// Header of a task-launch argument structure.
///
/// The lowering pass lays out the real structure as this header followed by
/// the return slot and the callee's parameters. `synch` is installed by
/// `__ares_task_queue` and carries the task's one-shot completion latch.
#[repr(C)]
pub struct TaskArg {
    pub synch: *const Latch,
    pub depth: u32,
}

/// Result-carrying handle for a task spawned through [`Runtime::spawn`].
///
/// Becomes ready when the task body finishes; `wait` consumes the handle,
/// mirroring the one-await-per-future ABI contract.
pub struct TaskFuture<T> {
    latch: Arc<Latch>,
    slot: Arc<Mutex<Option<Result<T, TaskError>>>>,
}

impl<T: Send> TaskFuture<T> {
    /// Block until the task finishes and take its result.
    pub fn wait(self) -> Result<T, TaskError> {
        self.latch.wait();
        self.slot
            .lock()
            .take()
            .expect("task completed without storing a result")
    }

    /// As `wait`, but give up after `timeout`.
    pub fn wait_timeout(self, timeout: std::time::Duration) -> Result<T, TaskError> {
        if !self.latch.wait_timeout(timeout) {
            return Err(TaskError::Timeout(timeout));
        }
        self.slot
            .lock()
            .take()
            .expect("task completed without storing a result")
    }

    /// Non-blocking readiness check.
    pub fn is_ready(&self) -> bool {
        self.slot.lock().is_some()
    }
}

/// An explicit runtime context: a thread pool plus the latch-based
/// task and parallel-for entry points built on it.
///
/// Constructed per use (typically once per process); tests can hold several
/// isolated runtimes at once.
pub struct Runtime {
    pool: ThreadPool,
}

impl Runtime {
    /// Create a runtime with default configuration.
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a runtime from a configuration.
    pub fn with_config(config: RuntimeConfig) -> Self {
        let pool = match config.workers {
            Some(n) => ThreadPool::with_workers(n),
            None => ThreadPool::new(),
        };
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }

    /// Launch `f` as a discrete task and return a future for its result.
    pub fn spawn<F, T>(&self, f: F) -> TaskFuture<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let latch = Arc::new(Latch::new(1));
        let slot = Arc::new(Mutex::new(None));

        let latch2 = Arc::clone(&latch);
        let slot2 = Arc::clone(&slot);
        self.pool.execute(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
            let result = result.map_err(|panic| {
                let msg = panic
                    .downcast_ref::<String>()
                    .cloned()
                    .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
                    .unwrap_or_else(|| "unknown panic".to_string());
                TaskError::Panicked(msg)
            });
            *slot2.lock() = Some(result);
            latch2.count_down();
        });

        TaskFuture { latch, slot }
    }

    /// Run `body` once per index in `range`, in parallel, and return only
    /// after every iteration has finished.
    ///
    /// Iterations are queued at priority 1, matching the dispatch priority
    /// the lowering pass emits for loop bodies.
    pub fn parallel_for<F>(&self, range: Range<u32>, body: F)
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        let n = range.end.saturating_sub(range.start);
        if n == 0 {
            return;
        }

        let latch = Arc::new(Latch::new(n));
        let body = Arc::new(body);

        for index in range {
            let latch = Arc::clone(&latch);
            let body = Arc::clone(&body);
            self.pool.execute_with_priority(1, move || {
                body(index);
                latch.count_down();
            });
        }

        latch.wait();
    }

    /// Parallel-reduce: run `body` per index, then fold the per-iteration
    /// partials with `combine` after the join point.
    ///
    /// Partials are only read after the latch is satisfied, so the combine
    /// loop needs no locking.
    pub fn parallel_reduce<T, F, C>(&self, range: Range<u32>, body: F, combine: C, init: T) -> T
    where
        T: Send + Sync + Clone + 'static,
        F: Fn(u32) -> T + Send + Sync + 'static,
        C: Fn(T, T) -> T,
    {
        let n = range.end.saturating_sub(range.start);
        if n == 0 {
            return init;
        }

        let latch = Arc::new(Latch::new(n));
        let body = Arc::new(body);
        let partials: Arc<Vec<Mutex<Option<T>>>> =
            Arc::new((0..n).map(|_| Mutex::new(None)).collect());

        for (slot, index) in range.enumerate() {
            let latch = Arc::clone(&latch);
            let body = Arc::clone(&body);
            let partials = Arc::clone(&partials);
            self.pool.execute_with_priority(1, move || {
                *partials[slot].lock() = Some(body(index));
                latch.count_down();
            });
        }

        latch.wait();

        let mut acc = init;
        for slot in partials.iter() {
            let partial = slot
                .lock()
                .take()
                .expect("iteration finished without a partial result");
            acc = combine(acc, partial);
        }
        acc
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}
