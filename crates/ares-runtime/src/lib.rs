//! Ares runtime - task queuing, countdown futures and synchronization for
//! lowered parallel IR.
//!
//! This crate is the runtime half of the Ares prototype:
//! - `Semaphore` - blocking counter with optional cap and timed acquire
//! - `Latch` - one-shot countdown join point ("Synch" in the lowered ABI)
//! - `ThreadPool` - fixed workers over a priority-then-FIFO queue
//! - `Runtime` / `TaskFuture<T>` - safe task and parallel-for entry points
//! - `ffi` - the `__ares_*` C ABI the lowering passes emit calls to
//!
//! # Design
//!
//! Lowered code drives everything through the C ABI: a parallel loop becomes
//! a latch plus one queued envelope per iteration, a task launch becomes a
//! heap argument structure with a one-shot latch in its header. The safe
//! `Runtime` API mirrors the same mechanics for Rust callers and tests.
//!
//! Latch handles crossing the ABI are counted references, so the releasing
//! worker and the awaiting thread can drop their handles in either order
//! without manual free-site auditing.

pub mod error;
pub mod ffi;
pub mod latch;
pub mod pool;
pub mod semaphore;
pub mod task;

pub use error::{RuntimeError, TaskError};
pub use latch::Latch;
pub use pool::{global_pool, ThreadPool};
pub use semaphore::Semaphore;
pub use task::{FuncArg, QueuedFn, Runtime, TaskArg, TaskFuture};

/// Configuration for a [`Runtime`].
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Number of pool workers; `None` means available parallelism.
    pub workers: Option<usize>,
}

impl RuntimeConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of pool workers.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }
}
