//! Error types for the Ares runtime.

use thiserror::Error;

/// Errors that can occur during runtime operations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Failed to spawn a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    SpawnFailed(String),

    /// Task execution error.
    #[error("task error: {0}")]
    Task(#[from] TaskError),
}

/// Errors that can occur while running or awaiting queued work.
#[derive(Debug, Error, Clone)]
pub enum TaskError {
    /// The task panicked during execution.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The wait on a future or latch timed out.
    #[error("wait timed out after {0:?}")]
    Timeout(std::time::Duration),
}
