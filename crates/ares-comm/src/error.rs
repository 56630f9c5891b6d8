//! Error types for the Ares communication layer.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors from endpoint setup, transport I/O and group coordination.
#[derive(Debug, Error)]
pub enum CommError {
    /// Endpoint setup failed (socket bind/listen/connect, FIFO creation or
    /// open). Setup is atomic: a failed call leaves no half-initialized
    /// communicator.
    #[error("endpoint setup failed: {0}")]
    Setup(#[source] io::Error),

    /// Transport-level I/O failure on an established channel.
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),

    /// The peer closed the connection or the dispatcher loops have exited.
    #[error("connection closed")]
    Disconnected,

    /// A receive wait ran out of time.
    #[error("receive timed out after {0:?}")]
    ReceiveTimeout(Duration),

    /// No peer connection has been established yet.
    #[error("no connection established")]
    NoConnection,

    /// An inbound frame carried an unknown message-type tag.
    #[error("invalid message kind tag: {0}")]
    InvalidKind(u8),

    /// The barrier only supports the two-party rendezvous.
    #[error("unsupported barrier group size {0} (only 2 is supported)")]
    UnsupportedGroupSize(usize),

    /// `barrier()` was called before `init_group`.
    #[error("barrier used before init_group")]
    BarrierNotInitialized,
}
