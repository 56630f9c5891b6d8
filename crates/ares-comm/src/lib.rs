//! Inter-process messaging for the Ares runtime.
//!
//! Processes exchange length-prefixed, typed messages over TCP sockets or
//! named FIFO pairs. A [`Communicator`] owns one process's connections;
//! each connection runs a [`MessageDispatcher`] with dedicated send and
//! receive threads, so application sends are non-blocking and receives
//! drain an in-order queue. Barrier markers coordinate a two-party
//! rendezvous without touching the data stream.
//!
//! ```no_run
//! use ares_comm::Communicator;
//! use std::time::Duration;
//!
//! let comm = Communicator::new();
//! comm.listen(0)?;
//! comm.wait_for_connection(Duration::from_secs(10))?;
//! comm.send(b"hello".to_vec())?;
//! let reply = comm.receive()?;
//! # Ok::<(), ares_comm::CommError>(())
//! ```

mod channel;
mod communicator;
mod dispatcher;
mod error;
mod message;

pub use channel::{create_fifo, open_fifo_reader, open_fifo_writer, Channel};
pub use communicator::Communicator;
pub use dispatcher::{MessageDispatcher, MessageHandler};
pub use error::CommError;
pub use message::{decode_header, Message, MessageKind, HEADER_LEN};
