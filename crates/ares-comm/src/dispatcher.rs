//! Per-connection message dispatcher.
//!
//! One dispatcher owns one connection: a send channel and a receive channel
//! (the same socket cloned per direction for TCP, two FIFOs otherwise), two
//! unbounded queues, and a background thread per direction. Application
//! calls to `send`/`receive` only touch the queues, never the transport, so
//! they are decoupled from blocking I/O.
//!
//! The loops exit when the transport fails or the owning side drops its
//! queue handles; exits are logged, not silent.

use std::net::Shutdown;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, trace, warn};

use crate::channel::Channel;
use crate::error::CommError;
use crate::message::{decode_header, Message, HEADER_LEN};

/// Hook for intercepting inbound messages before they reach the receive
/// queue. Returning `true` consumes the message.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle_message(&self, msg: &Message) -> bool;
}

/// The send/receive thread pair and queues owned by one connection.
pub struct MessageDispatcher {
    send_tx: Sender<Message>,
    recv_rx: Receiver<Message>,
    /// Socket handle kept for teardown. The receive loop blocks in a read
    /// on its own clone of the stream; only a shutdown of the underlying
    /// socket unblocks it and sends FIN to the peer. FIFO connections need
    /// no handle: the send loop closing its writer end gives the peer's
    /// reader EOF.
    socket: Option<TcpStream>,
}

impl MessageDispatcher {
    /// Wire up a dispatcher over an established channel pair and start both
    /// loops.
    pub fn spawn(
        handler: Arc<dyn MessageHandler>,
        send_channel: Channel,
        receive_channel: Channel,
    ) -> Self {
        let (send_tx, send_rx) = unbounded::<Message>();
        let (recv_tx, recv_rx) = unbounded::<Message>();
        let socket = receive_channel.socket_handle();

        // The loop threads are detached: they exit on transport failure or
        // when this dispatcher is dropped and the send queue disconnects.
        thread::Builder::new()
            .name("ares-send".to_string())
            .spawn(move || send_loop(send_channel, send_rx))
            .expect("failed to spawn send loop");

        thread::Builder::new()
            .name("ares-recv".to_string())
            .spawn(move || receive_loop(receive_channel, recv_tx, handler))
            .expect("failed to spawn receive loop");

        Self {
            send_tx,
            recv_rx,
            socket,
        }
    }

    /// Enqueue a message for transmission. Returns immediately; the send
    /// loop performs the blocking write.
    pub fn send(&self, msg: Message) -> Result<(), CommError> {
        self.send_tx.send(msg).map_err(|_| CommError::Disconnected)
    }

    /// Block until the next non-intercepted inbound message, FIFO order.
    pub fn receive(&self) -> Result<Message, CommError> {
        self.recv_rx.recv().map_err(|_| CommError::Disconnected)
    }

    /// Non-blocking receive.
    pub fn try_receive(&self) -> Result<Option<Message>, CommError> {
        match self.recv_rx.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(CommError::Disconnected),
        }
    }

    /// Receive with a bounded wait.
    pub fn receive_timeout(&self, timeout: Duration) -> Result<Message, CommError> {
        match self.recv_rx.recv_timeout(timeout) {
            Ok(msg) => Ok(msg),
            Err(RecvTimeoutError::Timeout) => Err(CommError::ReceiveTimeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(CommError::Disconnected),
        }
    }
}

impl Drop for MessageDispatcher {
    fn drop(&mut self) {
        // Tear the connection down so both loops observe EOF: the send
        // loop via the disconnected queue, the receive loop via the socket
        // shutdown. The peer sees FIN and reports Disconnected.
        if let Some(stream) = &self.socket {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Pop queued messages and write them out as header + payload frames.
fn send_loop(mut channel: Channel, send_rx: Receiver<Message>) {
    for msg in send_rx.iter() {
        trace!(kind = ?msg.kind(), len = msg.len(), "sending frame");
        let header = msg.encode_header();
        if let Err(err) = channel
            .send_all(&header)
            .and_then(|_| channel.send_all(msg.payload()))
        {
            warn!(transport = channel.transport_name(), %err, "send loop: transport failed");
            return;
        }
    }
    debug!(transport = channel.transport_name(), "send loop: queue closed");
}

/// Read frames off the wire, offer them to the handler, queue the rest.
fn receive_loop(mut channel: Channel, recv_tx: Sender<Message>, handler: Arc<dyn MessageHandler>) {
    loop {
        let mut header = [0u8; HEADER_LEN];
        if let Err(err) = channel.recv_exact(&mut header) {
            debug!(transport = channel.transport_name(), %err, "receive loop: connection closed");
            return;
        }

        let (kind, size) = match decode_header(&header) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(%err, "receive loop: bad frame header, dropping connection");
                return;
            }
        };

        let mut payload = vec![0u8; size];
        if let Err(err) = channel.recv_exact(&mut payload) {
            debug!(transport = channel.transport_name(), %err, "receive loop: connection closed mid-frame");
            return;
        }

        let msg = Message::with_kind(kind, payload);
        trace!(kind = ?msg.kind(), len = msg.len(), "received frame");

        if handler.handle_message(&msg) {
            continue;
        }

        if recv_tx.send(msg).is_err() {
            debug!("receive loop: receive queue closed");
            return;
        }
    }
}
