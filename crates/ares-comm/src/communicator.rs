//! Process-group communicator: connection setup, messaging and barriers.
//!
//! A `Communicator` owns every peer connection of one process. Connections
//! arrive either over TCP (a listener thread accepts in the background) or
//! over named FIFO pairs, and each one gets its own dispatcher. Barrier
//! markers are intercepted at the dispatcher level and counted against a
//! semaphore, so a barrier never consumes a slot in the data queues.

use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use aresruntime::Semaphore;

use crate::channel::{create_fifo, open_fifo_reader, open_fifo_writer, Channel};
use crate::dispatcher::{MessageDispatcher, MessageHandler};
use crate::error::CommError;
use crate::message::{Message, MessageKind};

/// Shared state behind every dispatcher's handler hook.
struct CommInner {
    dispatchers: Mutex<Vec<Arc<MessageDispatcher>>>,
    /// Released once per established connection; `wait_for_connection`
    /// acquires it.
    connections: Semaphore,
    /// Released once per inbound barrier marker. Lives from construction
    /// so a marker from a peer that reached its barrier first is counted,
    /// not lost, even if `init_group` has not run here yet.
    barrier: Semaphore,
    /// Set by `init_group`; `barrier()` refuses to wait before it.
    barrier_ready: AtomicBool,
}

impl MessageHandler for CommInner {
    fn handle_message(&self, msg: &Message) -> bool {
        if msg.kind() != MessageKind::Barrier {
            return false;
        }
        self.barrier.release();
        true
    }
}

/// One process's endpoint in a two-party group.
pub struct Communicator {
    inner: Arc<CommInner>,
    local_port: Mutex<Option<u16>>,
    is_listener: AtomicBool,
}

impl Default for Communicator {
    fn default() -> Self {
        Self::new()
    }
}

impl Communicator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CommInner {
                dispatchers: Mutex::new(Vec::new()),
                connections: Semaphore::new(0),
                barrier: Semaphore::new(0),
                barrier_ready: AtomicBool::new(false),
            }),
            local_port: Mutex::new(None),
            is_listener: AtomicBool::new(false),
        }
    }

    /// Bind a TCP listener and accept peers in the background. Pass port 0
    /// to let the OS pick; the bound port is available via `local_port`.
    pub fn listen(&self, port: u16) -> Result<(), CommError> {
        let listener = TcpListener::bind(("0.0.0.0", port)).map_err(CommError::Setup)?;
        let bound = listener.local_addr().map_err(CommError::Setup)?.port();
        *self.local_port.lock() = Some(bound);
        self.is_listener.store(true, Ordering::Release);
        info!(port = bound, "listening for peers");

        let inner = Arc::clone(&self.inner);
        std::thread::Builder::new()
            .name("ares-accept".to_string())
            .spawn(move || accept_loop(listener, inner))
            .map_err(CommError::Setup)?;
        Ok(())
    }

    /// The port the listener is bound to, once `listen` has succeeded.
    pub fn local_port(&self) -> Option<u16> {
        *self.local_port.lock()
    }

    /// Whether this endpoint took the listening role, over TCP or a FIFO
    /// pair.
    pub fn is_listener(&self) -> bool {
        self.is_listener.load(Ordering::Acquire)
    }

    /// Connect to a listening peer over TCP.
    pub fn connect(&self, host: &str, port: u16) -> Result<(), CommError> {
        let stream = TcpStream::connect((host, port)).map_err(CommError::Setup)?;
        let stream2 = stream.try_clone().map_err(CommError::Setup)?;
        info!(host, port, "connected to peer");
        self.add_connection(Channel::Socket(stream), Channel::Socket(stream2));
        Ok(())
    }

    /// Create a FIFO pair and open this side of it. The peer calls
    /// `connect_fifo` with the same paths swapped into its own view.
    ///
    /// Both `open` calls block until the peer opens the complementary end.
    /// This side opens its writer first and its reader second; the
    /// connecting side does the reverse, so the two processes pair up
    /// without deadlocking.
    pub fn listen_fifo(&self, send_path: &Path, receive_path: &Path) -> Result<(), CommError> {
        create_fifo(send_path)?;
        if let Err(err) = create_fifo(receive_path) {
            // Setup is atomic: do not leave a half-created pair on disk.
            let _ = std::fs::remove_file(send_path);
            return Err(err);
        }
        debug!(send = %send_path.display(), receive = %receive_path.display(), "created fifo pair");

        let opened = open_fifo_writer(send_path)
            .and_then(|send_channel| Ok((send_channel, open_fifo_reader(receive_path)?)));
        let (send_channel, receive_channel) = match opened {
            Ok(channels) => channels,
            Err(err) => {
                let _ = std::fs::remove_file(send_path);
                let _ = std::fs::remove_file(receive_path);
                return Err(err);
            }
        };
        self.is_listener.store(true, Ordering::Release);
        self.add_connection(send_channel, receive_channel);
        Ok(())
    }

    /// Open the connecting side of an existing FIFO pair. `send_path` is
    /// the listener's `receive_path` and vice versa.
    pub fn connect_fifo(&self, send_path: &Path, receive_path: &Path) -> Result<(), CommError> {
        let receive_channel = open_fifo_reader(receive_path)?;
        let send_channel = open_fifo_writer(send_path)?;
        self.add_connection(send_channel, receive_channel);
        Ok(())
    }

    /// Block until at least one peer connection exists.
    pub fn wait_for_connection(&self, timeout: Duration) -> Result<(), CommError> {
        if !self.inner.connections.acquire_timeout(timeout) {
            return Err(CommError::NoConnection);
        }
        // Put the permit back so repeated waits and connection counting
        // keep working.
        self.inner.connections.release();
        Ok(())
    }

    /// Number of established peer connections.
    pub fn num_connections(&self) -> usize {
        self.inner.dispatchers.lock().len()
    }

    /// Send a raw payload to the first connected peer.
    pub fn send(&self, payload: Vec<u8>) -> Result<(), CommError> {
        self.send_to(0, Message::raw(payload))
    }

    /// Send a message to the peer at `index`, in connection order.
    pub fn send_to(&self, index: usize, msg: Message) -> Result<(), CommError> {
        self.dispatcher(index)?.send(msg)
    }

    /// Block for the next message from the first connected peer.
    pub fn receive(&self) -> Result<Message, CommError> {
        self.receive_from(0)
    }

    /// Block for the next message from the peer at `index`.
    pub fn receive_from(&self, index: usize) -> Result<Message, CommError> {
        self.dispatcher(index)?.receive()
    }

    /// Receive from the first peer with a bounded wait.
    pub fn receive_timeout(&self, timeout: Duration) -> Result<Message, CommError> {
        self.dispatcher(0)?.receive_timeout(timeout)
    }

    /// Prepare the group barrier. Only the two-party rendezvous is
    /// supported; other sizes are rejected.
    ///
    /// The barrier semaphore itself exists from construction, so markers
    /// from a peer that initialized first are already counted by the time
    /// this runs.
    pub fn init_group(&self, group_size: usize) -> Result<(), CommError> {
        if group_size != 2 {
            return Err(CommError::UnsupportedGroupSize(group_size));
        }
        self.inner.barrier_ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Rendezvous with the peer: announce arrival, then wait for the
    /// peer's announcement. Neither side returns before both have arrived.
    pub fn barrier(&self) -> Result<(), CommError> {
        if !self.inner.barrier_ready.load(Ordering::Acquire) {
            return Err(CommError::BarrierNotInitialized);
        }

        self.send_to(0, Message::barrier())?;
        self.inner.barrier.acquire();
        Ok(())
    }

    fn add_connection(&self, send_channel: Channel, receive_channel: Channel) {
        let handler: Arc<dyn MessageHandler> = self.inner.clone();
        let dispatcher = Arc::new(MessageDispatcher::spawn(
            handler,
            send_channel,
            receive_channel,
        ));
        self.inner.dispatchers.lock().push(dispatcher);
        self.inner.connections.release();
    }

    fn dispatcher(&self, index: usize) -> Result<Arc<MessageDispatcher>, CommError> {
        self.inner
            .dispatchers
            .lock()
            .get(index)
            .map(Arc::clone)
            .ok_or(CommError::NoConnection)
    }
}

/// Accept inbound peers until the listener socket fails.
fn accept_loop(listener: TcpListener, inner: Arc<CommInner>) {
    loop {
        let stream = match listener.accept() {
            Ok((stream, addr)) => {
                debug!(%addr, "accepted peer connection");
                stream
            }
            Err(err) => {
                warn!(%err, "accept loop: listener failed");
                return;
            }
        };
        let stream2 = match stream.try_clone() {
            Ok(clone) => clone,
            Err(err) => {
                warn!(%err, "accept loop: failed to clone stream, dropping peer");
                continue;
            }
        };
        let handler: Arc<dyn MessageHandler> = inner.clone();
        let dispatcher = Arc::new(MessageDispatcher::spawn(
            handler,
            Channel::Socket(stream),
            Channel::Socket(stream2),
        ));
        inner.dispatchers.lock().push(dispatcher);
        inner.connections.release();
    }
}
