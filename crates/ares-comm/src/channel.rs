//! Byte channels: the transports the dispatcher frames messages over.
//!
//! The set of transports is closed, so `Channel` is a tagged variant rather
//! than a trait object: a connected TCP stream, or one direction of a named
//! FIFO pair. Short reads and writes are completed by looping; transport
//! failures and EOF surface as errors instead of corrupting framing.

use std::ffi::CString;
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::error::CommError;

/// One direction (or a duplex socket) of byte transport.
pub enum Channel {
    /// Connected stream socket; duplex, cloned per direction.
    Socket(TcpStream),
    /// One end of a named pipe, opened for a single direction. The
    /// descriptor closes on drop.
    Fifo(File),
}

impl Channel {
    /// Write the whole buffer, completing short writes.
    pub fn send_all(&mut self, buf: &[u8]) -> Result<(), CommError> {
        let result = match self {
            Channel::Socket(stream) => stream.write_all(buf),
            Channel::Fifo(file) => file.write_all(buf),
        };
        result.map_err(map_io_error)
    }

    /// Fill the whole buffer, completing short reads.
    pub fn recv_exact(&mut self, buf: &mut [u8]) -> Result<(), CommError> {
        let result = match self {
            Channel::Socket(stream) => stream.read_exact(buf),
            Channel::Fifo(file) => file.read_exact(buf),
        };
        result.map_err(map_io_error)
    }

    /// Clone of the underlying socket, used to shut the connection down
    /// from outside a blocked read. `None` for FIFOs.
    pub(crate) fn socket_handle(&self) -> Option<TcpStream> {
        match self {
            Channel::Socket(stream) => stream.try_clone().ok(),
            Channel::Fifo(_) => None,
        }
    }

    /// Short name for logging.
    pub fn transport_name(&self) -> &'static str {
        match self {
            Channel::Socket(_) => "socket",
            Channel::Fifo(_) => "fifo",
        }
    }
}

fn map_io_error(err: io::Error) -> CommError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionAborted => CommError::Disconnected,
        _ => CommError::Transport(err),
    }
}

/// Create a named FIFO at `path` with owner read/write permissions.
pub fn create_fifo(path: &Path) -> Result<(), CommError> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| CommError::Setup(io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL")))?;

    // SAFETY: c_path is a valid NUL-terminated string.
    let status = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if status != 0 {
        return Err(CommError::Setup(io::Error::last_os_error()));
    }
    Ok(())
}

/// Open a FIFO for writing. Blocks until the peer opens the read side.
pub fn open_fifo_writer(path: &Path) -> Result<Channel, CommError> {
    File::options()
        .write(true)
        .open(path)
        .map(Channel::Fifo)
        .map_err(CommError::Setup)
}

/// Open a FIFO for reading. Blocks until the peer opens the write side.
pub fn open_fifo_reader(path: &Path) -> Result<Channel, CommError> {
    File::open(path).map(Channel::Fifo).map_err(CommError::Setup)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_socket_channel_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut ch = Channel::Socket(stream);
            let mut buf = [0u8; 5];
            ch.recv_exact(&mut buf).unwrap();
            buf
        });

        let mut ch = Channel::Socket(TcpStream::connect(addr).unwrap());
        ch.send_all(b"hello").unwrap();

        assert_eq!(&server.join().unwrap(), b"hello");
    }

    #[test]
    fn test_recv_on_closed_socket_is_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).unwrap();
        let (stream, _) = listener.accept().unwrap();
        drop(client);

        let mut ch = Channel::Socket(stream);
        let mut buf = [0u8; 1];
        match ch.recv_exact(&mut buf) {
            Err(CommError::Disconnected) => {}
            other => panic!("expected Disconnected, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_create_fifo_rejects_existing_path() {
        let path = std::env::temp_dir().join("ares-test-fifo-exists");
        let _ = std::fs::remove_file(&path);
        create_fifo(&path).unwrap();
        assert!(create_fifo(&path).is_err());
        let _ = std::fs::remove_file(&path);
    }
}
