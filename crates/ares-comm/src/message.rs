//! Message framing: typed, length-prefixed payloads.
//!
//! Every message on the wire is a fixed 5-byte header - a little-endian
//! `u32` payload length followed by a one-byte kind tag - and then the
//! payload itself. Barrier messages are type-only markers with a
//! zero-length payload.

use crate::error::CommError;

/// Size of the wire header: 4-byte length + 1-byte kind tag.
pub const HEADER_LEN: usize = 5;

/// Message type tag carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    None = 0,
    Raw = 1,
    Barrier = 2,
}

impl MessageKind {
    /// Decode a wire tag.
    pub fn from_tag(tag: u8) -> Result<Self, CommError> {
        match tag {
            0 => Ok(MessageKind::None),
            1 => Ok(MessageKind::Raw),
            2 => Ok(MessageKind::Barrier),
            other => Err(CommError::InvalidKind(other)),
        }
    }

    /// The wire tag for this kind.
    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// A framed message owning its payload.
///
/// Created by the sender, moved through the dispatcher queues, consumed by
/// the receiver; ownership is the payload `Vec` itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageKind,
    payload: Vec<u8>,
}

impl Message {
    /// A raw application payload.
    pub fn raw(payload: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Raw,
            payload,
        }
    }

    /// A barrier marker (zero-length payload).
    pub fn barrier() -> Self {
        Self {
            kind: MessageKind::Barrier,
            payload: Vec::new(),
        }
    }

    /// A message with an explicit kind, as reconstructed from the wire.
    pub fn with_kind(kind: MessageKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Take ownership of the payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Encode the 5-byte wire header for this message.
    pub fn encode_header(&self) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[..4].copy_from_slice(&(self.payload.len() as u32).to_le_bytes());
        header[4] = self.kind.tag();
        header
    }
}

/// Decode a wire header into (kind, payload length).
pub fn decode_header(header: &[u8; HEADER_LEN]) -> Result<(MessageKind, usize), CommError> {
    let size = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let kind = MessageKind::from_tag(header[4])?;
    Ok((kind, size))
}
