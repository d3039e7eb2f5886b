//! Length-prefixed frame format used after the handshake.
//!
//! Frame layout (6 bytes header + payload):
//!
//! ```text
//! +---------+----------+----------+-------------------+
//! | length  | msg_type | encoding | payload           |
//! | 4 bytes | 1 byte   | 1 byte   | length - 2 bytes  |
//! +---------+----------+----------+-------------------+
//! ```
//!
//! `length` is big-endian and counts the type and encoding bytes plus the payload.

use crate::error::ProtocolError;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Size of the frame header in bytes (4+1+1 = 6).
pub const FRAME_HEADER_SIZE: usize = 6;

/// Bytes covered by `length` that are not payload.
const TAG_BYTES: u32 = 2;

/// Direction/kind of a framed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Request = 1,
    Response = 2,
    Notification = 3,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            1 => Ok(MessageType::Request),
            2 => Ok(MessageType::Response),
            3 => Ok(MessageType::Notification),
            other => Err(ProtocolError::InvalidMessageType(other)),
        }
    }
}

/// Payload serialization format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Encoding {
    /// MessagePack with struct fields written as map keys.
    BinaryPack = 1,
    Json = 2,
}

impl TryFrom<u8> for Encoding {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            1 => Ok(Encoding::BinaryPack),
            2 => Ok(Encoding::Json),
            other => Err(ProtocolError::InvalidEncoding(other)),
        }
    }
}

impl Encoding {
    /// Serializes a value in this encoding.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        match self {
            // to_vec_named keeps field names on the wire; positional arrays
            // would break the internally tagged message enums.
            Encoding::BinaryPack => Ok(rmp_serde::to_vec_named(value)?),
            Encoding::Json => Ok(serde_json::to_vec(value)?),
        }
    }

    /// Deserializes a value from this encoding.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, ProtocolError> {
        match self {
            Encoding::BinaryPack => Ok(rmp_serde::from_slice(bytes)?),
            Encoding::Json => Ok(serde_json::from_slice(bytes)?),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::BinaryPack => "msgpack",
            Encoding::Json => "json",
        }
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed frame header.
///
/// Type and encoding are kept as raw bytes so that a frame with an unknown tag
/// can still be skipped whole without losing stream alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub msg_type: u8,
    pub encoding: u8,
}

impl FrameHeader {
    /// Parses the 6-byte header at the front of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(ProtocolError::FrameHeaderTooShort {
                needed: FRAME_HEADER_SIZE - buf.len(),
            });
        }

        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if length < TAG_BYTES {
            return Err(ProtocolError::InvalidFrameLength(length));
        }

        Ok(Self {
            length,
            msg_type: buf[4],
            encoding: buf[5],
        })
    }

    /// Payload length implied by the `length` field.
    pub fn payload_len(&self) -> u32 {
        self.length - TAG_BYTES
    }

    /// Total bytes this frame occupies on the wire.
    pub fn frame_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload_len() as usize
    }

    pub fn message_type(&self) -> Result<MessageType, ProtocolError> {
        MessageType::try_from(self.msg_type)
    }

    pub fn encoding(&self) -> Result<Encoding, ProtocolError> {
        Encoding::try_from(self.encoding)
    }
}

/// A complete frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u8,
    pub encoding: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(msg_type: MessageType, encoding: Encoding, payload: Bytes) -> Self {
        Self {
            msg_type: msg_type as u8,
            encoding: encoding as u8,
            payload,
        }
    }

    /// Serializes `value` with `encoding` and wraps it in a frame.
    pub fn from_value<T: Serialize>(
        msg_type: MessageType,
        encoding: Encoding,
        value: &T,
    ) -> Result<Self, ProtocolError> {
        let payload = encoding.encode(value)?;
        Ok(Self::new(msg_type, encoding, Bytes::from(payload)))
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let payload_len = self.payload.len();
        if payload_len > MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::FrameTooLarge {
                size: u32::try_from(payload_len).unwrap_or(u32::MAX),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);
        buf.put_u32(payload_len as u32 + TAG_BYTES);
        buf.put_u8(self.msg_type);
        buf.put_u8(self.encoding);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    pub fn message_type(&self) -> Result<MessageType, ProtocolError> {
        MessageType::try_from(self.msg_type)
    }

    /// Decodes the payload using the encoding tag carried by this frame.
    pub fn decode_message<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Encoding::try_from(self.encoding)?.decode(&self.payload)
    }
}
