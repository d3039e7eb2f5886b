//! Encoder and receive-side decoder for handshake packets and frames.

use crate::error::ProtocolError;
use crate::frame::{Encoding, Frame, FrameHeader, MessageType, FRAME_HEADER_SIZE};
use crate::handshake::{HandshakeResponse, HANDSHAKE_RESPONSE_SIZE};
use crate::message::{ClientMessage, ServerMessage};
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BytesMut};

/// Encodes messages into framed bytes.
pub struct Encoder;

impl Encoder {
    /// Encodes a client request into a `Request` frame.
    pub fn encode_request(
        message: &ClientMessage,
        encoding: Encoding,
    ) -> Result<BytesMut, ProtocolError> {
        Frame::from_value(MessageType::Request, encoding, message)?.encode()
    }

    /// Encodes a server message. Change events go out as `Notification`
    /// frames, everything else as `Response`.
    pub fn encode_server_message(
        message: &ServerMessage,
        encoding: Encoding,
    ) -> Result<BytesMut, ProtocolError> {
        let msg_type = if message.is_change() {
            MessageType::Notification
        } else {
            MessageType::Response
        };
        Frame::from_value(msg_type, encoding, message)?.encode()
    }
}

/// Receive buffer that re-assembles frames from arbitrary read chunks.
///
/// Bytes are appended at the tail and whole frames are split off the front,
/// so a partially received frame always stays buffered untouched. The
/// consumed prefix is reclaimed by `BytesMut` when the buffer next grows.
pub struct FrameDecoder {
    buffer: BytesMut,
    max_payload_size: u32,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_payload(MAX_PAYLOAD_SIZE)
    }

    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            max_payload_size,
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Takes the 19-byte handshake response off the front of the buffer.
    ///
    /// Returns `Ok(None)` until enough bytes have arrived. Anything after the
    /// response stays buffered for frame decoding.
    pub fn take_handshake(&mut self) -> Result<Option<HandshakeResponse>, ProtocolError> {
        match HandshakeResponse::decode(&self.buffer) {
            Ok(response) => {
                self.buffer.advance(HANDSHAKE_RESPONSE_SIZE);
                Ok(Some(response))
            }
            Err(e) if e.is_incomplete() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Attempts to extract the next complete frame.
    ///
    /// Returns `Ok(Some(frame))` for a complete frame, `Ok(None)` if more data
    /// is needed, or `Err` when the header can never be satisfied (oversized
    /// or malformed length). Errors leave the buffer untouched.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        let header = match FrameHeader::decode(&self.buffer) {
            Ok(header) => header,
            Err(e) if e.is_incomplete() => return Ok(None),
            Err(e) => return Err(e),
        };

        if header.payload_len() > self.max_payload_size {
            return Err(ProtocolError::FrameTooLarge {
                size: header.payload_len(),
                max: self.max_payload_size,
            });
        }

        if self.buffer.len() < header.frame_len() {
            return Ok(None);
        }

        self.buffer.advance(FRAME_HEADER_SIZE);
        let payload = self.buffer.split_to(header.payload_len() as usize).freeze();

        Ok(Some(Frame {
            msg_type: header.msg_type,
            encoding: header.encoding,
            payload,
        }))
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
