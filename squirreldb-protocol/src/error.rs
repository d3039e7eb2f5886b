//! Protocol error types.

use thiserror::Error;

/// Errors that can occur during handshake parsing, framing or message encoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid magic bytes: expected 'SQRL', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("handshake too short: need {needed} more bytes")]
    HandshakeTooShort { needed: usize },

    #[error("frame header too short: need {needed} more bytes")]
    FrameHeaderTooShort { needed: usize },

    #[error("invalid frame length field: {0} (must be at least 2)")]
    InvalidFrameLength(u32),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("invalid message type: {0:#x}")]
    InvalidMessageType(u8),

    #[error("invalid encoding tag: {0:#x}")]
    InvalidEncoding(u8),

    #[error("auth token too long: {0} bytes (max 65535)")]
    TokenTooLong(usize),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MessagePack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    #[error("MessagePack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Returns whether this error only means more bytes are needed.
    ///
    /// The caller should keep the buffered data and wait for the next read.
    pub fn is_incomplete(&self) -> bool {
        matches!(
            self,
            ProtocolError::HandshakeTooShort { .. } | ProtocolError::FrameHeaderTooShort { .. }
        )
    }

    /// Returns whether the byte stream can no longer be trusted after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidMagic(_)
                | ProtocolError::InvalidFrameLength(_)
                | ProtocolError::FrameTooLarge { .. }
                | ProtocolError::Io(_)
        )
    }
}
