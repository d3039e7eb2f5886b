//! Handshake packets exchanged before any framed traffic.
//!
//! Request (client to server), variable length:
//!
//! ```text
//! +--------+---------+-------+-----------+-----------------+
//! | magic  | version | flags | token_len | token           |
//! | 4 bytes| 1 byte  |1 byte | 2 bytes   | token_len bytes |
//! +--------+---------+-------+-----------+-----------------+
//! ```
//!
//! Response (server to client), always 19 bytes:
//!
//! ```text
//! +--------+---------+-------+------------+
//! | status | version | flags | session_id |
//! | 1 byte | 1 byte  |1 byte | 16 bytes   |
//! +--------+---------+-------+------------+
//! ```

use crate::error::ProtocolError;
use crate::frame::Encoding;
use bytes::{BufMut, BytesMut};
use uuid::Uuid;

/// Magic bytes opening every handshake request: "SQRL"
pub const MAGIC: [u8; 4] = *b"SQRL";

/// Size of the fixed request prefix (magic + version + flags + token length).
pub const HANDSHAKE_REQUEST_PREFIX_SIZE: usize = 8;

/// Size of the handshake response in bytes (1+1+1+16 = 19).
pub const HANDSHAKE_RESPONSE_SIZE: usize = 19;

/// Encoding capabilities advertised during the handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandshakeFlags(u8);

impl HandshakeFlags {
    /// MessagePack payloads are supported.
    pub const BINARY: u8 = 1 << 0;
    /// JSON payloads are supported as a fallback.
    pub const JSON_FALLBACK: u8 = 1 << 1;

    pub fn new(binary: bool, json_fallback: bool) -> Self {
        let mut bits = 0;
        if binary {
            bits |= Self::BINARY;
        }
        if json_fallback {
            bits |= Self::JSON_FALLBACK;
        }
        Self(bits)
    }

    pub fn supports_binary(&self) -> bool {
        self.0 & Self::BINARY != 0
    }

    pub fn supports_json(&self) -> bool {
        self.0 & Self::JSON_FALLBACK != 0
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Unknown bits are preserved so a newer server's flags survive a round-trip.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }
}

/// Outcome reported by the server in the handshake response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    Success,
    VersionMismatch,
    AuthFailed,
    /// A status byte this client does not know.
    Unknown(u8),
}

impl HandshakeStatus {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0 => HandshakeStatus::Success,
            1 => HandshakeStatus::VersionMismatch,
            2 => HandshakeStatus::AuthFailed,
            other => HandshakeStatus::Unknown(other),
        }
    }

    pub fn as_byte(&self) -> u8 {
        match self {
            HandshakeStatus::Success => 0,
            HandshakeStatus::VersionMismatch => 1,
            HandshakeStatus::AuthFailed => 2,
            HandshakeStatus::Unknown(byte) => *byte,
        }
    }
}

/// Client hello packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub version: u8,
    pub flags: HandshakeFlags,
    /// Auth token, empty when the server does not require one.
    pub token: String,
}

impl HandshakeRequest {
    pub fn new(flags: HandshakeFlags, token: impl Into<String>) -> Self {
        Self {
            version: crate::PROTOCOL_VERSION,
            flags,
            token: token.into(),
        }
    }

    /// Encodes the request into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let token = self.token.as_bytes();
        let token_len =
            u16::try_from(token.len()).map_err(|_| ProtocolError::TokenTooLong(token.len()))?;

        let mut buf = BytesMut::with_capacity(HANDSHAKE_REQUEST_PREFIX_SIZE + token.len());
        buf.put_slice(&MAGIC);
        buf.put_u8(self.version);
        buf.put_u8(self.flags.bits());
        buf.put_u16(token_len);
        buf.put_slice(token);
        Ok(buf)
    }

    /// Decodes a request, returning it together with the number of bytes it used.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), ProtocolError> {
        if buf.len() < HANDSHAKE_REQUEST_PREFIX_SIZE {
            return Err(ProtocolError::HandshakeTooShort {
                needed: HANDSHAKE_REQUEST_PREFIX_SIZE - buf.len(),
            });
        }

        let magic: [u8; 4] = [buf[0], buf[1], buf[2], buf[3]];
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let token_len = u16::from_be_bytes([buf[6], buf[7]]) as usize;
        let total = HANDSHAKE_REQUEST_PREFIX_SIZE + token_len;
        if buf.len() < total {
            return Err(ProtocolError::HandshakeTooShort {
                needed: total - buf.len(),
            });
        }

        let token = String::from_utf8_lossy(&buf[HANDSHAKE_REQUEST_PREFIX_SIZE..total]).into_owned();

        Ok((
            Self {
                version: buf[4],
                flags: HandshakeFlags::from_bits(buf[5]),
                token,
            },
            total,
        ))
    }
}

/// Server reply to the hello packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub status: HandshakeStatus,
    pub version: u8,
    pub flags: HandshakeFlags,
    pub session_id: Uuid,
}

impl HandshakeResponse {
    /// Decodes the fixed 19-byte response. Extra trailing bytes are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < HANDSHAKE_RESPONSE_SIZE {
            return Err(ProtocolError::HandshakeTooShort {
                needed: HANDSHAKE_RESPONSE_SIZE - buf.len(),
            });
        }

        let mut session_id = [0u8; 16];
        session_id.copy_from_slice(&buf[3..HANDSHAKE_RESPONSE_SIZE]);

        Ok(Self {
            status: HandshakeStatus::from_byte(buf[0]),
            version: buf[1],
            flags: HandshakeFlags::from_bits(buf[2]),
            session_id: Uuid::from_bytes(session_id),
        })
    }

    /// Encodes the response into its 19-byte form.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_RESPONSE_SIZE);
        buf.put_u8(self.status.as_byte());
        buf.put_u8(self.version);
        buf.put_u8(self.flags.bits());
        buf.put_slice(self.session_id.as_bytes());
        buf
    }

    /// Picks the payload encoding for the rest of the connection.
    ///
    /// MessagePack is used only when both sides advertise it.
    pub fn negotiated_encoding(&self, client: HandshakeFlags) -> Encoding {
        if client.supports_binary() && self.flags.supports_binary() {
            Encoding::BinaryPack
        } else {
            Encoding::Json
        }
    }
}
