//! # squirreldb-protocol
//!
//! Wire protocol implementation for the SquirrelDB binary TCP channel.
//!
//! This crate provides:
//! - The fixed-layout handshake request/response packets
//! - Length-prefixed framing with message type and encoding tags
//! - Dual payload encoding (MessagePack or JSON) behind one switch
//! - Tagged client/server message types
//!
//! Nothing in here performs I/O; the client crate owns the socket.

pub mod codec;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod message;

pub use codec::{Encoder, FrameDecoder};
pub use error::ProtocolError;
pub use frame::{Encoding, Frame, FrameHeader, MessageType, FRAME_HEADER_SIZE};
pub use handshake::{
    HandshakeFlags, HandshakeRequest, HandshakeResponse, HandshakeStatus, HANDSHAKE_RESPONSE_SIZE,
    MAGIC,
};
pub use message::{ChangeEvent, ClientMessage, Document, ServerMessage};

/// Protocol version supported by this implementation.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default TCP port for the SquirrelDB wire protocol.
pub const DEFAULT_PORT: u16 = 8082;

/// Maximum frame payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;
