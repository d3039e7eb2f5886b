//! Client error types.

use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] squirreldb_protocol::ProtocolError),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timed out")]
    Timeout,

    #[error("protocol version mismatch: server speaks version {server_version}")]
    VersionMismatch { server_version: u8 },

    #[error("authentication failed")]
    AuthFailed,

    #[error("unexpected handshake status: {0}")]
    UnexpectedHandshakeStatus(u8),

    #[error("server error: {0}")]
    Server(String),

    #[error("unexpected response: expected '{expected}', got '{got}'")]
    UnexpectedResponse {
        expected: &'static str,
        got: &'static str,
    },

    #[error("request id already in flight: {0}")]
    DuplicateRequestId(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
