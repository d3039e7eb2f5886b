//! # squirreldb-client
//!
//! Client library for the SquirrelDB binary wire protocol.
//!
//! This crate provides:
//! - Async TCP connection with handshake and encoding negotiation
//! - Request/response correlation over a single connection
//! - Change subscriptions delivered by callback or channel
//! - High-level API for document operations

pub mod client;
pub mod connection;
pub mod error;
pub mod session;

pub use client::{Client, Subscription};
pub use connection::{Connection, ConnectionConfig, EncodingPreference};
pub use error::ClientError;
pub use session::{HandshakeResult, SessionState};
