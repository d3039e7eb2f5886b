//! Tagged message types carried inside frames.
//!
//! Every message is a map with a `type` discriminator and an `id`. The same
//! types serialize to JSON or MessagePack; see [`crate::frame::Encoding`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A stored document as returned by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub collection: String,
    pub data: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Query {
        id: String,
        /// Query string, passed through to the server untouched.
        query: String,
    },
    Subscribe {
        id: String,
        query: String,
    },
    Unsubscribe {
        id: String,
        subscription_id: String,
    },
    Insert {
        id: String,
        collection: String,
        data: Value,
    },
    Update {
        id: String,
        collection: String,
        document_id: String,
        data: Value,
    },
    Delete {
        id: String,
        collection: String,
        document_id: String,
    },
    ListCollections {
        id: String,
    },
    Ping {
        id: String,
    },
}

impl ClientMessage {
    /// Correlation id of this request.
    pub fn id(&self) -> &str {
        match self {
            ClientMessage::Query { id, .. }
            | ClientMessage::Subscribe { id, .. }
            | ClientMessage::Unsubscribe { id, .. }
            | ClientMessage::Insert { id, .. }
            | ClientMessage::Update { id, .. }
            | ClientMessage::Delete { id, .. }
            | ClientMessage::ListCollections { id }
            | ClientMessage::Ping { id } => id,
        }
    }

    /// Wire tag of this request.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Query { .. } => "query",
            ClientMessage::Subscribe { .. } => "subscribe",
            ClientMessage::Unsubscribe { .. } => "unsubscribe",
            ClientMessage::Insert { .. } => "insert",
            ClientMessage::Update { .. } => "update",
            ClientMessage::Delete { .. } => "delete",
            ClientMessage::ListCollections { .. } => "listcollections",
            ClientMessage::Ping { .. } => "ping",
        }
    }
}

/// A change delivered on an active subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChangeEvent {
    /// A document matching the query at subscription time.
    Initial { document: Document },
    Insert { new: Document },
    Update { old: Document, new: Document },
    Delete { old: Document },
}

impl ChangeEvent {
    /// The document the change is about (the new snapshot when there is one).
    pub fn document(&self) -> &Document {
        match self {
            ChangeEvent::Initial { document } => document,
            ChangeEvent::Insert { new } | ChangeEvent::Update { new, .. } => new,
            ChangeEvent::Delete { old } => old,
        }
    }
}

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Result {
        id: String,
        #[serde(default)]
        data: Value,
    },
    Change {
        /// Id of the subscribe request that opened the subscription.
        id: String,
        change: ChangeEvent,
    },
    Subscribed {
        id: String,
    },
    Unsubscribed {
        id: String,
    },
    Error {
        id: String,
        error: String,
    },
    Pong {
        id: String,
    },
}

impl ServerMessage {
    /// Correlation (or subscription) id this message is addressed to.
    pub fn id(&self) -> &str {
        match self {
            ServerMessage::Result { id, .. }
            | ServerMessage::Change { id, .. }
            | ServerMessage::Subscribed { id }
            | ServerMessage::Unsubscribed { id }
            | ServerMessage::Error { id, .. }
            | ServerMessage::Pong { id } => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Result { .. } => "result",
            ServerMessage::Change { .. } => "change",
            ServerMessage::Subscribed { .. } => "subscribed",
            ServerMessage::Unsubscribed { .. } => "unsubscribed",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Pong { .. } => "pong",
        }
    }

    pub fn is_change(&self) -> bool {
        matches!(self, ServerMessage::Change { .. })
    }
}
