//! High-level client API.

use crate::connection::{Connection, ConnectionConfig, SubscriptionGuard};
use crate::error::ClientError;
use squirreldb_protocol::{ChangeEvent, ClientMessage, Document, Encoding, ServerMessage};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

/// High-level client for SquirrelDB.
pub struct Client {
    conn: Connection,
}

/// Change events for one subscription, delivered through a channel.
///
/// Dropping it removes the subscription locally. The server is not told;
/// call [`Client::unsubscribe`] for that.
pub struct Subscription {
    id: String,
    events: mpsc::UnboundedReceiver<ChangeEvent>,
    _guard: SubscriptionGuard,
}

impl Subscription {
    /// Subscription id (the id of the subscribe request).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Waits for the next change. Returns `None` once the subscription is
    /// removed or the connection closes.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }
}

impl Client {
    /// Connects to the server and completes the handshake.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, ClientError> {
        let conn = Connection::connect(config).await?;
        Ok(Self::from_connection(conn))
    }

    /// Wraps an established connection.
    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Session id assigned by the server during the handshake.
    pub fn session_id(&self) -> Uuid {
        self.conn.handshake().session_id
    }

    /// Payload encoding negotiated for this connection.
    pub fn encoding(&self) -> Encoding {
        self.conn.encoding()
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.conn.close().await
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    // =========================================================================
    // Helper methods
    // =========================================================================

    async fn request_result(&self, message: ClientMessage) -> Result<Value, ClientError> {
        match self.conn.request(message).await? {
            ServerMessage::Result { data, .. } => Ok(data),
            other => Err(unexpected("result", other)),
        }
    }

    async fn request_document(&self, message: ClientMessage) -> Result<Document, ClientError> {
        let data = self.request_result(message).await?;
        Ok(serde_json::from_value(data)?)
    }

    // =========================================================================
    // Document operations
    // =========================================================================

    /// Runs a query and returns the raw result.
    ///
    /// The query string is sent as-is; building it is up to the caller.
    pub async fn query(&self, query: impl Into<String>) -> Result<Value, ClientError> {
        let message = ClientMessage::Query {
            id: self.conn.next_id(),
            query: query.into(),
        };
        self.request_result(message).await
    }

    /// Inserts a document into a collection.
    pub async fn insert(&self, collection: &str, data: Value) -> Result<Document, ClientError> {
        let message = ClientMessage::Insert {
            id: self.conn.next_id(),
            collection: collection.to_string(),
            data,
        };
        self.request_document(message).await
    }

    /// Replaces the data of an existing document.
    pub async fn update(
        &self,
        collection: &str,
        document_id: &str,
        data: Value,
    ) -> Result<Document, ClientError> {
        let message = ClientMessage::Update {
            id: self.conn.next_id(),
            collection: collection.to_string(),
            document_id: document_id.to_string(),
            data,
        };
        self.request_document(message).await
    }

    /// Deletes a document, returning its last snapshot.
    pub async fn delete(&self, collection: &str, document_id: &str) -> Result<Document, ClientError> {
        let message = ClientMessage::Delete {
            id: self.conn.next_id(),
            collection: collection.to_string(),
            document_id: document_id.to_string(),
        };
        self.request_document(message).await
    }

    /// Lists collection names.
    pub async fn list_collections(&self) -> Result<Vec<String>, ClientError> {
        let message = ClientMessage::ListCollections {
            id: self.conn.next_id(),
        };
        let data = self.request_result(message).await?;
        Ok(serde_json::from_value(data)?)
    }

    // =========================================================================
    // System operations
    // =========================================================================

    /// Pings the server.
    pub async fn ping(&self) -> Result<(), ClientError> {
        let message = ClientMessage::Ping {
            id: self.conn.next_id(),
        };
        match self.conn.request(message).await? {
            ServerMessage::Pong { .. } => Ok(()),
            other => Err(unexpected("pong", other)),
        }
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Subscribes to changes matching `query`, returning the subscription id.
    ///
    /// `callback` runs on the connection's driver task for every change, in
    /// wire order. It must not block.
    pub async fn subscribe<F>(
        &self,
        query: impl Into<String>,
        callback: F,
    ) -> Result<String, ClientError>
    where
        F: FnMut(ChangeEvent) + Send + 'static,
    {
        let id = self.conn.next_id();
        let message = ClientMessage::Subscribe {
            id: id.clone(),
            query: query.into(),
        };

        match self.conn.subscribe(message, Box::new(callback)).await? {
            ServerMessage::Subscribed { .. } => {
                tracing::debug!("Subscribed id={}", id);
                Ok(id)
            }
            other => Err(unexpected("subscribed", other)),
        }
    }

    /// Subscribes to changes matching `query` and delivers them through a
    /// [`Subscription`].
    pub async fn subscribe_stream(
        &self,
        query: impl Into<String>,
    ) -> Result<Subscription, ClientError> {
        let (tx, events) = mpsc::unbounded_channel();
        let id = self
            .subscribe(query, move |change| {
                let _ = tx.send(change);
            })
            .await?;
        let guard = self.conn.subscription_guard(&id);
        Ok(Subscription {
            id,
            events,
            _guard: guard,
        })
    }

    /// Cancels a subscription.
    ///
    /// The local entry is removed first, so no callback fires after this is
    /// called even if the server is slow to acknowledge.
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<(), ClientError> {
        self.conn.remove_subscription(subscription_id)?;

        let message = ClientMessage::Unsubscribe {
            id: self.conn.next_id(),
            subscription_id: subscription_id.to_string(),
        };
        match self.conn.request(message).await? {
            ServerMessage::Unsubscribed { .. } => Ok(()),
            other => Err(unexpected("unsubscribed", other)),
        }
    }
}

/// Converts a response of the wrong kind into an error. Server `error`
/// messages carry their text through.
fn unexpected(expected: &'static str, response: ServerMessage) -> ClientError {
    match response {
        ServerMessage::Error { error, .. } => ClientError::Server(error),
        other => ClientError::UnexpectedResponse {
            expected,
            got: other.kind(),
        },
    }
}
