//! Wire session state machine.
//!
//! A [`Session`] holds everything that belongs to one connection except the
//! socket itself: the handshake state, the receive buffer, the pending request
//! table and the subscription table. It is driven by exactly one task (see
//! [`crate::connection`]), so none of it is behind a lock.

use crate::error::ClientError;
use bytes::BytesMut;
use squirreldb_protocol::{
    ChangeEvent, ClientMessage, Encoder, Encoding, FrameDecoder, HandshakeFlags,
    HandshakeRequest, HandshakeStatus, ServerMessage,
};
use std::collections::HashMap;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Callback invoked for every change delivered on a subscription.
pub type ChangeCallback = Box<dyn FnMut(ChangeEvent) + Send + 'static>;

/// Completion slot for one outstanding request.
pub type ReplySender = oneshot::Sender<Result<ServerMessage, ClientError>>;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    AwaitingHandshake,
    Ready,
    Closed,
}

/// Outcome of a successful handshake. Fixed for the life of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeResult {
    pub status: HandshakeStatus,
    /// Encoding used for every outbound frame.
    pub encoding: Encoding,
    pub session_id: Uuid,
}

/// A request waiting for its correlated response.
pub struct PendingRequest {
    reply: ReplySender,
    /// Installed into the subscription table when the `subscribed` ack arrives.
    on_subscribed: Option<ChangeCallback>,
}

impl PendingRequest {
    pub fn new(reply: ReplySender) -> Self {
        Self {
            reply,
            on_subscribed: None,
        }
    }

    pub fn with_subscription(reply: ReplySender, callback: ChangeCallback) -> Self {
        Self {
            reply,
            on_subscribed: Some(callback),
        }
    }

    /// Completes the request with an error.
    pub fn fail(self, error: ClientError) {
        let _ = self.reply.send(Err(error));
    }
}

/// Per-connection protocol state.
pub struct Session {
    state: SessionState,
    client_flags: HandshakeFlags,
    decoder: FrameDecoder,
    handshake: Option<HandshakeResult>,
    pending: HashMap<String, PendingRequest>,
    subscriptions: HashMap<String, ChangeCallback>,
}

impl Session {
    pub fn new(client_flags: HandshakeFlags, max_payload_size: u32) -> Self {
        Self {
            state: SessionState::Connecting,
            client_flags,
            decoder: FrameDecoder::with_max_payload(max_payload_size),
            handshake: None,
            pending: HashMap::new(),
            subscriptions: HashMap::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn handshake(&self) -> Option<&HandshakeResult> {
        self.handshake.as_ref()
    }

    /// Builds the handshake request. Must be the first thing written.
    pub fn start_handshake(&mut self, token: &str) -> Result<BytesMut, ClientError> {
        let hello = HandshakeRequest::new(self.client_flags, token).encode()?;
        self.state = SessionState::AwaitingHandshake;
        Ok(hello)
    }

    /// Feeds bytes received while waiting for the handshake response.
    ///
    /// Returns `Ok(None)` until the full 19-byte response is buffered. Any
    /// bytes past the response are kept for [`Session::process_buffered`].
    pub fn receive_handshake(
        &mut self,
        data: &[u8],
    ) -> Result<Option<HandshakeResult>, ClientError> {
        debug_assert_eq!(self.state, SessionState::AwaitingHandshake);
        self.decoder.extend(data);

        let response = match self.decoder.take_handshake()? {
            Some(response) => response,
            None => return Ok(None),
        };

        let outcome = match response.status {
            HandshakeStatus::Success => Ok(HandshakeResult {
                status: response.status,
                encoding: response.negotiated_encoding(self.client_flags),
                session_id: response.session_id,
            }),
            HandshakeStatus::VersionMismatch => Err(ClientError::VersionMismatch {
                server_version: response.version,
            }),
            HandshakeStatus::AuthFailed => Err(ClientError::AuthFailed),
            HandshakeStatus::Unknown(status) => {
                Err(ClientError::UnexpectedHandshakeStatus(status))
            }
        };

        match outcome {
            Ok(result) => {
                tracing::debug!(
                    session_id = %result.session_id,
                    encoding = %result.encoding,
                    "handshake complete"
                );
                self.handshake = Some(result);
                self.state = SessionState::Ready;
                Ok(Some(result))
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    /// Encoding negotiated at handshake time (JSON before that).
    pub fn encoding(&self) -> Encoding {
        self.handshake
            .map(|h| h.encoding)
            .unwrap_or(Encoding::Json)
    }

    /// Registers a pending request and returns the framed bytes to write.
    ///
    /// On failure the pending slot is completed with the error and `None` is
    /// returned; nothing must be written in that case.
    pub fn begin_request(
        &mut self,
        message: &ClientMessage,
        pending: PendingRequest,
    ) -> Option<BytesMut> {
        if self.state != SessionState::Ready {
            pending.fail(ClientError::ConnectionClosed);
            return None;
        }

        let id = message.id();
        if self.pending.contains_key(id) {
            pending.fail(ClientError::DuplicateRequestId(id.to_string()));
            return None;
        }

        match Encoder::encode_request(message, self.encoding()) {
            Ok(bytes) => {
                tracing::debug!(id, kind = message.kind(), len = bytes.len(), "sending request");
                self.pending.insert(id.to_string(), pending);
                Some(bytes)
            }
            Err(e) => {
                pending.fail(ClientError::Protocol(e));
                None
            }
        }
    }

    /// Drops a pending request without completing it.
    ///
    /// A subscribe whose ack was already dispatched is torn down as well,
    /// since the subscription id is the request id.
    pub fn cancel_request(&mut self, id: &str) -> bool {
        let cancelled = self.pending.remove(id).is_some();
        let unsubscribed = self.subscriptions.remove(id).is_some();
        cancelled || unsubscribed
    }

    /// Appends received bytes and dispatches every complete frame.
    ///
    /// Returns the number of messages dispatched. An `Err` means the stream
    /// is desynchronized and the session must be closed.
    pub fn receive(&mut self, data: &[u8]) -> Result<usize, ClientError> {
        self.decoder.extend(data);
        self.process_buffered()
    }

    /// Dispatches complete frames already sitting in the receive buffer.
    pub fn process_buffered(&mut self) -> Result<usize, ClientError> {
        let mut dispatched = 0;
        while let Some(frame) = self.decoder.decode_frame()? {
            match frame.decode_message::<ServerMessage>() {
                Ok(message) => {
                    self.dispatch(message);
                    dispatched += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        encoding = frame.encoding,
                        len = frame.payload.len(),
                        "dropping undecodable frame: {}",
                        e
                    );
                }
            }
        }
        Ok(dispatched)
    }

    /// Routes a decoded server message to its subscription or pending request.
    pub fn dispatch(&mut self, message: ServerMessage) {
        if let ServerMessage::Change { id, change } = message {
            match self.subscriptions.get_mut(&id) {
                Some(callback) => callback(change),
                None => tracing::debug!(id = %id, "dropping change for unknown subscription"),
            }
            return;
        }

        let Some(pending) = self.pending.remove(message.id()) else {
            tracing::debug!(
                id = message.id(),
                kind = message.kind(),
                "dropping response with no pending request"
            );
            return;
        };

        if let (ServerMessage::Subscribed { id }, Some(callback)) =
            (&message, pending.on_subscribed)
        {
            if pending.reply.is_closed() {
                // Nobody holds the id, so nobody could ever unsubscribe.
                tracing::debug!(id = %id, "caller gone, not installing subscription");
            } else {
                tracing::debug!(id = %id, "subscription active");
                self.subscriptions.insert(id.clone(), callback);
            }
        }

        let _ = pending.reply.send(Ok(message));
    }

    /// Removes a subscription. Its callback is never invoked again.
    pub fn remove_subscription(&mut self, id: &str) -> bool {
        self.subscriptions.remove(id).is_some()
    }

    /// Moves to `Closed`: fails every pending request and drops all subscriptions.
    pub fn close(&mut self) {
        if !self.pending.is_empty() {
            tracing::debug!("failing {} pending requests", self.pending.len());
        }
        for (_, pending) in self.pending.drain() {
            pending.fail(ClientError::ConnectionClosed);
        }
        self.subscriptions.clear();
        self.decoder.clear();
        self.state = SessionState::Closed;
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn has_subscription(&self, id: &str) -> bool {
        self.subscriptions.contains_key(id)
    }
}
