//! Connection management.
//!
//! [`Connection::connect`] opens the TCP stream, performs the handshake and
//! then hands the stream and its [`Session`] to a background driver task. The
//! driver is the only code that touches the socket, the receive buffer and
//! the request/subscription tables. Callers reach it through an ordered
//! command channel, so frames hit the wire in the order operations were made.

use crate::error::ClientError;
use crate::session::{
    ChangeCallback, HandshakeResult, PendingRequest, Session, SessionState,
};
use squirreldb_protocol::{
    ClientMessage, Encoding, HandshakeFlags, ServerMessage, DEFAULT_PORT, MAX_PAYLOAD_SIZE,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Which payload encodings the client advertises in the handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EncodingPreference {
    /// Advertise MessagePack with JSON as fallback.
    #[default]
    Binary,
    /// Advertise JSON only.
    JsonOnly,
}

impl EncodingPreference {
    pub fn flags(&self) -> HandshakeFlags {
        match self {
            EncodingPreference::Binary => HandshakeFlags::new(true, true),
            EncodingPreference::JsonOnly => HandshakeFlags::new(false, true),
        }
    }
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server address.
    pub addr: SocketAddr,
    /// Limit for TCP connect and, separately, for the handshake exchange.
    pub connect_timeout: Duration,
    /// Per-request limit. `None` waits until the response or connection close.
    pub request_timeout: Option<Duration>,
    /// Token sent in the handshake.
    pub auth_token: Option<String>,
    /// Encodings to advertise.
    pub encoding: EncodingPreference,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// Largest inbound payload accepted before the connection is dropped.
    pub max_message_size: u32,
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
            request_timeout: None,
            auth_token: None,
            encoding: EncodingPreference::Binary,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_message_size: MAX_PAYLOAD_SIZE,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_encoding(mut self, encoding: EncodingPreference) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_max_message_size(mut self, size: u32) -> Self {
        self.max_message_size = size;
        self
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)))
    }
}

/// Work handed to the driver task.
enum Command {
    Request {
        message: ClientMessage,
        pending: PendingRequest,
    },
    Cancel {
        id: String,
    },
    Unsubscribe {
        subscription_id: String,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Handle to an established connection.
///
/// Dropping the handle closes the connection.
pub struct Connection {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
    handshake: HandshakeResult,
    next_id: AtomicU64,
    request_timeout: Option<Duration>,
    active_subscriptions: Arc<AtomicUsize>,
}

/// Removes a local subscription when dropped.
///
/// Holds only a weak command sender, so it never keeps the connection open.
pub(crate) struct SubscriptionGuard {
    commands: mpsc::WeakUnboundedSender<Command>,
    subscription_id: String,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(commands) = self.commands.upgrade() {
            let _ = commands.send(Command::Unsubscribe {
                subscription_id: std::mem::take(&mut self.subscription_id),
            });
        }
    }
}

impl Connection {
    /// Connects to the server and completes the handshake.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, ClientError> {
        tracing::debug!("Connecting to {}...", config.addr);

        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(config.addr))
            .await
            .map_err(|_| {
                tracing::debug!("Connection timeout");
                ClientError::Timeout
            })?
            .map_err(|e| {
                tracing::debug!("Connection failed: {}", e);
                ClientError::Io(e)
            })?;

        stream.set_nodelay(true).ok();

        Self::establish(stream, config).await
    }

    /// Runs the handshake over an already open stream and starts the driver.
    pub async fn establish<S>(mut stream: S, config: ConnectionConfig) -> Result<Self, ClientError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut session = Session::new(config.encoding.flags(), config.max_message_size);

        let hello = session.start_handshake(config.auth_token.as_deref().unwrap_or(""))?;
        stream.write_all(&hello).await?;
        tracing::debug!("Handshake sent ({} bytes), waiting for response...", hello.len());

        let handshake = tokio::time::timeout(
            config.connect_timeout,
            read_handshake(&mut stream, &mut session, config.read_buffer_size),
        )
        .await
        .map_err(|_| {
            tracing::debug!("Handshake timeout");
            ClientError::Timeout
        })??;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(SessionState::Ready);
        let active_subscriptions = Arc::new(AtomicUsize::new(0));
        tokio::spawn(drive(
            stream,
            session,
            command_rx,
            state_tx,
            active_subscriptions.clone(),
            config.read_buffer_size,
        ));

        Ok(Self {
            commands,
            state,
            handshake,
            next_id: AtomicU64::new(1),
            request_timeout: config.request_timeout,
            active_subscriptions,
        })
    }

    /// Allocates a fresh correlation id. Ids are never reused on a connection.
    pub fn next_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// Sends a request and waits for the correlated response.
    pub async fn request(&self, message: ClientMessage) -> Result<ServerMessage, ClientError> {
        self.submit(message, None).await
    }

    /// Sends a subscribe request. `callback` starts receiving changes once the
    /// server acknowledges with `subscribed`.
    pub async fn subscribe(
        &self,
        message: ClientMessage,
        callback: ChangeCallback,
    ) -> Result<ServerMessage, ClientError> {
        self.submit(message, Some(callback)).await
    }

    /// Removes a subscription locally. Later changes for it are dropped.
    pub fn remove_subscription(&self, subscription_id: &str) -> Result<(), ClientError> {
        self.send_command(Command::Unsubscribe {
            subscription_id: subscription_id.to_string(),
        })
    }

    pub(crate) fn subscription_guard(&self, subscription_id: &str) -> SubscriptionGuard {
        SubscriptionGuard {
            commands: self.commands.downgrade(),
            subscription_id: subscription_id.to_string(),
        }
    }

    /// Number of subscriptions currently receiving changes, as of the last
    /// time the driver finished handling a command or read.
    pub fn subscription_count(&self) -> usize {
        self.active_subscriptions.load(Ordering::Relaxed)
    }

    async fn submit(
        &self,
        message: ClientMessage,
        on_subscribed: Option<ChangeCallback>,
    ) -> Result<ServerMessage, ClientError> {
        let id = message.id().to_string();
        let (reply, rx) = oneshot::channel();
        let pending = match on_subscribed {
            Some(callback) => PendingRequest::with_subscription(reply, callback),
            None => PendingRequest::new(reply),
        };

        self.send_command(Command::Request { message, pending })?;

        let outcome = match self.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::debug!("Request id={} timed out", id);
                    let _ = self.send_command(Command::Cancel { id });
                    return Err(ClientError::Timeout);
                }
            },
            None => rx.await,
        };

        outcome.map_err(|_| ClientError::ConnectionClosed)?
    }

    fn send_command(&self, command: Command) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::ConnectionClosed)
    }

    pub fn handshake(&self) -> &HandshakeResult {
        &self.handshake
    }

    pub fn encoding(&self) -> Encoding {
        self.handshake.encoding
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Returns whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Closes the connection, failing every outstanding request.
    pub async fn close(&self) -> Result<(), ClientError> {
        tracing::debug!("Closing connection...");
        let (done, rx) = oneshot::channel();
        if self.send_command(Command::Close { done }).is_ok() {
            let _ = rx.await;
        }
        Ok(())
    }
}

async fn read_handshake<S>(
    stream: &mut S,
    session: &mut Session,
    buffer_size: usize,
) -> Result<HandshakeResult, ClientError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            tracing::debug!("Connection closed during handshake");
            return Err(ClientError::ConnectionClosed);
        }
        if let Some(result) = session.receive_handshake(&buf[..n])? {
            return Ok(result);
        }
    }
}

/// Owns the stream for the rest of the connection's life.
async fn drive<S>(
    mut stream: S,
    mut session: Session,
    mut commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<SessionState>,
    active_subscriptions: Arc<AtomicUsize>,
    buffer_size: usize,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let mut close_ack = None;

    // Frames that arrived together with the handshake response.
    let mut healthy = match session.process_buffered() {
        Ok(_) => true,
        Err(e) => {
            log_receive_error(&e);
            false
        }
    };

    while healthy {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Request { message, pending }) => {
                    if let Some(bytes) = session.begin_request(&message, pending) {
                        if let Err(e) = stream.write_all(&bytes).await {
                            tracing::debug!("Write failed: {}", e);
                            healthy = false;
                        }
                    }
                }
                Some(Command::Cancel { id }) => {
                    session.cancel_request(&id);
                }
                Some(Command::Unsubscribe { subscription_id }) => {
                    session.remove_subscription(&subscription_id);
                }
                Some(Command::Close { done }) => {
                    let _ = stream.shutdown().await;
                    close_ack = Some(done);
                    healthy = false;
                }
                None => {
                    tracing::debug!("Connection handle dropped");
                    let _ = stream.shutdown().await;
                    healthy = false;
                }
            },

            result = stream.read(&mut buf) => match result {
                Ok(0) => {
                    tracing::debug!("Connection closed by server");
                    healthy = false;
                }
                Ok(n) => {
                    if let Err(e) = session.receive(&buf[..n]) {
                        log_receive_error(&e);
                        healthy = false;
                    }
                }
                Err(e) => {
                    tracing::debug!("Read failed: {}", e);
                    healthy = false;
                }
            },
        }

        active_subscriptions.store(session.subscription_count(), Ordering::Relaxed);
    }

    session.close();
    active_subscriptions.store(0, Ordering::Relaxed);
    state.send_replace(SessionState::Closed);

    commands.close();
    while let Ok(command) = commands.try_recv() {
        match command {
            Command::Request { pending, .. } => pending.fail(ClientError::ConnectionClosed),
            Command::Close { done } => {
                let _ = done.send(());
            }
            Command::Cancel { .. } | Command::Unsubscribe { .. } => {}
        }
    }

    if let Some(done) = close_ack {
        let _ = done.send(());
    }
    tracing::debug!("Connection closed");
}

fn log_receive_error(error: &ClientError) {
    match error {
        ClientError::Protocol(e) if e.is_fatal() => {
            tracing::error!("Fatal protocol error: {}", e);
        }
        other => tracing::debug!("Receive failed: {}", other),
    }
}
