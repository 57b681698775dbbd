//! WebSocket remote
//!
//! Maintains a long-lived WebSocket connection to the document server.
//! Handles reconnection automatically with exponential backoff and
//! re-subscribes every open listener once the connection is back.
//!
//! There is no retry queue: while the connection is down, merges, deletes
//! and fetches fail immediately with [`RemoteError::Disconnected`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::message::{ClientMessage, PeerId, RequestId, ServerMessage};
use super::{RemoteError, RemoteResult, RemoteStore, SnapshotStream};
use crate::models::{Collection, Fields};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;
type Listener = mpsc::UnboundedSender<RemoteResult<Collection>>;
type PendingReplies = HashMap<RequestId, oneshot::Sender<RemoteResult<Reply>>>;

/// Connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Not connected, waiting to retry
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Connected and ready
    Connected,
}

/// Configuration for the WebSocket remote
#[derive(Debug, Clone)]
pub struct WsRemoteConfig {
    /// WebSocket URL of the document server
    pub url: String,
    /// Limit for connecting plus the join/peer handshake
    pub handshake_timeout: Duration,
    /// Initial reconnect delay
    pub initial_reconnect_delay: Duration,
    /// Maximum reconnect delay
    pub max_reconnect_delay: Duration,
}

impl WsRemoteConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            handshake_timeout: Duration::from_secs(10),
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
        }
    }
}

enum Reply {
    Ack,
    Documents(Collection),
}

enum Command {
    Request {
        message: ClientMessage,
        reply: oneshot::Sender<RemoteResult<Reply>>,
    },
    Listen {
        listener_id: u64,
        collection: String,
        sink: Listener,
    },
    Unlisten {
        listener_id: u64,
    },
    Shutdown,
}

struct ListenerEntry {
    collection: String,
    sink: Listener,
}

struct Session {
    write: WsWrite,
    read: WsRead,
}

/// Remote document store reached over WebSocket
pub struct WsRemote {
    peer_id: PeerId,
    command_tx: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<ConnectionStatus>,
    next_request: AtomicU64,
    next_listener: AtomicU64,
}

impl WsRemote {
    /// Connect to the document server
    ///
    /// The first connection must succeed; an unreachable or misconfigured
    /// server yields [`RemoteError::Unavailable`]. Later disconnections are
    /// handled in the background.
    pub async fn connect(config: WsRemoteConfig) -> RemoteResult<Self> {
        let peer_id: PeerId = format!("comanda-{}", &uuid::Uuid::new_v4().to_string()[..8]);

        let session = open_session(&config, &peer_id)
            .await
            .map_err(|e| RemoteError::Unavailable(format!("{:#}", e)))?;
        info!(url = %config.url, peer_id = %peer_id, "Connected to remote");

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connected);

        tokio::spawn(connection_loop(
            config,
            peer_id.clone(),
            session,
            command_rx,
            status_tx,
        ));

        Ok(Self {
            peer_id,
            command_tx,
            status_rx,
            next_request: AtomicU64::new(1),
            next_listener: AtomicU64::new(1),
        })
    }

    /// Get our peer ID
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Get the current status
    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    /// Subscribe to status changes
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    fn next_request_id(&self) -> RequestId {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }

    async fn request(&self, message: ClientMessage) -> RemoteResult<Reply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Request {
                message,
                reply: reply_tx,
            })
            .map_err(|_| RemoteError::Closed)?;

        reply_rx.await.map_err(|_| RemoteError::Closed)?
    }
}

impl Drop for WsRemote {
    fn drop(&mut self) {
        let _ = self.command_tx.send(Command::Shutdown);
    }
}

#[async_trait]
impl RemoteStore for WsRemote {
    async fn merge(&self, collection: &str, id: &str, fields: &Fields) -> RemoteResult<()> {
        let message = ClientMessage::Merge {
            request_id: self.next_request_id(),
            collection: collection.to_string(),
            id: id.to_string(),
            fields: fields.clone(),
        };
        match self.request(message).await? {
            Reply::Ack => Ok(()),
            Reply::Documents(_) => Err(RemoteError::Protocol(
                "documents reply to a merge".to_string(),
            )),
        }
    }

    async fn delete(&self, collection: &str, id: &str) -> RemoteResult<()> {
        let message = ClientMessage::Delete {
            request_id: self.next_request_id(),
            collection: collection.to_string(),
            id: id.to_string(),
        };
        match self.request(message).await? {
            Reply::Ack => Ok(()),
            Reply::Documents(_) => Err(RemoteError::Protocol(
                "documents reply to a delete".to_string(),
            )),
        }
    }

    async fn fetch_all(&self, collection: &str) -> RemoteResult<Collection> {
        let message = ClientMessage::Fetch {
            request_id: self.next_request_id(),
            collection: collection.to_string(),
        };
        match self.request(message).await? {
            Reply::Documents(documents) => Ok(documents),
            Reply::Ack => Err(RemoteError::Protocol("ack reply to a fetch".to_string())),
        }
    }

    async fn listen(&self, collection: &str) -> RemoteResult<SnapshotStream> {
        let listener_id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        let (sink, rx) = mpsc::unbounded_channel();

        self.command_tx
            .send(Command::Listen {
                listener_id,
                collection: collection.to_string(),
                sink,
            })
            .map_err(|_| RemoteError::Closed)?;

        let command_tx = self.command_tx.clone();
        Ok(SnapshotStream::new(rx).on_drop(move || {
            let _ = command_tx.send(Command::Unlisten { listener_id });
        }))
    }
}

/// Connect and complete the join/peer handshake
async fn open_session(config: &WsRemoteConfig, peer_id: &str) -> Result<Session> {
    debug!("Connecting to {}", config.url);
    let (ws_stream, _response) =
        tokio::time::timeout(config.handshake_timeout, connect_async(&config.url))
            .await
            .with_context(|| format!("Timed out connecting to {}", config.url))?
            .with_context(|| format!("Failed to connect to {}", config.url))?;

    let (mut write, mut read) = ws_stream.split();

    send(&mut write, &ClientMessage::join(peer_id)).await?;
    let server_peer_id = wait_for_peer(&mut read, config.handshake_timeout).await?;
    debug!(server_peer_id = %server_peer_id, "Handshake complete");

    Ok(Session { write, read })
}

/// Wait for peer handshake response
async fn wait_for_peer(read: &mut WsRead, timeout: Duration) -> Result<PeerId> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            anyhow::bail!("Timeout waiting for the remote handshake. Check that the server is running.");
        }

        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        match ServerMessage::decode(&data) {
                            Ok(ServerMessage::Peer { sender_id, .. }) => return Ok(sender_id),
                            Ok(ServerMessage::Error { message, .. }) => {
                                anyhow::bail!("Remote refused the connection: {}", message);
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "Failed to decode handshake message"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        anyhow::bail!("Remote closed connection during handshake");
                    }
                    Some(Err(e)) => {
                        anyhow::bail!("Remote connection error: {}", e);
                    }
                    _ => {}
                }
            }
            _ = tokio::time::sleep(remaining) => {
                anyhow::bail!("Timeout waiting for the remote handshake. Check that the server is running.");
            }
        }
    }
}

/// Main connection task with reconnection
async fn connection_loop(
    config: WsRemoteConfig,
    peer_id: PeerId,
    first: Session,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
    status_tx: watch::Sender<ConnectionStatus>,
) {
    let mut listeners: HashMap<u64, ListenerEntry> = HashMap::new();
    let mut session = Some(first);
    let mut reconnect_delay = config.initial_reconnect_delay;

    loop {
        if let Some(active) = session.take() {
            let _ = status_tx.send(ConnectionStatus::Connected);

            match run_session(active, &mut command_rx, &mut listeners).await {
                Ok(true) => break,
                Ok(false) => info!(url = %config.url, "Remote closed the connection"),
                Err(e) => warn!(url = %config.url, error = %format!("{:#}", e), "Remote connection lost"),
            }

            for entry in listeners.values() {
                let _ = entry.sink.send(Err(RemoteError::Disconnected));
            }
        }
        let _ = status_tx.send(ConnectionStatus::Disconnected);

        if wait_offline(reconnect_delay, &mut command_rx, &mut listeners).await {
            break;
        }

        let _ = status_tx.send(ConnectionStatus::Connecting);
        match open_session(&config, &peer_id).await {
            Ok(reopened) => {
                info!(url = %config.url, "Reconnected to remote");
                reconnect_delay = config.initial_reconnect_delay;
                session = Some(reopened);
            }
            Err(e) => {
                debug!(error = %format!("{:#}", e), "Reconnect failed");
                reconnect_delay = (reconnect_delay * 2).min(config.max_reconnect_delay);
            }
        }
    }

    let _ = status_tx.send(ConnectionStatus::Disconnected);
    debug!("Remote connection task stopped");
}

/// Serve commands while disconnected until `delay` elapses
///
/// Returns true on shutdown.
async fn wait_offline(
    delay: Duration,
    command_rx: &mut mpsc::UnboundedReceiver<Command>,
    listeners: &mut HashMap<u64, ListenerEntry>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            cmd = command_rx.recv() => match cmd {
                Some(Command::Request { reply, .. }) => {
                    let _ = reply.send(Err(RemoteError::Disconnected));
                }
                Some(Command::Listen { listener_id, collection, sink }) => {
                    // Subscribed for real after the next reconnect
                    let _ = sink.send(Err(RemoteError::Disconnected));
                    listeners.insert(listener_id, ListenerEntry { collection, sink });
                }
                Some(Command::Unlisten { listener_id }) => {
                    listeners.remove(&listener_id);
                }
                Some(Command::Shutdown) | None => return true,
            }
        }
    }
}

/// Run one connected session until it ends
///
/// Returns true on shutdown, false when the server hung up.
async fn run_session(
    session: Session,
    command_rx: &mut mpsc::UnboundedReceiver<Command>,
    listeners: &mut HashMap<u64, ListenerEntry>,
) -> Result<bool> {
    let Session {
        mut write,
        mut read,
    } = session;
    let mut pending = PendingReplies::new();

    let result = session_loop(&mut write, &mut read, command_rx, listeners, &mut pending).await;

    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(RemoteError::Disconnected));
    }
    result
}

async fn session_loop(
    write: &mut WsWrite,
    read: &mut WsRead,
    command_rx: &mut mpsc::UnboundedReceiver<Command>,
    listeners: &mut HashMap<u64, ListenerEntry>,
    pending: &mut PendingReplies,
) -> Result<bool> {
    let mut collections: Vec<String> = listeners
        .values()
        .map(|entry| entry.collection.clone())
        .collect();
    collections.sort();
    collections.dedup();
    for collection in collections {
        send(write, &ClientMessage::Subscribe { collection }).await?;
    }

    loop {
        tokio::select! {
            cmd = command_rx.recv() => {
                match cmd {
                    Some(Command::Request { message, reply }) => {
                        let Some(request_id) = message.request_id() else {
                            let _ = reply.send(Err(RemoteError::Protocol("not a request".to_string())));
                            continue;
                        };
                        pending.insert(request_id, reply);
                        send(write, &message).await?;
                    }
                    Some(Command::Listen { listener_id, collection, sink }) => {
                        // The server answers every subscribe with the current snapshot
                        listeners.insert(listener_id, ListenerEntry { collection: collection.clone(), sink });
                        send(write, &ClientMessage::Subscribe { collection }).await?;
                    }
                    Some(Command::Unlisten { listener_id }) => {
                        if let Some(entry) = listeners.remove(&listener_id) {
                            let still_listened = listeners
                                .values()
                                .any(|other| other.collection == entry.collection);
                            if !still_listened {
                                send(write, &ClientMessage::Unsubscribe { collection: entry.collection }).await?;
                            }
                        }
                    }
                    Some(Command::Shutdown) | None => {
                        write.close().await.ok();
                        return Ok(true);
                    }
                }
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => dispatch(&data, listeners, pending),
                    Some(Ok(Message::Close(_))) | None => return Ok(false),
                    Some(Err(e)) => return Err(e.into()),
                    _ => {}
                }
            }
        }
    }
}

/// Route one server frame to its waiting request or listeners
fn dispatch(data: &[u8], listeners: &HashMap<u64, ListenerEntry>, pending: &mut PendingReplies) {
    let message = match ServerMessage::decode(data) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "Failed to decode message from remote");
            return;
        }
    };

    match message {
        ServerMessage::Snapshot {
            collection,
            documents,
        } => {
            for entry in listeners.values().filter(|e| e.collection == collection) {
                let _ = entry.sink.send(Ok(documents.clone()));
            }
        }
        ServerMessage::Ack { request_id } => resolve(pending, request_id, Ok(Reply::Ack)),
        ServerMessage::Documents {
            request_id,
            documents,
        } => resolve(pending, request_id, Ok(Reply::Documents(documents))),
        ServerMessage::Error {
            request_id: Some(request_id),
            message,
            ..
        } => resolve(pending, request_id, Err(RemoteError::Rejected(message))),
        ServerMessage::Error {
            request_id: None,
            collection: Some(collection),
            message,
        } => {
            for entry in listeners.values().filter(|e| e.collection == collection) {
                let _ = entry.sink.send(Err(RemoteError::Rejected(message.clone())));
            }
        }
        ServerMessage::Error { message, .. } => warn!(message = %message, "Remote reported an error"),
        ServerMessage::Peer { .. } => {}
    }
}

fn resolve(pending: &mut PendingReplies, request_id: RequestId, result: RemoteResult<Reply>) {
    match pending.remove(&request_id) {
        Some(reply) => {
            let _ = reply.send(result);
        }
        None => debug!(request_id, "Reply for unknown request"),
    }
}

async fn send(write: &mut WsWrite, message: &ClientMessage) -> Result<()> {
    let bytes = message.encode()?;
    write
        .send(Message::Binary(bytes))
        .await
        .context("Failed to send to remote")
}
