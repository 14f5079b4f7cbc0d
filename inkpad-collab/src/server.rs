//! WebSocket front-end for the [`Authority`].
//!
//! Architecture:
//! ```text
//! Client A ──┐                     ┌── SessionRegistry
//!            ├── connection task ──┤── StateStore (text history + drawing)
//! Client B ──┘   (calls in order)  └── Fanout ──► writer task of every other
//!                                                 connection (Notify frames)
//! ```
//!
//! Each connection gets a reader loop that serves calls in arrival order and
//! a writer task that owns the socket's sink. Replies and notifications both
//! go through the writer; a notification only counts as delivered once the
//! writer has flushed it to the socket.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::authority::Authority;
use crate::directory::{Directory, DirectoryError};
use crate::fanout::{DeliveryError, NotifySink, DEFAULT_DELIVERY_TIMEOUT};
use crate::protocol::{Call, ChangeKind, RemoteError, Reply, SyncMessage};
use crate::store::DEFAULT_INITIAL_TEXT;

/// Directory name used when none is configured.
pub const DEFAULT_SERVER_NAME: &str = "Pypad_dot_com";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Directory name and participant-name prefix
    pub server_name: String,
    /// Revision 1 of the text history
    pub initial_text: String,
    /// Time a single notification may take before the peer is dropped
    pub delivery_timeout: Duration,
    /// Frames buffered per connection writer
    pub outgoing_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            server_name: DEFAULT_SERVER_NAME.to_string(),
            initial_text: DEFAULT_INITIAL_TEXT.to_string(),
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
            outgoing_capacity: 256,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_calls: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),
}

/// One frame for the connection writer, optionally acknowledged once written.
struct Outbound {
    message: Message,
    ack: Option<oneshot::Sender<Result<(), String>>>,
}

/// Reaches a participant through its connection's writer task.
struct ConnectionSink {
    outgoing: mpsc::Sender<Outbound>,
}

impl NotifySink for ConnectionSink {
    fn notify(&self, kind: ChangeKind) -> BoxFuture<'_, Result<(), DeliveryError>> {
        Box::pin(async move {
            let frame = SyncMessage::notify(kind)
                .encode()
                .map_err(|e| DeliveryError::Transport(e.to_string()))?;
            let (ack_tx, ack_rx) = oneshot::channel();
            self.outgoing
                .send(Outbound {
                    message: Message::Binary(frame.into()),
                    ack: Some(ack_tx),
                })
                .await
                .map_err(|_| DeliveryError::ConnectionClosed)?;

            match ack_rx.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(DeliveryError::Transport(e)),
                Err(_) => Err(DeliveryError::ConnectionClosed),
            }
        })
    }
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    authority: Arc<Authority>,
    stats: Arc<RwLock<ServerStats>>,
    directory: Option<Arc<dyn Directory>>,
}

impl SyncServer {
    /// Create a new sync server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let authority = Arc::new(Authority::new(
            config.server_name.clone(),
            config.initial_text.clone(),
            config.delivery_timeout,
        ));
        Self {
            config,
            authority,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            directory: None,
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Publish the bound endpoint in `directory` when the server starts.
    pub fn with_directory(mut self, directory: Arc<dyn Directory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        log::info!(
            "Sync server {} listening on {local_addr}",
            self.config.server_name
        );

        if let Some(directory) = &self.directory {
            let endpoint = format!("ws://{local_addr}");
            let (directory, name, published) = (
                directory.clone(),
                self.config.server_name.clone(),
                endpoint.clone(),
            );
            tokio::task::spawn_blocking(move || directory.publish(&name, &published))
                .await
                .map_err(std::io::Error::other)??;
            log::info!("Published {} as {endpoint}", self.config.server_name);
        }

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let authority = self.authority.clone();
            let stats = self.stats.clone();
            let capacity = self.config.outgoing_capacity;

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, authority, stats, capacity).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        authority: Arc<Authority>,
        stats: Arc<RwLock<ServerStats>>,
        outgoing_capacity: usize,
    ) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(outgoing_capacity);
        tokio::spawn(async move {
            while let Some(out) = out_rx.recv().await {
                let result = ws_sender.send(out.message).await.map_err(|e| e.to_string());
                let failed = result.is_err();
                if let Some(ack) = out.ack {
                    let _ = ack.send(result);
                }
                if failed {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        let sink = Arc::new(ConnectionSink {
            outgoing: out_tx.clone(),
        });
        // Participants registered over this connection, unregistered on close.
        let mut registered: Vec<String> = Vec::new();

        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    {
                        let mut s = stats.write().await;
                        s.total_calls += 1;
                        s.total_bytes += data.len() as u64;
                    }

                    match SyncMessage::decode(&data) {
                        Ok(SyncMessage::Call { call_id, call }) => {
                            log::trace!("{addr} -> {} (call {call_id})", call.name());
                            let result = dispatch(&authority, call, &sink, &mut registered).await;
                            let frame = match SyncMessage::reply(call_id, result).encode() {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::error!("Failed to encode reply for {addr}: {e}");
                                    continue;
                                }
                            };
                            let out = Outbound {
                                message: Message::Binary(frame.into()),
                                ack: None,
                            };
                            if out_tx.send(out).await.is_err() {
                                break;
                            }
                        }
                        Ok(other) => {
                            log::warn!("Unexpected message from {addr}: {other:?}");
                        }
                        Err(e) => {
                            log::warn!("Failed to decode message from {addr}: {e}");
                        }
                    }
                }

                Ok(Message::Close(_)) => {
                    log::info!("Connection closed from {addr}");
                    break;
                }

                Ok(Message::Ping(data)) => {
                    let out = Outbound {
                        message: Message::Pong(data),
                        ack: None,
                    };
                    if out_tx.send(out).await.is_err() {
                        break;
                    }
                }

                Err(e) => {
                    log::error!("WebSocket error from {addr}: {e}");
                    break;
                }

                _ => {}
            }
        }

        for name in registered {
            if authority.unregister(&name).await {
                log::info!("{name} disconnected without unregistering");
            }
        }

        let mut s = stats.write().await;
        s.active_connections -= 1;
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn server_name(&self) -> &str {
        &self.config.server_name
    }

    /// Shared handle to the server core.
    pub fn authority(&self) -> Arc<Authority> {
        self.authority.clone()
    }
}

async fn dispatch(
    authority: &Authority,
    call: Call,
    sink: &Arc<ConnectionSink>,
    registered: &mut Vec<String>,
) -> Result<Reply, RemoteError> {
    match call {
        Call::Register => {
            let participant = authority.register(sink.clone()).await;
            registered.push(participant.name.clone());
            Ok(Reply::Registered(participant))
        }
        Call::Unregister { name } => {
            registered.retain(|n| n != &name);
            Ok(Reply::Unregistered(authority.unregister(&name).await))
        }
        Call::Mutate { sender, payload } => {
            let (receipt, _round) = authority.accept_mutation(&sender, payload).await;
            Ok(Reply::Accepted(receipt))
        }
        Call::ReadState { kind } => Ok(Reply::State(authority.read_state(kind).await)),
        Call::ReadHistory { revision } => authority
            .read_history(revision)
            .await
            .map(Reply::History)
            .map_err(RemoteError::from),
        Call::RevisionNumber => Ok(Reply::Revision(authority.current_revision().await)),
    }
}
