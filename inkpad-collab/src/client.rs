//! WebSocket RPC client for talking to the authority.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Concurrent calls multiplexed by call id, each with its own timeout
//! - Inbound `notify(kind)` pushes surfaced as [`SyncEvent`]s

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::directory::{Directory, DirectoryError};
use crate::protocol::{
    Call, ChangeKind, MutationReceipt, Participant, RemoteError, Reply, StatePayload, SyncMessage,
};
use crate::service::{CallError, SyncService};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long a call may wait for its reply
    pub call_timeout: Duration,
    /// Buffered events before notifications start being dropped
    pub event_capacity: usize,
    /// Buffered outgoing frames
    pub outgoing_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(5),
            event_capacity: 256,
            outgoing_capacity: 256,
        }
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// The authority says `kind` changed
    Notified(ChangeKind),
    /// Connection lost
    Disconnected,
}

type PendingCalls = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Reply, RemoteError>>>>>;

/// The sync client.
pub struct SyncClient {
    server_url: String,
    config: ClientConfig,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    next_call_id: AtomicU64,

    /// Calls waiting for their reply
    pending: PendingCalls,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<SyncEvent>,

    /// Stops the reader and writer tasks of the current connection
    shutdown: CancellationToken,

    /// Identity obtained through [`SyncClient::register`]
    participant: Mutex<Option<Participant>>,
}

impl SyncClient {
    /// Create a new sync client for `server_url` (`ws://host:port`).
    pub fn new(server_url: impl Into<String>, config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        Self {
            server_url: server_url.into(),
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            next_call_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            shutdown: CancellationToken::new(),
            participant: Mutex::new(None),
        }
    }

    /// Create a client for the endpoint `directory` has under `server_name`.
    ///
    /// Resolves synchronously; call it once before connecting.
    pub fn from_directory(
        directory: &dyn Directory,
        server_name: &str,
        config: ClientConfig,
    ) -> Result<Self, DirectoryError> {
        let url = directory.resolve(server_name)?;
        log::debug!("Resolved {server_name} to {url}");
        Ok(Self::new(url, config))
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), CallError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(CallError::Connect(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        self.shutdown = CancellationToken::new();
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(self.config.outgoing_capacity);
        self.outgoing_tx = Some(out_tx);

        // Writer task: forward outgoing channel to WebSocket
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        let _ = ws_writer.send(Message::Close(None)).await;
                        break;
                    }
                    out = out_rx.recv() => match out {
                        Some(message) => {
                            if ws_writer.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        // Reader task: route replies to their callers, notifications to events
        let shutdown = self.shutdown.clone();
        let pending = self.pending.clone();
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let url = self.server_url.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    msg = ws_reader.next() => msg,
                };
                match msg {
                    Some(Ok(Message::Binary(data))) => match SyncMessage::decode(&data) {
                        Ok(SyncMessage::Reply { call_id, result }) => {
                            match pending.lock().remove(&call_id) {
                                Some(tx) => {
                                    let _ = tx.send(result);
                                }
                                None => log::debug!("Dropping late reply to call {call_id}"),
                            }
                        }
                        Ok(SyncMessage::Notify { kind }) => {
                            if let Err(e) = event_tx.try_send(SyncEvent::Notified(kind)) {
                                log::warn!("Dropping {kind} notification: {e}");
                            }
                        }
                        Ok(other) => log::warn!("Unexpected message from {url}: {other:?}"),
                        Err(e) => log::warn!("Failed to decode message from {url}: {e}"),
                    },
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }

            // Connection lost: stop the writer, fail every call still waiting
            shutdown.cancel();
            *state.write().await = ConnectionState::Disconnected;
            pending.lock().clear();
            let _ = event_tx.try_send(SyncEvent::Disconnected);
            log::info!("Disconnected from {url}");
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.try_send(SyncEvent::Connected);
        log::info!("Connected to {}", self.server_url);
        Ok(())
    }

    /// Send one call and wait for its reply.
    pub async fn call(&self, call: Call) -> Result<Reply, CallError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(CallError::NotConnected);
        }
        let tx = self.outgoing_tx.as_ref().ok_or(CallError::NotConnected)?;

        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let frame = SyncMessage::call(call_id, call).encode()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(call_id, reply_tx);

        if tx.send(Message::Binary(frame.into())).await.is_err() {
            self.pending.lock().remove(&call_id);
            return Err(CallError::ConnectionClosed);
        }

        match tokio::time::timeout(self.config.call_timeout, reply_rx).await {
            Ok(Ok(result)) => result.map_err(CallError::from),
            Ok(Err(_)) => Err(CallError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().remove(&call_id);
                Err(CallError::Timeout(self.config.call_timeout))
            }
        }
    }

    /// Obtain an identity from the authority.
    pub async fn register(&self) -> Result<Participant, CallError> {
        match self.call(Call::Register).await? {
            Reply::Registered(participant) => {
                *self.participant.lock() = Some(participant.clone());
                Ok(participant)
            }
            _ => Err(CallError::UnexpectedReply("register")),
        }
    }

    pub async fn unregister(&self, name: &str) -> Result<bool, CallError> {
        match self.call(Call::Unregister { name: name.to_string() }).await? {
            Reply::Unregistered(removed) => {
                let mut participant = self.participant.lock();
                if participant.as_ref().is_some_and(|p| p.name == name) {
                    *participant = None;
                }
                Ok(removed)
            }
            _ => Err(CallError::UnexpectedReply("unregister")),
        }
    }

    pub async fn set_state(
        &self,
        sender: &str,
        payload: StatePayload,
    ) -> Result<MutationReceipt, CallError> {
        let call = Call::Mutate {
            sender: sender.to_string(),
            payload,
        };
        match self.call(call).await? {
            Reply::Accepted(receipt) => Ok(receipt),
            _ => Err(CallError::UnexpectedReply("set_state")),
        }
    }

    pub async fn get_state(&self, kind: ChangeKind) -> Result<StatePayload, CallError> {
        match self.call(Call::ReadState { kind }).await? {
            Reply::State(payload) => Ok(payload),
            _ => Err(CallError::UnexpectedReply("get_state")),
        }
    }

    pub async fn get_history(&self, revision: u64) -> Result<String, CallError> {
        match self.call(Call::ReadHistory { revision }).await? {
            Reply::History(text) => Ok(text),
            _ => Err(CallError::UnexpectedReply("get_history")),
        }
    }

    pub async fn get_rev_num(&self) -> Result<u64, CallError> {
        match self.call(Call::RevisionNumber).await? {
            Reply::Revision(revision) => Ok(revision),
            _ => Err(CallError::UnexpectedReply("get_rev_num")),
        }
    }

    /// Unregister (best effort) and close the connection.
    pub async fn disconnect(&self) {
        let participant = self.participant.lock().clone();
        if let Some(participant) = participant {
            log::info!("Disconnecting {} from server", participant.name);
            if let Err(e) = self.unregister(&participant.name).await {
                log::warn!("Unregister of {} failed: {e}", participant.name);
            }
        }
        self.shutdown.cancel();
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Identity from the last successful [`SyncClient::register`].
    pub fn participant(&self) -> Option<Participant> {
        self.participant.lock().clone()
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.pending.lock().len()
    }
}

impl SyncService for SyncClient {
    fn accept_mutation(
        &self,
        sender: String,
        payload: StatePayload,
    ) -> BoxFuture<'_, Result<MutationReceipt, CallError>> {
        Box::pin(async move { self.set_state(&sender, payload).await })
    }

    fn read_state(&self, kind: ChangeKind) -> BoxFuture<'_, Result<StatePayload, CallError>> {
        Box::pin(self.get_state(kind))
    }

    fn read_history(&self, revision: u64) -> BoxFuture<'_, Result<String, CallError>> {
        Box::pin(self.get_history(revision))
    }

    fn current_revision(&self) -> BoxFuture<'_, Result<u64, CallError>> {
        Box::pin(self.get_rev_num())
    }
}
