//! The authority's contract as seen by a participant.
//!
//! [`SyncClient`](crate::client::SyncClient) implements it over the network,
//! [`Authority`](crate::authority::Authority) implements it in-process.

use futures_util::future::BoxFuture;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::{ChangeKind, MutationReceipt, ProtocolError, RemoteError, StatePayload};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("not connected")]
    NotConnected,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("unexpected reply to {0}")]
    UnexpectedReply(&'static str),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

pub trait SyncService: Send + Sync + 'static {
    fn accept_mutation(
        &self,
        sender: String,
        payload: StatePayload,
    ) -> BoxFuture<'_, Result<MutationReceipt, CallError>>;

    fn read_state(&self, kind: ChangeKind) -> BoxFuture<'_, Result<StatePayload, CallError>>;

    fn read_history(&self, revision: u64) -> BoxFuture<'_, Result<String, CallError>>;

    fn current_revision(&self) -> BoxFuture<'_, Result<u64, CallError>>;
}
