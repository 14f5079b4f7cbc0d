//! The server core: registry, store and fanout under one roof.
//!
//! Transport-independent. [`SyncServer`](crate::server::SyncServer) maps
//! wire calls onto it; tests and embedded setups call it directly.

use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;

use crate::fanout::{Fanout, FanoutRound, FanoutStats, NotifySink};
use crate::protocol::{ChangeKind, MutationReceipt, Participant, StatePayload};
use crate::registry::SessionRegistry;
use crate::service::{CallError, SyncService};
use crate::store::{StateStore, StoreError};

pub struct Authority {
    registry: Arc<SessionRegistry>,
    store: StateStore,
    fanout: Fanout,
}

impl Authority {
    pub fn new(
        server_name: impl Into<String>,
        initial_text: impl Into<String>,
        delivery_timeout: Duration,
    ) -> Self {
        Self::with_registry(
            Arc::new(SessionRegistry::new(server_name)),
            initial_text,
            delivery_timeout,
        )
    }

    pub fn with_registry(
        registry: Arc<SessionRegistry>,
        initial_text: impl Into<String>,
        delivery_timeout: Duration,
    ) -> Self {
        Self {
            fanout: Fanout::new(registry.clone(), delivery_timeout),
            store: StateStore::new(initial_text),
            registry,
        }
    }

    pub async fn register(&self, sink: Arc<dyn NotifySink>) -> Participant {
        self.registry.register(sink).await
    }

    pub async fn unregister(&self, name: &str) -> bool {
        self.registry.unregister(name).await
    }

    /// Commit `payload`, then start notifying everyone but `sender`.
    ///
    /// Returns as soon as the commit is visible; the returned round may be
    /// dropped to leave the deliveries running in the background.
    pub async fn accept_mutation(
        &self,
        sender: &str,
        payload: StatePayload,
    ) -> (MutationReceipt, FanoutRound) {
        let kind = payload.kind();
        let revision = self.store.commit(payload).await;
        log::debug!("Accepted {kind} change from {sender} (revision {revision})");

        let round = self.fanout.broadcast(sender, kind).await;
        (MutationReceipt { kind, revision }, round)
    }

    pub async fn read_state(&self, kind: ChangeKind) -> StatePayload {
        self.store.read(kind).await
    }

    pub async fn read_history(&self, revision: u64) -> Result<String, StoreError> {
        self.store.history(revision).await
    }

    pub async fn current_revision(&self) -> u64 {
        self.store.revision().await
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn fanout_stats(&self) -> FanoutStats {
        self.fanout.stats()
    }
}

impl SyncService for Authority {
    fn accept_mutation(
        &self,
        sender: String,
        payload: StatePayload,
    ) -> BoxFuture<'_, Result<MutationReceipt, CallError>> {
        Box::pin(async move {
            let (receipt, _round) = Authority::accept_mutation(self, &sender, payload).await;
            Ok(receipt)
        })
    }

    fn read_state(&self, kind: ChangeKind) -> BoxFuture<'_, Result<StatePayload, CallError>> {
        Box::pin(async move { Ok(Authority::read_state(self, kind).await) })
    }

    fn read_history(&self, revision: u64) -> BoxFuture<'_, Result<String, CallError>> {
        Box::pin(async move {
            Authority::read_history(self, revision)
                .await
                .map_err(|e| CallError::Remote(e.into()))
        })
    }

    fn current_revision(&self) -> BoxFuture<'_, Result<u64, CallError>> {
        Box::pin(async move { Ok(Authority::current_revision(self).await) })
    }
}
