//! Fire-and-forget change notification to every live participant but the sender.
//!
//! Each recipient gets its own spawned delivery task, so a slow or dead peer
//! never holds up the others. A delivery that errors or does not finish
//! within the timeout marks the peer dead: it is unregistered and never
//! retried. Nothing is reported back to the mutating caller.

use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::protocol::{ChangeKind, Participant};
use crate::registry::{Session, SessionRegistry};

/// Default time a single delivery may take before the peer is considered dead.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Something the authority can push a `notify(kind)` call into.
pub trait NotifySink: Send + Sync {
    fn notify(&self, kind: ChangeKind) -> BoxFuture<'_, Result<(), DeliveryError>>;
}

/// Fanout health counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutStats {
    pub rounds: u64,
    pub delivered: u64,
    pub failed: u64,
}

#[derive(Default)]
struct AtomicFanoutStats {
    rounds: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered(Participant),
    Failed(Participant, DeliveryError),
}

/// Delivery tasks spawned by one [`Fanout::broadcast`] call.
///
/// Dropping the round detaches the tasks; they keep running.
pub struct FanoutRound {
    tasks: Vec<JoinHandle<DeliveryOutcome>>,
    recipients: Vec<Participant>,
}

impl FanoutRound {
    pub fn recipients(&self) -> &[Participant] {
        &self.recipients
    }

    /// Wait for every delivery of this round.
    pub async fn settle(self) -> FanoutReport {
        let mut report = FanoutReport::default();
        for task in self.tasks {
            match task.await {
                Ok(DeliveryOutcome::Delivered(p)) => report.delivered.push(p),
                Ok(DeliveryOutcome::Failed(p, _)) => report.failed.push(p),
                Err(e) => log::error!("Delivery task panicked: {e}"),
            }
        }
        report.delivered.sort_by_key(|p| p.id);
        report.failed.sort_by_key(|p| p.id);
        report
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: Vec<Participant>,
    pub failed: Vec<Participant>,
}

pub struct Fanout {
    registry: Arc<SessionRegistry>,
    delivery_timeout: Duration,
    stats: Arc<AtomicFanoutStats>,
}

impl Fanout {
    pub fn new(registry: Arc<SessionRegistry>, delivery_timeout: Duration) -> Self {
        Self {
            registry,
            delivery_timeout,
            stats: Arc::new(AtomicFanoutStats::default()),
        }
    }

    /// Notify every live participant except `sender` that `kind` changed.
    pub async fn broadcast(&self, sender: &str, kind: ChangeKind) -> FanoutRound {
        let recipients = self.registry.recipients_except(sender).await;
        self.stats.rounds.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "Fanout of {kind} change from {sender} to {} participants",
            recipients.len()
        );

        let mut round = FanoutRound {
            tasks: Vec::with_capacity(recipients.len()),
            recipients: Vec::with_capacity(recipients.len()),
        };
        for session in recipients {
            round.recipients.push(session.participant.clone());
            round.tasks.push(tokio::spawn(deliver(
                session,
                kind,
                self.delivery_timeout,
                self.registry.clone(),
                self.stats.clone(),
            )));
        }
        round
    }

    pub fn delivery_timeout(&self) -> Duration {
        self.delivery_timeout
    }

    pub fn stats(&self) -> FanoutStats {
        FanoutStats {
            rounds: self.stats.rounds.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        }
    }
}

async fn deliver(
    session: Session,
    kind: ChangeKind,
    timeout: Duration,
    registry: Arc<SessionRegistry>,
    stats: Arc<AtomicFanoutStats>,
) -> DeliveryOutcome {
    let result = match tokio::time::timeout(timeout, session.sink.notify(kind)).await {
        Ok(result) => result,
        Err(_) => Err(DeliveryError::Timeout(timeout)),
    };

    match result {
        Ok(()) => {
            stats.delivered.fetch_add(1, Ordering::Relaxed);
            log::trace!("Notified {} of {kind} change", session.participant.name);
            DeliveryOutcome::Delivered(session.participant)
        }
        Err(err) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "Notifying {} failed ({err}); treating it as dead",
                session.participant.name
            );
            registry.unregister(&session.participant.name).await;
            DeliveryOutcome::Failed(session.participant, err)
        }
    }
}

#[cfg(test)]
pub(crate) mod test_sinks {
    use super::*;
    use parking_lot::Mutex;

    /// Records every notification it receives.
    #[derive(Default)]
    pub struct RecordingSink {
        pub received: Mutex<Vec<ChangeKind>>,
    }

    impl NotifySink for RecordingSink {
        fn notify(&self, kind: ChangeKind) -> BoxFuture<'_, Result<(), DeliveryError>> {
            self.received.lock().push(kind);
            Box::pin(async { Ok(()) })
        }
    }

    /// A peer whose endpoint is gone.
    pub struct UnreachableSink;

    impl NotifySink for UnreachableSink {
        fn notify(&self, _kind: ChangeKind) -> BoxFuture<'_, Result<(), DeliveryError>> {
            Box::pin(async { Err(DeliveryError::ConnectionClosed) })
        }
    }

    /// A peer that accepts the call and never answers.
    pub struct StalledSink;

    impl NotifySink for StalledSink {
        fn notify(&self, _kind: ChangeKind) -> BoxFuture<'_, Result<(), DeliveryError>> {
            Box::pin(std::future::pending())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_sinks::*;
    use super::*;

    fn setup() -> (Arc<SessionRegistry>, Fanout) {
        let registry = Arc::new(SessionRegistry::with_seed("s", 0));
        let fanout = Fanout::new(registry.clone(), Duration::from_millis(100));
        (registry, fanout)
    }

    #[tokio::test]
    async fn test_sender_is_never_notified() {
        let (registry, fanout) = setup();
        let a_sink = Arc::new(RecordingSink::default());
        let b_sink = Arc::new(RecordingSink::default());
        let a = registry.register(a_sink.clone()).await;
        let b = registry.register(b_sink.clone()).await;

        let report = fanout.broadcast(&a.name, ChangeKind::Text).await.settle().await;

        assert_eq!(report.delivered, vec![b]);
        assert!(a_sink.received.lock().is_empty());
        assert_eq!(*b_sink.received.lock(), vec![ChangeKind::Text]);
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_removed_and_skipped_next_time() {
        let (registry, fanout) = setup();
        let a = registry.register(Arc::new(RecordingSink::default())).await;
        let b_sink = Arc::new(RecordingSink::default());
        let b = registry.register(b_sink.clone()).await;
        let c = registry.register(Arc::new(UnreachableSink)).await;

        let report = fanout
            .broadcast(&a.name, ChangeKind::Drawing)
            .await
            .settle()
            .await;
        assert_eq!(report.delivered, vec![b.clone()]);
        assert_eq!(report.failed, vec![c.clone()]);
        assert!(!registry.contains(&c.name).await);

        let round = fanout.broadcast(&a.name, ChangeKind::Drawing).await;
        assert_eq!(round.recipients(), &[b][..]);
        round.settle().await;
        assert_eq!(b_sink.received.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_stalled_peer_does_not_delay_healthy_ones() {
        let (registry, fanout) = setup();
        let a = registry.register(Arc::new(RecordingSink::default())).await;
        let stalled = registry.register(Arc::new(StalledSink)).await;
        let healthy_sink = Arc::new(RecordingSink::default());
        registry.register(healthy_sink.clone()).await;

        let round = fanout.broadcast(&a.name, ChangeKind::Text).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(healthy_sink.received.lock().len(), 1);

        let report = round.settle().await;
        assert_eq!(report.failed, vec![stalled.clone()]);
        assert!(!registry.contains(&stalled.name).await);
    }

    #[tokio::test]
    async fn test_stats() {
        let (registry, fanout) = setup();
        let a = registry.register(Arc::new(RecordingSink::default())).await;
        registry.register(Arc::new(RecordingSink::default())).await;
        registry.register(Arc::new(UnreachableSink)).await;

        fanout.broadcast(&a.name, ChangeKind::Text).await.settle().await;
        fanout.broadcast(&a.name, ChangeKind::Text).await.settle().await;

        assert_eq!(
            fanout.stats(),
            FanoutStats {
                rounds: 2,
                delivered: 2,
                failed: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_broadcast_with_no_peers() {
        let (registry, fanout) = setup();
        let a = registry.register(Arc::new(RecordingSink::default())).await;
        let report = fanout.broadcast(&a.name, ChangeKind::Text).await.settle().await;
        assert_eq!(report, FanoutReport::default());
    }
}
