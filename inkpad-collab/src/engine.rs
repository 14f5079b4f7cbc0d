//! Per-participant reconciliation between the [`LocalMirror`] and the authority.
//!
//! Three independent loops plus an inbound-event pump:
//!
//! | Loop     | Cadence                                  | Work                                  |
//! |----------|------------------------------------------|---------------------------------------|
//! | text     | woken by keystrokes, text notifications, | push local text, pull if dirty,       |
//! |          | rollback requests                        | serve rollback requests               |
//! | drawing  | `drawing_interval` (1 s)                 | push local drawing, pull if dirty     |
//! | revision | `revision_interval` (5 s)                | refresh revision indicator            |
//! | events   | as `SyncEvent`s arrive                   | set dirty flags                       |
//!
//! Each loop is its own task, so a slow drawing transfer never stalls text.
//! Concurrent writers are not merged: whichever mutation the authority
//! commits last is what everyone pulls.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::client::SyncEvent;
use crate::mirror::LocalMirror;
use crate::protocol::{ChangeKind, Participant, StatePayload};
use crate::revision::{RevisionController, RollbackOutcome};
use crate::service::{CallError, SyncService};

/// Engine cadences.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Period of the drawing loop
    pub drawing_interval: Duration,
    /// Period of the revision indicator refresh
    pub revision_interval: Duration,
    /// Pause after a failed text iteration before trying again
    pub retry_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            drawing_interval: Duration::from_secs(1),
            revision_interval: Duration::from_secs(5),
            retry_delay: Duration::from_millis(250),
        }
    }
}

/// What one text iteration did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextTick {
    /// Revision created by pushing the local text
    pub pushed: Option<u64>,
    /// Mirror overwritten with authoritative text
    pub refreshed: bool,
    pub rollback: Option<RollbackOutcome>,
}

/// What one drawing iteration did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrawingTick {
    pub pushed: bool,
    pub refreshed: bool,
}

pub struct SyncEngine<S> {
    service: Arc<S>,
    mirror: Arc<LocalMirror>,
    participant: Participant,
    revisions: RevisionController<S>,
    config: EngineConfig,
}

impl<S: SyncService> SyncEngine<S> {
    pub fn new(
        service: Arc<S>,
        participant: Participant,
        mirror: Arc<LocalMirror>,
        config: EngineConfig,
    ) -> Self {
        Self {
            revisions: RevisionController::new(service.clone()),
            service,
            mirror,
            participant,
            config,
        }
    }

    pub fn mirror(&self) -> &Arc<LocalMirror> {
        &self.mirror
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    /// Inbound `notify(kind)` from the authority.
    pub fn handle_notification(&self, kind: ChangeKind) {
        log::debug!("{} notified of {kind} change", self.participant.name);
        self.mirror.mark_dirty(kind);
    }

    /// One text iteration: push, pull, then serve a pending rollback.
    pub async fn text_tick(&self) -> Result<TextTick, CallError> {
        let mut tick = TextTick::default();

        if let Some(text) = self.mirror.take_local_text() {
            match self.push(StatePayload::Text(text)).await {
                Ok(revision) => tick.pushed = Some(revision),
                Err(e) => {
                    self.mirror.requeue_local(ChangeKind::Text);
                    return Err(e);
                }
            }
        }

        if self.mirror.take_dirty(ChangeKind::Text) {
            let text = match self.pull_text().await {
                Ok(text) => text,
                Err(e) => {
                    self.mirror.mark_dirty(ChangeKind::Text);
                    return Err(e);
                }
            };
            if self.mirror.apply_remote_text(text) {
                tick.refreshed = true;
            } else {
                // Typed during the pull: push that first, pull again after.
                self.mirror.mark_dirty(ChangeKind::Text);
            }
        }

        if let Some(target) = self.mirror.take_rollback_request() {
            let outcome = self
                .revisions
                .request_rollback(&self.participant.name, target)
                .await;
            // Refresh even when the request was rejected.
            let text = match self.pull_text().await {
                Ok(text) => text,
                Err(e) => {
                    // The rollback may already be committed; pull it next time.
                    self.mirror.mark_dirty(ChangeKind::Text);
                    return Err(e);
                }
            };
            self.mirror.force_remote_text(text);
            tick.refreshed = true;
            let outcome = outcome?;
            if let RollbackOutcome::Applied { revision, .. } = outcome {
                self.mirror.show_revision(revision);
            }
            tick.rollback = Some(outcome);
        }

        Ok(tick)
    }

    /// One drawing iteration: push local strokes, pull if dirty.
    pub async fn drawing_tick(&self) -> Result<DrawingTick, CallError> {
        let mut tick = DrawingTick::default();

        if let Some(drawing) = self.mirror.take_local_drawing() {
            if let Err(e) = self.push(StatePayload::Drawing(drawing)).await {
                self.mirror.requeue_local(ChangeKind::Drawing);
                return Err(e);
            }
            tick.pushed = true;
        }

        if self.mirror.take_dirty(ChangeKind::Drawing) {
            let pulled = self
                .service
                .read_state(ChangeKind::Drawing)
                .await
                .and_then(|payload| {
                    payload
                        .into_drawing()
                        .ok_or(CallError::UnexpectedReply("get_state"))
                });
            let drawing = match pulled {
                Ok(drawing) => drawing,
                Err(e) => {
                    self.mirror.mark_dirty(ChangeKind::Drawing);
                    return Err(e);
                }
            };
            if self.mirror.apply_remote_drawing(drawing) {
                tick.refreshed = true;
            } else {
                self.mirror.mark_dirty(ChangeKind::Drawing);
            }
        }

        Ok(tick)
    }

    /// Refresh the revision indicator. Returns the number shown, if any.
    pub async fn revision_tick(&self) -> Result<Option<u64>, CallError> {
        if self.mirror.is_revision_typing() {
            return Ok(None);
        }
        let revision = self.service.current_revision().await?;
        Ok(self.mirror.show_revision(revision).then_some(revision))
    }

    /// Start all loops. `events` is the client's event stream, if any.
    pub fn spawn(self: Arc<Self>, events: Option<mpsc::Receiver<SyncEvent>>) -> EngineHandle {
        let token = CancellationToken::new();
        let mut tasks = vec![
            tokio::spawn(self.clone().run_text_loop(token.clone())),
            tokio::spawn(self.clone().run_drawing_loop(token.clone())),
            tokio::spawn(self.clone().run_revision_loop(token.clone())),
        ];
        if let Some(events) = events {
            tasks.push(tokio::spawn(self.clone().run_event_pump(events, token.clone())));
        }
        log::info!("Sync engine started for {}", self.participant.name);
        EngineHandle { token, tasks }
    }

    async fn push(&self, payload: StatePayload) -> Result<u64, CallError> {
        let kind = payload.kind();
        let receipt = self
            .service
            .accept_mutation(self.participant.name.clone(), payload)
            .await?;
        log::debug!(
            "{} pushed {kind} (revision {})",
            self.participant.name,
            receipt.revision
        );
        Ok(receipt.revision)
    }

    async fn pull_text(&self) -> Result<String, CallError> {
        self.service
            .read_state(ChangeKind::Text)
            .await?
            .into_text()
            .ok_or(CallError::UnexpectedReply("get_state"))
    }

    async fn run_text_loop(self: Arc<Self>, token: CancellationToken) {
        loop {
            if let Err(e) = self.text_tick().await {
                log::warn!("Text sync for {} failed: {e}", self.participant.name);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(self.config.retry_delay) => continue,
                }
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = self.mirror.text_activity() => {}
            }
        }
    }

    async fn run_drawing_loop(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.drawing_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.drawing_tick().await {
                log::warn!("Drawing sync for {} failed: {e}", self.participant.name);
            }
        }
    }

    async fn run_revision_loop(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.revision_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.revision_tick().await {
                log::warn!("Revision refresh for {} failed: {e}", self.participant.name);
            }
        }
    }

    async fn run_event_pump(
        self: Arc<Self>,
        mut events: mpsc::Receiver<SyncEvent>,
        token: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Some(SyncEvent::Notified(kind)) => self.handle_notification(kind),
                Some(SyncEvent::Connected) => {}
                Some(SyncEvent::Disconnected) | None => {
                    log::warn!("{} lost its connection to the authority", self.participant.name);
                    break;
                }
            }
        }
    }
}

/// Running engine loops.
pub struct EngineHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Stop every loop and wait for them to exit.
    pub async fn shutdown(self) {
        self.token.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                log::error!("Engine task panicked: {e}");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
    }
}
