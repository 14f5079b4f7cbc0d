//! Non-destructive rollback.
//!
//! Restoring revision `r` re-submits its text as a brand new head revision;
//! history is never truncated. Only strictly earlier revisions apply.

use std::sync::Arc;

use crate::protocol::StatePayload;
use crate::service::{CallError, SyncService};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// Revision `restored` was re-applied as the new head `revision`.
    Applied { restored: u64, revision: u64 },
    /// The target was not earlier than `current`; nothing changed.
    Ignored { current: u64 },
}

pub struct RevisionController<S> {
    service: Arc<S>,
}

impl<S: SyncService> RevisionController<S> {
    pub fn new(service: Arc<S>) -> Self {
        Self { service }
    }

    /// Re-apply revision `target` on behalf of `sender`.
    ///
    /// `target == 0` is reported as out of range by the authority.
    pub async fn request_rollback(
        &self,
        sender: &str,
        target: u64,
    ) -> Result<RollbackOutcome, CallError> {
        let current = self.service.current_revision().await?;
        if target >= current {
            log::debug!("Rollback to {target} ignored (current revision {current})");
            return Ok(RollbackOutcome::Ignored { current });
        }

        let content = self.service.read_history(target).await?;
        let receipt = self
            .service
            .accept_mutation(sender.to_string(), StatePayload::Text(content))
            .await?;
        log::info!(
            "{sender} restored revision {target} as revision {}",
            receipt.revision
        );
        Ok(RollbackOutcome::Applied {
            restored: target,
            revision: receipt.revision,
        })
    }
}
