//! Authoritative text history and drawing.
//!
//! Text is append-only: every accepted text mutation becomes a new revision
//! (1-indexed, dense). The drawing is not historized; each mutation replaces
//! it wholesale. Each kind sits behind its own lock, and a commit holds the
//! write lock for the whole read/compute/publish step, so readers only ever
//! observe fully committed values.

use thiserror::Error;
use tokio::sync::RwLock;

use crate::protocol::{ChangeKind, Drawing, StatePayload};

/// Text the history starts with when nothing else is configured.
pub const DEFAULT_INITIAL_TEXT: &str = "hello";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("revision {requested} out of range (current revision is {current})")]
    RevisionOutOfRange { requested: u64, current: u64 },
}

pub struct StateStore {
    history: RwLock<Vec<String>>,
    drawing: RwLock<Drawing>,
}

impl StateStore {
    /// Create a store whose history holds `initial_text` as revision 1.
    pub fn new(initial_text: impl Into<String>) -> Self {
        Self {
            history: RwLock::new(vec![initial_text.into()]),
            drawing: RwLock::new(Drawing::default()),
        }
    }

    /// Commit a mutation. Returns the text revision number after the commit.
    pub async fn commit(&self, payload: StatePayload) -> u64 {
        match payload {
            StatePayload::Text(text) => {
                let mut history = self.history.write().await;
                history.push(text);
                history.len() as u64
            }
            StatePayload::Drawing(drawing) => {
                {
                    let mut current = self.drawing.write().await;
                    *current = drawing;
                }
                self.revision().await
            }
        }
    }

    /// Current value of `kind`.
    pub async fn read(&self, kind: ChangeKind) -> StatePayload {
        match kind {
            ChangeKind::Text => StatePayload::Text(self.text().await),
            ChangeKind::Drawing => StatePayload::Drawing(self.drawing.read().await.clone()),
        }
    }

    /// Latest text revision.
    pub async fn text(&self) -> String {
        let history = self.history.read().await;
        history.last().cloned().unwrap_or_default()
    }

    /// Text at 1-indexed `revision`.
    ///
    /// Revision 0 and revisions past the head are rejected rather than clamped.
    pub async fn history(&self, revision: u64) -> Result<String, StoreError> {
        let history = self.history.read().await;
        let current = history.len() as u64;
        if revision == 0 || revision > current {
            return Err(StoreError::RevisionOutOfRange {
                requested: revision,
                current,
            });
        }
        Ok(history[(revision - 1) as usize].clone())
    }

    /// Number of text revisions.
    pub async fn revision(&self) -> u64 {
        self.history.read().await.len() as u64
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_TEXT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Point, Segment};
    use std::sync::Arc;

    fn line(x: i32) -> Drawing {
        Drawing::new(vec![Segment::new(Point::new(x, 0), Point::new(x, 10))])
    }

    #[tokio::test]
    async fn test_initial_state() {
        let store = StateStore::default();
        assert_eq!(store.revision().await, 1);
        assert_eq!(store.text().await, "hello");
        assert_eq!(
            store.read(ChangeKind::Drawing).await,
            StatePayload::Drawing(Drawing::default())
        );
    }

    #[tokio::test]
    async fn test_text_appends_in_order() {
        let store = StateStore::new("a");
        for (i, text) in ["b", "c", "d"].iter().enumerate() {
            let rev = store.commit(StatePayload::Text(text.to_string())).await;
            assert_eq!(rev, i as u64 + 2);
        }

        assert_eq!(store.revision().await, 4);
        for (rev, expected) in ["a", "b", "c", "d"].iter().enumerate() {
            assert_eq!(store.history(rev as u64 + 1).await.unwrap(), *expected);
        }
        assert_eq!(
            store.read(ChangeKind::Text).await,
            StatePayload::Text("d".into())
        );
    }

    #[tokio::test]
    async fn test_drawing_replaces_without_history() {
        let store = StateStore::default();
        store.commit(StatePayload::Drawing(line(1))).await;
        let rev = store.commit(StatePayload::Drawing(line(2))).await;

        assert_eq!(rev, 1, "drawing commits do not create text revisions");
        assert_eq!(
            store.read(ChangeKind::Drawing).await,
            StatePayload::Drawing(line(2))
        );
    }

    #[tokio::test]
    async fn test_history_out_of_range_is_rejected() {
        let store = StateStore::new("only");
        assert_eq!(
            store.history(2).await,
            Err(StoreError::RevisionOutOfRange { requested: 2, current: 1 })
        );
        assert_eq!(
            store.history(0).await,
            Err(StoreError::RevisionOutOfRange { requested: 0, current: 1 })
        );
        assert_eq!(store.history(1).await.unwrap(), "only");
    }

    #[tokio::test]
    async fn test_concurrent_text_commits_are_dense() {
        let store = Arc::new(StateStore::new("seed"));
        let mut tasks = Vec::new();
        for i in 0..64 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.commit(StatePayload::Text(format!("edit {i}"))).await
            }));
        }

        let mut revisions = Vec::new();
        for task in tasks {
            revisions.push(task.await.unwrap());
        }
        revisions.sort_unstable();

        assert_eq!(revisions, (2..=65).collect::<Vec<u64>>());
        assert_eq!(store.revision().await, 65);
    }
}
