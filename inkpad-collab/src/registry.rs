//! Live participant set.
//!
//! Identities are `<server name>_client_<id>`. The first id comes from a
//! random seed so two servers sharing one directory namespace are unlikely
//! to hand out the same names; later ids count up from there.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::fanout::NotifySink;
use crate::protocol::Participant;

/// Upper bound (inclusive) of the random id seed.
pub const MAX_ID_SEED: u64 = 1000;

/// A registered participant and the channel used to reach it.
#[derive(Clone)]
pub struct Session {
    pub participant: Participant,
    pub sink: Arc<dyn NotifySink>,
}

pub struct SessionRegistry {
    server_name: String,
    next_id: AtomicU64,
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionRegistry {
    /// Create a registry with a random id seed in `0..=MAX_ID_SEED`.
    pub fn new(server_name: impl Into<String>) -> Self {
        let seed = (Uuid::new_v4().as_u128() % (MAX_ID_SEED as u128 + 1)) as u64;
        Self::with_seed(server_name, seed)
    }

    /// Create a registry whose first id is `seed`.
    pub fn with_seed(server_name: impl Into<String>, seed: u64) -> Self {
        Self {
            server_name: server_name.into(),
            next_id: AtomicU64::new(seed),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Allocate a fresh identity and add it to the live set.
    pub async fn register(&self, sink: Arc<dyn NotifySink>) -> Participant {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let participant = Participant {
            name: format!("{}_client_{id}", self.server_name),
            id,
        };

        let mut sessions = self.sessions.write().await;
        sessions.insert(
            participant.name.clone(),
            Session {
                participant: participant.clone(),
                sink,
            },
        );
        log::info!("Registered {} ({} live)", participant.name, sessions.len());
        participant
    }

    /// Remove `name` from the live set. Returns `false` if it was not there.
    pub async fn unregister(&self, name: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.remove(name) {
            Some(_) => {
                log::info!("Unregistered {name} ({} live)", sessions.len());
                true
            }
            None => {
                log::debug!("Unregister of unknown participant {name} ignored");
                false
            }
        }
    }

    /// Snapshot of every live session except `sender`.
    pub async fn recipients_except(&self, sender: &str) -> Vec<Session> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|session| session.participant.name != sender)
            .cloned()
            .collect()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.sessions.read().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// All live participants, ordered by id.
    pub async fn participants(&self) -> Vec<Participant> {
        let mut participants: Vec<Participant> = self
            .sessions
            .read()
            .await
            .values()
            .map(|session| session.participant.clone())
            .collect();
        participants.sort_by_key(|p| p.id);
        participants
    }
}
