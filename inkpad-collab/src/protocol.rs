//! Binary RPC protocol between participants and the authority.
//!
//! Wire format (bincode-encoded, one message per WebSocket binary frame):
//! ```text
//! client ──► server   Call   { call_id, call }
//! server ──► client   Reply  { call_id, result }
//! server ──► client   Notify { kind }            (unsolicited push)
//! ```
//!
//! Calls are multiplexed over a single connection by `call_id`; replies may
//! be interleaved with notifications.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;

/// Which half of the shared state a mutation or notification refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Text,
    Drawing,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => f.write_str("text"),
            Self::Drawing => f.write_str("drawing"),
        }
    }
}

/// A point on the drawing canvas, in canvas pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// A single stroke between two points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub from: Point,
    pub to: Point,
    /// Optional pen style tag (color name, width, ...). Opaque to the server.
    pub style: Option<String>,
}

impl Segment {
    pub fn new(from: Point, to: Point) -> Self {
        Self { from, to, style: None }
    }

    pub fn styled(from: Point, to: Point, style: impl Into<String>) -> Self {
        Self {
            from,
            to,
            style: Some(style.into()),
        }
    }
}

/// The whole drawing. There is no delta form: every change ships all segments.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Drawing {
    pub segments: Vec<Segment>,
}

impl Drawing {
    pub fn new(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    pub fn push(&mut self, segment: Segment) {
        self.segments.push(segment);
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Authoritative value of one [`ChangeKind`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatePayload {
    Text(String),
    Drawing(Drawing),
}

impl StatePayload {
    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Text(_) => ChangeKind::Text,
            Self::Drawing(_) => ChangeKind::Drawing,
        }
    }

    pub fn into_text(self) -> Option<String> {
        match self {
            Self::Text(text) => Some(text),
            Self::Drawing(_) => None,
        }
    }

    pub fn into_drawing(self) -> Option<Drawing> {
        match self {
            Self::Drawing(drawing) => Some(drawing),
            Self::Text(_) => None,
        }
    }
}

/// Identity handed out by the session registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Participant {
    pub name: String,
    pub id: u64,
}

/// Acknowledgement of a committed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationReceipt {
    pub kind: ChangeKind,
    /// Text revision number after the commit.
    pub revision: u64,
}

/// Operations a participant can invoke on the authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Call {
    Register,
    Unregister { name: String },
    Mutate { sender: String, payload: StatePayload },
    ReadState { kind: ChangeKind },
    ReadHistory { revision: u64 },
    RevisionNumber,
}

impl Call {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Unregister { .. } => "unregister",
            Self::Mutate { .. } => "set_state",
            Self::ReadState { .. } => "get_state",
            Self::ReadHistory { .. } => "get_history",
            Self::RevisionNumber => "get_rev_num",
        }
    }
}

/// Successful results, one variant per [`Call`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Registered(Participant),
    Unregistered(bool),
    Accepted(MutationReceipt),
    State(StatePayload),
    History(String),
    Revision(u64),
}

/// Errors the authority reports back to a caller.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RemoteError {
    #[error("revision {requested} out of range (current revision is {current})")]
    RevisionOutOfRange { requested: u64, current: u64 },
}

impl From<StoreError> for RemoteError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::RevisionOutOfRange { requested, current } => {
                Self::RevisionOutOfRange { requested, current }
            }
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    Call { call_id: u64, call: Call },
    Reply {
        call_id: u64,
        result: Result<Reply, RemoteError>,
    },
    Notify { kind: ChangeKind },
}

impl SyncMessage {
    pub fn call(call_id: u64, call: Call) -> Self {
        Self::Call { call_id, call }
    }

    pub fn reply(call_id: u64, result: Result<Reply, RemoteError>) -> Self {
        Self::Reply { call_id, result }
    }

    pub fn notify(kind: ChangeKind) -> Self {
        Self::Notify { kind }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }
}

/// Wire-level errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}
