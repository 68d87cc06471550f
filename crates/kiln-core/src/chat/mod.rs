//! On-disk chat persistence: per-session records, the index, and queued
//! session ops. The data directory layout is opaque to everything above the
//! store API:
//!
//! ```text
//! <root>/chats/<sessionId>.json
//! <root>/index.json
//! <root>/pending.json
//! ```

mod pending;
mod store;

pub use pending::{OpResult, SessionOp};
pub use store::ChatStore;

use serde::{Deserialize, Serialize};

/// One message in a chat session. `id` is the session-scoped sequence number
/// assigned at append time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: u64,
    pub role: String,
    pub content: String,
}

/// The full persisted state of one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    pub session_id: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    /// Monotonic message counter; also the id of the newest message.
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub owner_uid: String,
}

/// One row of the chat index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexRow {
    pub session_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub updated_at: String,
}
