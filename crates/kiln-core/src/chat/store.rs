//! Chat store: atomic JSON files under a per-user data root.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;
use tracing::warn;

use crate::error::CoreError;
use crate::fsjson::{atomic_write_json, load_json_file};

use super::pending::{apply_op, OpResult, SessionOp};
use super::{ChatMessage, ChatRecord, IndexRow};

/// All filesystem access goes through one store instance; a store-wide lock
/// covers read-modify-write cycles so concurrent streams cannot interleave
/// partial updates.
pub struct ChatStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl std::fmt::Debug for ChatStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatStore").field("root", &self.root).finish()
    }
}

impl ChatStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn chat_path(&self, session_id: &str) -> PathBuf {
        // Session ids come from our own id minting or request bodies; strip
        // path separators so a hostile id cannot escape the chats dir.
        let safe: String = session_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        self.root.join("chats").join(format!("{safe}.json"))
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    fn pending_path(&self) -> PathBuf {
        self.root.join("pending.json")
    }

    fn read<T: serde::de::DeserializeOwned + Default>(&self, path: &Path) -> T {
        match load_json_file(path, Value::Null) {
            Ok(Value::Null) => T::default(),
            Ok(v) => serde_json::from_value(v).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "unreadable store file; starting empty");
                T::default()
            }),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable store file; starting empty");
                T::default()
            }
        }
    }

    fn write<T: serde::Serialize>(&self, path: &Path, value: &T) -> Result<(), CoreError> {
        let v = serde_json::to_value(value).map_err(|e| CoreError::ChatStore {
            message: e.to_string(),
        })?;
        atomic_write_json(path, &v).map_err(|e| CoreError::ChatStore {
            message: format!("{}: {e}", path.display()),
        })
    }

    // ── Chats ────────────────────────────────────────────────────────────────

    /// Load a session, creating an empty record for unknown ids.
    pub fn load_chat(&self, session_id: &str) -> ChatRecord {
        let _g = self.lock.lock().unwrap();
        self.load_chat_unlocked(session_id)
    }

    fn load_chat_unlocked(&self, session_id: &str) -> ChatRecord {
        let mut rec: ChatRecord = self.read(&self.chat_path(session_id));
        if rec.session_id.is_empty() {
            rec.session_id = session_id.to_string();
        }
        rec
    }

    fn save_chat_unlocked(&self, rec: &ChatRecord) -> Result<(), CoreError> {
        self.write(&self.chat_path(&rec.session_id), rec)
    }

    /// Append one message, assigning the next sequence id. Returns the id.
    pub fn append_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
    ) -> Result<u64, CoreError> {
        let _g = self.lock.lock().unwrap();
        let mut rec = self.load_chat_unlocked(session_id);
        rec.seq += 1;
        rec.messages.push(ChatMessage {
            id: rec.seq,
            role: role.to_string(),
            content: content.to_string(),
        });
        let id = rec.seq;
        self.save_chat_unlocked(&rec)?;
        Ok(id)
    }

    pub fn set_summary(&self, session_id: &str, summary: &str) -> Result<(), CoreError> {
        let _g = self.lock.lock().unwrap();
        let mut rec = self.load_chat_unlocked(session_id);
        if rec.summary == summary {
            return Ok(());
        }
        rec.summary = summary.to_string();
        self.save_chat_unlocked(&rec)
    }

    pub fn list_messages(&self, session_id: &str) -> Vec<ChatMessage> {
        self.load_chat(session_id).messages
    }

    pub fn current_seq(&self, session_id: &str) -> u64 {
        self.load_chat(session_id).seq
    }

    // ── Index ────────────────────────────────────────────────────────────────

    pub fn load_index(&self) -> Vec<IndexRow> {
        let _g = self.lock.lock().unwrap();
        self.read(&self.index_path())
    }

    /// Update a session's title. Returns false when the row is missing or the
    /// title is already current (no write happens in either case).
    pub fn update_title(&self, session_id: &str, title: &str) -> Result<bool, CoreError> {
        let _g = self.lock.lock().unwrap();
        let mut rows: Vec<IndexRow> = self.read(&self.index_path());
        let Some(row) = rows.iter_mut().find(|r| r.session_id == session_id) else {
            return Ok(false);
        };
        if row.title.trim() == title {
            return Ok(false);
        }
        row.title = title.to_string();
        row.updated_at = chrono::Utc::now().to_rfc3339();
        self.write(&self.index_path(), &rows)?;
        Ok(true)
    }

    /// Ensure an index row exists for the session and bump its timestamp.
    pub fn touch_index(&self, session_id: &str) -> Result<(), CoreError> {
        let _g = self.lock.lock().unwrap();
        let mut rows: Vec<IndexRow> = self.read(&self.index_path());
        let now = chrono::Utc::now().to_rfc3339();
        match rows.iter_mut().find(|r| r.session_id == session_id) {
            Some(row) => row.updated_at = now,
            None => rows.push(IndexRow {
                session_id: session_id.to_string(),
                title: String::new(),
                updated_at: now,
            }),
        }
        self.write(&self.index_path(), &rows)
    }

    // ── Pending session ops ──────────────────────────────────────────────────

    pub fn enqueue_pending(&self, session_id: &str, op: SessionOp) -> Result<(), CoreError> {
        let _g = self.lock.lock().unwrap();
        let mut pend: std::collections::BTreeMap<String, Vec<SessionOp>> =
            self.read(&self.pending_path());
        pend.entry(session_id.to_string()).or_default().push(op);
        self.write(&self.pending_path(), &pend)
    }

    pub fn list_pending_sessions(&self) -> Vec<String> {
        let _g = self.lock.lock().unwrap();
        let pend: std::collections::BTreeMap<String, Vec<SessionOp>> =
            self.read(&self.pending_path());
        pend.keys().cloned().collect()
    }

    /// Consume and apply this session's queued ops in order. A failing op is
    /// requeued at the front so it retries after the next stream.
    pub fn apply_pending_for(&self, session_id: &str) -> Vec<OpResult> {
        let _g = self.lock.lock().unwrap();
        let mut pend: std::collections::BTreeMap<String, Vec<SessionOp>> =
            self.read(&self.pending_path());
        let ops = pend.remove(session_id).unwrap_or_default();
        if self.write(&self.pending_path(), &pend).is_err() {
            return Vec::new();
        }

        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            let mut rec = self.load_chat_unlocked(session_id);
            match apply_op(&mut rec, &op) {
                Ok(result) => {
                    if result.changed {
                        if let Err(e) = self.save_chat_unlocked(&rec) {
                            warn!(session_id, error = %e, "failed to persist pending op result");
                        }
                    }
                    results.push(result);
                }
                Err(reason) => {
                    // Defer: push back to the front of this session's queue.
                    let mut pend: std::collections::BTreeMap<String, Vec<SessionOp>> =
                        self.read(&self.pending_path());
                    pend.entry(session_id.to_string())
                        .or_default()
                        .insert(0, op.clone());
                    let _ = self.write(&self.pending_path(), &pend);
                    results.push(OpResult {
                        ok: false,
                        changed: false,
                        deleted: Vec::new(),
                        deferred: Some(reason),
                    });
                }
            }
        }
        results
    }

    /// Drain pending ops for every idle session.
    pub fn process_all_pending<F: Fn(&str) -> bool>(&self, is_active: F) -> usize {
        let sessions = self.list_pending_sessions();
        let mut applied = 0;
        for sid in sessions {
            if is_active(&sid) {
                continue;
            }
            applied += self
                .apply_pending_for(&sid)
                .iter()
                .filter(|r| r.ok)
                .count();
        }
        applied
    }
}
