//! Typed session ops queued while a session is busy and applied post-stream.

use serde::{Deserialize, Serialize};

use super::ChatRecord;

/// The queued-op vocabulary. Deletion is the only op today; the tag/payload
/// encoding leaves room for more without breaking stored queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum SessionOp {
    #[serde(rename_all = "camelCase")]
    DeleteMessages {
        message_ids: Vec<u64>,
        /// Also delete the most recent assistant message. Used for "retry
        /// last answer": queued mid-stream, applied once the answer landed.
        tail_assistant: bool,
    },
}

#[derive(Debug, Clone, Default)]
pub struct OpResult {
    pub ok: bool,
    pub changed: bool,
    pub deleted: Vec<u64>,
    /// Set when the op could not run yet and was requeued.
    pub deferred: Option<String>,
}

/// Apply one op to a loaded record. `Err` means "not applicable yet, defer".
pub(super) fn apply_op(rec: &mut ChatRecord, op: &SessionOp) -> Result<OpResult, String> {
    match op {
        SessionOp::DeleteMessages {
            message_ids,
            tail_assistant,
        } => {
            let mut ids: std::collections::BTreeSet<u64> = message_ids.iter().copied().collect();

            let mut found_tail = false;
            if *tail_assistant {
                if let Some(m) = rec.messages.iter().rev().find(|m| m.role == "assistant") {
                    ids.insert(m.id);
                    found_tail = true;
                }
            }

            // The tail assistant has not been persisted yet: requeue rather
            // than silently dropping the request.
            if ids.is_empty() && *tail_assistant && !found_tail {
                return Err("defer_tail_assistant".into());
            }
            if ids.is_empty() {
                return Ok(OpResult {
                    ok: true,
                    ..OpResult::default()
                });
            }

            let before = rec.messages.len();
            let mut deleted = Vec::new();
            rec.messages.retain(|m| {
                if ids.contains(&m.id) {
                    deleted.push(m.id);
                    false
                } else {
                    true
                }
            });
            Ok(OpResult {
                ok: true,
                changed: rec.messages.len() != before,
                deleted,
                deferred: None,
            })
        }
    }
}
