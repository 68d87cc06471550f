//! Cooperative cancellation and generation admission.
//!
//! One latch per session id: set by the cancel endpoint or the disconnect
//! watcher on any thread, observed by the streaming producer and consumer,
//! cleared at the start of the next stream. The registry also tracks which
//! sessions are actively streaming (the retitle queue defers on these) and
//! owns the generation semaphore that serializes inference.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A one-shot cancel latch. Setting is idempotent; `clear` re-arms it for the
/// next stream on the same session.
#[derive(Debug, Default, Clone)]
pub struct CancelFlag {
    set: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn set(&self) {
        self.set.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.set.store(false, Ordering::SeqCst);
    }
}

/// Session-keyed cancel flags plus active-stream accounting.
#[derive(Debug)]
pub struct CancelRegistry {
    flags: Mutex<HashMap<String, CancelFlag>>,
    active: Mutex<HashMap<String, u32>>,
    gen_semaphore: Arc<Semaphore>,
}

impl CancelRegistry {
    pub fn new(gen_permits: usize) -> Self {
        Self {
            flags: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            gen_semaphore: Arc::new(Semaphore::new(gen_permits.max(1))),
        }
    }

    /// The flag for a session, created lazily on first reference.
    pub fn flag(&self, session_id: &str) -> CancelFlag {
        let mut flags = self.flags.lock().unwrap();
        flags.entry(session_id.to_string()).or_default().clone()
    }

    /// Set the session's flag. Returns quietly whether or not a generation is
    /// in progress.
    pub fn cancel(&self, session_id: &str) {
        self.flag(session_id).set();
    }

    pub fn is_cancelled(&self, session_id: &str) -> bool {
        self.flags
            .lock()
            .unwrap()
            .get(session_id)
            .map(CancelFlag::is_set)
            .unwrap_or(false)
    }

    /// True while at least one stream for the session is running.
    pub fn is_active(&self, session_id: &str) -> bool {
        self.active
            .lock()
            .unwrap()
            .get(session_id)
            .copied()
            .unwrap_or(0)
            > 0
    }

    pub fn mark_active(&self, session_id: &str, delta: i32) {
        let mut active = self.active.lock().unwrap();
        let entry = active.entry(session_id.to_string()).or_insert(0);
        if delta >= 0 {
            *entry = entry.saturating_add(delta as u32);
        } else {
            *entry = entry.saturating_sub(delta.unsigned_abs());
        }
        if *entry == 0 {
            active.remove(session_id);
        }
    }

    /// Acquire a generation permit. Held for the whole stream, shared with
    /// the retitle queue so background work never pre-empts users.
    pub async fn acquire_generation(&self) -> OwnedSemaphorePermit {
        Arc::clone(&self.gen_semaphore)
            .acquire_owned()
            .await
            .expect("generation semaphore closed")
    }

    /// Non-blocking variant used by tests and opportunistic callers.
    pub fn try_acquire_generation(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.gen_semaphore).try_acquire_owned().ok()
    }
}
