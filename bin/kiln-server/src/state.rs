//! Shared application state injected into every handler.

use std::sync::{Arc, Mutex};

use kiln_core::cancel::CancelRegistry;
use kiln_core::chat::ChatStore;
use kiln_core::retitle::RetitleQueue;
use kiln_core::settings::Settings;
use kiln_core::supervisor::{Supervisor, WorkerInfo, WorkerStatus};
use kiln_core::system::SnapshotHandle;
use kiln_core::CoreError;

use crate::config::Config;

/// The single worker selected to receive generation traffic, shared with the
/// retitle resolver.
#[derive(Debug, Clone, Default)]
pub struct ActiveWorker {
    inner: Arc<Mutex<Option<String>>>,
}

impl ActiveWorker {
    pub fn get(&self) -> Option<String> {
        self.inner.lock().unwrap().clone()
    }

    pub fn set(&self, id: Option<String>) {
        *self.inner.lock().unwrap() = id;
    }

    /// Install the id only when no worker is active yet.
    pub fn set_if_empty(&self, id: &str) {
        let mut guard = self.inner.lock().unwrap();
        if guard.is_none() {
            *guard = Some(id.to_string());
        }
    }

    pub fn clear_if(&self, id: &str) {
        let mut guard = self.inner.lock().unwrap();
        if guard.as_deref() == Some(id) {
            *guard = None;
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub settings: Arc<Settings>,
    pub store: Arc<ChatStore>,
    pub registry: Arc<CancelRegistry>,
    pub supervisor: Arc<Supervisor>,
    pub snapshot: SnapshotHandle,
    pub retitle: RetitleQueue,
    pub active: ActiveWorker,
}

impl AppState {
    /// The live record of the currently selected worker, or `NoActiveWorker`.
    pub fn active_worker(&self) -> Result<WorkerInfo, CoreError> {
        let id = self.active.get().ok_or(CoreError::NoActiveWorker)?;
        let info = self
            .supervisor
            .get_worker(&id)
            .ok_or(CoreError::NoActiveWorker)?;
        if info.status == WorkerStatus::Stopped {
            return Err(CoreError::NoActiveWorker);
        }
        Ok(info)
    }
}
