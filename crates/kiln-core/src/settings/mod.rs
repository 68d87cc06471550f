//! Layered settings store.
//!
//! The effective configuration is `deep_merge(defaults, adaptive[session or
//! "_global_"], overrides)`, later layers winning. Defaults and overrides are
//! JSON files reloaded on mtime change; the adaptive layer is in-memory only.
//!
//! Failure semantics: a malformed overrides file fails closed (treated as
//! empty), a malformed or missing defaults file aborts initialization.

mod config;

pub use config::{
    GuardrailConfig, GuardrailMode, PackingConfig, RetitleConfig, StreamConfig, WorkerDefaults,
};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::CoreError;
use crate::fsjson::{atomic_write_json, load_json_file};

pub type JsonMap = Map<String, Value>;

const GLOBAL_SESSION: &str = "_global_";

/// Recursively merge `src` onto `dst`; objects merge, everything else replaces.
fn deep_merge(dst: &mut JsonMap, src: &JsonMap) {
    for (k, v) in src {
        match (dst.get_mut(k), v) {
            (Some(Value::Object(d)), Value::Object(s)) => deep_merge(d, s),
            _ => {
                dst.insert(k.clone(), v.clone());
            }
        }
    }
}

/// Like [`deep_merge`] but a JSON `null` in `src` deletes the key from `dst`.
fn merge_delete(dst: &mut JsonMap, src: &JsonMap) {
    for (k, v) in src {
        match v {
            Value::Null => {
                dst.remove(k);
            }
            Value::Object(s) => {
                if let Some(Value::Object(d)) = dst.get_mut(k) {
                    merge_delete(d, s);
                } else {
                    dst.insert(k.clone(), Value::Object(s.clone()));
                }
            }
            other => {
                dst.insert(k.clone(), other.clone());
            }
        }
    }
}

fn mtime_of(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn as_object(v: Value) -> JsonMap {
    match v {
        Value::Object(m) => m,
        _ => JsonMap::new(),
    }
}

struct Inner {
    defaults: JsonMap,
    defaults_mtime: Option<SystemTime>,
    overrides: JsonMap,
    overrides_mtime: Option<SystemTime>,
    adaptive: HashMap<String, JsonMap>,
}

/// Process-wide settings manager. Cheap to share behind an `Arc`.
pub struct Settings {
    defaults_path: PathBuf,
    overrides_path: PathBuf,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("defaults_path", &self.defaults_path)
            .field("overrides_path", &self.overrides_path)
            .finish()
    }
}

impl Settings {
    /// Load both layers from disk. The defaults file must exist and parse.
    pub fn load(
        defaults_path: impl Into<PathBuf>,
        overrides_path: impl Into<PathBuf>,
    ) -> Result<Self, CoreError> {
        let defaults_path = defaults_path.into();
        let overrides_path = overrides_path.into();

        let defaults = match load_json_file(&defaults_path, Value::Null) {
            Ok(Value::Object(m)) => m,
            Ok(_) => {
                return Err(CoreError::SettingsDefaults {
                    path: defaults_path.display().to_string(),
                    message: "file missing or not a JSON object".into(),
                })
            }
            Err(e) => {
                return Err(CoreError::SettingsDefaults {
                    path: defaults_path.display().to_string(),
                    message: e.to_string(),
                })
            }
        };
        let overrides = Self::load_overrides_file(&overrides_path);

        info!(
            defaults = defaults.len(),
            overrides = overrides.len(),
            "settings loaded"
        );

        let inner = Inner {
            defaults_mtime: mtime_of(&defaults_path),
            overrides_mtime: mtime_of(&overrides_path),
            defaults,
            overrides,
            adaptive: HashMap::new(),
        };
        Ok(Self {
            defaults_path,
            overrides_path,
            inner: Mutex::new(inner),
        })
    }

    /// Build an in-memory store for tests or embedded use (no file backing).
    pub fn from_values(defaults: Value, overrides: Value) -> Self {
        let inner = Inner {
            defaults: as_object(defaults),
            defaults_mtime: None,
            overrides: as_object(overrides),
            overrides_mtime: None,
            adaptive: HashMap::new(),
        };
        Self {
            defaults_path: PathBuf::new(),
            overrides_path: PathBuf::new(),
            inner: Mutex::new(inner),
        }
    }

    fn load_overrides_file(path: &Path) -> JsonMap {
        match load_json_file(path, Value::Object(JsonMap::new())) {
            Ok(Value::Object(m)) => m,
            Ok(_) | Err(_) => {
                warn!(path = %path.display(), "overrides file unreadable; failing closed (empty)");
                JsonMap::new()
            }
        }
    }

    /// Re-read either file if its mtime changed since the last load.
    fn refresh_if_stale(&self, inner: &mut Inner) {
        if self.defaults_path.as_os_str().is_empty() {
            return;
        }
        let dm = mtime_of(&self.defaults_path);
        if dm != inner.defaults_mtime {
            if let Ok(Value::Object(m)) = load_json_file(&self.defaults_path, Value::Null) {
                inner.defaults = m;
                info!("settings defaults reloaded");
            }
            inner.defaults_mtime = dm;
        }
        let om = mtime_of(&self.overrides_path);
        if om != inner.overrides_mtime {
            inner.overrides = Self::load_overrides_file(&self.overrides_path);
            inner.overrides_mtime = om;
            info!("settings overrides reloaded");
        }
    }

    /// The merged view for a session (or the global adaptive layer).
    pub fn effective(&self, session_id: Option<&str>) -> JsonMap {
        let mut inner = self.inner.lock().unwrap();
        self.refresh_if_stale(&mut inner);

        let mut eff = inner.defaults.clone();
        let adaptive_key = session_id.unwrap_or(GLOBAL_SESSION);
        if let Some(layer) = inner.adaptive.get(adaptive_key) {
            deep_merge(&mut eff, layer);
        }
        let overrides = inner.overrides.clone();
        deep_merge(&mut eff, &overrides);
        eff
    }

    /// A deep copy of the current overrides layer.
    pub fn overrides(&self) -> JsonMap {
        let mut inner = self.inner.lock().unwrap();
        self.refresh_if_stale(&mut inner);
        inner.overrides.clone()
    }

    /// Merge a patch into the overrides layer; `null` values delete keys.
    pub fn patch_overrides(&self, patch: Value) -> Result<(), CoreError> {
        let patch = as_object(patch);
        let mut inner = self.inner.lock().unwrap();
        self.refresh_if_stale(&mut inner);
        merge_delete(&mut inner.overrides, &patch);
        self.persist_overrides(&inner)
    }

    /// Replace the overrides layer wholesale.
    pub fn replace_overrides(&self, new_overrides: Value) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.overrides = as_object(new_overrides);
        self.persist_overrides(&inner)
    }

    fn persist_overrides(&self, inner: &Inner) -> Result<(), CoreError> {
        if self.overrides_path.as_os_str().is_empty() {
            return Ok(());
        }
        atomic_write_json(
            &self.overrides_path,
            &Value::Object(inner.overrides.clone()),
        )?;
        Ok(())
    }

    /// Install the adaptive layer for a session (in-memory only).
    pub fn set_adaptive(&self, session_id: &str, layer: Value) {
        let mut inner = self.inner.lock().unwrap();
        inner.adaptive.insert(session_id.to_string(), as_object(layer));
    }

    // ── Typed views ──────────────────────────────────────────────────────────

    pub fn worker_defaults(&self) -> WorkerDefaults {
        config::section(&self.effective(None), "worker_default")
    }

    pub fn guardrail(&self) -> GuardrailConfig {
        self.worker_defaults().guardrail
    }

    pub fn stream(&self) -> StreamConfig {
        config::section(&self.effective(None), "stream")
    }

    pub fn packing(&self) -> PackingConfig {
        config::section(&self.effective(None), "packing")
    }

    pub fn retitle(&self) -> RetitleConfig {
        config::section(&self.effective(None), "retitle")
    }
}
