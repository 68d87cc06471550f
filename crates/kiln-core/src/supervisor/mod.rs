//! Worker supervisor: spawn, readiness, dedup, kill-on-spawn, pending-VRAM
//! accounting, and structured shutdown of model worker subprocesses.
//!
//! Ownership: the supervisor exclusively owns the worker map and the pending
//! ledger. Callers only ever see [`WorkerInfo`] copies. The caller-facing
//! semantics of spawn vs. kill-by-path together read: "make me a worker for
//! this model, eventually" vs. "make sure no worker for this model lives."

mod info;
mod process;

pub use info::{mirror_kwargs_to_env, WorkerInfo, WorkerStatus};
pub use process::StopOutcome;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::error::CoreError;
use crate::guardrail::{self, PlanInput, UserKwargs};
use crate::settings::Settings;
use crate::system::{self, SnapshotHandle};

/// How the supervisor launches and supervises workers. Tests inject an inert
/// command and short deadlines.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Worker executable; defaults to a `kiln-worker` next to the server.
    pub worker_program: PathBuf,
    /// Leading arguments before the environment-driven configuration.
    pub worker_args: Vec<String>,
    pub bind_host: String,
    pub client_host: String,
    /// Readiness deadline for a spawned worker.
    pub wait_ready: Duration,
    /// Interval between readiness probes.
    pub readiness_poll: Duration,
    /// Timeout for one health probe call.
    pub health_timeout: Duration,
    /// Grace period before a hard kill.
    pub stop_grace: Duration,
    /// Inherit stdio so worker logs are visible.
    pub debug: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            worker_program: PathBuf::from("kiln-worker"),
            worker_args: Vec::new(),
            bind_host: "127.0.0.1".into(),
            client_host: "127.0.0.1".into(),
            wait_ready: Duration::from_secs(120),
            readiness_poll: Duration::from_millis(250),
            health_timeout: Duration::from_millis(200),
            stop_grace: Duration::from_secs(10),
            debug: false,
        }
    }
}

/// Outcome of [`Supervisor::request_kill_by_path`].
#[derive(Debug, Clone, Serialize)]
pub struct KillByPath {
    pub killed: Vec<String>,
    pub queued: bool,
}

struct WorkerEntry {
    info: WorkerInfo,
    child: Option<Child>,
}

pub struct Supervisor {
    cfg: SupervisorConfig,
    settings: std::sync::Arc<Settings>,
    snapshot: SnapshotHandle,
    workers: Mutex<HashMap<String, WorkerEntry>>,
    kill_on_spawn: Mutex<HashSet<String>>,
    pending_vram_gb: Mutex<HashMap<String, f64>>,
    last_diag: Mutex<Option<Value>>,
    http: reqwest::Client,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let n = self.workers.lock().map(|w| w.len()).unwrap_or(0);
        write!(f, "Supervisor({n} workers)")
    }
}

impl Supervisor {
    pub fn new(
        cfg: SupervisorConfig,
        settings: std::sync::Arc<Settings>,
        snapshot: SnapshotHandle,
    ) -> Self {
        Self {
            cfg,
            settings,
            snapshot,
            workers: Mutex::new(HashMap::new()),
            kill_on_spawn: Mutex::new(HashSet::new()),
            pending_vram_gb: Mutex::new(HashMap::new()),
            last_diag: Mutex::new(None),
            http: reqwest::Client::new(),
        }
    }

    // ── Lookup / snapshot helpers ────────────────────────────────────────────

    fn find_free_port(&self) -> Result<u16, CoreError> {
        let live_ports: HashSet<u16> = {
            let workers = self.workers.lock().unwrap();
            workers
                .values()
                .filter(|e| e.info.status.is_live())
                .map(|e| e.info.port)
                .collect()
        };
        for _ in 0..16 {
            let listener = std::net::TcpListener::bind((self.cfg.bind_host.as_str(), 0))
                .map_err(CoreError::SpawnIo)?;
            let port = listener.local_addr().map_err(CoreError::SpawnIo)?.port();
            drop(listener);
            if !live_ports.contains(&port) {
                return Ok(port);
            }
        }
        Err(CoreError::SpawnIo(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            "no free port distinct from live workers",
        )))
    }

    async fn probe_health(&self, host: &str, port: u16) -> bool {
        let url = format!("http://{host}:{port}/health");
        match self
            .http
            .get(&url)
            .timeout(self.cfg.health_timeout)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => resp
                .json::<Value>()
                .await
                .map(|v| v.get("ok").and_then(Value::as_bool).unwrap_or(false))
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Σ pending projections of other still-loading, still-alive workers.
    ///
    /// Lock order is workers → pending everywhere in this type.
    fn pending_sum_excluding(&self, exclude: Option<&str>) -> f64 {
        let mut workers = self.workers.lock().unwrap();
        let pending = self.pending_vram_gb.lock().unwrap();
        let mut total = 0.0;
        for (wid, gb) in pending.iter() {
            if exclude == Some(wid.as_str()) {
                continue;
            }
            let Some(entry) = workers.get_mut(wid) else {
                continue;
            };
            let alive = entry
                .child
                .as_mut()
                .map(process::is_running)
                .unwrap_or(false);
            if entry.info.status == WorkerStatus::Loading && alive {
                total += gb.max(0.0);
            }
        }
        total
    }

    // ── Public introspection ─────────────────────────────────────────────────

    /// Refresh statuses (process-alive, then a short health probe for workers
    /// not yet ready) and return public records.
    pub async fn list(&self) -> Vec<WorkerInfo> {
        // Pass 1: process liveness under the lock.
        let probe_targets: Vec<(String, String, u16)> = {
            let mut workers = self.workers.lock().unwrap();
            let mut targets = Vec::new();
            for entry in workers.values_mut() {
                if entry.info.status.is_terminal() {
                    continue;
                }
                let exited = entry
                    .child
                    .as_mut()
                    .map(|c| !process::is_running(c))
                    .unwrap_or(false);
                if exited {
                    entry.info.status = WorkerStatus::Stopped;
                } else if entry.info.status != WorkerStatus::Ready {
                    targets.push((
                        entry.info.id.clone(),
                        entry.info.client_host.clone(),
                        entry.info.port,
                    ));
                }
            }
            targets
        };

        // Pass 2: health probes without the lock.
        for (wid, host, port) in probe_targets {
            if self.probe_health(&host, port).await {
                let mut workers = self.workers.lock().unwrap();
                if let Some(entry) = workers.get_mut(&wid) {
                    if entry.info.status == WorkerStatus::Loading {
                        entry.info.status = WorkerStatus::Ready;
                        self.pending_vram_gb.lock().unwrap().remove(&wid);
                    }
                }
            }
        }

        let workers = self.workers.lock().unwrap();
        workers.values().map(|e| e.info.clone()).collect()
    }

    pub fn get_worker(&self, wid: &str) -> Option<WorkerInfo> {
        self.workers.lock().unwrap().get(wid).map(|e| e.info.clone())
    }

    pub fn get_addr(&self, wid: &str) -> Option<(String, u16)> {
        self.get_worker(wid).map(|w| w.addr())
    }

    pub fn get_port(&self, wid: &str) -> Option<u16> {
        self.get_worker(wid).map(|w| w.port)
    }

    /// Diagnostics of the most recent plan, for 409 payloads.
    pub fn last_guardrail_diag(&self) -> Option<Value> {
        self.last_diag.lock().unwrap().clone()
    }

    // ── Kill APIs ────────────────────────────────────────────────────────────

    async fn kill_worker_id(&self, wid: &str) -> bool {
        let (child, pid) = {
            let mut workers = self.workers.lock().unwrap();
            match workers.get_mut(wid) {
                None => return false,
                Some(entry) => (entry.child.take(), entry.info.pid),
            }
        };

        let outcome = match child {
            Some(mut child) => {
                let o = process::sigterm_then_kill(&mut child, self.cfg.stop_grace).await;
                Some(o)
            }
            None => None,
        };

        let mut workers = self.workers.lock().unwrap();
        if let Some(entry) = workers.get_mut(wid) {
            entry.info.status = WorkerStatus::Stopped;
        }
        self.pending_vram_gb.lock().unwrap().remove(wid);
        info!(wid, ?pid, outcome = %outcome.map(|o| o.to_string()).unwrap_or_else(|| "no-process".into()), "worker stopped");
        outcome.is_some()
    }

    /// Gracefully stop one worker. Idempotent; true when a live process was
    /// actually stopped by this call.
    pub async fn stop_worker(&self, wid: &str) -> bool {
        if self.get_worker(wid).is_none() {
            return false;
        }
        self.kill_worker_id(wid).await
    }

    /// Stop every live worker; returns how many were stopped.
    pub async fn stop_all(&self) -> usize {
        let ids: Vec<String> = {
            let workers = self.workers.lock().unwrap();
            workers
                .values()
                .filter(|e| e.info.status.is_live())
                .map(|e| e.info.id.clone())
                .collect()
        };
        let mut n = 0;
        for wid in ids {
            if self.kill_worker_id(&wid).await {
                n += 1;
            }
        }
        n
    }

    /// Kill every live worker for the path; when none matched, queue a
    /// kill-on-spawn marker so the next spawn for the path dies immediately.
    pub async fn request_kill_by_path(&self, model_path: &str, include_ready: bool) -> KillByPath {
        let matching: Vec<String> = {
            let workers = self.workers.lock().unwrap();
            workers
                .values()
                .filter(|e| {
                    e.info.model_path == model_path
                        && e.info.status.is_live()
                        && (include_ready || e.info.status == WorkerStatus::Loading)
                })
                .map(|e| e.info.id.clone())
                .collect()
        };

        let mut killed = Vec::new();
        for wid in matching {
            if self.kill_worker_id(&wid).await {
                killed.push(wid);
            }
        }

        let queued = {
            let mut set = self.kill_on_spawn.lock().unwrap();
            if killed.is_empty() {
                if set.insert(model_path.to_string()) {
                    info!(model_path, "kill queued; no live worker matched");
                }
            }
            set.contains(model_path)
        };

        info!(model_path, ?killed, queued, "kill-by-path outcome");
        KillByPath { killed, queued }
    }

    // ── Spawn path ───────────────────────────────────────────────────────────

    fn find_loading_for_path(&self, model_path: &str) -> Option<WorkerInfo> {
        let workers = self.workers.lock().unwrap();
        workers
            .values()
            .find(|e| e.info.model_path == model_path && e.info.status == WorkerStatus::Loading)
            .map(|e| e.info.clone())
    }

    fn record_diag(&self, user: &UserKwargs, plan: &guardrail::LaunchPlan) {
        let env: serde_json::Map<String, Value> = plan
            .env
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        let diag = json!({
            "incoming": user,
            "resolved": plan.kwargs,
            "env": env,
            "vram_proj": {
                "per_layer_gb": plan.diag.per_layer_gb,
                "overhead_gb": plan.diag.overhead_gb,
                "budget_gb": plan.diag.budget_gb,
                "proj_gb": plan.diag.proj_gb,
                "decision": plan.diag.decision,
            },
            "raw": plan.diag,
        });
        *self.last_diag.lock().unwrap() = Some(diag);
    }

    /// Spawn a worker for `model_path`, deduplicating against one already
    /// loading, honoring the guardrail plan and kill-on-spawn markers, and
    /// waiting for readiness up to the configured deadline.
    pub async fn spawn_worker(
        &self,
        model_path: &str,
        user_kwargs: UserKwargs,
    ) -> Result<WorkerInfo, CoreError> {
        if let Some(existing) = self.find_loading_for_path(model_path) {
            info!(wid = %existing.id, model_path, "spawn dedup: model already loading");
            return Ok(existing);
        }

        // Plan against live GPU state, falling back to a direct probe when
        // the background snapshot has not sampled a GPU yet.
        let (mut free_gb, mut total_gb) = {
            let snap = self.snapshot.get();
            match snap.gpus.first() {
                Some(g) => (
                    g.free as f64 / system::GIB as f64,
                    g.total as f64 / system::GIB as f64,
                ),
                None => (0.0, 0.0),
            }
        };
        if total_gb <= 0.0 {
            let (free, total) = tokio::task::spawn_blocking(system::free_total_bytes)
                .await
                .unwrap_or((0, 0));
            if total > 0 {
                free_gb = free as f64 / system::GIB as f64;
                total_gb = total as f64 / system::GIB as f64;
            }
        }

        let model_size_bytes = std::fs::metadata(model_path).map(|m| m.len()).unwrap_or(0);
        let plan_input = PlanInput {
            model_path: model_path.to_string(),
            model_size_bytes,
            user: user_kwargs.clone(),
            defaults: self.settings.worker_defaults(),
            free_gb,
            total_gb,
            pending_gb: self.pending_sum_excluding(None),
        };
        let plan = guardrail::plan(&plan_input);
        self.record_diag(&user_kwargs, &plan);
        info!(model_path, decision = %plan.diag.decision, proj_gb = plan.diag.proj_gb, budget_gb = ?plan.diag.budget_gb, "guardrail plan");

        if plan.aborted() {
            return Err(CoreError::GuardrailAbort {
                diag: Box::new(plan.diag),
            });
        }

        let wid = uuid::Uuid::new_v4().simple().to_string();
        let port = self.find_free_port()?;

        // Compose the child environment.
        let mut env = plan.env.clone();
        if let (Some(device), Some(accel)) = (
            plan.kwargs.main_gpu,
            env.iter().find(|(k, _)| k == "LLAMA_ACCEL").map(|(_, v)| v.clone()),
        ) {
            if accel == "cuda" || accel == "hip" {
                env.push(("LLAMA_DEVICE".into(), device.to_string()));
            }
        }
        mirror_kwargs_to_env(&plan.kwargs, &mut env);
        env.push((
            "LLAMA_KWARGS_JSON".into(),
            serde_json::to_string(&plan.kwargs).unwrap_or_else(|_| "{}".into()),
        ));
        env.push(("MODEL_PATH".into(), model_path.to_string()));
        env.push(("WORKER_ID".into(), wid.clone()));
        env.push(("WORKER_HOST".into(), self.cfg.bind_host.clone()));
        env.push(("WORKER_PORT".into(), port.to_string()));

        info!(wid, port, model_path, "spawning worker");
        let mut cmd = Command::new(&self.cfg.worker_program);
        cmd.args(&self.cfg.worker_args).envs(env.iter().map(|(k, v)| (k, v)));
        if !self.cfg.debug {
            cmd.stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null());
        }
        let mut child = cmd.spawn().map_err(CoreError::SpawnIo)?;
        let pid = child.id();

        // Give the process a beat to crash if it is going to.
        tokio::time::sleep(Duration::from_millis(50)).await;
        if !process::is_running(&mut child) {
            warn!(wid, model_path, "worker exited immediately");
            return Err(CoreError::WorkerSpawnFailed);
        }

        let worker_info = WorkerInfo {
            id: wid.clone(),
            model_path: model_path.to_string(),
            port,
            bind_host: self.cfg.bind_host.clone(),
            client_host: self.cfg.client_host.clone(),
            status: WorkerStatus::Loading,
            kwargs: plan.kwargs.clone(),
            pid,
        };
        {
            let mut workers = self.workers.lock().unwrap();
            workers.insert(
                wid.clone(),
                WorkerEntry {
                    info: worker_info.clone(),
                    child: Some(child),
                },
            );
        }
        // Projection attributed while loading; KV already resident on the GPU
        // is excluded because the driver reports it inside "free" churn.
        let pending_gb = if plan.diag.kv_on {
            (plan.diag.proj_gb - crate::guardrail::kv_projection_gb(&plan.kwargs)).max(0.0)
        } else {
            plan.diag.proj_gb
        };
        self.pending_vram_gb
            .lock()
            .unwrap()
            .insert(wid.clone(), pending_gb);

        // Kill-on-spawn: a caller asked for this path to die before it lived.
        let queued_kill = {
            let mut set = self.kill_on_spawn.lock().unwrap();
            set.remove(model_path)
        };
        if queued_kill {
            info!(wid, model_path, "kill-on-spawn: stopping fresh worker");
            self.kill_worker_id(&wid).await;
            return Ok(self.get_worker(&wid).unwrap_or(worker_info));
        }

        let ready = self.wait_ready(&wid).await;

        let mut workers = self.workers.lock().unwrap();
        self.pending_vram_gb.lock().unwrap().remove(&wid);
        match workers.get_mut(&wid) {
            Some(entry) => {
                // Stopped is terminal; a concurrent kill wins.
                if entry.info.status != WorkerStatus::Stopped {
                    entry.info.status = if ready {
                        WorkerStatus::Ready
                    } else {
                        WorkerStatus::Loading
                    };
                }
                Ok(entry.info.clone())
            }
            None => Ok(worker_info),
        }
    }

    async fn wait_ready(&self, wid: &str) -> bool {
        let deadline = tokio::time::Instant::now() + self.cfg.wait_ready;
        while tokio::time::Instant::now() < deadline {
            let target = {
                let mut workers = self.workers.lock().unwrap();
                match workers.get_mut(wid) {
                    None => return false,
                    Some(entry) => {
                        if entry.info.status.is_terminal() {
                            return false;
                        }
                        let alive = entry
                            .child
                            .as_mut()
                            .map(process::is_running)
                            .unwrap_or(false);
                        if !alive {
                            return false;
                        }
                        (entry.info.client_host.clone(), entry.info.port)
                    }
                }
            };
            if self.probe_health(&target.0, target.1).await {
                return true;
            }
            tokio::time::sleep(self.cfg.readiness_poll).await;
        }
        info!(wid, "readiness wait timed out");
        false
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
