//! Background-maintained system snapshot (CPU, RAM, GPUs).
//!
//! A tokio task refreshes the snapshot roughly once per second after a short
//! warmup sample; readers get a point-in-time copy behind a lock.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use sysinfo::System;
use tracing::warn;

use super::gpu;

const REFRESH_PERIOD: Duration = Duration::from_secs(1);
const WARMUP_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Default, Serialize)]
pub struct CpuInfo {
    pub logical: usize,
    pub physical: usize,
    #[serde(rename = "usagePct")]
    pub usage_pct: f32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RamInfo {
    pub total: u64,
    pub used: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GpuInfo {
    pub index: u32,
    pub free: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemSnapshot {
    pub cpu: CpuInfo,
    pub ram: RamInfo,
    pub gpus: Vec<GpuInfo>,
    #[serde(rename = "gpuSource")]
    pub gpu_source: String,
    /// Unix seconds at collection time; 0.0 until the first sample lands.
    pub ts: f64,
}

/// Shared handle to the latest snapshot.
#[derive(Debug, Clone, Default)]
pub struct SnapshotHandle {
    inner: Arc<Mutex<SystemSnapshot>>,
}

impl SnapshotHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// A point-in-time copy of the latest sample.
    pub fn get(&self) -> SystemSnapshot {
        self.inner.lock().unwrap().clone()
    }

    fn set(&self, snap: SystemSnapshot) {
        *self.inner.lock().unwrap() = snap;
    }

    /// VRAM projection against GPU 0 of the latest snapshot.
    ///
    /// Returns `(proj_gb, free_gb, total_gb)`; free/total are 0.0 when no GPU
    /// has been observed.
    pub fn vram_projection(&self, model_gb: f64, kv_gb: f64, overhead_gb: f64) -> (f64, f64, f64) {
        let proj = model_gb + kv_gb + overhead_gb;
        let snap = self.get();
        match snap.gpus.first() {
            Some(g) => (
                proj,
                g.free as f64 / gpu::GIB as f64,
                g.total as f64 / gpu::GIB as f64,
            ),
            None => (proj, 0.0, 0.0),
        }
    }

    /// Inject a sample directly (tests and warmup).
    pub fn install(&self, snap: SystemSnapshot) {
        self.set(snap);
    }
}

fn collect_once(sys: &mut System) -> SystemSnapshot {
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let (free, total) = gpu::free_total_bytes();
    let gpus = if total > 0 {
        vec![GpuInfo { index: 0, free, total }]
    } else {
        Vec::new()
    };

    SystemSnapshot {
        cpu: CpuInfo {
            logical: sys.cpus().len(),
            physical: System::physical_core_count().unwrap_or(0),
            usage_pct: sys.global_cpu_usage(),
        },
        ram: RamInfo {
            total: sys.total_memory(),
            used: sys.used_memory(),
        },
        gpu_source: if total > 0 { "nvidia".into() } else { "none".into() },
        gpus,
        ts: std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0),
    }
}

/// Spawn the refresh loop and return the shared handle.
///
/// The loop runs until the runtime shuts down; collection happens on the
/// blocking pool so the event loop never waits on a probe.
pub fn spawn_snapshot_task() -> SnapshotHandle {
    let handle = SnapshotHandle::new();
    let loop_handle = handle.clone();

    tokio::spawn(async move {
        // Warmup sample so CPU usage has a baseline before the first reader.
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        tokio::time::sleep(WARMUP_DELAY).await;

        let sys = Arc::new(Mutex::new(sys));
        loop {
            let sys2 = Arc::clone(&sys);
            let snap = tokio::task::spawn_blocking(move || {
                let mut guard = sys2.lock().unwrap();
                collect_once(&mut guard)
            })
            .await;

            match snap {
                Ok(snap) => loop_handle.set(snap),
                Err(e) => warn!(error = %e, "system snapshot collection panicked"),
            }
            tokio::time::sleep(REFRESH_PERIOD).await;
        }
    });

    handle
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_snapshot_projects_with_zero_gpu() {
        let h = SnapshotHandle::new();
        let (proj, free, total) = h.vram_projection(4.0, 0.5, 0.2);
        assert!((proj - 4.7).abs() < 1e-9);
        assert_eq!(free, 0.0);
        assert_eq!(total, 0.0);
    }

    #[test]
    fn installed_sample_is_visible_to_readers() {
        let h = SnapshotHandle::new();
        h.install(SystemSnapshot {
            gpus: vec![GpuInfo {
                index: 0,
                free: 6 * gpu::GIB,
                total: 8 * gpu::GIB,
            }],
            gpu_source: "nvidia".into(),
            ts: 1.0,
            ..Default::default()
        });
        let (_, free, total) = h.vram_projection(1.0, 0.0, 0.2);
        assert_eq!(free, 6.0);
        assert_eq!(total, 8.0);
    }

    #[tokio::test]
    async fn refresh_task_publishes_a_sample() {
        let h = spawn_snapshot_task();
        tokio::time::sleep(Duration::from_millis(600)).await;
        let snap = h.get();
        assert!(snap.ts > 0.0, "warmup + first sample should have landed");
        assert!(snap.cpu.logical > 0);
    }
}
