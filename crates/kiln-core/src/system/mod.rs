//! System probing: GPU memory and the background-refreshed snapshot.

mod gpu;
mod snapshot;

pub use gpu::{free_total_bytes, GIB};
pub use snapshot::{spawn_snapshot_task, CpuInfo, GpuInfo, RamInfo, SnapshotHandle, SystemSnapshot};
