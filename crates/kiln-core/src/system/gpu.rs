//! Best-effort GPU memory probe.
//!
//! Order of attempts: the vendor library (NVML), then the vendor CLI
//! (`nvidia-smi`), finally `(0, 0)`. Probe failures never surface as errors;
//! the guardrail planner owns policy when no GPU information is available.

use std::process::Command;
use std::time::Duration;

use tracing::debug;

/// One GiB in bytes.
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Upper bound on how long a single probe may block.
const CLI_TIMEOUT: Duration = Duration::from_millis(2500);

/// Free and total memory of GPU 0 in bytes. `(0, 0)` when no GPU is visible.
pub fn free_total_bytes() -> (u64, u64) {
    if let Some(pair) = nvml_free_total() {
        return pair;
    }
    if let Some(pair) = smi_free_total() {
        return pair;
    }
    (0, 0)
}

fn nvml_free_total() -> Option<(u64, u64)> {
    let nvml = nvml_wrapper::Nvml::init().ok()?;
    let device = nvml.device_by_index(0).ok()?;
    let mem = device.memory_info().ok()?;
    Some((mem.free, mem.total))
}

/// `nvidia-smi --query-gpu=memory.free,memory.total` reports MiB figures.
fn smi_free_total() -> Option<(u64, u64)> {
    let mut child = Command::new("nvidia-smi")
        .args([
            "--query-gpu=memory.free,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .spawn()
        .ok()?;

    // Bounded wait: poll the child rather than blocking on wait_with_output.
    let deadline = std::time::Instant::now() + CLI_TIMEOUT;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) => {
                if std::time::Instant::now() >= deadline {
                    debug!("nvidia-smi probe timed out; killing");
                    let _ = child.kill();
                    let _ = child.wait();
                    return None;
                }
                std::thread::sleep(Duration::from_millis(25));
            }
            Err(_) => return None,
        }
    }

    let mut out = String::new();
    use std::io::Read;
    child.stdout.take()?.read_to_string(&mut out).ok()?;
    parse_smi_line(out.lines().next()?)
}

fn parse_smi_line(line: &str) -> Option<(u64, u64)> {
    let mut parts = line.split(',').map(|p| p.trim());
    let free_mib: u64 = parts.next()?.parse().ok()?;
    let total_mib: u64 = parts.next()?.parse().ok()?;
    Some((free_mib * 1024 * 1024, total_mib * 1024 * 1024))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn smi_line_parses_free_and_total() {
        let (free, total) = parse_smi_line("2048, 8192").unwrap();
        assert_eq!(free, 2048 * 1024 * 1024);
        assert_eq!(total, 8192 * 1024 * 1024);
    }

    #[test]
    fn smi_garbage_yields_none() {
        assert!(parse_smi_line("N/A, N/A").is_none());
        assert!(parse_smi_line("").is_none());
    }

    #[test]
    fn probe_never_panics_without_gpu() {
        // On a GPU-less machine both paths fail and the probe degrades to zeros.
        let (free, total) = free_total_bytes();
        assert!(free <= total || total == 0);
    }
}
