//! Subprocess termination: graceful signal first, hard kill on timeout.

use std::time::Duration;

use tokio::process::Child;
use tracing::debug;

const POLL: Duration = Duration::from_millis(50);

/// How the process ended up stopped, for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    AlreadyExited,
    Terminated,
    Killed,
}

impl std::fmt::Display for StopOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StopOutcome::AlreadyExited => "already-exited",
            StopOutcome::Terminated => "terminated",
            StopOutcome::Killed => "killed",
        };
        f.write_str(s)
    }
}

/// Ask the process to exit, waiting up to `grace` before the hard kill.
pub async fn sigterm_then_kill(child: &mut Child, grace: Duration) -> StopOutcome {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return StopOutcome::AlreadyExited;
    }

    send_term(child);

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if matches!(child.try_wait(), Ok(Some(_))) {
            return StopOutcome::Terminated;
        }
        tokio::time::sleep(POLL).await;
    }

    debug!("graceful stop timed out; hard killing");
    let _ = child.start_kill();
    let _ = child.wait().await;
    StopOutcome::Killed
}

#[cfg(unix)]
fn send_term(child: &Child) {
    if let Some(pid) = child.id() {
        // SIGTERM lets the worker close the model before exiting.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn send_term(child: &mut Child) {
    let _ = child.start_kill();
}

/// Non-blocking liveness check.
pub fn is_running(child: &mut Child) -> bool {
    matches!(child.try_wait(), Ok(None))
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::process::Command;

    fn sleeper() -> Child {
        Command::new("sleep")
            .arg("60")
            .stdout(std::process::Stdio::null())
            .spawn()
            .expect("sleep should spawn")
    }

    #[tokio::test]
    async fn sigterm_stops_a_sleeping_process() {
        let mut child = sleeper();
        assert!(is_running(&mut child));
        let outcome = sigterm_then_kill(&mut child, Duration::from_secs(5)).await;
        assert_eq!(outcome, StopOutcome::Terminated);
        assert!(!is_running(&mut child));
    }

    #[tokio::test]
    async fn stopping_twice_reports_already_exited() {
        let mut child = sleeper();
        let _ = sigterm_then_kill(&mut child, Duration::from_secs(5)).await;
        let second = sigterm_then_kill(&mut child, Duration::from_secs(1)).await;
        assert_eq!(second, StopOutcome::AlreadyExited);
    }
}
