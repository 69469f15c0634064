use anyhow::{Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// Spawns a shell command in its own process group with stdout/stderr piped.
///
/// The fresh process group lets termination signals reach the whole tree a
/// dev command forks (npm → node → esbuild, ...), not just the shell.
pub fn spawn_shell(
    command: &str,
    workdir: &Path,
    envs: &[(String, String)],
) -> Result<Child> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd.current_dir(workdir);
    for (key, value) in envs {
        cmd.env(key, value);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.process_group(0);
    cmd.spawn()
        .with_context(|| format!("failed to spawn `{command}` in {}", workdir.display()))
}

/// True if a process with this pid exists (signal 0 probe).
pub fn is_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Sends a signal to the process group led by `pid`. ESRCH (already gone)
/// is not an error.
pub fn signal_group(pid: u32, signal: Signal) -> Result<()> {
    let pid = i32::try_from(pid).context("pid out of range")?;
    match kill(Pid::from_raw(-pid), signal) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(anyhow::anyhow!("failed to signal process group {pid}: {e}")),
    }
}

/// Terminates a child gracefully: SIGTERM to its process group, wait up to
/// `grace`, then SIGKILL. Returns the exit code when one is observed.
pub async fn terminate_child(child: &mut Child, name: &str, grace: Duration) -> Option<i32> {
    let Some(pid) = child.id() else {
        // Already reaped.
        return child.try_wait().ok().flatten().and_then(|s| s.code());
    };

    info!("Sending SIGTERM to {} (pgid {})", name, pid);
    if let Err(e) = signal_group(pid, Signal::SIGTERM) {
        warn!("Failed to send SIGTERM to {}: {}", name, e);
    }

    let deadline = tokio::time::Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return status.code(),
            Ok(None) => {}
            Err(e) => {
                warn!("Error waiting for {}: {}", name, e);
                return None;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            warn!("{} did not exit within {:?}, sending SIGKILL", name, grace);
            if let Err(e) = signal_group(pid, Signal::SIGKILL) {
                warn!("Failed to force kill {}: {}", name, e);
            }
            return child.wait().await.ok().and_then(|s| s.code());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Terminates a process we did not spawn ourselves (re-adopted after a
/// daemon restart), by pid alone: SIGTERM to its group, bounded grace,
/// SIGKILL escalation.
pub async fn terminate_pid(pid: u32, name: &str, grace: Duration) {
    info!("Sending SIGTERM to {} (pgid {})", name, pid);
    if let Err(e) = signal_group(pid, Signal::SIGTERM) {
        warn!("Failed to send SIGTERM to {}: {}", name, e);
    }

    let deadline = tokio::time::Instant::now() + grace;
    while is_alive(pid) {
        if tokio::time::Instant::now() >= deadline {
            warn!("{} did not exit within {:?}, sending SIGKILL", name, grace);
            if let Err(e) = signal_group(pid, Signal::SIGKILL) {
                warn!("Failed to force kill {}: {}", name, e);
            }
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
