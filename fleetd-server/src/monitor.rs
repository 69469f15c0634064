use fleetd_core::state::ProcessState;
use std::time::Duration;
use tracing::{error, warn};

use crate::manager::Fleet;
use crate::ports::ComponentId;

/// Spawns the background liveness monitor: a periodic sweep over all
/// running components that detects unexpected exits.
///
/// The monitor only ever moves components `Running → Error`, never the
/// reverse, and never touches the per-project lifecycle locks — it reads
/// and writes through the same shared tables the manager uses, so the rest
/// of the system cannot tell a polled update from a pushed one.
pub fn spawn(fleet: Fleet) {
    let interval = Duration::from_secs(fleet.config().liveness_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            fleet.liveness_sweep().await;
        }
    });
}

impl Fleet {
    /// One pass over the runtime map. Crashed components are flagged
    /// `Error` with their exit code, and their port-table rows stop
    /// counting as running (the port itself stays as the sticky hint).
    pub(crate) async fn liveness_sweep(&self) {
        let mut crashed: Vec<(ComponentId, Option<i32>)> = Vec::new();
        {
            let mut runtime = self.runtime.lock().await;
            for (key, rt) in runtime.iter_mut() {
                if rt.state != ProcessState::Running || rt.stop_requested {
                    continue;
                }

                let exited: Option<Option<i32>> = match rt.child.as_mut() {
                    Some(child) => match child.try_wait() {
                        Ok(Some(status)) => Some(status.code()),
                        Ok(None) => None,
                        Err(e) => {
                            error!("error checking process status for {}/{}: {}", key.0, key.1, e);
                            None
                        }
                    },
                    // Re-adopted process: no handle, only a pid.
                    None => match rt.pid {
                        Some(pid) if !fleetd_utils::process::is_alive(pid) => Some(None),
                        _ => None,
                    },
                };

                if let Some(code) = exited {
                    rt.state = ProcessState::Error;
                    rt.exit_code = code;
                    rt.last_error = Some(match code {
                        Some(c) => format!("process exited unexpectedly with code {c}"),
                        None => "process exited unexpectedly".to_string(),
                    });
                    rt.child = None;
                    rt.pid = None;
                    crashed.push((key.clone(), code));
                }
            }
        }

        if crashed.is_empty() {
            return;
        }

        {
            let mut ports = self.ports.lock().await;
            for ((name, component), _) in &crashed {
                ports.release(name, *component);
            }
        }
        for ((name, component), code) in &crashed {
            warn!("crash detected: {}/{} (exit code {:?})", name, component, code);
        }
        self.persist().await;
    }
}
