//! Daemon-tracked child processes (backend CLIs) and kill plumbing.

use std::process::Stdio;
use std::sync::Arc;

use serde::Serialize;
use tokio::process::Command;
use tracing::warn;

use crate::state::Daemon;

#[derive(Debug, Clone, Serialize)]
pub struct TrackedProcess {
    pub session_id: String,
    pub task_id: String,
    pub pid: u32,
    pub backend: String,
    pub live: bool,
}

/// Every backend CLI child the daemon currently tracks.
pub fn list_system(daemon: &Arc<Daemon>) -> Vec<TrackedProcess> {
    daemon
        .store
        .list()
        .into_iter()
        .filter_map(|record| {
            let bridge = daemon.bridge(&record.id)?;
            let snap = bridge.snapshot();
            let pid = snap.pid?;
            Some(TrackedProcess {
                session_id: record.id.clone(),
                task_id: pid.to_string(),
                pid,
                backend: record.backend.as_str().to_string(),
                live: snap.live,
            })
        })
        .collect()
}

/// Kill one tracked child of a session by task id. Returns false when the
/// session has no such task.
pub async fn kill_task(daemon: &Arc<Daemon>, session_id: &str, task_id: &str) -> bool {
    let Some(bridge) = daemon.bridge(session_id) else {
        return false;
    };
    let Some(pid) = bridge.snapshot().pid else {
        return false;
    };
    if pid.to_string() != task_id {
        return false;
    }
    signal_terminate(pid).await
}

/// Kill every tracked child of a session.
pub async fn kill_all(daemon: &Arc<Daemon>, session_id: &str) -> usize {
    let Some(bridge) = daemon.bridge(session_id) else {
        return 0;
    };
    match bridge.snapshot().pid {
        Some(pid) if signal_terminate(pid).await => 1,
        _ => 0,
    }
}

async fn signal_terminate(pid: u32) -> bool {
    let result = Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match result {
        Ok(status) => status.success(),
        Err(e) => {
            warn!(
                component = "processes",
                event = "process.kill_failed",
                pid = pid,
                error = %e,
                "Failed to signal process"
            );
            false
        }
    }
}
