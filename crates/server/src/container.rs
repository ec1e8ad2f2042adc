//! Container runtime for per-session isolation.
//!
//! Shells out to the `docker` CLI in argv form only; no shell strings are
//! ever built from request input. Tracked handles are keyed by session id
//! and persisted to `containers.json` so a restarted daemon can re-adopt
//! still-running containers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use companion_protocol::BackendKind;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::RuntimeError;
use crate::persist::{read_json_or_empty, write_json_atomic};

/// Path the session workspace is mounted at inside every container.
pub const CONTAINER_WORKSPACE: &str = "/workspace";
/// Read-only mount of the host's backend auth directory.
const HOST_AUTH_MOUNT: &str = "/mnt/host-auth";

/// Host directory holding the backend's auth material.
fn host_auth_dir(backend: BackendKind) -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"));
    match backend {
        BackendKind::Claude => home.join(".claude"),
        BackendKind::Codex => home.join(".codex"),
    }
}

/// Writable location the backend CLI reads its auth from inside the container.
fn runtime_auth_dir(backend: BackendKind) -> &'static str {
    match backend {
        BackendKind::Claude => "/root/.claude",
        BackendKind::Codex => "/root/.codex",
    }
}

/// Only auth/settings/skills files are seeded, never the full host dir.
fn auth_seed_files(backend: BackendKind) -> &'static [&'static str] {
    match backend {
        BackendKind::Claude => &[".credentials.json", "settings.json"],
        BackendKind::Codex => &["auth.json", "config.toml"],
    }
}

const EXEC_TIMEOUT: Duration = Duration::from_secs(30);
const QUICK_EXEC_TIMEOUT: Duration = Duration::from_secs(8);
const BOOT_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Creating,
    Running,
    Stopped,
    Removed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
    pub image: String,
    /// container port -> host port
    pub ports: HashMap<u16, u16>,
    pub host_cwd: String,
    pub container_cwd: String,
    pub state: ContainerState,
}

#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub backend: BackendKind,
    pub image: String,
    pub ports: Vec<u16>,
    /// (host path, container path) extra bind mounts
    pub volumes: Vec<(String, String)>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    Stopped,
    Missing,
}

#[derive(Debug)]
pub struct StreamedExec {
    pub exit_code: i32,
    pub combined_output: String,
}

pub struct ContainerRuntime {
    docker_bin: String,
    tracked: Mutex<HashMap<String, ContainerHandle>>,
}

impl ContainerRuntime {
    pub fn new() -> Self {
        let docker_bin =
            std::env::var("COMPANION_DOCKER_BIN").unwrap_or_else(|_| "docker".to_string());
        Self {
            docker_bin,
            tracked: Mutex::new(HashMap::new()),
        }
    }

    async fn docker(&self, args: &[&str], timeout: Duration) -> Result<String, RuntimeError> {
        let fut = Command::new(&self.docker_bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        let output = tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| {
                RuntimeError::Timeout(format!(
                    "docker {} exceeded {}s",
                    args.first().unwrap_or(&""),
                    timeout.as_secs()
                ))
            })?
            .map_err(|e| RuntimeError::BackendUnavailable(format!("docker not runnable: {e}")))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(RuntimeError::Fatal(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    pub async fn check_available(&self) -> bool {
        self.version().await.is_some()
    }

    pub async fn version(&self) -> Option<String> {
        self.docker(
            &["version", "--format", "{{.Server.Version}}"],
            QUICK_EXEC_TIMEOUT,
        )
        .await
        .ok()
    }

    pub async fn list_images(&self) -> Vec<String> {
        match self
            .docker(
                &["images", "--format", "{{.Repository}}:{{.Tag}}"],
                EXEC_TIMEOUT,
            )
            .await
        {
            Ok(out) => out
                .lines()
                .filter(|l| !l.is_empty() && !l.ends_with(":<none>"))
                .map(String::from)
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Create and start a container for a session.
    ///
    /// Any sub-step failure tears the partially created container down.
    pub async fn create(
        &self,
        session_id: &str,
        host_cwd: &str,
        config: &ContainerConfig,
    ) -> Result<ContainerHandle, RuntimeError> {
        for port in &config.ports {
            if *port == 0 {
                return Err(RuntimeError::InvalidInput(format!(
                    "container port {port} outside 1..65535"
                )));
            }
        }

        let name = format!("companion-{}", &session_id[..session_id.len().min(12)]);
        let host_auth = host_auth_dir(config.backend).to_string_lossy().to_string();

        let mut args: Vec<String> = vec![
            "create".into(),
            "--name".into(),
            name.clone(),
            "--workdir".into(),
            CONTAINER_WORKSPACE.into(),
            "--add-host".into(),
            "host.docker.internal:host-gateway".into(),
            // Host auth material is visible read-only; the CLI writes to a tmpfs copy.
            "-v".into(),
            format!("{host_auth}:{HOST_AUTH_MOUNT}:ro"),
            "--tmpfs".into(),
            runtime_auth_dir(config.backend).into(),
            "-v".into(),
            format!("{host_cwd}:{CONTAINER_WORKSPACE}"),
        ];
        for (host, container) in &config.volumes {
            args.push("-v".into());
            args.push(format!("{host}:{container}"));
        }
        for (key, value) in &config.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        for port in &config.ports {
            // Auto-assigned host port
            args.push("-p".into());
            args.push(format!("{port}"));
        }
        args.push(config.image.clone());
        args.push("sleep".into());
        args.push("infinity".into());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let container_id = self.docker(&arg_refs, BOOT_TIMEOUT).await?;

        let mut handle = ContainerHandle {
            id: container_id.clone(),
            name,
            image: config.image.clone(),
            ports: HashMap::new(),
            host_cwd: host_cwd.to_string(),
            container_cwd: CONTAINER_WORKSPACE.to_string(),
            state: ContainerState::Creating,
        };

        if let Err(e) = self.finish_create(&mut handle, config).await {
            warn!(
                component = "container",
                event = "container.create.teardown",
                container_id = %container_id,
                error = %e,
                "Creation sub-step failed, tearing down partial container"
            );
            let _ = self
                .docker(&["rm", "-f", &container_id], EXEC_TIMEOUT)
                .await;
            return Err(e);
        }

        handle.state = ContainerState::Running;
        self.tracked
            .lock()
            .expect("container lock poisoned")
            .insert(session_id.to_string(), handle.clone());

        info!(
            component = "container",
            event = "container.created",
            session_id = %session_id,
            container_id = %handle.id,
            image = %handle.image,
            ports = ?handle.ports,
            "Container created"
        );
        Ok(handle)
    }

    async fn finish_create(
        &self,
        handle: &mut ContainerHandle,
        config: &ContainerConfig,
    ) -> Result<(), RuntimeError> {
        self.docker(&["start", &handle.id], BOOT_TIMEOUT).await?;

        self.seed_auth_files(&handle.id, config.backend).await?;

        for port in &config.ports {
            let host_port = self.resolve_host_port(&handle.id, *port).await?;
            handle.ports.insert(*port, host_port);
        }
        Ok(())
    }

    /// Copy only the backend's auth/settings/skills files from the read-only
    /// host mount into the writable runtime location. Explicitly not the
    /// full home dir.
    async fn seed_auth_files(
        &self,
        container_id: &str,
        backend: BackendKind,
    ) -> Result<(), RuntimeError> {
        let auth_dir = runtime_auth_dir(backend);
        let files = auth_seed_files(backend).join(" ");
        let script = format!(
            "mkdir -p {auth_dir} && \
             for f in {files}; do \
               [ -f {HOST_AUTH_MOUNT}/$f ] && cp {HOST_AUTH_MOUNT}/$f {auth_dir}/$f; \
             done; \
             [ -d {HOST_AUTH_MOUNT}/skills ] && cp -r {HOST_AUTH_MOUNT}/skills {auth_dir}/skills; \
             true"
        );
        // The script body is built from compile-time constants; only fixed
        // paths and filenames appear in it.
        self.docker(
            &["exec", container_id, "sh", "-c", &script],
            QUICK_EXEC_TIMEOUT,
        )
        .await
        .map(|_| ())
    }

    async fn resolve_host_port(
        &self,
        container_id: &str,
        container_port: u16,
    ) -> Result<u16, RuntimeError> {
        let spec = format!("{container_port}/tcp");
        let out = self
            .docker(&["port", container_id, &spec], QUICK_EXEC_TIMEOUT)
            .await?;
        // "0.0.0.0:49153" (possibly multiple lines for v4+v6)
        out.lines()
            .filter_map(|l| l.rsplit(':').next())
            .find_map(|p| p.parse::<u16>().ok())
            .ok_or_else(|| {
                RuntimeError::Fatal(format!(
                    "could not resolve host port for {container_port}: {out:?}"
                ))
            })
    }

    /// One-shot exec, argv form, hard timeout.
    pub async fn exec(
        &self,
        container_id: &str,
        argv: &[&str],
        timeout: Duration,
    ) -> Result<String, RuntimeError> {
        let mut args = vec!["exec", container_id];
        args.extend_from_slice(argv);
        self.docker(&args, timeout).await
    }

    /// Exec with line-buffered streaming; stdout and stderr are merged into
    /// the combined output and each line is surfaced via the channel.
    pub async fn exec_streaming(
        &self,
        container_id: &str,
        argv: &[&str],
        timeout: Duration,
        line_tx: mpsc::Sender<String>,
    ) -> Result<StreamedExec, RuntimeError> {
        let mut args = vec!["exec".to_string(), container_id.to_string()];
        args.extend(argv.iter().map(|s| s.to_string()));

        let mut child = Command::new(&self.docker_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RuntimeError::BackendUnavailable(format!("docker not runnable: {e}")))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (merge_tx, mut merge_rx) = mpsc::channel::<String>(256);

        if let Some(out) = stdout {
            let tx = merge_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(err) = stderr {
            let tx = merge_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(merge_tx);

        let mut combined = String::new();
        let collect = async {
            while let Some(line) = merge_rx.recv().await {
                combined.push_str(&line);
                combined.push('\n');
                let _ = line_tx.send(line).await;
            }
            child.wait().await
        };

        let status = tokio::time::timeout(timeout, collect).await.map_err(|_| {
            // Don't leave the exec'd process running past its deadline
            let _ = child.start_kill();
            RuntimeError::Timeout(format!(
                "container exec exceeded {}s",
                timeout.as_secs()
            ))
        })?;

        let exit_code = status
            .map_err(|e| RuntimeError::Fatal(format!("wait for exec: {e}")))?
            .code()
            .unwrap_or(-1);

        Ok(StreamedExec {
            exit_code,
            combined_output: combined,
        })
    }

    pub async fn alive(&self, container_id: &str) -> Liveness {
        match self
            .docker(
                &["inspect", "--format", "{{.State.Running}}", container_id],
                QUICK_EXEC_TIMEOUT,
            )
            .await
        {
            Ok(out) if out == "true" => Liveness::Running,
            Ok(_) => Liveness::Stopped,
            Err(_) => Liveness::Missing,
        }
    }

    /// Re-key the tracking map once the real session id is known.
    pub fn retrack(&self, old_session_id: &str, new_session_id: &str) {
        let mut guard = self.tracked.lock().expect("container lock poisoned");
        if let Some(handle) = guard.remove(old_session_id) {
            guard.insert(new_session_id.to_string(), handle);
        }
    }

    pub fn handle_for(&self, session_id: &str) -> Option<ContainerHandle> {
        self.tracked
            .lock()
            .expect("container lock poisoned")
            .get(session_id)
            .cloned()
    }

    /// Force-remove the container tracked for a session. Idempotent; remove
    /// failures are logged and swallowed.
    pub async fn remove(&self, session_id: &str) {
        let handle = {
            let mut guard = self.tracked.lock().expect("container lock poisoned");
            guard.remove(session_id)
        };
        let Some(handle) = handle else { return };

        if let Err(e) = self.docker(&["rm", "-f", &handle.id], EXEC_TIMEOUT).await {
            warn!(
                component = "container",
                event = "container.remove_failed",
                session_id = %session_id,
                container_id = %handle.id,
                error = %e,
                "Remove failed, continuing"
            );
        } else {
            info!(
                component = "container",
                event = "container.removed",
                session_id = %session_id,
                container_id = %handle.id,
                "Container removed"
            );
        }
    }

    pub async fn cleanup_all(&self) {
        let session_ids: Vec<String> = {
            let guard = self.tracked.lock().expect("container lock poisoned");
            guard.keys().cloned().collect()
        };
        for id in session_ids {
            self.remove(&id).await;
        }
    }

    /// Write tracked non-removed handles to disk.
    pub fn persist(&self, path: &Path) {
        let guard = self.tracked.lock().expect("container lock poisoned");
        let snapshot: HashMap<&String, &ContainerHandle> = guard
            .iter()
            .filter(|(_, h)| h.state != ContainerState::Removed)
            .collect();
        if let Err(e) = write_json_atomic(path, &snapshot) {
            warn!(
                component = "container",
                event = "container.persist_failed",
                error = %e,
                "Failed to persist container index"
            );
        }
    }

    /// Restore tracked handles, dropping any the runtime no longer knows.
    pub async fn restore(&self, path: &Path) {
        let Some(saved) = read_json_or_empty::<HashMap<String, ContainerHandle>>(path) else {
            return;
        };
        let mut kept = 0usize;
        for (session_id, handle) in saved {
            match self.alive(&handle.id).await {
                Liveness::Missing => {
                    debug!(
                        component = "container",
                        event = "container.restore.dropped",
                        session_id = %session_id,
                        container_id = %handle.id,
                        "Container no longer exists, dropping"
                    );
                }
                _ => {
                    self.tracked
                        .lock()
                        .expect("container lock poisoned")
                        .insert(session_id, handle);
                    kept += 1;
                }
            }
        }
        if kept > 0 {
            info!(
                component = "container",
                event = "container.restored",
                containers = kept,
                "Re-adopted tracked containers"
            );
        }
    }
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: &str) -> ContainerHandle {
        ContainerHandle {
            id: id.to_string(),
            name: format!("companion-{id}"),
            image: "ubuntu:24.04".into(),
            ports: HashMap::from([(3000, 49200)]),
            host_cwd: "/home/u/p".into(),
            container_cwd: CONTAINER_WORKSPACE.into(),
            state: ContainerState::Running,
        }
    }

    #[tokio::test]
    async fn create_rejects_port_zero() {
        let runtime = ContainerRuntime::new();
        let config = ContainerConfig {
            backend: BackendKind::Claude,
            image: "ubuntu:24.04".into(),
            ports: vec![0],
            volumes: vec![],
            env: HashMap::new(),
        };
        let err = runtime.create("s1", "/tmp", &config).await.unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidInput(_)));
    }

    #[test]
    fn auth_paths_follow_the_backend() {
        assert!(host_auth_dir(BackendKind::Claude).ends_with(".claude"));
        assert!(host_auth_dir(BackendKind::Codex).ends_with(".codex"));
        assert_eq!(runtime_auth_dir(BackendKind::Claude), "/root/.claude");
        assert_eq!(runtime_auth_dir(BackendKind::Codex), "/root/.codex");
        assert!(auth_seed_files(BackendKind::Claude).contains(&".credentials.json"));
        assert!(auth_seed_files(BackendKind::Codex).contains(&"auth.json"));
    }

    #[test]
    fn retrack_rekeys_the_handle() {
        let runtime = ContainerRuntime::new();
        runtime
            .tracked
            .lock()
            .unwrap()
            .insert("temp-id".into(), handle("c1"));
        runtime.retrack("temp-id", "real-id");
        assert!(runtime.handle_for("temp-id").is_none());
        assert_eq!(runtime.handle_for("real-id").unwrap().id, "c1");
    }

    #[test]
    fn retrack_unknown_id_is_noop() {
        let runtime = ContainerRuntime::new();
        runtime.retrack("ghost", "real");
        assert!(runtime.handle_for("real").is_none());
    }

    #[test]
    fn persist_skips_removed_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("containers.json");
        let runtime = ContainerRuntime::new();
        runtime.tracked.lock().unwrap().insert("s1".into(), handle("c1"));
        let mut gone = handle("c2");
        gone.state = ContainerState::Removed;
        runtime.tracked.lock().unwrap().insert("s2".into(), gone);

        runtime.persist(&path);
        let saved: HashMap<String, ContainerHandle> =
            read_json_or_empty(&path).unwrap();
        assert!(saved.contains_key("s1"));
        assert!(!saved.contains_key("s2"));
    }
}
