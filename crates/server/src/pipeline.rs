//! Session creation pipeline.
//!
//! An ordered, resumable staging sequence: env → git → image → container →
//! workspace → init script → CLI launch. Each step reports progress through
//! one [`ProgressReporter`]; the first error terminates the pipeline and
//! rolls back side effects created after the failing step (the container is
//! removed, a created worktree is left in place). Callers relaunch the whole
//! pipeline - there are no per-step retries.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use companion_connectors::{Adapter, ClaudeAdapter, CodexAdapter, LaunchSpec};
use companion_protocol::{
    BackendKind, ContainerInfo, PipelineStep, SessionDescriptor, SessionRecord, StepStatus,
    WorktreeInfo,
};

use crate::bridge::{BridgeHandle, BridgeMsg};
use crate::container::{ContainerConfig, CONTAINER_WORKSPACE};
use crate::git::{self, EnsureWorktreeOpts};
use crate::settings::EnvProfile;
use crate::state::Daemon;

/// Container port the in-container editor is published on.
pub const EDITOR_CONTAINER_PORT: u16 = 4455;
/// Container port the Codex app server is published on.
pub const APP_SERVER_CONTAINER_PORT: u16 = 4411;

const IMAGE_PULL_DEADLINE: Duration = Duration::from_secs(300);
const INIT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(120);

const INIT_OUTPUT_LIMIT: usize = 2_000;
const INIT_OUTPUT_HEAD: usize = 500;
const INIT_OUTPUT_TAIL: usize = 1_500;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRequest {
    pub backend: BackendKind,
    pub cwd: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub use_worktree: bool,
    #[serde(default)]
    pub create_branch: bool,
    /// Named environment profile from settings
    #[serde(default)]
    pub environment: Option<String>,
    /// Per-request overrides merged over the profile
    #[serde(default)]
    pub overrides: EnvProfile,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub resume: Option<String>,
    #[serde(default)]
    pub fork: bool,
}

/// One fatal step failure
#[derive(Debug, Clone)]
pub struct StepError {
    pub step: Option<PipelineStep>,
    pub message: String,
    pub status: u16,
}

/// The pipeline's single reporting seam. Transports map this either to one
/// JSON response (first error wins) or to a stream of server-sent events.
pub trait ProgressReporter: Send + Sync {
    fn progress(&self, step: PipelineStep, status: StepStatus, detail: Option<String>);
    fn error(&self, message: &str, status: u16, step: Option<PipelineStep>);
}

struct ResolvedEnv {
    image: Option<String>,
    ports: Vec<u16>,
    volumes: Vec<(String, String)>,
    init_script: Option<String>,
    env: HashMap<String, String>,
}

/// Merge the named profile (if any) with per-request overrides. Override
/// scalars win; ports/volumes/env are unioned.
fn resolve_env(profile: Option<&EnvProfile>, overrides: &EnvProfile) -> ResolvedEnv {
    let empty = EnvProfile::default();
    let base = profile.unwrap_or(&empty);

    let mut ports: Vec<u16> = base.ports.clone();
    for p in &overrides.ports {
        if !ports.contains(p) {
            ports.push(*p);
        }
    }

    let mut volumes = Vec::new();
    for spec in base.volumes.iter().chain(overrides.volumes.iter()) {
        if let Some((host, container)) = spec.split_once(':') {
            volumes.push((host.to_string(), container.to_string()));
        }
    }

    let mut env = base.env.clone();
    env.extend(overrides.env.clone());

    ResolvedEnv {
        image: overrides.image.clone().or_else(|| base.image.clone()),
        ports,
        volumes,
        init_script: overrides
            .init_script
            .clone()
            .or_else(|| base.init_script.clone()),
        env,
    }
}

/// Truncate long init-script output to head + tail for error surfaces.
fn truncate_head_tail(output: &str) -> String {
    if output.chars().count() <= INIT_OUTPUT_LIMIT {
        return output.to_string();
    }
    let chars: Vec<char> = output.chars().collect();
    let head: String = chars[..INIT_OUTPUT_HEAD].iter().collect();
    let tail: String = chars[chars.len() - INIT_OUTPUT_TAIL..].iter().collect();
    format!("{head}\n...[output truncated]...\n{tail}")
}

fn free_local_port() -> Option<u16> {
    std::net::TcpListener::bind("127.0.0.1:0")
        .ok()
        .and_then(|l| l.local_addr().ok())
        .map(|a| a.port())
}

/// Backend-specific auth must be reachable from inside the container before
/// it is created.
fn container_auth_available(backend: BackendKind, env: &HashMap<String, String>) -> Result<(), String> {
    let home = dirs::home_dir().unwrap_or_default();
    match backend {
        BackendKind::Claude => {
            if env.contains_key("ANTHROPIC_API_KEY")
                || home.join(".claude/.credentials.json").is_file()
            {
                Ok(())
            } else {
                Err("no Claude auth available to the container: set ANTHROPIC_API_KEY \
                     in the environment or log in with the claude CLI on the host"
                    .into())
            }
        }
        BackendKind::Codex => {
            if env.contains_key("OPENAI_API_KEY") || home.join(".codex/auth.json").is_file() {
                Ok(())
            } else {
                Err("no Codex auth available to the container: set OPENAI_API_KEY \
                     in the environment or log in with the codex CLI on the host"
                    .into())
            }
        }
    }
}

/// Run the full creation pipeline, returning the created session or the
/// first fatal step error.
pub async fn run(
    daemon: &Arc<Daemon>,
    req: CreateRequest,
    reporter: &dyn ProgressReporter,
) -> Result<SessionDescriptor, StepError> {
    let session_id = companion_protocol::new_id();
    let staging_key = format!("pending-{session_id}");

    let fail = |step: PipelineStep, status: u16, message: String| {
        reporter.error(&message, status, Some(step));
        StepError {
            step: Some(step),
            message,
            status,
        }
    };

    // 1. resolving_env
    reporter.progress(PipelineStep::ResolvingEnv, StepStatus::InProgress, None);
    let settings = daemon.settings.get();
    let profile = match &req.environment {
        Some(name) => match settings.environments.get(name) {
            Some(p) => Some(p.clone()),
            None => {
                return Err(fail(
                    PipelineStep::ResolvingEnv,
                    400,
                    format!("unknown environment profile {name:?}"),
                ));
            }
        },
        None => None,
    };
    let env = resolve_env(profile.as_ref(), &req.overrides);
    reporter.progress(PipelineStep::ResolvingEnv, StepStatus::Done, None);

    // 2. git staging - exactly one path; errors here are non-fatal
    let mut effective_cwd = req.cwd.clone();
    let mut worktree: Option<WorktreeInfo> = None;

    if req.use_worktree {
        if let Some(branch) = &req.branch {
            reporter.progress(PipelineStep::CreatingWorktree, StepStatus::InProgress, None);
            match stage_worktree(&req.cwd, branch, req.create_branch).await {
                Ok(info) => {
                    effective_cwd = info.worktree_path.clone();
                    reporter.progress(
                        PipelineStep::CreatingWorktree,
                        StepStatus::Done,
                        Some(info.actual_branch.clone()),
                    );
                    worktree = Some(info);
                }
                Err(e) => {
                    warn!(
                        component = "pipeline",
                        event = "pipeline.worktree_failed",
                        session_id = %session_id,
                        error = %e,
                        "Worktree staging failed, proceeding in original cwd"
                    );
                    reporter.progress(
                        PipelineStep::CreatingWorktree,
                        StepStatus::Error,
                        Some(e),
                    );
                }
            }
        }
    } else if let Some(branch) = &req.branch {
        stage_branch_checkout(&req.cwd, branch, req.create_branch, reporter).await;
    }

    // 3. pulling_image
    if let Some(image) = &env.image {
        reporter.progress(PipelineStep::PullingImage, StepStatus::InProgress, None);
        let (line_tx, mut line_rx) = mpsc::channel::<String>(64);
        let sub_id = daemon.images.on_progress(image, line_tx);
        daemon.images.ensure_image(image);

        let ready = {
            let wait = daemon.images.wait_for_ready(image, IMAGE_PULL_DEADLINE);
            tokio::pin!(wait);
            loop {
                tokio::select! {
                    ready = &mut wait => break ready,
                    Some(line) = line_rx.recv() => {
                        reporter.progress(
                            PipelineStep::PullingImage,
                            StepStatus::InProgress,
                            Some(line),
                        );
                    }
                }
            }
        };
        daemon.images.unsubscribe(image, sub_id);

        if !ready {
            let detail = match daemon.images.state(image) {
                crate::image_pull::PullStatus::Error(e) => e,
                _ => format!("image {image} not ready within {}s", IMAGE_PULL_DEADLINE.as_secs()),
            };
            return Err(fail(PipelineStep::PullingImage, 503, detail));
        }
        reporter.progress(PipelineStep::PullingImage, StepStatus::Done, None);
    }

    // 4. creating_container
    let mut container: Option<crate::container::ContainerHandle> = None;
    if let Some(image) = &env.image {
        reporter.progress(PipelineStep::CreatingContainer, StepStatus::InProgress, None);

        if let Err(msg) = container_auth_available(req.backend, &env.env) {
            return Err(fail(PipelineStep::CreatingContainer, 400, msg));
        }

        let mut ports = env.ports.clone();
        if !ports.contains(&EDITOR_CONTAINER_PORT) {
            ports.push(EDITOR_CONTAINER_PORT);
        }
        if req.backend == BackendKind::Codex && !ports.contains(&APP_SERVER_CONTAINER_PORT) {
            ports.push(APP_SERVER_CONTAINER_PORT);
        }

        let config = ContainerConfig {
            backend: req.backend,
            image: image.clone(),
            ports,
            volumes: env.volumes.clone(),
            env: env.env.clone(),
        };
        match daemon.containers.create(&staging_key, &effective_cwd, &config).await {
            Ok(handle) => {
                reporter.progress(
                    PipelineStep::CreatingContainer,
                    StepStatus::Done,
                    Some(handle.name.clone()),
                );
                container = Some(handle);
            }
            Err(e) => {
                return Err(fail(PipelineStep::CreatingContainer, e.status().as_u16(), e.to_string()));
            }
        }
    }

    // Everything past this point tears the container down on failure.
    let rollback = |daemon: &Arc<Daemon>| {
        let daemon = daemon.clone();
        let key = staging_key.clone();
        async move {
            daemon.containers.remove(&key).await;
        }
    };

    // 5. copying_workspace
    if let Some(handle) = &container {
        reporter.progress(PipelineStep::CopyingWorkspace, StepStatus::InProgress, None);
        let staged = stage_workspace(daemon, &handle.id).await;
        if let Err(e) = staged {
            rollback(daemon).await;
            return Err(fail(PipelineStep::CopyingWorkspace, 500, e));
        }
        reporter.progress(PipelineStep::CopyingWorkspace, StepStatus::Done, None);
    }

    // 6. running_init_script
    if let (Some(handle), Some(script)) = (&container, &env.init_script) {
        reporter.progress(PipelineStep::RunningInitScript, StepStatus::InProgress, None);
        let (line_tx, mut line_rx) = mpsc::channel::<String>(64);

        let init_cmd = ["sh", "-c", script.as_str()];
        let exec = daemon.containers.exec_streaming(
            &handle.id,
            &init_cmd,
            INIT_SCRIPT_TIMEOUT,
            line_tx,
        );
        tokio::pin!(exec);
        let result = loop {
            tokio::select! {
                result = &mut exec => break result,
                Some(line) = line_rx.recv() => {
                    reporter.progress(
                        PipelineStep::RunningInitScript,
                        StepStatus::InProgress,
                        Some(line),
                    );
                }
            }
        };

        match result {
            Ok(streamed) if streamed.exit_code == 0 => {
                reporter.progress(PipelineStep::RunningInitScript, StepStatus::Done, None);
            }
            Ok(streamed) => {
                rollback(daemon).await;
                return Err(fail(
                    PipelineStep::RunningInitScript,
                    500,
                    format!(
                        "init script exited with {}:\n{}",
                        streamed.exit_code,
                        truncate_head_tail(&streamed.combined_output)
                    ),
                ));
            }
            Err(e) => {
                rollback(daemon).await;
                return Err(fail(PipelineStep::RunningInitScript, e.status().as_u16(), e.to_string()));
            }
        }
    }

    // 7. launching_cli
    reporter.progress(PipelineStep::LaunchingCli, StepStatus::InProgress, None);

    let mut spec = LaunchSpec {
        cwd: effective_cwd.clone(),
        model: req.model.clone(),
        permission_mode: req.permission_mode.clone(),
        allowed_tools: req.allowed_tools.clone(),
        env: env.env.clone(),
        resume: req.resume.clone(),
        fork: req.fork,
        ..Default::default()
    };
    if let Some(handle) = &container {
        let docker_bin =
            std::env::var("COMPANION_DOCKER_BIN").unwrap_or_else(|_| "docker".to_string());
        spec.wrapper = vec![
            docker_bin,
            "exec".into(),
            "-i".into(),
            "-w".into(),
            CONTAINER_WORKSPACE.into(),
            handle.id.clone(),
        ];
        if req.backend == BackendKind::Codex {
            spec.app_server_port = Some(APP_SERVER_CONTAINER_PORT);
            spec.app_server_connect_port =
                handle.ports.get(&APP_SERVER_CONTAINER_PORT).copied();
        }
    } else if req.backend == BackendKind::Codex {
        let port = free_local_port().unwrap_or(APP_SERVER_CONTAINER_PORT);
        spec.app_server_port = Some(port);
    }

    let adapter = match req.backend {
        BackendKind::Claude => ClaudeAdapter::launch(&spec).await.map(Adapter::Claude),
        BackendKind::Codex => CodexAdapter::launch(&spec).await.map(Adapter::Codex),
    };
    let adapter = match adapter {
        Ok(adapter) => adapter,
        Err(e) => {
            rollback(daemon).await;
            return Err(fail(PipelineStep::LaunchingCli, 503, e.to_string()));
        }
    };
    reporter.progress(PipelineStep::LaunchingCli, StepStatus::Done, None);

    // 8. Post-launch bookkeeping
    daemon.containers.retrack(&staging_key, &session_id);
    daemon.containers.persist(&crate::paths::containers_path());

    let mut record = SessionRecord::new(session_id.clone(), req.backend, req.cwd.clone());
    record.model = req.model.clone();
    record.permission_mode = req.permission_mode.clone();
    record.current_cwd = Some(effective_cwd.clone());
    if let Some(handle) = daemon.containers.handle_for(&session_id) {
        record.container = Some(ContainerInfo {
            id: handle.id.clone(),
            name: handle.name.clone(),
            image: handle.image.clone(),
            ports: handle.ports.clone(),
        });
    }
    if let Some(info) = &worktree {
        record.git_branch = Some(info.actual_branch.clone());
        record.worktree = Some(info.clone());
        daemon.worktrees.record(&session_id, info.clone());
    }
    daemon.store.insert(record.clone());

    let bridge = BridgeHandle::spawn(
        session_id.clone(),
        req.backend,
        effective_cwd,
        Some(adapter),
        daemon.plugins.clone(),
        daemon.store.clone(),
    );
    if container.is_some() {
        bridge
            .send(BridgeMsg::SetContainerized {
                host_cwd: req.cwd.clone(),
            })
            .await;
    }
    daemon.add_bridge(bridge);

    info!(
        component = "pipeline",
        event = "pipeline.session_created",
        session_id = %session_id,
        backend = %req.backend.as_str(),
        containerized = container.is_some(),
        worktree = worktree.is_some(),
        "Session created"
    );

    Ok(daemon.describe(record))
}

async fn stage_worktree(
    cwd: &str,
    branch: &str,
    create_branch: bool,
) -> Result<WorktreeInfo, String> {
    let info = git::repo_info(Path::new(cwd))
        .await
        .ok_or_else(|| format!("{cwd} is not inside a git repository"))?;

    let created = git::ensure_worktree(
        Path::new(&info.repo_root),
        branch,
        &EnsureWorktreeOpts {
            base_branch: Some(info.default_branch.clone()),
            create_branch,
            force_new: false,
        },
    )
    .await
    .map_err(|e| e.to_string())?;

    Ok(WorktreeInfo {
        repo_root: info.repo_root,
        branch: branch.to_string(),
        actual_branch: created.actual_branch,
        worktree_path: created.worktree_path,
        created_at: companion_protocol::unix_now_z(),
    })
}

/// The fetch → checkout → pull path. Every failure is logged and reported
/// as a step error status, never fatal.
async fn stage_branch_checkout(
    cwd: &str,
    branch: &str,
    create_branch: bool,
    reporter: &dyn ProgressReporter,
) {
    let Some(info) = git::repo_info(Path::new(cwd)).await else {
        reporter.progress(
            PipelineStep::FetchingGit,
            StepStatus::Error,
            Some(format!("{cwd} is not inside a git repository")),
        );
        return;
    };
    let repo_root = Path::new(&info.repo_root);

    reporter.progress(PipelineStep::FetchingGit, StepStatus::InProgress, None);
    let fetched = git::fetch(repo_root).await;
    reporter.progress(
        PipelineStep::FetchingGit,
        if fetched.success { StepStatus::Done } else { StepStatus::Error },
        (!fetched.success).then_some(fetched.output),
    );

    reporter.progress(PipelineStep::CheckoutBranch, StepStatus::InProgress, None);
    match git::checkout_or_create_branch(
        repo_root,
        branch,
        create_branch,
        Some(&info.default_branch),
    )
    .await
    {
        Ok(()) => {
            reporter.progress(PipelineStep::CheckoutBranch, StepStatus::Done, None);
        }
        Err(e) => {
            reporter.progress(
                PipelineStep::CheckoutBranch,
                StepStatus::Error,
                Some(e.to_string()),
            );
            return;
        }
    }

    reporter.progress(PipelineStep::PullingGit, StepStatus::InProgress, None);
    let pulled = git::pull(repo_root).await;
    reporter.progress(
        PipelineStep::PullingGit,
        if pulled.success { StepStatus::Done } else { StepStatus::Error },
        (!pulled.success).then_some(pulled.output),
    );
}

/// Verify the bind-mounted workspace is visible inside the container and
/// reseed git trust for it.
async fn stage_workspace(daemon: &Arc<Daemon>, container_id: &str) -> Result<(), String> {
    daemon
        .containers
        .exec(container_id, &["ls", CONTAINER_WORKSPACE], Duration::from_secs(8))
        .await
        .map_err(|e| format!("workspace not visible in container: {e}"))?;

    daemon
        .containers
        .exec(
            container_id,
            &[
                "git",
                "config",
                "--global",
                "--add",
                "safe.directory",
                CONTAINER_WORKSPACE,
            ],
            Duration::from_secs(8),
        )
        .await
        .map_err(|e| format!("reseeding git auth failed: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_env_overrides_win_on_scalars_and_union_on_collections() {
        let profile = EnvProfile {
            image: Some("base:1".into()),
            ports: vec![3000],
            volumes: vec!["/a:/b".into()],
            init_script: Some("make setup".into()),
            env: HashMap::from([("A".to_string(), "1".to_string())]),
        };
        let overrides = EnvProfile {
            image: Some("override:2".into()),
            ports: vec![3000, 8080],
            volumes: vec!["/c:/d".into()],
            init_script: None,
            env: HashMap::from([("A".to_string(), "2".to_string())]),
        };
        let resolved = resolve_env(Some(&profile), &overrides);
        assert_eq!(resolved.image.as_deref(), Some("override:2"));
        assert_eq!(resolved.ports, vec![3000, 8080]);
        assert_eq!(resolved.volumes.len(), 2);
        assert_eq!(resolved.init_script.as_deref(), Some("make setup"));
        assert_eq!(resolved.env["A"], "2");
    }

    #[test]
    fn resolve_env_without_profile_uses_overrides() {
        let overrides = EnvProfile {
            image: Some("img:1".into()),
            ..Default::default()
        };
        let resolved = resolve_env(None, &overrides);
        assert_eq!(resolved.image.as_deref(), Some("img:1"));
        assert!(resolved.ports.is_empty());
    }

    #[test]
    fn head_tail_truncation_keeps_boundaries() {
        let long: String = "x".repeat(3_000);
        let truncated = truncate_head_tail(&long);
        assert!(truncated.len() < long.len());
        assert!(truncated.contains("[output truncated]"));
        // head 500 + tail 1500 + marker
        let parts: Vec<&str> = truncated.split('\n').collect();
        assert_eq!(parts[0].chars().count(), INIT_OUTPUT_HEAD);
        assert_eq!(parts[2].chars().count(), INIT_OUTPUT_TAIL);
    }

    #[test]
    fn short_output_is_untouched() {
        assert_eq!(truncate_head_tail("short"), "short");
    }

    #[test]
    fn free_local_port_returns_nonzero() {
        assert!(free_local_port().unwrap() > 0);
    }

    #[test]
    fn create_request_parses_minimal_body() {
        let req: CreateRequest =
            serde_json::from_str(r#"{"backend": "claude", "cwd": "/home/u/p"}"#).unwrap();
        assert_eq!(req.backend, BackendKind::Claude);
        assert!(!req.use_worktree);
        assert!(req.environment.is_none());
    }
}
