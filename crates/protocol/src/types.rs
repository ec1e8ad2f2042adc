//! Core types shared across the protocol

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Backend CLI kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Claude,
    Codex,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Claude => "claude",
            BackendKind::Codex => "codex",
        }
    }
}

/// Where an envelope was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventSource {
    Routes,
    WsBridge,
    BackendAdapter,
    PluginBus,
}

/// Envelope metadata attached to every event crossing a fan-out boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMeta {
    pub event_id: String,
    pub event_version: u32,
    pub timestamp: String,
    pub source: EventSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_type: Option<BackendKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl EventMeta {
    pub fn new(source: EventSource, session_id: Option<String>) -> Self {
        Self {
            event_id: crate::new_id(),
            event_version: 2,
            timestamp: unix_now_z(),
            source,
            session_id,
            backend_type: None,
            correlation_id: None,
        }
    }
}

/// Current time as a `<unix-secs>Z` string
pub fn unix_now_z() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("{}Z", secs)
}

/// Allow/deny decision for a tool-use permission request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionBehavior {
    Allow,
    Deny,
}

/// A pending tool-use permission request from a backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub request_id: String,
    pub tool_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    pub input: Value,
    /// Best-effort flat view of the tool input for display
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_hash: Option<String>,
}

/// Decision a plugin or browser resolves a permission request with
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionDecision {
    pub behavior: PermissionBehavior,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Notification level of a plugin insight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightLevel {
    Info,
    Warning,
    Error,
}

/// Delivery channel hint for an insight. `None` means log-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightChannel {
    Toast,
    Sound,
    Desktop,
}

/// A plugin-produced notification record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub plugin_id: String,
    pub level: InsightLevel,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<InsightChannel>,
}

/// A container bound to a session, as surfaced to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    /// container port -> host port
    pub ports: std::collections::HashMap<u16, u16>,
}

/// A worktree bound to a session, as surfaced to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub repo_root: String,
    pub branch: String,
    pub actual_branch: String,
    pub worktree_path: String,
    pub created_at: String,
}

/// Rolling counters the bridge caches from backend state updates
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    pub lines_added: u64,
    pub lines_removed: u64,
    pub num_turns: u64,
    pub total_cost_usd: f64,
    pub context_used_percent: f64,
}

/// Persisted session metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub backend: BackendKind,
    pub cwd: String,
    pub archived: bool,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_ahead: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_behind: Option<u32>,
    #[serde(default)]
    pub stats: SessionStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree: Option<WorktreeInfo>,
}

impl SessionRecord {
    pub fn new(id: String, backend: BackendKind, cwd: String) -> Self {
        Self {
            id,
            backend,
            cwd,
            archived: false,
            created_at: unix_now_z(),
            name: None,
            model: None,
            permission_mode: None,
            current_cwd: None,
            git_branch: None,
            git_ahead: None,
            git_behind: None,
            stats: SessionStats::default(),
            container: None,
            worktree: None,
        }
    }
}

/// Session descriptor returned from the create/list routes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescriptor {
    #[serde(flatten)]
    pub record: SessionRecord,
    /// True while the backend process is running
    pub live: bool,
}

/// Ordered steps of the session creation pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    ResolvingEnv,
    CreatingWorktree,
    FetchingGit,
    CheckoutBranch,
    PullingGit,
    PullingImage,
    CreatingContainer,
    CopyingWorkspace,
    RunningInitScript,
    LaunchingCli,
}

impl PipelineStep {
    pub fn label(&self) -> &'static str {
        match self {
            PipelineStep::ResolvingEnv => "Resolving environment",
            PipelineStep::CreatingWorktree => "Creating worktree",
            PipelineStep::FetchingGit => "Fetching git remotes",
            PipelineStep::CheckoutBranch => "Checking out branch",
            PipelineStep::PullingGit => "Pulling latest changes",
            PipelineStep::PullingImage => "Pulling container image",
            PipelineStep::CreatingContainer => "Creating container",
            PipelineStep::CopyingWorkspace => "Copying workspace",
            PipelineStep::RunningInitScript => "Running init script",
            PipelineStep::LaunchingCli => "Launching CLI",
        }
    }
}

/// Status of a pipeline step progress event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    InProgress,
    Done,
    Error,
}

/// A single progress event from the creation pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepProgress {
    pub step: PipelineStep,
    pub label: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Best-effort reconstruction of one retained message for history rehydration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: String,
    pub content: Value,
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_meta_defaults_to_version_two() {
        let meta = EventMeta::new(EventSource::WsBridge, Some("s1".into()));
        assert_eq!(meta.event_version, 2);
        assert_eq!(meta.session_id.as_deref(), Some("s1"));
        assert!(meta.timestamp.ends_with('Z'));
    }

    #[test]
    fn event_source_serializes_kebab_case() {
        let json = serde_json::to_string(&EventSource::BackendAdapter).unwrap();
        assert_eq!(json, "\"backend-adapter\"");
    }

    #[test]
    fn pipeline_step_serializes_snake_case() {
        let json = serde_json::to_string(&PipelineStep::RunningInitScript).unwrap();
        assert_eq!(json, "\"running_init_script\"");
    }
}
