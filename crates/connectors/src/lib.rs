//! Companion Connectors
//!
//! Adapters for the interactive backend CLIs (Claude Code, Codex). Each
//! adapter spawns a CLI child, speaks its native JSONL dialect, and
//! normalizes inbound traffic into [`BackendEvent`]s. Sequencing is the
//! bridge's job - adapters never stamp `seq`.

pub mod claude;
pub mod codex;

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use companion_protocol::{PermissionBehavior, PermissionRequest, SessionStats};

pub use claude::ClaudeAdapter;
pub use codex::CodexAdapter;

/// Errors that can occur in adapters
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    #[error("Process communication error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connect deadline exceeded: {0}")]
    ConnectTimeout(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Normalized inbound events from a backend CLI
#[derive(Debug, Clone)]
pub enum BackendEvent {
    SessionInit {
        backend_session_id: Option<String>,
        model: Option<String>,
        permission_mode: Option<String>,
        cwd: Option<String>,
        tools: Option<Value>,
    },
    SessionUpdate {
        model: Option<String>,
        permission_mode: Option<String>,
        cwd: Option<String>,
        git_branch: Option<String>,
        git_ahead: Option<u32>,
        git_behind: Option<u32>,
        stats: Option<SessionStats>,
    },
    Assistant {
        message: Value,
    },
    StreamEvent {
        event: Value,
    },
    TurnResult {
        data: Value,
    },
    PermissionRequest(PermissionRequest),
    PermissionCancelled {
        request_id: String,
    },
    ToolProgress {
        tool_use_id: String,
        tool_name: Option<String>,
        elapsed_ms: Option<u64>,
    },
    ToolUseSummary {
        tool_use_id: String,
        summary: String,
    },
    SystemEvent {
        data: Value,
    },
    StatusChange {
        status: String,
    },
    AuthStatus {
        authenticated: bool,
        detail: Option<String>,
    },
    Error {
        message: String,
    },
    /// The child exited or its stream broke. Terminal for this adapter.
    Closed {
        reason: String,
    },
}

/// Outbound commands the bridge serializes toward the backend
#[derive(Debug, Clone)]
pub enum BackendCommand {
    UserMessage {
        content: String,
    },
    PermissionResponse {
        request_id: String,
        behavior: PermissionBehavior,
        message: Option<String>,
    },
    Interrupt,
    SetModel {
        model: String,
    },
    SetPermissionMode {
        mode: String,
    },
    McpGetStatus,
    McpToggle {
        server_name: String,
        enabled: bool,
    },
    McpReconnect {
        server_name: String,
    },
    McpSetServers {
        servers: Value,
    },
}

/// Everything needed to launch a backend CLI for one session
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub cwd: String,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub allowed_tools: Vec<String>,
    pub env: HashMap<String, String>,
    pub resume: Option<String>,
    pub fork: bool,
    /// Argv prefix wrapping the CLI invocation (e.g. `docker exec -i ...` for
    /// containerized sessions). Empty for direct host spawns.
    pub wrapper: Vec<String>,
    /// Port the backend's app server listens on (WebSocket backends only)
    pub app_server_port: Option<u16>,
    /// Port the adapter dials, when it differs from `app_server_port`
    /// (container port published to a different host port)
    pub app_server_connect_port: Option<u16>,
}

/// A running adapter of either variant
pub enum Adapter {
    Claude(ClaudeAdapter),
    Codex(CodexAdapter),
}

impl Adapter {
    /// Take the inbound event receiver. Can only be taken once.
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<BackendEvent>> {
        match self {
            Adapter::Claude(a) => a.take_event_rx(),
            Adapter::Codex(a) => a.take_event_rx(),
        }
    }

    /// Serialize one command as one complete line toward the child.
    pub async fn send(&self, command: BackendCommand) -> Result<(), AdapterError> {
        match self {
            Adapter::Claude(a) => a.send(command).await,
            Adapter::Codex(a) => a.send(command).await,
        }
    }

    /// Pid of the CLI child, while it is running.
    pub fn child_pid(&self) -> Option<u32> {
        match self {
            Adapter::Claude(a) => a.child_pid(),
            Adapter::Codex(a) => a.child_pid(),
        }
    }

    /// Kill the CLI child and close the adapter.
    pub async fn shutdown(&self) {
        match self {
            Adapter::Claude(a) => a.shutdown().await,
            Adapter::Codex(a) => a.shutdown().await,
        }
    }
}

pub(crate) fn truncate_line_preview(line: &str, max: usize) -> &str {
    let end = (0..=max.min(line.len()))
        .rev()
        .find(|&i| line.is_char_boundary(i))
        .unwrap_or(0);
    &line[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_preview_respects_char_boundaries() {
        let line = "héllo wörld";
        let preview = truncate_line_preview(line, 3);
        assert!(line.starts_with(preview));
        assert!(preview.len() <= 3);
    }

    #[test]
    fn truncate_preview_passes_short_lines_through() {
        assert_eq!(truncate_line_preview("ok", 200), "ok");
    }
}
