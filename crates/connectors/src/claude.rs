//! Claude Code adapter
//!
//! Spawns the `claude` CLI as a subprocess and communicates via stdin/stdout
//! using the NDJSON stream-json protocol. Inbound lines are normalized into
//! [`BackendEvent`]s; outbound commands are serialized one complete line at
//! a time by a single writer task.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use companion_protocol::{PermissionBehavior, PermissionRequest};

use crate::{truncate_line_preview, AdapterError, BackendCommand, BackendEvent, LaunchSpec};

// ---------------------------------------------------------------------------
// Stdin messages (daemon → CLI)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StdinMessage {
    User {
        message: UserMessagePayload,
    },
    ControlRequest {
        request_id: String,
        request: ControlRequestBody,
    },
    ControlResponse {
        response: ControlResponsePayload,
    },
}

#[derive(Debug, Serialize)]
struct UserMessagePayload {
    role: &'static str,
    content: Vec<UserContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum UserContentBlock {
    Text { text: String },
}

#[derive(Debug, Serialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
enum ControlRequestBody {
    Initialize {},
    Interrupt,
    SetModel {
        model: Option<String>,
    },
    SetPermissionMode {
        mode: String,
    },
    McpStatus,
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

#[derive(Debug, Serialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
enum ControlResponsePayload {
    Success { request_id: String, response: Value },
}

/// Input echoed back in the approval response (the CLI requires it)
struct PendingApproval {
    input: Value,
    tool_use_id: Option<String>,
}

// ---------------------------------------------------------------------------
// ClaudeAdapter
// ---------------------------------------------------------------------------

pub struct ClaudeAdapter {
    stdin_tx: mpsc::Sender<String>,
    child: Arc<Mutex<Child>>,
    child_pid: Option<u32>,
    event_rx: Option<mpsc::Receiver<BackendEvent>>,
    pending_approvals: Arc<Mutex<HashMap<String, PendingApproval>>>,
}

impl ClaudeAdapter {
    /// Spawn a new `claude` CLI subprocess per the launch spec.
    pub async fn launch(spec: &LaunchSpec) -> Result<Self, AdapterError> {
        let claude_bin =
            std::env::var("COMPANION_CLAUDE_BIN").unwrap_or_else(|_| "claude".to_string());

        let mut args = vec![
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--input-format".to_string(),
            "stream-json".to_string(),
            "--permission-prompt-tool".to_string(),
            "stdio".to_string(),
            "--include-partial-messages".to_string(),
        ];
        if let Some(m) = &spec.model {
            args.push("--model".to_string());
            args.push(m.clone());
        }
        if let Some(mode) = &spec.permission_mode {
            args.push("--permission-mode".to_string());
            args.push(mode.clone());
        }
        if let Some(sid) = &spec.resume {
            args.push("--resume".to_string());
            args.push(sid.clone());
            if spec.fork {
                args.push("--fork-session".to_string());
            }
        }
        if !spec.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(spec.allowed_tools.join(","));
        }

        info!(
            component = "claude_adapter",
            event = "claude.spawn",
            cwd = %spec.cwd,
            claude_bin = %claude_bin,
            resume = ?spec.resume,
            containerized = !spec.wrapper.is_empty(),
            "Spawning Claude CLI"
        );

        let mut command = if spec.wrapper.is_empty() {
            let mut c = tokio::process::Command::new(&claude_bin);
            c.current_dir(&spec.cwd).envs(&spec.env);
            c
        } else {
            let mut c = tokio::process::Command::new(&spec.wrapper[0]);
            c.args(&spec.wrapper[1..]).arg(&claude_bin);
            c
        };
        let mut child = command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("CLAUDE_CODE_ENTRYPOINT", "companion")
            .spawn()
            .map_err(|e| AdapterError::Spawn(format!("Failed to spawn claude CLI: {e}")))?;

        let child_pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AdapterError::Spawn("No stdin on child".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AdapterError::Spawn("No stdout on child".into()))?;

        let (event_tx, event_rx) = mpsc::channel::<BackendEvent>(256);
        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(256);
        let pending_approvals: Arc<Mutex<HashMap<String, PendingApproval>>> =
            Arc::new(Mutex::new(HashMap::new()));

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let reader = BufReader::new(stderr);
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(
                        component = "claude_adapter",
                        event = "claude.stderr",
                        line = %line,
                        "Claude CLI stderr"
                    );
                }
            });
        }

        tokio::spawn(stdin_writer(stdin, stdin_rx));

        let approvals_clone = pending_approvals.clone();
        tokio::spawn(read_loop(stdout, event_tx, approvals_clone));

        let adapter = Self {
            stdin_tx,
            child: Arc::new(Mutex::new(child)),
            child_pid,
            event_rx: Some(event_rx),
            pending_approvals,
        };

        adapter
            .write_stdin(&StdinMessage::ControlRequest {
                request_id: companion_protocol::new_id(),
                request: ControlRequestBody::Initialize {},
            })
            .await?;

        Ok(adapter)
    }

    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<BackendEvent>> {
        self.event_rx.take()
    }

    pub fn child_pid(&self) -> Option<u32> {
        self.child_pid
    }

    /// Serialize one bridge command into the CLI's stdin dialect.
    pub async fn send(&self, command: BackendCommand) -> Result<(), AdapterError> {
        let msg = match command {
            BackendCommand::UserMessage { content } => StdinMessage::User {
                message: UserMessagePayload {
                    role: "user",
                    content: vec![UserContentBlock::Text { text: content }],
                },
            },
            BackendCommand::PermissionResponse {
                request_id,
                behavior,
                message,
            } => {
                let pending = self.pending_approvals.lock().await.remove(&request_id);
                let response = permission_response_payload(behavior, message, pending.as_ref());
                StdinMessage::ControlResponse {
                    response: ControlResponsePayload::Success {
                        request_id,
                        response,
                    },
                }
            }
            BackendCommand::Interrupt => control(ControlRequestBody::Interrupt),
            BackendCommand::SetModel { model } => {
                control(ControlRequestBody::SetModel { model: Some(model) })
            }
            BackendCommand::SetPermissionMode { mode } => {
                control(ControlRequestBody::SetPermissionMode { mode })
            }
            BackendCommand::McpGetStatus => control(ControlRequestBody::McpStatus),
            BackendCommand::McpToggle {
                server_name,
                enabled,
            } => control(ControlRequestBody::McpToggle {
                server_name,
                enabled,
            }),
            BackendCommand::McpReconnect { server_name } => {
                control(ControlRequestBody::McpReconnect { server_name })
            }
            BackendCommand::McpSetServers { servers } => {
                control(ControlRequestBody::McpSetServers { servers })
            }
        };
        self.write_stdin(&msg).await
    }

    pub async fn shutdown(&self) {
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            debug!(
                component = "claude_adapter",
                event = "claude.shutdown.kill_failed",
                error = %e,
                "Child already gone"
            );
        }
    }

    async fn write_stdin(&self, msg: &StdinMessage) -> Result<(), AdapterError> {
        let json = serde_json::to_string(msg)?;
        self.stdin_tx
            .send(json)
            .await
            .map_err(|_| AdapterError::ChannelClosed)
    }
}

fn control(request: ControlRequestBody) -> StdinMessage {
    StdinMessage::ControlRequest {
        request_id: companion_protocol::new_id(),
        request,
    }
}

/// Build the `can_use_tool` control response body, echoing the stored input.
fn permission_response_payload(
    behavior: PermissionBehavior,
    message: Option<String>,
    pending: Option<&PendingApproval>,
) -> Value {
    match behavior {
        PermissionBehavior::Allow => {
            let mut allow = serde_json::json!({ "behavior": "allow" });
            if let Some(p) = pending {
                allow["updatedInput"] = p.input.clone();
                if let Some(id) = &p.tool_use_id {
                    allow["toolUseID"] = serde_json::json!(id);
                }
            }
            allow
        }
        PermissionBehavior::Deny => {
            let mut deny = serde_json::json!({
                "behavior": "deny",
                "message": message.unwrap_or_else(|| "User denied this operation".into()),
                "interrupt": false,
            });
            if let Some(p) = pending {
                if let Some(id) = &p.tool_use_id {
                    deny["toolUseID"] = serde_json::json!(id);
                }
            }
            deny
        }
    }
}

/// Dedicated stdin writer task. One message = one complete line, written
/// atomically; outbound writes are never interleaved.
async fn stdin_writer(mut stdin: tokio::process::ChildStdin, mut rx: mpsc::Receiver<String>) {
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            error!(
                component = "claude_adapter",
                event = "claude.stdin.write_error",
                error = %e,
                "Failed to write to CLI stdin"
            );
            break;
        }
        if stdin.flush().await.is_err() {
            break;
        }
    }
    debug!(
        component = "claude_adapter",
        event = "claude.stdin.closed",
        "Stdin writer task ended"
    );
}

/// Read stdout line-by-line, parse JSON, normalize to BackendEvents.
async fn read_loop(
    stdout: tokio::process::ChildStdout,
    event_tx: mpsc::Sender<BackendEvent>,
    pending_approvals: Arc<Mutex<HashMap<String, PendingApproval>>>,
) {
    let reader = BufReader::new(stdout);
    let mut lines = reader.lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let raw: Value = match serde_json::from_str(line) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(
                            component = "claude_adapter",
                            event = "claude.stdout.parse_error",
                            error = %e,
                            line_preview = %truncate_line_preview(line, 200),
                            "Failed to parse stdout JSON"
                        );
                        continue;
                    }
                };
                for ev in normalize_line(&raw, &pending_approvals).await {
                    if event_tx.send(ev).await.is_err() {
                        info!(
                            component = "claude_adapter",
                            event = "claude.read_loop.channel_closed",
                            "Event channel closed, stopping reader"
                        );
                        return;
                    }
                }
            }
            Ok(None) => {
                info!(
                    component = "claude_adapter",
                    event = "claude.stdout.eof",
                    "Claude CLI stdout EOF"
                );
                let _ = event_tx
                    .send(BackendEvent::Closed {
                        reason: "cli_exited".into(),
                    })
                    .await;
                return;
            }
            Err(e) => {
                error!(
                    component = "claude_adapter",
                    event = "claude.stdout.read_error",
                    error = %e,
                    "Error reading CLI stdout"
                );
                let _ = event_tx
                    .send(BackendEvent::Closed {
                        reason: format!("read_error: {e}"),
                    })
                    .await;
                return;
            }
        }
    }
}

/// Normalize one parsed stdout line by its `type` field.
async fn normalize_line(
    raw: &Value,
    pending_approvals: &Arc<Mutex<HashMap<String, PendingApproval>>>,
) -> Vec<BackendEvent> {
    let msg_type = raw.get("type").and_then(|v| v.as_str()).unwrap_or("");

    match msg_type {
        "system" => normalize_system(raw),
        "assistant" => vec![BackendEvent::Assistant {
            message: raw.get("message").cloned().unwrap_or(Value::Null),
        }],
        "stream_event" => vec![BackendEvent::StreamEvent {
            event: raw.get("event").cloned().unwrap_or(Value::Null),
        }],
        "result" => vec![BackendEvent::TurnResult { data: raw.clone() }],
        "control_request" => normalize_control_request(raw, pending_approvals).await,
        "control_cancel_request" => {
            let Some(req_id) = raw.get("request_id").and_then(|v| v.as_str()) else {
                return vec![];
            };
            pending_approvals.lock().await.remove(req_id);
            vec![BackendEvent::PermissionCancelled {
                request_id: req_id.to_string(),
            }]
        }
        "tool_progress" => {
            let Some(tool_use_id) = raw.get("tool_use_id").and_then(|v| v.as_str()) else {
                return vec![];
            };
            vec![BackendEvent::ToolProgress {
                tool_use_id: tool_use_id.to_string(),
                tool_name: raw
                    .get("tool_name")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                elapsed_ms: raw.get("elapsed_time_ms").and_then(|v| v.as_u64()),
            }]
        }
        "tool_use_summary" => {
            let Some(tool_use_id) = raw.get("tool_use_id").and_then(|v| v.as_str()) else {
                return vec![];
            };
            vec![BackendEvent::ToolUseSummary {
                tool_use_id: tool_use_id.to_string(),
                summary: raw
                    .get("summary")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            }]
        }
        "auth_status" => vec![BackendEvent::AuthStatus {
            authenticated: raw
                .get("authenticated")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            detail: raw.get("detail").and_then(|v| v.as_str()).map(String::from),
        }],
        "keep_alive" | "control_response" => vec![],
        "user" => {
            // Tool results echo back as user messages; surface as system events
            // so the bridge can clear tool-progress timers.
            vec![BackendEvent::SystemEvent { data: raw.clone() }]
        }
        _ => {
            debug!(
                component = "claude_adapter",
                event = "claude.stdout.unknown_type",
                msg_type = %msg_type,
                "Unknown stdout message type"
            );
            vec![]
        }
    }
}

fn normalize_system(raw: &Value) -> Vec<BackendEvent> {
    let subtype = raw.get("subtype").and_then(|v| v.as_str()).unwrap_or("");
    match subtype {
        "init" => vec![BackendEvent::SessionInit {
            backend_session_id: raw
                .get("session_id")
                .and_then(|v| v.as_str())
                .map(String::from),
            model: raw.get("model").and_then(|v| v.as_str()).map(String::from),
            permission_mode: raw
                .get("permissionMode")
                .and_then(|v| v.as_str())
                .map(String::from),
            cwd: raw.get("cwd").and_then(|v| v.as_str()).map(String::from),
            tools: raw.get("tools").cloned(),
        }],
        "status" => vec![BackendEvent::StatusChange {
            status: raw
                .get("status")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string(),
        }],
        _ => vec![BackendEvent::SystemEvent { data: raw.clone() }],
    }
}

/// `can_use_tool` control requests become permission requests; the original
/// input is stashed so the eventual response can echo it.
async fn normalize_control_request(
    raw: &Value,
    pending_approvals: &Arc<Mutex<HashMap<String, PendingApproval>>>,
) -> Vec<BackendEvent> {
    let Some(request_id) = raw.get("request_id").and_then(|v| v.as_str()) else {
        return vec![];
    };
    let request = raw.get("request").cloned().unwrap_or(Value::Null);
    let subtype = request.get("subtype").and_then(|v| v.as_str()).unwrap_or("");
    if subtype != "can_use_tool" {
        return vec![BackendEvent::SystemEvent { data: raw.clone() }];
    }

    let tool_name = request
        .get("tool_name")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    let input = request.get("input").cloned().unwrap_or(Value::Null);
    let tool_use_id = request
        .get("tool_use_id")
        .and_then(|v| v.as_str())
        .map(String::from);

    pending_approvals.lock().await.insert(
        request_id.to_string(),
        PendingApproval {
            input: input.clone(),
            tool_use_id: tool_use_id.clone(),
        },
    );

    vec![BackendEvent::PermissionRequest(PermissionRequest {
        request_id: request_id.to_string(),
        tool_name: tool_name.clone(),
        tool_use_id,
        command: flat_input_str(&input, "command"),
        file_path: flat_input_str(&input, "file_path").or_else(|| flat_input_str(&input, "filePath")),
        permission_mode: request
            .get("permission_mode")
            .and_then(|v| v.as_str())
            .map(String::from),
        request_hash: None,
        input,
    })]
}

fn flat_input_str(input: &Value, key: &str) -> Option<String> {
    input.get(key).and_then(|v| v.as_str()).map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approvals() -> Arc<Mutex<HashMap<String, PendingApproval>>> {
        Arc::new(Mutex::new(HashMap::new()))
    }

    #[tokio::test]
    async fn init_line_normalizes_to_session_init() {
        let raw = serde_json::json!({
            "type": "system",
            "subtype": "init",
            "session_id": "sdk-1",
            "model": "claude-sonnet-4-5",
            "cwd": "/workspace",
        });
        let events = normalize_line(&raw, &approvals()).await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            BackendEvent::SessionInit {
                backend_session_id,
                model,
                cwd,
                ..
            } => {
                assert_eq!(backend_session_id.as_deref(), Some("sdk-1"));
                assert_eq!(model.as_deref(), Some("claude-sonnet-4-5"));
                assert_eq!(cwd.as_deref(), Some("/workspace"));
            }
            other => panic!("expected SessionInit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn can_use_tool_stashes_input_and_flattens_command() {
        let store = approvals();
        let raw = serde_json::json!({
            "type": "control_request",
            "request_id": "req-9",
            "request": {
                "subtype": "can_use_tool",
                "tool_name": "Bash",
                "tool_use_id": "tu-1",
                "input": {"command": "ls -la"},
            },
        });
        let events = normalize_line(&raw, &store).await;
        match &events[0] {
            BackendEvent::PermissionRequest(req) => {
                assert_eq!(req.request_id, "req-9");
                assert_eq!(req.tool_name, "Bash");
                assert_eq!(req.command.as_deref(), Some("ls -la"));
            }
            other => panic!("expected PermissionRequest, got {other:?}"),
        }
        assert!(store.lock().await.contains_key("req-9"));
    }

    #[tokio::test]
    async fn cancel_removes_pending_and_emits_cancelled() {
        let store = approvals();
        store.lock().await.insert(
            "req-3".into(),
            PendingApproval {
                input: Value::Null,
                tool_use_id: None,
            },
        );
        let raw = serde_json::json!({
            "type": "control_cancel_request",
            "request_id": "req-3",
        });
        let events = normalize_line(&raw, &store).await;
        assert!(matches!(
            &events[0],
            BackendEvent::PermissionCancelled { request_id } if request_id == "req-3"
        ));
        assert!(!store.lock().await.contains_key("req-3"));
    }

    #[test]
    fn allow_response_echoes_stored_input() {
        let pending = PendingApproval {
            input: serde_json::json!({"command": "pwd"}),
            tool_use_id: Some("tu-7".into()),
        };
        let payload =
            permission_response_payload(PermissionBehavior::Allow, None, Some(&pending));
        assert_eq!(payload["behavior"], "allow");
        assert_eq!(payload["updatedInput"]["command"], "pwd");
        assert_eq!(payload["toolUseID"], "tu-7");
    }

    #[test]
    fn deny_response_carries_message() {
        let payload =
            permission_response_payload(PermissionBehavior::Deny, Some("nope".into()), None);
        assert_eq!(payload["behavior"], "deny");
        assert_eq!(payload["message"], "nope");
        assert_eq!(payload["interrupt"], false);
    }
}
