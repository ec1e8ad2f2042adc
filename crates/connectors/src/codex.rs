//! Codex adapter
//!
//! Spawns the `codex` CLI in app-server mode and speaks newline-delimited
//! JSON over a WebSocket to its local port. The connect phase retries with
//! backoff until a bounded deadline; lines queued before the socket opens
//! are flushed once it does. A post-open error is fatal for the adapter.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use companion_protocol::{PermissionBehavior, PermissionRequest, SessionStats};

use crate::{truncate_line_preview, AdapterError, BackendCommand, BackendEvent, LaunchSpec};

/// Total budget for the connect phase before the adapter fails.
const CONNECT_DEADLINE: Duration = Duration::from_secs(15);
/// First retry delay; doubles up to the cap below.
const CONNECT_BACKOFF_INITIAL: Duration = Duration::from_millis(200);
const CONNECT_BACKOFF_MAX: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct CodexAdapter {
    outbound_tx: mpsc::Sender<String>,
    child: Arc<Mutex<Child>>,
    child_pid: Option<u32>,
    event_rx: Option<mpsc::Receiver<BackendEvent>>,
}

impl CodexAdapter {
    /// Spawn the codex app server and connect to its WebSocket endpoint.
    pub async fn launch(spec: &LaunchSpec) -> Result<Self, AdapterError> {
        let codex_bin =
            std::env::var("COMPANION_CODEX_BIN").unwrap_or_else(|_| "codex".to_string());
        let port = spec
            .app_server_port
            .ok_or_else(|| AdapterError::Spawn("codex launch requires an app-server port".into()))?;

        let mut args = vec![
            "app-server".to_string(),
            "--port".to_string(),
            port.to_string(),
        ];
        if let Some(m) = &spec.model {
            args.push("--model".to_string());
            args.push(m.clone());
        }
        if let Some(sid) = &spec.resume {
            args.push("--resume".to_string());
            args.push(sid.clone());
        }

        info!(
            component = "codex_adapter",
            event = "codex.spawn",
            cwd = %spec.cwd,
            codex_bin = %codex_bin,
            port = port,
            containerized = !spec.wrapper.is_empty(),
            "Spawning Codex app server"
        );

        let mut command = if spec.wrapper.is_empty() {
            let mut c = tokio::process::Command::new(&codex_bin);
            c.current_dir(&spec.cwd).envs(&spec.env);
            c
        } else {
            let mut c = tokio::process::Command::new(&spec.wrapper[0]);
            c.args(&spec.wrapper[1..]).arg(&codex_bin);
            c
        };
        let mut child = command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AdapterError::Spawn(format!("Failed to spawn codex CLI: {e}")))?;

        let child_pid = child.id();
        spawn_child_log_readers(&mut child);

        let connect_port = spec.app_server_connect_port.unwrap_or(port);
        let url = format!("ws://127.0.0.1:{connect_port}/ws");
        let ws = match connect_with_backoff(&url).await {
            Ok(ws) => ws,
            Err(e) => {
                let _ = child.kill().await;
                return Err(e);
            }
        };

        let (event_tx, event_rx) = mpsc::channel::<BackendEvent>(256);
        let (outbound_tx, outbound_rx) = mpsc::channel::<String>(256);

        tokio::spawn(socket_loop(ws, outbound_rx, event_tx));

        Ok(Self {
            outbound_tx,
            child: Arc::new(Mutex::new(child)),
            child_pid,
            event_rx: Some(event_rx),
        })
    }

    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<BackendEvent>> {
        self.event_rx.take()
    }

    pub fn child_pid(&self) -> Option<u32> {
        self.child_pid
    }

    /// Serialize one bridge command as one JSONL line over the socket.
    pub async fn send(&self, command: BackendCommand) -> Result<(), AdapterError> {
        let payload = serialize_command(command)?;
        self.outbound_tx
            .send(payload)
            .await
            .map_err(|_| AdapterError::ChannelClosed)
    }

    pub async fn shutdown(&self) {
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            debug!(
                component = "codex_adapter",
                event = "codex.shutdown.kill_failed",
                error = %e,
                "Child already gone"
            );
        }
    }
}

fn spawn_child_log_readers(child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(
                    component = "codex_adapter",
                    event = "codex.stdout",
                    line = %line,
                    "Codex app server stdout"
                );
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(
                    component = "codex_adapter",
                    event = "codex.stderr",
                    line = %line,
                    "Codex app server stderr"
                );
            }
        });
    }
}

/// Retry the WS connect with doubling backoff until `CONNECT_DEADLINE`.
async fn connect_with_backoff(url: &str) -> Result<WsStream, AdapterError> {
    let deadline = Instant::now() + CONNECT_DEADLINE;
    let mut backoff = CONNECT_BACKOFF_INITIAL;
    let mut last_error = String::new();

    loop {
        match connect_async(url).await {
            Ok((ws, _)) => {
                info!(
                    component = "codex_adapter",
                    event = "codex.ws.connected",
                    url = %url,
                    "Connected to Codex app server"
                );
                return Ok(ws);
            }
            Err(e) => {
                last_error = e.to_string();
                if Instant::now() + backoff >= deadline {
                    return Err(AdapterError::ConnectTimeout(format!(
                        "{url} not reachable within {}s: {last_error}",
                        CONNECT_DEADLINE.as_secs()
                    )));
                }
                debug!(
                    component = "codex_adapter",
                    event = "codex.ws.retry",
                    url = %url,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %last_error,
                    "Connect failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(CONNECT_BACKOFF_MAX);
            }
        }
    }
}

/// Single task owning the socket: drains outbound lines and normalizes
/// inbound frames. Any socket error after open is fatal.
async fn socket_loop(
    ws: WsStream,
    mut outbound_rx: mpsc::Receiver<String>,
    event_tx: mpsc::Sender<BackendEvent>,
) {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            maybe_line = outbound_rx.recv() => {
                let Some(line) = maybe_line else { break };
                if let Err(e) = sink.send(WsMessage::Text(line.into())).await {
                    error!(
                        component = "codex_adapter",
                        event = "codex.ws.send_error",
                        error = %e,
                        "WebSocket send failed"
                    );
                    let _ = event_tx
                        .send(BackendEvent::Closed { reason: format!("ws_send_error: {e}") })
                        .await;
                    return;
                }
            }
            maybe_frame = stream.next() => {
                match maybe_frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        for line in text.lines() {
                            let line = line.trim();
                            if line.is_empty() {
                                continue;
                            }
                            let raw: Value = match serde_json::from_str(line) {
                                Ok(v) => v,
                                Err(e) => {
                                    warn!(
                                        component = "codex_adapter",
                                        event = "codex.ws.parse_error",
                                        error = %e,
                                        line_preview = %truncate_line_preview(line, 200),
                                        "Failed to parse inbound frame"
                                    );
                                    continue;
                                }
                            };
                            for ev in normalize_frame(&raw) {
                                if event_tx.send(ev).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {}
                    Some(Ok(WsMessage::Close(_))) | None => {
                        info!(
                            component = "codex_adapter",
                            event = "codex.ws.closed",
                            "Codex app server closed the socket"
                        );
                        let _ = event_tx
                            .send(BackendEvent::Closed { reason: "ws_closed".into() })
                            .await;
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(
                            component = "codex_adapter",
                            event = "codex.ws.read_error",
                            error = %e,
                            "WebSocket read failed"
                        );
                        let _ = event_tx
                            .send(BackendEvent::Closed { reason: format!("ws_read_error: {e}") })
                            .await;
                        return;
                    }
                }
            }
        }
    }
}

fn serialize_command(command: BackendCommand) -> Result<String, AdapterError> {
    let value = match command {
        BackendCommand::UserMessage { content } => serde_json::json!({
            "op": "user_input",
            "items": [{"type": "text", "text": content}],
        }),
        BackendCommand::PermissionResponse {
            request_id,
            behavior,
            message,
        } => serde_json::json!({
            "op": "approval_decision",
            "request_id": request_id,
            "decision": match behavior {
                PermissionBehavior::Allow => "approved",
                PermissionBehavior::Deny => "denied",
            },
            "message": message,
        }),
        BackendCommand::Interrupt => serde_json::json!({"op": "interrupt"}),
        BackendCommand::SetModel { model } => {
            serde_json::json!({"op": "set_model", "model": model})
        }
        BackendCommand::SetPermissionMode { mode } => {
            serde_json::json!({"op": "set_approval_policy", "policy": mode})
        }
        BackendCommand::McpGetStatus => serde_json::json!({"op": "mcp_status"}),
        BackendCommand::McpToggle {
            server_name,
            enabled,
        } => serde_json::json!({"op": "mcp_toggle", "server": server_name, "enabled": enabled}),
        BackendCommand::McpReconnect { server_name } => {
            serde_json::json!({"op": "mcp_reconnect", "server": server_name})
        }
        BackendCommand::McpSetServers { servers } => {
            serde_json::json!({"op": "mcp_set_servers", "servers": servers})
        }
    };
    Ok(serde_json::to_string(&value)?)
}

/// Normalize one inbound app-server frame by its `type` field.
fn normalize_frame(raw: &Value) -> Vec<BackendEvent> {
    let msg_type = raw.get("type").and_then(|v| v.as_str()).unwrap_or("");

    match msg_type {
        "thread_started" | "session_configured" => vec![BackendEvent::SessionInit {
            backend_session_id: raw
                .get("thread_id")
                .or_else(|| raw.get("session_id"))
                .and_then(|v| v.as_str())
                .map(String::from),
            model: raw.get("model").and_then(|v| v.as_str()).map(String::from),
            permission_mode: raw
                .get("approval_policy")
                .and_then(|v| v.as_str())
                .map(String::from),
            cwd: raw.get("cwd").and_then(|v| v.as_str()).map(String::from),
            tools: None,
        }],
        "agent_message" => vec![BackendEvent::Assistant {
            message: raw.clone(),
        }],
        "agent_message_delta" => vec![BackendEvent::StreamEvent { event: raw.clone() }],
        "turn_complete" | "turn_aborted" => vec![BackendEvent::TurnResult { data: raw.clone() }],
        "token_count" => vec![BackendEvent::SessionUpdate {
            model: None,
            permission_mode: None,
            cwd: None,
            git_branch: None,
            git_ahead: None,
            git_behind: None,
            stats: Some(stats_from_token_count(raw)),
        }],
        "exec_approval_request" | "apply_patch_approval_request" => {
            let Some(request_id) = raw.get("request_id").and_then(|v| v.as_str()) else {
                return vec![];
            };
            let command = raw
                .get("command")
                .and_then(|v| v.as_array())
                .map(|argv| {
                    argv.iter()
                        .filter_map(|a| a.as_str())
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .or_else(|| {
                    raw.get("command")
                        .and_then(|v| v.as_str())
                        .map(String::from)
                });
            vec![BackendEvent::PermissionRequest(PermissionRequest {
                request_id: request_id.to_string(),
                tool_name: if msg_type == "exec_approval_request" {
                    "exec".to_string()
                } else {
                    "apply_patch".to_string()
                },
                tool_use_id: raw.get("call_id").and_then(|v| v.as_str()).map(String::from),
                command,
                file_path: raw.get("path").and_then(|v| v.as_str()).map(String::from),
                permission_mode: None,
                request_hash: None,
                input: raw.clone(),
            })]
        }
        "approval_cancelled" => {
            let Some(request_id) = raw.get("request_id").and_then(|v| v.as_str()) else {
                return vec![];
            };
            vec![BackendEvent::PermissionCancelled {
                request_id: request_id.to_string(),
            }]
        }
        "exec_command_output_delta" => {
            let Some(call_id) = raw.get("call_id").and_then(|v| v.as_str()) else {
                return vec![];
            };
            vec![BackendEvent::ToolProgress {
                tool_use_id: call_id.to_string(),
                tool_name: Some("exec".to_string()),
                elapsed_ms: None,
            }]
        }
        "error" => vec![BackendEvent::Error {
            message: raw
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown backend error")
                .to_string(),
        }],
        "status" => vec![BackendEvent::StatusChange {
            status: raw
                .get("status")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string(),
        }],
        "auth_status" => vec![BackendEvent::AuthStatus {
            authenticated: raw
                .get("authenticated")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            detail: raw.get("detail").and_then(|v| v.as_str()).map(String::from),
        }],
        _ => vec![BackendEvent::SystemEvent { data: raw.clone() }],
    }
}

fn stats_from_token_count(raw: &Value) -> SessionStats {
    let context_window = raw
        .get("context_window")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0);
    let used = raw.get("total_tokens").and_then(|v| v.as_f64()).unwrap_or(0.0);
    SessionStats {
        context_used_percent: if context_window > 0.0 {
            (used / context_window) * 100.0
        } else {
            0.0
        },
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_approval_flattens_argv_command() {
        let raw = serde_json::json!({
            "type": "exec_approval_request",
            "request_id": "r1",
            "call_id": "c1",
            "command": ["cargo", "test"],
        });
        let events = normalize_frame(&raw);
        match &events[0] {
            BackendEvent::PermissionRequest(req) => {
                assert_eq!(req.request_id, "r1");
                assert_eq!(req.tool_name, "exec");
                assert_eq!(req.command.as_deref(), Some("cargo test"));
            }
            other => panic!("expected PermissionRequest, got {other:?}"),
        }
    }

    #[test]
    fn token_count_becomes_context_percent() {
        let raw = serde_json::json!({
            "type": "token_count",
            "total_tokens": 50_000,
            "context_window": 200_000,
        });
        let events = normalize_frame(&raw);
        match &events[0] {
            BackendEvent::SessionUpdate { stats: Some(s), .. } => {
                assert!((s.context_used_percent - 25.0).abs() < f64::EPSILON);
            }
            other => panic!("expected SessionUpdate, got {other:?}"),
        }
    }

    #[test]
    fn unknown_frames_become_system_events() {
        let raw = serde_json::json!({"type": "novel_thing", "x": 1});
        let events = normalize_frame(&raw);
        assert!(matches!(&events[0], BackendEvent::SystemEvent { .. }));
    }

    #[test]
    fn user_message_serializes_to_user_input_op() {
        let line = serialize_command(BackendCommand::UserMessage {
            content: "hello".into(),
        })
        .unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["op"], "user_input");
        assert_eq!(value["items"][0]["text"], "hello");
    }
}
