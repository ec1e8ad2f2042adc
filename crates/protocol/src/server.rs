//! Server → Browser events
//!
//! Every event delivered to a session subscriber is wrapped in a
//! [`SeqEnvelope`] carrying the per-session monotonic `seq`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::*;

/// Events produced by the bridge and fanned out to browser subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    SessionInit {
        #[serde(skip_serializing_if = "Option::is_none")]
        backend_session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        permission_mode: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tools: Option<Value>,
    },
    SessionUpdate {
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        permission_mode: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        git_branch: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        git_ahead: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        git_behind: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        stats: Option<SessionStats>,
        #[serde(skip_serializing_if = "Option::is_none")]
        containerized: Option<bool>,
    },
    Assistant {
        message: Value,
    },
    StreamEvent {
        event: Value,
    },
    #[serde(rename = "result")]
    TurnResult {
        data: Value,
    },
    PermissionRequest {
        request: PermissionRequest,
    },
    PermissionCancelled {
        request_id: String,
    },
    ToolProgress {
        tool_use_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
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
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    CliDisconnected {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    CliConnected {},
    SessionNameUpdate {
        name: Option<String>,
    },
    PrStatusUpdate {
        data: Value,
    },
    McpStatus {
        servers: Value,
    },
    Insight {
        insight: Insight,
    },
    MessageHistory {
        messages: Vec<HistoryMessage>,
    },
    EventReplay {
        events: Vec<SeqEnvelope>,
    },
}

impl ServerEvent {
    /// The wire tag of this event - the name plugins subscribe to.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::SessionInit { .. } => "session_init",
            ServerEvent::SessionUpdate { .. } => "session_update",
            ServerEvent::Assistant { .. } => "assistant",
            ServerEvent::StreamEvent { .. } => "stream_event",
            ServerEvent::TurnResult { .. } => "result",
            ServerEvent::PermissionRequest { .. } => "permission_request",
            ServerEvent::PermissionCancelled { .. } => "permission_cancelled",
            ServerEvent::ToolProgress { .. } => "tool_progress",
            ServerEvent::ToolUseSummary { .. } => "tool_use_summary",
            ServerEvent::SystemEvent { .. } => "system_event",
            ServerEvent::StatusChange { .. } => "status_change",
            ServerEvent::AuthStatus { .. } => "auth_status",
            ServerEvent::Error { .. } => "error",
            ServerEvent::CliDisconnected { .. } => "cli_disconnected",
            ServerEvent::CliConnected {} => "cli_connected",
            ServerEvent::SessionNameUpdate { .. } => "session_name_update",
            ServerEvent::PrStatusUpdate { .. } => "pr_status_update",
            ServerEvent::McpStatus { .. } => "mcp_status",
            ServerEvent::Insight { .. } => "insight",
            ServerEvent::MessageHistory { .. } => "message_history",
            ServerEvent::EventReplay { .. } => "event_replay",
        }
    }
}

/// An event plus the metadata it travels with
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub meta: EventMeta,
    #[serde(flatten)]
    pub event: ServerEvent,
}

impl Envelope {
    pub fn new(source: EventSource, session_id: Option<String>, event: ServerEvent) -> Self {
        Self {
            meta: EventMeta::new(source, session_id),
            event,
        }
    }

    pub fn name(&self) -> &'static str {
        self.event.name()
    }
}

/// An envelope stamped with its per-session sequence number
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeqEnvelope {
    pub seq: u64,
    #[serde(flatten)]
    pub envelope: Envelope,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventMeta, EventSource};

    #[test]
    fn seq_envelope_flattens_type_tag() {
        let frame = SeqEnvelope {
            seq: 7,
            envelope: Envelope {
                meta: EventMeta::new(EventSource::WsBridge, Some("s1".into())),
                event: ServerEvent::StatusChange {
                    status: "idle".into(),
                },
            },
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["seq"], 7);
        assert_eq!(json["type"], "status_change");
        assert_eq!(json["status"], "idle");
        assert_eq!(json["meta"]["source"], "ws-bridge");
    }

    #[test]
    fn result_event_uses_result_tag() {
        let event = ServerEvent::TurnResult {
            data: serde_json::json!({"num_turns": 3}),
        };
        assert_eq!(event.name(), "result");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "result");
    }

    #[test]
    fn event_names_round_trip_through_serde_tag() {
        let events = vec![
            ServerEvent::CliConnected {},
            ServerEvent::PermissionCancelled {
                request_id: "r1".into(),
            },
            ServerEvent::MessageHistory { messages: vec![] },
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], event.name());
        }
    }
}
