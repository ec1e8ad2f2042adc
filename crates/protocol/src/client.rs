//! Browser → Server commands

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::PermissionBehavior;

/// Typed frames a browser sends over the per-session WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrowserCommand {
    SessionSubscribe {
        last_seq: u64,
    },
    SessionAck {
        last_seq: u64,
    },
    UserMessage {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_msg_id: Option<String>,
    },
    PermissionResponse {
        request_id: String,
        behavior: PermissionBehavior,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_msg_id: Option<String>,
    },
    Interrupt {
        #[serde(skip_serializing_if = "Option::is_none")]
        client_msg_id: Option<String>,
    },
    SetModel {
        model: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_msg_id: Option<String>,
    },
    SetPermissionMode {
        mode: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_msg_id: Option<String>,
    },
    McpGetStatus {
        #[serde(skip_serializing_if = "Option::is_none")]
        client_msg_id: Option<String>,
    },
    McpToggle {
        server_name: String,
        enabled: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_msg_id: Option<String>,
    },
    McpReconnect {
        server_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_msg_id: Option<String>,
    },
    McpSetServers {
        servers: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_msg_id: Option<String>,
    },
}

impl BrowserCommand {
    /// Subscribe/ack frames are connection bookkeeping, not outbound commands.
    pub fn is_outbound(&self) -> bool {
        !matches!(
            self,
            BrowserCommand::SessionSubscribe { .. } | BrowserCommand::SessionAck { .. }
        )
    }

    pub fn client_msg_id(&self) -> Option<&str> {
        match self {
            BrowserCommand::SessionSubscribe { .. } | BrowserCommand::SessionAck { .. } => None,
            BrowserCommand::UserMessage { client_msg_id, .. }
            | BrowserCommand::PermissionResponse { client_msg_id, .. }
            | BrowserCommand::Interrupt { client_msg_id }
            | BrowserCommand::SetModel { client_msg_id, .. }
            | BrowserCommand::SetPermissionMode { client_msg_id, .. }
            | BrowserCommand::McpGetStatus { client_msg_id }
            | BrowserCommand::McpToggle { client_msg_id, .. }
            | BrowserCommand::McpReconnect { client_msg_id, .. }
            | BrowserCommand::McpSetServers { client_msg_id, .. } => client_msg_id.as_deref(),
        }
    }

    /// Stamp a client_msg_id if the frame is an outbound command without one.
    pub fn ensure_client_msg_id(&mut self) {
        match self {
            BrowserCommand::SessionSubscribe { .. } | BrowserCommand::SessionAck { .. } => {}
            BrowserCommand::UserMessage { client_msg_id, .. }
            | BrowserCommand::PermissionResponse { client_msg_id, .. }
            | BrowserCommand::Interrupt { client_msg_id }
            | BrowserCommand::SetModel { client_msg_id, .. }
            | BrowserCommand::SetPermissionMode { client_msg_id, .. }
            | BrowserCommand::McpGetStatus { client_msg_id }
            | BrowserCommand::McpToggle { client_msg_id, .. }
            | BrowserCommand::McpReconnect { client_msg_id, .. }
            | BrowserCommand::McpSetServers { client_msg_id, .. } => {
                if client_msg_id.is_none() {
                    *client_msg_id = Some(crate::new_id());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_parses_from_wire_shape() {
        let cmd: BrowserCommand =
            serde_json::from_str(r#"{"type":"session_subscribe","last_seq":42}"#).unwrap();
        assert!(matches!(
            cmd,
            BrowserCommand::SessionSubscribe { last_seq: 42 }
        ));
        assert!(!cmd.is_outbound());
    }

    #[test]
    fn ensure_client_msg_id_stamps_only_when_absent() {
        let mut cmd: BrowserCommand =
            serde_json::from_str(r#"{"type":"interrupt"}"#).unwrap();
        assert!(cmd.client_msg_id().is_none());
        cmd.ensure_client_msg_id();
        assert!(cmd.client_msg_id().is_some());

        let mut cmd: BrowserCommand = serde_json::from_str(
            r#"{"type":"user_message","content":"hi","client_msg_id":"k1"}"#,
        )
        .unwrap();
        cmd.ensure_client_msg_id();
        assert_eq!(cmd.client_msg_id(), Some("k1"));
    }

    #[test]
    fn ack_never_gets_a_client_msg_id() {
        let mut cmd: BrowserCommand =
            serde_json::from_str(r#"{"type":"session_ack","last_seq":5}"#).unwrap();
        cmd.ensure_client_msg_id();
        assert!(cmd.client_msg_id().is_none());
    }
}
