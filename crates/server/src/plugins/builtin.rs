//! Built-in plugins shipped with the daemon.

use std::sync::Arc;

use serde_json::Value;

use companion_protocol::{
    Insight, InsightChannel, InsightLevel, PermissionBehavior, PermissionDecision, ServerEvent,
};

use super::{
    BusEvent, Capability, FailPolicy, MessageMutation, PluginDef, PluginFuture, PluginHandler,
    PluginOutput, RiskLevel,
};

/// The full built-in registry, in registration order.
pub fn registry() -> Vec<PluginDef> {
    vec![
        permission_automation(),
        notifications(),
        message_prefix(),
    ]
}

// ---------------------------------------------------------------------------
// permission-automation
// ---------------------------------------------------------------------------

/// Auto-decides permission requests from a configured rule list.
fn permission_automation() -> PluginDef {
    PluginDef {
        id: "permission-automation",
        name: "Permission automation",
        version: "1.0.0",
        events: &["permission_request"],
        priority: 100,
        blocking: true,
        timeout_ms: 500,
        fail_policy: FailPolicy::Continue,
        default_enabled: true,
        default_config: serde_json::json!({ "rules": [] }),
        config_validator: Some(validate_rules),
        capabilities: &[Capability::PermissionAutoDecide],
        risk: RiskLevel::High,
        handler: Arc::new(PermissionAutomation),
    }
}

fn validate_rules(config: &Value) -> Result<(), String> {
    let rules = config
        .get("rules")
        .and_then(|r| r.as_array())
        .ok_or("config must carry a rules array")?;
    for rule in rules {
        let tool = rule.get("tool_name").and_then(|t| t.as_str());
        let action = rule.get("action").and_then(|a| a.as_str());
        if tool.is_none() {
            return Err("rule missing tool_name".into());
        }
        match action {
            Some("allow") | Some("deny") => {}
            _ => return Err("rule action must be allow or deny".into()),
        }
    }
    Ok(())
}

struct PermissionAutomation;

impl PluginHandler for PermissionAutomation {
    fn on_event(&self, event: Arc<BusEvent>, config: Value) -> PluginFuture {
        Box::pin(async move {
            let BusEvent::Backend(envelope) = event.as_ref() else {
                return Ok(PluginOutput::default());
            };
            let ServerEvent::PermissionRequest { request } = &envelope.event else {
                return Ok(PluginOutput::default());
            };

            let rules = config
                .get("rules")
                .and_then(|r| r.as_array())
                .cloned()
                .unwrap_or_default();
            let matched = rules.iter().find(|rule| {
                rule.get("tool_name").and_then(|t| t.as_str()) == Some(request.tool_name.as_str())
            });

            let Some(rule) = matched else {
                return Ok(PluginOutput::default());
            };
            let behavior = match rule.get("action").and_then(|a| a.as_str()) {
                Some("allow") => PermissionBehavior::Allow,
                _ => PermissionBehavior::Deny,
            };

            Ok(PluginOutput {
                permission_decision: Some(PermissionDecision {
                    behavior,
                    message: Some(format!(
                        "auto-decided by rule for {}",
                        request.tool_name
                    )),
                }),
                ..Default::default()
            })
        })
    }
}

// ---------------------------------------------------------------------------
// notifications
// ---------------------------------------------------------------------------

/// Surfaces toast notifications on turn completion and permission prompts.
fn notifications() -> PluginDef {
    PluginDef {
        id: "notifications",
        name: "Notifications",
        version: "1.0.0",
        events: &["result", "permission_request"],
        priority: 50,
        blocking: false,
        timeout_ms: 1_000,
        fail_policy: FailPolicy::Continue,
        default_enabled: true,
        default_config: serde_json::json!({ "sound": false }),
        config_validator: None,
        capabilities: &[
            Capability::InsightToast,
            Capability::InsightSound,
            Capability::InsightDesktop,
        ],
        risk: RiskLevel::Low,
        handler: Arc::new(Notifications),
    }
}

struct Notifications;

impl PluginHandler for Notifications {
    fn on_event(&self, event: Arc<BusEvent>, config: Value) -> PluginFuture {
        Box::pin(async move {
            let BusEvent::Backend(envelope) = event.as_ref() else {
                return Ok(PluginOutput::default());
            };
            let mut insights = Vec::new();
            match &envelope.event {
                ServerEvent::TurnResult { .. } => {
                    insights.push(Insight {
                        plugin_id: "notifications".into(),
                        level: InsightLevel::Info,
                        title: "Turn complete".into(),
                        body: None,
                        channel: Some(InsightChannel::Toast),
                    });
                    if config.get("sound").and_then(|s| s.as_bool()).unwrap_or(false) {
                        insights.push(Insight {
                            plugin_id: "notifications".into(),
                            level: InsightLevel::Info,
                            title: "Turn complete".into(),
                            body: None,
                            channel: Some(InsightChannel::Sound),
                        });
                    }
                }
                ServerEvent::PermissionRequest { request } => {
                    insights.push(Insight {
                        plugin_id: "notifications".into(),
                        level: InsightLevel::Info,
                        title: format!("Permission needed: {}", request.tool_name),
                        body: request.command.clone(),
                        channel: Some(InsightChannel::Toast),
                    });
                }
                _ => {}
            }
            Ok(PluginOutput {
                insights,
                ..Default::default()
            })
        })
    }
}

// ---------------------------------------------------------------------------
// message-prefix
// ---------------------------------------------------------------------------

/// Prepends a configured tag to outgoing user messages. Disabled by default.
fn message_prefix() -> PluginDef {
    PluginDef {
        id: "message-prefix",
        name: "Message prefix",
        version: "1.0.0",
        events: &["user.message.before_send"],
        priority: 10,
        blocking: true,
        timeout_ms: super::DEFAULT_TIMEOUT_MS,
        fail_policy: FailPolicy::Continue,
        default_enabled: false,
        default_config: serde_json::json!({ "tag": "" }),
        config_validator: Some(|config| {
            config
                .get("tag")
                .and_then(|t| t.as_str())
                .map(|_| ())
                .ok_or_else(|| "tag must be a string".into())
        }),
        capabilities: &[Capability::MessageMutate],
        risk: RiskLevel::Medium,
        handler: Arc::new(MessagePrefix),
    }
}

struct MessagePrefix;

impl PluginHandler for MessagePrefix {
    fn on_event(&self, event: Arc<BusEvent>, config: Value) -> PluginFuture {
        Box::pin(async move {
            if !matches!(event.as_ref(), BusEvent::UserMessageBeforeSend { .. }) {
                return Ok(PluginOutput::default());
            }
            let tag = config
                .get("tag")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string();
            if tag.is_empty() {
                return Ok(PluginOutput::default());
            }
            Ok(PluginOutput {
                message_mutation: Some(MessageMutation(Box::new(move |content| {
                    format!("[{tag}] {content}")
                }))),
                ..Default::default()
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use companion_protocol::{Envelope, EventSource, PermissionRequest};

    fn permission_event(tool: &str) -> Arc<BusEvent> {
        Arc::new(BusEvent::Backend(Envelope::new(
            EventSource::BackendAdapter,
            Some("s1".into()),
            ServerEvent::PermissionRequest {
                request: PermissionRequest {
                    request_id: "r1".into(),
                    tool_name: tool.into(),
                    tool_use_id: None,
                    input: Value::Null,
                    command: None,
                    file_path: None,
                    permission_mode: None,
                    request_hash: None,
                },
            },
        )))
    }

    #[tokio::test]
    async fn automation_allows_matching_tool() {
        let config = serde_json::json!({
            "rules": [{"tool_name": "Read", "action": "allow"}]
        });
        let output = PermissionAutomation
            .on_event(permission_event("Read"), config)
            .await
            .unwrap();
        assert_eq!(
            output.permission_decision.unwrap().behavior,
            PermissionBehavior::Allow
        );
    }

    #[tokio::test]
    async fn automation_ignores_unmatched_tool() {
        let config = serde_json::json!({
            "rules": [{"tool_name": "Read", "action": "allow"}]
        });
        let output = PermissionAutomation
            .on_event(permission_event("Bash"), config)
            .await
            .unwrap();
        assert!(output.permission_decision.is_none());
    }

    #[test]
    fn rule_validation_rejects_bad_action() {
        assert!(validate_rules(&serde_json::json!({
            "rules": [{"tool_name": "Read", "action": "maybe"}]
        }))
        .is_err());
        assert!(validate_rules(&serde_json::json!({"rules": []})).is_ok());
        assert!(validate_rules(&serde_json::json!({})).is_err());
    }

    #[tokio::test]
    async fn prefix_mutation_prepends_tag() {
        let event = Arc::new(BusEvent::UserMessageBeforeSend {
            session_id: "s1".into(),
            content: "hello".into(),
        });
        let output = MessagePrefix
            .on_event(event, serde_json::json!({"tag": "wip"}))
            .await
            .unwrap();
        let mutated = output.message_mutation.unwrap().apply("hello".into());
        assert_eq!(mutated, "[wip] hello");
    }

    #[tokio::test]
    async fn empty_tag_produces_no_mutation() {
        let event = Arc::new(BusEvent::UserMessageBeforeSend {
            session_id: "s1".into(),
            content: "hello".into(),
        });
        let output = MessagePrefix
            .on_event(event, serde_json::json!({"tag": ""}))
            .await
            .unwrap();
        assert!(output.message_mutation.is_none());
    }
}
