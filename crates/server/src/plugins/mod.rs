//! Plugin event bus.
//!
//! The registry is append-only after boot. Every inbound event is offered to
//! all enabled plugins whose subscriptions match (by name or `*`), in
//! priority order, highest first. Blocking plugins are awaited under their
//! timeout and may contribute insights, at most one permission decision
//! (first wins), and message mutations; non-blocking plugins run on the
//! worker pool and can only deliver insights through the on-insight
//! callback. Everything a plugin produces is filtered through its
//! capability grants before it surfaces.

pub mod builtin;

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use companion_protocol::{
    Envelope, Insight, InsightChannel, InsightLevel, PermissionDecision,
};

use crate::persist::{read_json_or_empty, write_json_atomic};

pub const DEFAULT_TIMEOUT_MS: u64 = 3_000;
const DEGRADE_AFTER_CONSECUTIVE_FAILURES: u32 = 3;
const RECOVER_AFTER_CONSECUTIVE_SUCCESSES: u32 = 100;

/// Capabilities a plugin may declare; each needs a runtime grant to surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    #[serde(rename = "insight:toast")]
    InsightToast,
    #[serde(rename = "insight:sound")]
    InsightSound,
    #[serde(rename = "insight:desktop")]
    InsightDesktop,
    #[serde(rename = "permission:auto-decide")]
    PermissionAutoDecide,
    #[serde(rename = "message:mutate")]
    MessageMutate,
}

impl Capability {
    pub fn for_channel(channel: InsightChannel) -> Capability {
        match channel {
            InsightChannel::Toast => Capability::InsightToast,
            InsightChannel::Sound => Capability::InsightSound,
            InsightChannel::Desktop => Capability::InsightDesktop,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailPolicy {
    Continue,
    AbortCurrentAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

/// An event as the bus sees it: a backend envelope, or one of the daemon's
/// own dispatch points.
#[derive(Debug, Clone)]
pub enum BusEvent {
    Backend(Envelope),
    UserMessageBeforeSend {
        session_id: String,
        content: String,
    },
}

impl BusEvent {
    pub fn name(&self) -> &str {
        match self {
            BusEvent::Backend(envelope) => envelope.name(),
            BusEvent::UserMessageBeforeSend { .. } => "user.message.before_send",
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            BusEvent::Backend(envelope) => envelope.meta.session_id.as_deref(),
            BusEvent::UserMessageBeforeSend { session_id, .. } => Some(session_id),
        }
    }
}

/// A user-message transformation produced by a plugin. Composed by the
/// bridge linearly in priority order, lowest first, so the highest-priority
/// plugin's transformation acts on the already-mutated content.
pub struct MessageMutation(pub Box<dyn FnOnce(String) -> String + Send>);

impl std::fmt::Debug for MessageMutation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageMutation")
    }
}

impl MessageMutation {
    pub fn apply(self, content: String) -> String {
        (self.0)(content)
    }
}

/// What one plugin invocation may return
#[derive(Debug, Default)]
pub struct PluginOutput {
    pub insights: Vec<Insight>,
    pub permission_decision: Option<PermissionDecision>,
    pub message_mutation: Option<MessageMutation>,
}

pub type PluginFuture = Pin<Box<dyn Future<Output = Result<PluginOutput, String>> + Send>>;

pub trait PluginHandler: Send + Sync {
    fn on_event(&self, event: Arc<BusEvent>, config: Value) -> PluginFuture;
}

/// Static definition of a plugin, registered at boot.
pub struct PluginDef {
    pub id: &'static str,
    pub name: &'static str,
    pub version: &'static str,
    /// Event names, or `*` for everything
    pub events: &'static [&'static str],
    pub priority: i32,
    pub blocking: bool,
    pub timeout_ms: u64,
    pub fail_policy: FailPolicy,
    pub default_enabled: bool,
    pub default_config: Value,
    pub config_validator: Option<fn(&Value) -> Result<(), String>>,
    pub capabilities: &'static [Capability],
    pub risk: RiskLevel,
    pub handler: Arc<dyn PluginHandler>,
}

impl PluginDef {
    fn matches(&self, event_name: &str) -> bool {
        self.events.iter().any(|e| *e == "*" || *e == event_name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCounters {
    pub successes: u64,
    pub failures: u64,
    pub aborted: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub status: HealthStatus,
    #[serde(skip)]
    consecutive_failures: u32,
    #[serde(skip)]
    consecutive_successes: u32,
}

impl Default for HealthStatus {
    fn default() -> Self {
        HealthStatus::Healthy
    }
}

impl HealthCounters {
    fn record_success(&mut self) {
        self.successes += 1;
        self.consecutive_failures = 0;
        self.consecutive_successes += 1;
        if self.status == HealthStatus::Degraded
            && self.consecutive_successes >= RECOVER_AFTER_CONSECUTIVE_SUCCESSES
        {
            self.status = HealthStatus::Healthy;
        }
    }

    fn record_failure(&mut self, error: String, aborted_chain: bool) {
        self.failures += 1;
        if aborted_chain {
            self.aborted += 1;
        }
        self.last_error = Some(error);
        self.consecutive_successes = 0;
        self.consecutive_failures += 1;
        if self.consecutive_failures >= DEGRADE_AFTER_CONSECUTIVE_FAILURES {
            self.status = HealthStatus::Degraded;
        }
    }
}

/// Mutable per-plugin state
struct PluginRuntime {
    enabled: bool,
    config: Value,
    config_warned: bool,
    grants: HashMap<Capability, bool>,
    health: HealthCounters,
}

/// Persisted shape of `plugins.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PluginStateFile {
    #[serde(default)]
    updated_at: String,
    #[serde(default)]
    enabled: HashMap<String, bool>,
    #[serde(default)]
    config: HashMap<String, Value>,
    #[serde(default)]
    grants: HashMap<String, HashMap<Capability, bool>>,
}

/// Resolved runtime info for introspection
#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub events: Vec<String>,
    pub priority: i32,
    pub blocking: bool,
    pub timeout_ms: u64,
    pub fail_policy: FailPolicy,
    pub risk: RiskLevel,
    pub enabled: bool,
    pub config: Value,
    pub grants: HashMap<Capability, bool>,
    pub health: HealthCounters,
}

/// Outcome of dispatching one event through the bus
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    pub insights: Vec<Insight>,
    pub permission_decision: Option<PermissionDecision>,
    /// (priority, mutation) pairs for the bridge to compose
    pub mutations: Vec<(i32, MessageMutation)>,
    pub aborted: bool,
}

/// Result of a dry run - health counters untouched
#[derive(Debug, Serialize)]
pub struct DryRunResult {
    pub insights: Vec<Insight>,
    pub permission_decision: Option<PermissionDecision>,
    pub mutated_sample: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct PluginBus {
    defs: Vec<PluginDef>,
    state_path: PathBuf,
    runtime: Mutex<HashMap<String, PluginRuntime>>,
}

impl PluginBus {
    /// Build the bus from a fixed plugin registry plus persisted state.
    pub fn new(defs: Vec<PluginDef>, state_path: PathBuf) -> Self {
        let persisted = read_json_or_empty::<PluginStateFile>(&state_path).unwrap_or_default();
        let mut runtime = HashMap::new();
        for def in &defs {
            let enabled = persisted
                .enabled
                .get(def.id)
                .copied()
                .unwrap_or(def.default_enabled);
            let config = persisted
                .config
                .get(def.id)
                .cloned()
                .unwrap_or_else(|| def.default_config.clone());
            let mut grants: HashMap<Capability, bool> =
                def.capabilities.iter().map(|c| (*c, true)).collect();
            if let Some(saved) = persisted.grants.get(def.id) {
                for (cap, granted) in saved {
                    if grants.contains_key(cap) {
                        grants.insert(*cap, *granted);
                    }
                }
            }
            runtime.insert(
                def.id.to_string(),
                PluginRuntime {
                    enabled,
                    config,
                    config_warned: false,
                    grants,
                    health: HealthCounters::default(),
                },
            );
        }
        Self {
            defs,
            state_path,
            runtime: Mutex::new(runtime),
        }
    }

    /// Dispatch an event to every matching enabled plugin.
    ///
    /// `on_insight` receives the (gated) insights of non-blocking plugins as
    /// they complete; blocking plugins' insights come back in the outcome.
    pub async fn dispatch(
        self: &Arc<Self>,
        event: Arc<BusEvent>,
        on_insight: tokio::sync::mpsc::Sender<Insight>,
    ) -> DispatchOutcome {
        let mut matching: Vec<&PluginDef> = self
            .defs
            .iter()
            .filter(|def| def.matches(event.name()) && self.is_enabled(def.id))
            .collect();
        // Stable sort: ties keep registration order
        matching.sort_by_key(|def| std::cmp::Reverse(def.priority));

        let mut outcome = DispatchOutcome::default();

        for def in matching {
            let config = self.effective_config(def);

            if def.blocking {
                let run = def.handler.on_event(event.clone(), config);
                let timeout = Duration::from_millis(def.timeout_ms);
                let result = match tokio::time::timeout(timeout, run).await {
                    Ok(Ok(output)) => Ok(output),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(format!("timed out after {}ms", def.timeout_ms)),
                };

                match result {
                    Ok(output) => {
                        self.record_success(def.id);
                        let gated = self.gate_output(def, output);
                        outcome.insights.extend(gated.insights);
                        if outcome.permission_decision.is_none() {
                            outcome.permission_decision = gated.permission_decision;
                        }
                        if let Some(mutation) = gated.message_mutation {
                            outcome.mutations.push((def.priority, mutation));
                        }
                    }
                    Err(error) => {
                        let aborts = def.fail_policy == FailPolicy::AbortCurrentAction;
                        self.record_failure(def.id, error.clone(), aborts);
                        outcome.insights.push(error_insight(def.id, &error));
                        warn!(
                            component = "plugin_bus",
                            event = "plugin.invocation_failed",
                            plugin_id = %def.id,
                            bus_event = %event.name(),
                            error = %error,
                            aborts_chain = aborts,
                            "Blocking plugin failed"
                        );
                        if aborts {
                            outcome.aborted = true;
                            break;
                        }
                    }
                }
            } else {
                // Fire-and-forget: insights flow through the callback; never
                // decisions or mutations.
                let bus = self.clone();
                let plugin_id = def.id.to_string();
                let run = def.handler.on_event(event.clone(), config);
                let timeout = Duration::from_millis(def.timeout_ms);
                let tx = on_insight.clone();
                let event_name = event.name().to_string();
                tokio::spawn(async move {
                    let result = match tokio::time::timeout(timeout, run).await {
                        Ok(Ok(output)) => Ok(output),
                        Ok(Err(e)) => Err(e),
                        Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
                    };
                    match result {
                        Ok(output) => {
                            bus.record_success(&plugin_id);
                            let gated = bus.gate_output_by_id(&plugin_id, output);
                            for insight in gated.insights {
                                let _ = tx.send(insight).await;
                            }
                        }
                        Err(error) => {
                            bus.record_failure(&plugin_id, error.clone(), false);
                            debug!(
                                component = "plugin_bus",
                                event = "plugin.async_invocation_failed",
                                plugin_id = %plugin_id,
                                bus_event = %event_name,
                                error = %error,
                                "Non-blocking plugin failed"
                            );
                            let _ = tx.send(error_insight(&plugin_id, &error)).await;
                        }
                    }
                });
            }
        }

        outcome
    }

    /// Filter one plugin's output through its capability grants.
    fn gate_output(&self, def: &PluginDef, output: PluginOutput) -> PluginOutput {
        self.gate_output_by_id(def.id, output)
    }

    fn gate_output_by_id(&self, plugin_id: &str, output: PluginOutput) -> PluginOutput {
        let guard = self.runtime.lock().expect("plugin lock poisoned");
        let Some(rt) = guard.get(plugin_id) else {
            return PluginOutput::default();
        };
        let granted = |cap: Capability| rt.grants.get(&cap).copied().unwrap_or(false);

        let mut gated = PluginOutput::default();

        for insight in output.insights {
            match insight.channel {
                Some(channel) if !granted(Capability::for_channel(channel)) => {
                    gated.insights.push(capability_blocked_insight(
                        plugin_id,
                        &format!("insight:{}", channel_name(channel)),
                    ));
                }
                _ => gated.insights.push(insight),
            }
        }

        if let Some(decision) = output.permission_decision {
            if granted(Capability::PermissionAutoDecide) {
                gated.permission_decision = Some(decision);
            } else {
                gated
                    .insights
                    .push(capability_blocked_insight(plugin_id, "permission:auto-decide"));
            }
        }

        if let Some(mutation) = output.message_mutation {
            if granted(Capability::MessageMutate) {
                gated.message_mutation = Some(mutation);
            } else {
                gated
                    .insights
                    .push(capability_blocked_insight(plugin_id, "message:mutate"));
            }
        }

        gated
    }

    fn is_enabled(&self, id: &str) -> bool {
        self.runtime
            .lock()
            .expect("plugin lock poisoned")
            .get(id)
            .map(|rt| rt.enabled)
            .unwrap_or(false)
    }

    /// Resolve a plugin's effective config, falling back to the default (and
    /// persisting it) when the stored value fails validation.
    fn effective_config(&self, def: &PluginDef) -> Value {
        let mut guard = self.runtime.lock().expect("plugin lock poisoned");
        let Some(rt) = guard.get_mut(def.id) else {
            return def.default_config.clone();
        };
        if let Some(validate) = def.config_validator {
            if let Err(reason) = validate(&rt.config) {
                if !rt.config_warned {
                    rt.config_warned = true;
                    warn!(
                        component = "plugin_bus",
                        event = "plugin.config_invalid",
                        plugin_id = %def.id,
                        reason = %reason,
                        "Persisted config invalid, falling back to default"
                    );
                }
                rt.config = def.default_config.clone();
                drop(guard);
                self.persist_state();
                return def.default_config.clone();
            }
        }
        rt.config.clone()
    }

    fn record_success(&self, id: &str) {
        let mut guard = self.runtime.lock().expect("plugin lock poisoned");
        if let Some(rt) = guard.get_mut(id) {
            rt.health.record_success();
        }
    }

    fn record_failure(&self, id: &str, error: String, aborted_chain: bool) {
        let mut guard = self.runtime.lock().expect("plugin lock poisoned");
        if let Some(rt) = guard.get_mut(id) {
            rt.health.record_failure(error, aborted_chain);
        }
    }

    // -- Runtime mutation ---------------------------------------------------

    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        let changed = {
            let mut guard = self.runtime.lock().expect("plugin lock poisoned");
            match guard.get_mut(id) {
                Some(rt) => {
                    rt.enabled = enabled;
                    true
                }
                None => false,
            }
        };
        if changed {
            self.persist_state();
            info!(
                component = "plugin_bus",
                event = "plugin.enabled_changed",
                plugin_id = %id,
                enabled = enabled,
                "Plugin enabled flag changed"
            );
        }
        changed
    }

    pub fn set_config(&self, id: &str, config: Value) -> Result<(), String> {
        let def = self
            .defs
            .iter()
            .find(|d| d.id == id)
            .ok_or_else(|| format!("unknown plugin {id}"))?;
        if let Some(validate) = def.config_validator {
            validate(&config)?;
        }
        {
            let mut guard = self.runtime.lock().expect("plugin lock poisoned");
            if let Some(rt) = guard.get_mut(id) {
                rt.config = config;
                rt.config_warned = false;
            }
        }
        self.persist_state();
        Ok(())
    }

    pub fn set_grant(&self, id: &str, capability: Capability, granted: bool) -> bool {
        let changed = {
            let mut guard = self.runtime.lock().expect("plugin lock poisoned");
            match guard.get_mut(id) {
                Some(rt) if rt.grants.contains_key(&capability) => {
                    rt.grants.insert(capability, granted);
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.persist_state();
        }
        changed
    }

    fn persist_state(&self) {
        let guard = self.runtime.lock().expect("plugin lock poisoned");
        let file = PluginStateFile {
            updated_at: companion_protocol::unix_now_z(),
            enabled: guard.iter().map(|(id, rt)| (id.clone(), rt.enabled)).collect(),
            config: guard
                .iter()
                .map(|(id, rt)| (id.clone(), rt.config.clone()))
                .collect(),
            grants: guard
                .iter()
                .map(|(id, rt)| (id.clone(), rt.grants.clone()))
                .collect(),
        };
        drop(guard);
        if let Err(e) = write_json_atomic(&self.state_path, &file) {
            warn!(
                component = "plugin_bus",
                event = "plugin.state_persist_failed",
                error = %e,
                "Failed to persist plugin state"
            );
        }
    }

    // -- Introspection ------------------------------------------------------

    pub fn list(&self) -> Vec<PluginInfo> {
        let guard = self.runtime.lock().expect("plugin lock poisoned");
        self.defs
            .iter()
            .map(|def| {
                let rt = guard.get(def.id);
                PluginInfo {
                    id: def.id.to_string(),
                    name: def.name.to_string(),
                    version: def.version.to_string(),
                    events: def.events.iter().map(|s| s.to_string()).collect(),
                    priority: def.priority,
                    blocking: def.blocking,
                    timeout_ms: def.timeout_ms,
                    fail_policy: def.fail_policy,
                    risk: def.risk,
                    enabled: rt.map(|r| r.enabled).unwrap_or(false),
                    config: rt.map(|r| r.config.clone()).unwrap_or(Value::Null),
                    grants: rt.map(|r| r.grants.clone()).unwrap_or_default(),
                    health: rt.map(|r| r.health.clone()).unwrap_or_default(),
                }
            })
            .collect()
    }

    /// Execute a single plugin synchronously without touching health
    /// counters. Used for debugging.
    pub async fn dry_run(&self, id: &str, event: Arc<BusEvent>) -> Result<DryRunResult, String> {
        let def = self
            .defs
            .iter()
            .find(|d| d.id == id)
            .ok_or_else(|| format!("unknown plugin {id}"))?;
        let config = {
            let guard = self.runtime.lock().expect("plugin lock poisoned");
            guard
                .get(id)
                .map(|rt| rt.config.clone())
                .unwrap_or_else(|| def.default_config.clone())
        };

        let run = def.handler.on_event(event.clone(), config);
        let result = tokio::time::timeout(Duration::from_millis(def.timeout_ms), run).await;

        match result {
            Ok(Ok(output)) => {
                let gated = self.gate_output(def, output);
                let mutated_sample = gated.message_mutation.map(|m| {
                    let sample = match event.as_ref() {
                        BusEvent::UserMessageBeforeSend { content, .. } => content.clone(),
                        _ => String::from("sample message"),
                    };
                    m.apply(sample)
                });
                Ok(DryRunResult {
                    insights: gated.insights,
                    permission_decision: gated.permission_decision,
                    mutated_sample,
                    error: None,
                })
            }
            Ok(Err(e)) => Ok(DryRunResult {
                insights: vec![],
                permission_decision: None,
                mutated_sample: None,
                error: Some(e),
            }),
            Err(_) => Ok(DryRunResult {
                insights: vec![],
                permission_decision: None,
                mutated_sample: None,
                error: Some(format!("timed out after {}ms", def.timeout_ms)),
            }),
        }
    }
}

fn channel_name(channel: InsightChannel) -> &'static str {
    match channel {
        InsightChannel::Toast => "toast",
        InsightChannel::Sound => "sound",
        InsightChannel::Desktop => "desktop",
    }
}

fn error_insight(plugin_id: &str, error: &str) -> Insight {
    Insight {
        plugin_id: plugin_id.to_string(),
        level: InsightLevel::Error,
        title: format!("Plugin {plugin_id} failed"),
        body: Some(error.to_string()),
        channel: None,
    }
}

fn capability_blocked_insight(plugin_id: &str, capability: &str) -> Insight {
    Insight {
        plugin_id: plugin_id.to_string(),
        level: InsightLevel::Info,
        title: "Capability blocked".to_string(),
        body: Some(format!("{plugin_id} produced output requiring {capability}")),
        channel: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use companion_protocol::PermissionBehavior;

    struct FnHandler<F>(F);

    impl<F> PluginHandler for FnHandler<F>
    where
        F: Fn(Arc<BusEvent>, Value) -> Result<PluginOutput, String> + Send + Sync,
    {
        fn on_event(&self, event: Arc<BusEvent>, config: Value) -> PluginFuture {
            let result = (self.0)(event, config);
            Box::pin(async move { result })
        }
    }

    fn def(
        id: &'static str,
        priority: i32,
        blocking: bool,
        fail_policy: FailPolicy,
        capabilities: &'static [Capability],
        handler: Arc<dyn PluginHandler>,
    ) -> PluginDef {
        PluginDef {
            id,
            name: id,
            version: "1.0.0",
            events: &["*"],
            priority,
            blocking,
            timeout_ms: 200,
            fail_policy,
            default_enabled: true,
            default_config: Value::Null,
            config_validator: None,
            capabilities,
            risk: RiskLevel::Low,
            handler,
        }
    }

    fn bus(defs: Vec<PluginDef>) -> (tempfile::TempDir, Arc<PluginBus>) {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(PluginBus::new(defs, dir.path().join("plugins.json")));
        (dir, bus)
    }

    fn status_event() -> Arc<BusEvent> {
        Arc::new(BusEvent::Backend(Envelope::new(
            companion_protocol::EventSource::WsBridge,
            Some("s1".into()),
            companion_protocol::ServerEvent::StatusChange {
                status: "idle".into(),
            },
        )))
    }

    fn insight_sink() -> tokio::sync::mpsc::Sender<Insight> {
        tokio::sync::mpsc::channel(64).0
    }

    fn allow_decision() -> PluginOutput {
        PluginOutput {
            permission_decision: Some(PermissionDecision {
                behavior: PermissionBehavior::Allow,
                message: None,
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn first_permission_decision_wins() {
        let high = def(
            "high",
            100,
            true,
            FailPolicy::Continue,
            &[Capability::PermissionAutoDecide],
            Arc::new(FnHandler(|_, _| Ok(allow_decision()))),
        );
        let low = def(
            "low",
            10,
            true,
            FailPolicy::Continue,
            &[Capability::PermissionAutoDecide],
            Arc::new(FnHandler(|_, _| {
                Ok(PluginOutput {
                    permission_decision: Some(PermissionDecision {
                        behavior: PermissionBehavior::Deny,
                        message: None,
                    }),
                    ..Default::default()
                })
            })),
        );
        let (_dir, bus) = bus(vec![low, high]);
        let outcome = bus.dispatch(status_event(), insight_sink()).await;
        assert_eq!(
            outcome.permission_decision.unwrap().behavior,
            PermissionBehavior::Allow
        );
    }

    #[tokio::test]
    async fn ungrated_decision_is_suppressed_with_blocked_insight() {
        let plugin = def(
            "auto",
            100,
            true,
            FailPolicy::Continue,
            &[Capability::PermissionAutoDecide],
            Arc::new(FnHandler(|_, _| Ok(allow_decision()))),
        );
        let (_dir, bus) = bus(vec![plugin]);
        bus.set_grant("auto", Capability::PermissionAutoDecide, false);

        let outcome = bus.dispatch(status_event(), insight_sink()).await;
        assert!(outcome.permission_decision.is_none());
        assert!(outcome
            .insights
            .iter()
            .any(|i| i.title == "Capability blocked"));
    }

    #[tokio::test]
    async fn abort_policy_stops_lower_priority_plugins() {
        static RAN_LOW: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);
        let failing = def(
            "failing",
            100,
            true,
            FailPolicy::AbortCurrentAction,
            &[],
            Arc::new(FnHandler(|_, _| Err("boom".to_string()))),
        );
        let low = def(
            "low",
            10,
            true,
            FailPolicy::Continue,
            &[],
            Arc::new(FnHandler(|_, _| {
                RAN_LOW.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(PluginOutput::default())
            })),
        );
        let (_dir, bus) = bus(vec![failing, low]);
        let outcome = bus.dispatch(status_event(), insight_sink()).await;
        assert!(outcome.aborted);
        assert!(!RAN_LOW.load(std::sync::atomic::Ordering::SeqCst));
        assert!(outcome
            .insights
            .iter()
            .any(|i| i.level == InsightLevel::Error));
    }

    #[tokio::test]
    async fn three_consecutive_failures_degrade() {
        let failing = def(
            "flaky",
            50,
            true,
            FailPolicy::Continue,
            &[],
            Arc::new(FnHandler(|_, _| Err("nope".to_string()))),
        );
        let (_dir, bus) = bus(vec![failing]);
        for _ in 0..3 {
            bus.dispatch(status_event(), insight_sink()).await;
        }
        let info = &bus.list()[0];
        assert_eq!(info.health.status, HealthStatus::Degraded);
        assert_eq!(info.health.failures, 3);
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let slow = def(
            "slow",
            50,
            true,
            FailPolicy::Continue,
            &[],
            Arc::new(SlowHandler),
        );
        struct SlowHandler;
        impl PluginHandler for SlowHandler {
            fn on_event(&self, _event: Arc<BusEvent>, _config: Value) -> PluginFuture {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(PluginOutput::default())
                })
            }
        }
        let (_dir, bus) = bus(vec![slow]);
        let outcome = bus.dispatch(status_event(), insight_sink()).await;
        assert!(outcome.insights.iter().any(|i| i
            .body
            .as_deref()
            .map(|b| b.contains("timed out"))
            .unwrap_or(false)));
        assert_eq!(bus.list()[0].health.failures, 1);
    }

    #[tokio::test]
    async fn non_blocking_insights_flow_through_callback_only() {
        let notifier = def(
            "notify",
            50,
            false,
            FailPolicy::Continue,
            &[Capability::InsightToast],
            Arc::new(FnHandler(|_, _| {
                Ok(PluginOutput {
                    insights: vec![Insight {
                        plugin_id: "notify".into(),
                        level: InsightLevel::Info,
                        title: "done".into(),
                        body: None,
                        channel: Some(InsightChannel::Toast),
                    }],
                    permission_decision: Some(PermissionDecision {
                        behavior: PermissionBehavior::Allow,
                        message: None,
                    }),
                    ..Default::default()
                })
            })),
        );
        let (_dir, bus) = bus(vec![notifier]);
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let outcome = bus.dispatch(status_event(), tx).await;
        // Decision from a non-blocking plugin never surfaces
        assert!(outcome.permission_decision.is_none());
        assert!(outcome.insights.is_empty());
        let insight = rx.recv().await.unwrap();
        assert_eq!(insight.title, "done");
    }

    #[tokio::test]
    async fn disabled_plugins_do_not_run() {
        let plugin = def(
            "p",
            50,
            true,
            FailPolicy::Continue,
            &[],
            Arc::new(FnHandler(|_, _| Err("should not run".to_string()))),
        );
        let (_dir, bus) = bus(vec![plugin]);
        bus.set_enabled("p", false);
        let outcome = bus.dispatch(status_event(), insight_sink()).await;
        assert!(outcome.insights.is_empty());
        assert_eq!(bus.list()[0].health.failures, 0);
    }

    #[tokio::test]
    async fn persisted_state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugins.json");
        let make = || {
            vec![def(
                "p",
                50,
                true,
                FailPolicy::Continue,
                &[Capability::MessageMutate],
                Arc::new(FnHandler(|_, _| Ok(PluginOutput::default()))),
            )]
        };
        {
            let bus = PluginBus::new(make(), path.clone());
            bus.set_enabled("p", false);
            bus.set_grant("p", Capability::MessageMutate, false);
        }
        let bus = PluginBus::new(make(), path);
        let info = &bus.list()[0];
        assert!(!info.enabled);
        assert_eq!(info.grants.get(&Capability::MessageMutate), Some(&false));
    }

    #[tokio::test]
    async fn invalid_persisted_config_falls_back_and_persists_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugins.json");
        fn validate(v: &Value) -> Result<(), String> {
            if v.get("tag").and_then(|t| t.as_str()).is_some() {
                Ok(())
            } else {
                Err("tag required".into())
            }
        }
        let make = || {
            vec![PluginDef {
                id: "cfg",
                name: "cfg",
                version: "1.0.0",
                events: &["*"],
                priority: 1,
                blocking: true,
                timeout_ms: 200,
                fail_policy: FailPolicy::Continue,
                default_enabled: true,
                default_config: serde_json::json!({"tag": "default"}),
                config_validator: Some(validate),
                capabilities: &[],
                risk: RiskLevel::Low,
                handler: Arc::new(FnHandler(|_, config: Value| {
                    assert_eq!(config["tag"], "default");
                    Ok(PluginOutput::default())
                })),
            }]
        };
        std::fs::write(
            &path,
            serde_json::json!({
                "updatedAt": "0Z",
                "config": {"cfg": {"bogus": true}},
            })
            .to_string(),
        )
        .unwrap();

        let bus = Arc::new(PluginBus::new(make(), path.clone()));
        bus.dispatch(status_event(), insight_sink()).await;

        let saved: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(saved["config"]["cfg"]["tag"], "default");
    }
}
