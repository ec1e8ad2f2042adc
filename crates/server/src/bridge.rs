//! Per-session bridge: the central data plane.
//!
//! Each live session owns one bridge task that serializes every state
//! mutation for that session. Backend adapter events, browser commands,
//! subscriber lifecycle, and plugin insights all arrive through one fan-in
//! channel. Fan-out stamps a strictly increasing per-session `seq`, appends
//! to the replay ring, and delivers to every subscribed browser. Lock-free
//! reads go through `ArcSwap` snapshots.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use companion_connectors::{Adapter, BackendCommand, BackendEvent};
use companion_protocol::{
    BackendKind, BrowserCommand, Envelope, EventSource, HistoryMessage, Insight, PermissionBehavior,
    PermissionDecision, PermissionRequest, SeqEnvelope, ServerEvent, SessionStats,
};

use crate::container::CONTAINER_WORKSPACE;
use crate::plugins::{BusEvent, PluginBus};
use crate::store::SessionStore;

/// Replay ring capacity, in envelopes.
const RING_CAPACITY: usize = 600;
/// Retained messages for best-effort history rehydration.
const HISTORY_CAPACITY: usize = 200;
/// Outbound-command idempotence window, in client_msg_ids.
const DEDUP_WINDOW: usize = 256;

/// Messages feeding the bridge loop
pub enum BridgeMsg {
    /// Inbound event pumped from the adapter
    Backend(BackendEvent),
    /// A frame from one browser connection
    Browser {
        conn_id: u64,
        command: BrowserCommand,
    },
    /// A browser socket opened for this session
    SubscriberJoin {
        conn_id: u64,
        tx: mpsc::Sender<String>,
    },
    /// A browser socket closed
    SubscriberLeave { conn_id: u64 },
    /// An event produced by the daemon itself (name update, PR status, ...)
    Publish(ServerEvent),
    /// The pipeline finished staging a container for this session
    SetContainerized { host_cwd: String },
    /// A fresh adapter after relaunch
    AdapterAttached(Box<Adapter>),
    /// Kill the session: close the child, drain, disconnect browsers
    Kill { reply: oneshot::Sender<()> },
}

/// Lock-free view of the bridge for registries and HTTP routes
#[derive(Debug, Clone, Default)]
pub struct BridgeSnapshot {
    pub live: bool,
    pub pid: Option<u32>,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub cwd: Option<String>,
    pub git_branch: Option<String>,
    pub stats: SessionStats,
    pub pending_permissions: usize,
}

/// Handle to a running bridge (cheap to Clone)
#[derive(Clone)]
pub struct BridgeHandle {
    pub session_id: String,
    tx: mpsc::Sender<BridgeMsg>,
    snapshot: Arc<ArcSwap<BridgeSnapshot>>,
}

impl BridgeHandle {
    pub async fn send(&self, msg: BridgeMsg) {
        if self.tx.send(msg).await.is_err() {
            warn!(
                component = "ws_bridge",
                session_id = %self.session_id,
                "Bridge channel closed, message dropped"
            );
        }
    }

    pub fn snapshot(&self) -> Arc<BridgeSnapshot> {
        self.snapshot.load_full()
    }

    /// Spawn a bridge task for a session. `adapter` is `None` for dormant
    /// sessions restored from disk.
    pub fn spawn(
        session_id: String,
        backend: BackendKind,
        host_cwd: String,
        adapter: Option<Adapter>,
        bus: Arc<PluginBus>,
        store: Arc<SessionStore>,
    ) -> BridgeHandle {
        let (tx, inbox) = mpsc::channel::<BridgeMsg>(256);
        let pid = adapter.as_ref().and_then(|a| a.child_pid());
        let snapshot = Arc::new(ArcSwap::from_pointee(BridgeSnapshot {
            live: adapter.is_some(),
            pid,
            ..Default::default()
        }));

        let mut state = BridgeState {
            session_id: session_id.clone(),
            backend,
            host_cwd,
            containerized: false,
            seq: 0,
            ring: VecDeque::with_capacity(RING_CAPACITY),
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            streaming_draft: None,
            pending_permissions: HashMap::new(),
            tool_progress: HashMap::new(),
            seen_msg_ids: DedupWindow::new(DEDUP_WINDOW),
            subscribers: HashMap::new(),
            snapshot: snapshot.clone(),
            cached: BridgeSnapshot {
                live: adapter.is_some(),
                pid,
                ..Default::default()
            },
        };
        state.publish_snapshot();

        let handle = BridgeHandle {
            session_id,
            tx: tx.clone(),
            snapshot,
        };

        tokio::spawn(bridge_loop(state, inbox, tx, adapter, bus, store));

        handle
    }
}

struct Subscriber {
    tx: mpsc::Sender<String>,
    subscribed: bool,
    /// Highest seq delivered to this connection (dedup on outbound)
    last_delivered: u64,
    /// Advisory high-water mark from session_ack
    ack: u64,
}

struct DedupWindow {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl DedupWindow {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Returns true when `id` was already observed inside the window.
    fn check_and_insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return true;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        false
    }
}

struct ToolProgressEntry {
    tool_name: Option<String>,
    started_at: Instant,
}

struct BridgeState {
    session_id: String,
    backend: BackendKind,
    host_cwd: String,
    containerized: bool,
    seq: u64,
    ring: VecDeque<SeqEnvelope>,
    history: VecDeque<HistoryMessage>,
    streaming_draft: Option<String>,
    pending_permissions: HashMap<String, PermissionRequest>,
    tool_progress: HashMap<String, ToolProgressEntry>,
    seen_msg_ids: DedupWindow,
    subscribers: HashMap<u64, Subscriber>,
    snapshot: Arc<ArcSwap<BridgeSnapshot>>,
    cached: BridgeSnapshot,
}

impl BridgeState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn publish_snapshot(&self) {
        self.snapshot.store(Arc::new(self.cached.clone()));
    }

    /// Rewrite a container path back to the host path when containerized.
    fn rewrite_cwd(&self, cwd: String) -> String {
        if !self.containerized {
            return cwd;
        }
        match cwd.strip_prefix(CONTAINER_WORKSPACE) {
            Some("") => self.host_cwd.clone(),
            Some(rest) => format!("{}{}", self.host_cwd, rest),
            None => cwd,
        }
    }

    /// Stamp, append to the ring, and deliver to every up-to-date subscriber.
    fn fan_out(&mut self, envelope: Envelope) {
        let seq = self.next_seq();
        let frame = SeqEnvelope { seq, envelope };
        if self.ring.len() == RING_CAPACITY {
            self.ring.pop_front();
        }
        self.ring.push_back(frame.clone());

        let serialized = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(e) => {
                warn!(
                    component = "ws_bridge",
                    event = "bridge.serialize_failed",
                    session_id = %self.session_id,
                    error = %e,
                    "Failed to serialize envelope"
                );
                return;
            }
        };

        let mut dropped = Vec::new();
        for (conn_id, sub) in self.subscribers.iter_mut() {
            if !sub.subscribed || seq <= sub.last_delivered {
                continue;
            }
            match sub.tx.try_send(serialized.clone()) {
                Ok(()) => sub.last_delivered = seq,
                Err(_) => dropped.push(*conn_id),
            }
        }
        for conn_id in dropped {
            self.subscribers.remove(&conn_id);
            info!(
                component = "ws_bridge",
                event = "bridge.subscriber_dropped",
                session_id = %self.session_id,
                connection_id = conn_id,
                "Subscriber could not keep up, dropped"
            );
        }
    }

    fn fan_out_event(&mut self, source: EventSource, event: ServerEvent) {
        let envelope = Envelope::new(source, Some(self.session_id.clone()), event);
        self.fan_out(envelope);
    }

    fn push_history(&mut self, role: &str, content: Value) {
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(HistoryMessage {
            role: role.to_string(),
            content,
            timestamp: companion_protocol::unix_now_z(),
        });
    }

    /// Handle a `session_subscribe`, replying per the resume protocol.
    fn handle_subscribe(&mut self, conn_id: u64, last_seq: u64) {
        if !self.subscribers.contains_key(&conn_id) {
            return;
        }

        let response = if last_seq == self.seq {
            // Up to date: a single empty replay acknowledges the cursor.
            ServerEvent::EventReplay { events: vec![] }
        } else {
            let ring_contiguous = self
                .ring
                .front()
                .map(|front| last_seq + 1 >= front.seq)
                .unwrap_or(false);
            if last_seq > 0 && ring_contiguous {
                ServerEvent::EventReplay {
                    events: self
                        .ring
                        .iter()
                        .filter(|f| f.seq > last_seq)
                        .cloned()
                        .collect(),
                }
            } else {
                // Cursor predates the ring (or a fresh client): best-effort
                // history rehydration, then live delivery from the ring tail.
                let mut messages: Vec<HistoryMessage> = self.history.iter().cloned().collect();
                if let Some(draft) = &self.streaming_draft {
                    messages.push(HistoryMessage {
                        role: "assistant".into(),
                        content: Value::String(draft.clone()),
                        timestamp: companion_protocol::unix_now_z(),
                    });
                }
                ServerEvent::MessageHistory { messages }
            }
        };

        let session_id = self.session_id.clone();
        let current_seq = self.seq;
        let Some(sub) = self.subscribers.get_mut(&conn_id) else {
            return;
        };
        sub.subscribed = true;
        sub.last_delivered = current_seq;
        send_frame(sub, &session_id, response);
    }
}

/// Serialize a single non-seq frame directly to one subscriber.
fn send_frame(sub: &mut Subscriber, session_id: &str, event: ServerEvent) {
    let envelope = Envelope::new(EventSource::WsBridge, Some(session_id.to_string()), event);
    if let Ok(json) = serde_json::to_string(&envelope) {
        let _ = sub.tx.try_send(json);
    }
}

/// Pump the adapter's event stream into the bridge inbox.
fn spawn_adapter_pump(
    mut event_rx: mpsc::Receiver<BackendEvent>,
    inbox_tx: mpsc::Sender<BridgeMsg>,
) {
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if inbox_tx.send(BridgeMsg::Backend(event)).await.is_err() {
                break;
            }
        }
    });
}

async fn bridge_loop(
    mut state: BridgeState,
    mut inbox: mpsc::Receiver<BridgeMsg>,
    inbox_tx: mpsc::Sender<BridgeMsg>,
    mut adapter: Option<Adapter>,
    bus: Arc<PluginBus>,
    store: Arc<SessionStore>,
) {
    if let Some(adapter) = adapter.as_mut() {
        if let Some(event_rx) = adapter.take_event_rx() {
            spawn_adapter_pump(event_rx, inbox_tx.clone());
        }
    }

    // Insights from non-blocking plugins arrive here as they complete.
    let (insight_tx, mut insight_rx) = mpsc::channel::<Insight>(64);

    loop {
        tokio::select! {
            maybe_msg = inbox.recv() => {
                let Some(msg) = maybe_msg else { break };
                match msg {
                    BridgeMsg::Backend(event) => {
                        handle_backend_event(&mut state, &mut adapter, &bus, &store, &insight_tx, event).await;
                    }
                    BridgeMsg::Browser { conn_id, command } => {
                        handle_browser_command(&mut state, &mut adapter, &bus, &insight_tx, conn_id, command).await;
                    }
                    BridgeMsg::SubscriberJoin { conn_id, tx } => {
                        state.subscribers.insert(conn_id, Subscriber {
                            tx,
                            subscribed: false,
                            last_delivered: 0,
                            ack: 0,
                        });
                    }
                    BridgeMsg::SubscriberLeave { conn_id } => {
                        if let Some(sub) = state.subscribers.remove(&conn_id) {
                            debug!(
                                component = "ws_bridge",
                                event = "bridge.subscriber_left",
                                session_id = %state.session_id,
                                connection_id = conn_id,
                                acked_seq = sub.ack,
                                "Subscriber left"
                            );
                        }
                    }
                    BridgeMsg::Publish(event) => {
                        state.fan_out_event(EventSource::Routes, event);
                    }
                    BridgeMsg::SetContainerized { host_cwd } => {
                        state.containerized = true;
                        state.host_cwd = host_cwd;
                    }
                    BridgeMsg::AdapterAttached(new_adapter) => {
                        let mut new_adapter = *new_adapter;
                        if let Some(event_rx) = new_adapter.take_event_rx() {
                            spawn_adapter_pump(event_rx, inbox_tx.clone());
                        }
                        state.cached.pid = new_adapter.child_pid();
                        adapter = Some(new_adapter);
                        state.cached.live = true;
                        state.publish_snapshot();
                        state.fan_out_event(EventSource::WsBridge, ServerEvent::CliConnected {});
                    }
                    BridgeMsg::Kill { reply } => {
                        kill_session(&mut state, &mut adapter).await;
                        let _ = reply.send(());
                        break;
                    }
                }
            }
            Some(insight) = insight_rx.recv() => {
                state.fan_out_event(EventSource::PluginBus, ServerEvent::Insight { insight });
            }
            else => break,
        }
    }

    info!(
        component = "ws_bridge",
        event = "bridge.loop_ended",
        session_id = %state.session_id,
        backend = %state.backend.as_str(),
        "Bridge loop ended"
    );
}

/// Cancellation order: close the child, resolve pending permissions toward
/// the backend, close subscriber sockets.
async fn kill_session(state: &mut BridgeState, adapter: &mut Option<Adapter>) {
    if let Some(adapter) = adapter.as_ref() {
        for request_id in state.pending_permissions.keys() {
            let _ = adapter
                .send(BackendCommand::PermissionResponse {
                    request_id: request_id.clone(),
                    behavior: PermissionBehavior::Deny,
                    message: Some("session cancelled".into()),
                })
                .await;
        }
        adapter.shutdown().await;
    }
    state.pending_permissions.clear();
    state.subscribers.clear();
    state.cached.live = false;
    state.publish_snapshot();
}

async fn handle_backend_event(
    state: &mut BridgeState,
    adapter: &mut Option<Adapter>,
    bus: &Arc<PluginBus>,
    store: &Arc<SessionStore>,
    insight_tx: &mpsc::Sender<Insight>,
    event: BackendEvent,
) {
    let server_event = match event {
        BackendEvent::SessionInit {
            backend_session_id,
            model,
            permission_mode,
            cwd,
            tools,
        } => {
            let cwd = cwd.map(|c| state.rewrite_cwd(c));
            state.cached.model = model.clone().or(state.cached.model.take());
            state.cached.permission_mode =
                permission_mode.clone().or(state.cached.permission_mode.take());
            state.cached.cwd = cwd.clone().or(state.cached.cwd.take());
            state.publish_snapshot();
            store.update(&state.session_id, |r| {
                r.model = state.cached.model.clone();
                r.permission_mode = state.cached.permission_mode.clone();
                r.current_cwd = state.cached.cwd.clone();
            });
            ServerEvent::SessionInit {
                backend_session_id,
                model,
                permission_mode,
                cwd,
                tools,
            }
        }
        BackendEvent::SessionUpdate {
            model,
            permission_mode,
            cwd,
            git_branch,
            git_ahead,
            git_behind,
            stats,
        } => {
            let cwd = cwd.map(|c| state.rewrite_cwd(c));
            if let Some(m) = &model {
                state.cached.model = Some(m.clone());
            }
            if let Some(p) = &permission_mode {
                state.cached.permission_mode = Some(p.clone());
            }
            if let Some(c) = &cwd {
                state.cached.cwd = Some(c.clone());
            }
            if let Some(b) = &git_branch {
                state.cached.git_branch = Some(b.clone());
            }
            if let Some(s) = &stats {
                state.cached.stats = s.clone();
            }
            state.publish_snapshot();
            store.update(&state.session_id, |r| {
                if let Some(m) = &model {
                    r.model = Some(m.clone());
                }
                if let Some(p) = &permission_mode {
                    r.permission_mode = Some(p.clone());
                }
                if let Some(c) = &cwd {
                    r.current_cwd = Some(c.clone());
                }
                if let Some(b) = &git_branch {
                    r.git_branch = Some(b.clone());
                }
                if git_ahead.is_some() {
                    r.git_ahead = git_ahead;
                }
                if git_behind.is_some() {
                    r.git_behind = git_behind;
                }
                if let Some(s) = &stats {
                    r.stats = s.clone();
                }
            });
            ServerEvent::SessionUpdate {
                model,
                permission_mode,
                cwd,
                git_branch,
                git_ahead,
                git_behind,
                stats,
                containerized: Some(state.containerized),
            }
        }
        BackendEvent::Assistant { message } => {
            state.push_history("assistant", message.clone());
            ServerEvent::Assistant { message }
        }
        BackendEvent::StreamEvent { event } => {
            if let Some(delta) = extract_text_delta(&event) {
                state
                    .streaming_draft
                    .get_or_insert_with(String::new)
                    .push_str(&delta);
            }
            ServerEvent::StreamEvent { event }
        }
        BackendEvent::TurnResult { data } => {
            // Turn boundary: streaming state and per-turn maps reset here;
            // this is the only place bulk-clearing tool timers is allowed.
            state.streaming_draft = None;
            state.tool_progress.clear();
            state.push_history("result", data.clone());
            ServerEvent::TurnResult { data }
        }
        BackendEvent::PermissionRequest(request) => {
            state
                .pending_permissions
                .insert(request.request_id.clone(), request.clone());
            state.cached.pending_permissions = state.pending_permissions.len();
            state.publish_snapshot();
            ServerEvent::PermissionRequest { request }
        }
        BackendEvent::PermissionCancelled { request_id } => {
            state.pending_permissions.remove(&request_id);
            state.cached.pending_permissions = state.pending_permissions.len();
            state.publish_snapshot();
            ServerEvent::PermissionCancelled { request_id }
        }
        BackendEvent::ToolProgress {
            tool_use_id,
            tool_name,
            elapsed_ms,
        } => {
            let entry = state
                .tool_progress
                .entry(tool_use_id.clone())
                .or_insert_with(|| ToolProgressEntry {
                    tool_name: tool_name.clone(),
                    started_at: Instant::now(),
                });
            let elapsed =
                elapsed_ms.unwrap_or_else(|| entry.started_at.elapsed().as_millis() as u64);
            ServerEvent::ToolProgress {
                tool_use_id,
                tool_name: entry.tool_name.clone(),
                elapsed_ms: Some(elapsed),
            }
        }
        BackendEvent::ToolUseSummary {
            tool_use_id,
            summary,
        } => ServerEvent::ToolUseSummary {
            tool_use_id,
            summary,
        },
        BackendEvent::SystemEvent { data } => {
            // tool_result blocks clear the matching progress timer
            for id in tool_result_ids(&data) {
                state.tool_progress.remove(&id);
            }
            ServerEvent::SystemEvent { data }
        }
        BackendEvent::StatusChange { status } => ServerEvent::StatusChange { status },
        BackendEvent::AuthStatus {
            authenticated,
            detail,
        } => ServerEvent::AuthStatus {
            authenticated,
            detail,
        },
        BackendEvent::Error { message } => ServerEvent::Error {
            message,
            code: None,
        },
        BackendEvent::Closed { reason } => {
            state.cached.live = false;
            state.cached.pid = None;
            state.publish_snapshot();
            ServerEvent::CliDisconnected {
                reason: Some(reason),
            }
        }
    };

    let is_permission_request = matches!(server_event, ServerEvent::PermissionRequest { .. });
    let envelope = Envelope::new(
        EventSource::BackendAdapter,
        Some(state.session_id.clone()),
        server_event,
    );

    let outcome = bus
        .dispatch(
            Arc::new(BusEvent::Backend(envelope.clone())),
            insight_tx.clone(),
        )
        .await;

    // A plugin decision resolves the permission request immediately; exactly
    // one decision reaches the backend.
    if is_permission_request {
        if let Some(decision) = &outcome.permission_decision {
            if let ServerEvent::PermissionRequest { request } = &envelope.event {
                if state.pending_permissions.remove(&request.request_id).is_some() {
                    state.cached.pending_permissions = state.pending_permissions.len();
                    state.publish_snapshot();
                    deliver_decision(adapter, &request.request_id, decision.clone()).await;
                }
            }
        }
    }

    state.fan_out(envelope);

    for insight in outcome.insights {
        state.fan_out_event(EventSource::PluginBus, ServerEvent::Insight { insight });
    }
}

async fn deliver_decision(
    adapter: &mut Option<Adapter>,
    request_id: &str,
    decision: PermissionDecision,
) {
    let Some(adapter) = adapter.as_ref() else {
        return;
    };
    if let Err(e) = adapter
        .send(BackendCommand::PermissionResponse {
            request_id: request_id.to_string(),
            behavior: decision.behavior,
            message: decision.message,
        })
        .await
    {
        warn!(
            component = "ws_bridge",
            event = "bridge.decision_send_failed",
            request_id = %request_id,
            error = %e,
            "Failed to deliver permission decision"
        );
    }
}

async fn handle_browser_command(
    state: &mut BridgeState,
    adapter: &mut Option<Adapter>,
    bus: &Arc<PluginBus>,
    insight_tx: &mpsc::Sender<Insight>,
    conn_id: u64,
    command: BrowserCommand,
) {
    match command {
        BrowserCommand::SessionSubscribe { last_seq } => {
            state.handle_subscribe(conn_id, last_seq);
            return;
        }
        BrowserCommand::SessionAck { last_seq } => {
            if let Some(sub) = state.subscribers.get_mut(&conn_id) {
                // Acks are advisory and monotone
                sub.ack = sub.ack.max(last_seq);
            }
            return;
        }
        _ => {}
    }

    // Outbound-command idempotence window
    if let Some(id) = command.client_msg_id() {
        if state.seen_msg_ids.check_and_insert(id) {
            debug!(
                component = "ws_bridge",
                event = "bridge.duplicate_command",
                session_id = %state.session_id,
                client_msg_id = %id,
                "Duplicate outbound command discarded"
            );
            return;
        }
    }

    let backend_command = match command {
        BrowserCommand::UserMessage { content, .. } => {
            let final_content = run_mutation_chain(state, bus, insight_tx, content).await;
            state.push_history("user", Value::String(final_content.clone()));
            Some(BackendCommand::UserMessage {
                content: final_content,
            })
        }
        BrowserCommand::PermissionResponse {
            request_id,
            behavior,
            message,
            ..
        } => {
            // Only a still-pending request may be resolved; anything else
            // (already auto-decided or cancelled) is dropped silently.
            if state.pending_permissions.remove(&request_id).is_some() {
                state.cached.pending_permissions = state.pending_permissions.len();
                state.publish_snapshot();
                Some(BackendCommand::PermissionResponse {
                    request_id,
                    behavior,
                    message,
                })
            } else {
                None
            }
        }
        BrowserCommand::Interrupt { .. } => Some(BackendCommand::Interrupt),
        BrowserCommand::SetModel { model, .. } => Some(BackendCommand::SetModel { model }),
        BrowserCommand::SetPermissionMode { mode, .. } => {
            Some(BackendCommand::SetPermissionMode { mode })
        }
        BrowserCommand::McpGetStatus { .. } => Some(BackendCommand::McpGetStatus),
        BrowserCommand::McpToggle {
            server_name,
            enabled,
            ..
        } => Some(BackendCommand::McpToggle {
            server_name,
            enabled,
        }),
        BrowserCommand::McpReconnect { server_name, .. } => {
            Some(BackendCommand::McpReconnect { server_name })
        }
        BrowserCommand::McpSetServers { servers, .. } => {
            Some(BackendCommand::McpSetServers { servers })
        }
        BrowserCommand::SessionSubscribe { .. } | BrowserCommand::SessionAck { .. } => None,
    };

    let Some(backend_command) = backend_command else {
        return;
    };

    match adapter.as_ref() {
        Some(adapter) => {
            if let Err(e) = adapter.send(backend_command).await {
                state.fan_out_event(
                    EventSource::WsBridge,
                    ServerEvent::Error {
                        message: format!("backend write failed: {e}"),
                        code: Some("backend_write_failed".into()),
                    },
                );
            }
        }
        None => {
            state.fan_out_event(
                EventSource::WsBridge,
                ServerEvent::Error {
                    message: "backend is not running; relaunch the session".into(),
                    code: Some("cli_disconnected".into()),
                },
            );
        }
    }
}

/// Dispatch `user.message.before_send` and compose the returned mutations.
///
/// Dispatch runs highest-priority first (bus invariant); composition applies
/// lowest-priority first so the highest-priority plugin's transformation
/// acts on the already-mutated content.
async fn run_mutation_chain(
    state: &mut BridgeState,
    bus: &Arc<PluginBus>,
    insight_tx: &mpsc::Sender<Insight>,
    content: String,
) -> String {
    let event = Arc::new(BusEvent::UserMessageBeforeSend {
        session_id: state.session_id.clone(),
        content: content.clone(),
    });
    let outcome = bus.dispatch(event, insight_tx.clone()).await;

    for insight in outcome.insights {
        state.fan_out_event(EventSource::PluginBus, ServerEvent::Insight { insight });
    }

    let mut mutations = outcome.mutations;
    mutations.sort_by_key(|(priority, _)| *priority);
    mutations
        .into_iter()
        .fold(content, |acc, (_, mutation)| mutation.apply(acc))
}

/// Extract the text delta from a streaming event, if it carries one.
fn extract_text_delta(event: &Value) -> Option<String> {
    let delta = event.get("delta")?;
    delta
        .get("text")
        .and_then(|t| t.as_str())
        .map(String::from)
}

/// tool_use ids referenced by tool_result blocks in a message payload.
fn tool_result_ids(data: &Value) -> Vec<String> {
    let Some(blocks) = data
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_array())
    else {
        return vec![];
    };
    blocks
        .iter()
        .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("tool_result"))
        .filter_map(|b| {
            b.get("tool_use_id")
                .and_then(|id| id.as_str())
                .map(String::from)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::builtin;
    use crate::plugins::{Capability, FailPolicy, PluginDef, PluginOutput, RiskLevel};

    fn test_store() -> (tempfile::TempDir, Arc<SessionStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::load(dir.path().join("sessions.json")));
        (dir, store)
    }

    fn test_bus(defs: Vec<PluginDef>) -> (tempfile::TempDir, Arc<PluginBus>) {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(PluginBus::new(defs, dir.path().join("plugins.json")));
        (dir, bus)
    }

    fn spawn_bridge(defs: Vec<PluginDef>) -> (Vec<tempfile::TempDir>, BridgeHandle, Arc<PluginBus>) {
        let (d1, store) = test_store();
        let (d2, bus) = test_bus(defs);
        store.insert(companion_protocol::SessionRecord::new(
            "s1".into(),
            BackendKind::Claude,
            "/tmp/p".into(),
        ));
        let handle = BridgeHandle::spawn(
            "s1".into(),
            BackendKind::Claude,
            "/tmp/p".into(),
            None,
            bus.clone(),
            store,
        );
        (vec![d1, d2], handle, bus)
    }

    async fn subscribe(handle: &BridgeHandle, conn_id: u64, last_seq: u64) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(1024);
        handle
            .send(BridgeMsg::SubscriberJoin { conn_id, tx })
            .await;
        handle
            .send(BridgeMsg::Browser {
                conn_id,
                command: BrowserCommand::SessionSubscribe { last_seq },
            })
            .await;
        rx
    }

    async fn recv_json(rx: &mut mpsc::Receiver<String>) -> Value {
        let frame = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("subscriber channel closed");
        serde_json::from_str(&frame).unwrap()
    }

    fn status_event(status: &str) -> BridgeMsg {
        BridgeMsg::Backend(BackendEvent::StatusChange {
            status: status.into(),
        })
    }

    #[tokio::test]
    async fn seq_is_contiguous_and_monotonic() {
        let (_dirs, handle, _bus) = spawn_bridge(vec![]);
        let mut rx = subscribe(&handle, 1, 0).await;

        // A fresh client already at the current seq gets an empty replay
        let first = recv_json(&mut rx).await;
        assert_eq!(first["type"], "event_replay");
        assert_eq!(first["events"].as_array().unwrap().len(), 0);

        for i in 0..5 {
            handle.send(status_event(&format!("s{i}"))).await;
        }
        for expected in 1..=5u64 {
            let frame = recv_json(&mut rx).await;
            assert_eq!(frame["seq"], expected);
            assert_eq!(frame["type"], "status_change");
        }
    }

    #[tokio::test]
    async fn subscribe_at_current_seq_yields_empty_replay() {
        let (_dirs, handle, _bus) = spawn_bridge(vec![]);
        let mut warmup = subscribe(&handle, 1, 0).await;
        recv_json(&mut warmup).await; // history
        for i in 0..3 {
            handle.send(status_event(&format!("s{i}"))).await;
        }
        for _ in 0..3 {
            recv_json(&mut warmup).await;
        }

        let mut rx = subscribe(&handle, 2, 3).await;
        let frame = recv_json(&mut rx).await;
        assert_eq!(frame["type"], "event_replay");
        assert_eq!(frame["events"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn reconnect_with_gap_replays_contiguous_tail() {
        let (_dirs, handle, _bus) = spawn_bridge(vec![]);
        let mut warmup = subscribe(&handle, 1, 0).await;
        recv_json(&mut warmup).await;
        for i in 0..10 {
            handle.send(status_event(&format!("s{i}"))).await;
        }
        for _ in 0..10 {
            recv_json(&mut warmup).await;
        }

        // Reconnect claiming we saw up to seq 4
        let mut rx = subscribe(&handle, 2, 4).await;
        let frame = recv_json(&mut rx).await;
        assert_eq!(frame["type"], "event_replay");
        let events = frame["events"].as_array().unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e["seq"].as_u64().unwrap()).collect();
        assert_eq!(seqs, vec![5, 6, 7, 8, 9, 10]);

        // Live delivery continues past the replay
        handle.send(status_event("after")).await;
        let live = recv_json(&mut rx).await;
        assert_eq!(live["seq"], 11);
    }

    #[tokio::test]
    async fn cursor_older_than_ring_gets_history() {
        let (_dirs, handle, _bus) = spawn_bridge(vec![]);
        let mut warmup = subscribe(&handle, 1, 0).await;
        recv_json(&mut warmup).await;
        // Overflow the ring so seq 1 is evicted
        for i in 0..(RING_CAPACITY + 10) {
            handle.send(status_event(&format!("s{i}"))).await;
        }
        for _ in 0..(RING_CAPACITY + 10) {
            recv_json(&mut warmup).await;
        }

        let mut rx = subscribe(&handle, 2, 1).await;
        let frame = recv_json(&mut rx).await;
        assert_eq!(frame["type"], "message_history");

        // Subsequent live envelopes carry seq beyond the stale cursor
        handle.send(status_event("live")).await;
        let live = recv_json(&mut rx).await;
        assert!(live["seq"].as_u64().unwrap() > 1);
    }

    #[tokio::test]
    async fn duplicate_client_msg_id_is_discarded() {
        let (_dirs, handle, _bus) = spawn_bridge(vec![]);
        let mut rx = subscribe(&handle, 1, 0).await;
        recv_json(&mut rx).await;

        // No adapter: each forwarded command fans out a cli_disconnected
        // error. A duplicate must produce exactly one.
        for _ in 0..2 {
            handle
                .send(BridgeMsg::Browser {
                    conn_id: 1,
                    command: BrowserCommand::Interrupt {
                        client_msg_id: Some("k1".into()),
                    },
                })
                .await;
        }
        let first = recv_json(&mut rx).await;
        assert_eq!(first["type"], "error");
        assert_eq!(first["seq"], 1);

        handle.send(status_event("probe")).await;
        let next = recv_json(&mut rx).await;
        // seq 2 would have been the duplicate's error if it weren't dropped
        assert_eq!(next["type"], "status_change");
        assert_eq!(next["seq"], 2);
    }

    #[tokio::test]
    async fn mutation_chain_composes_in_priority_order() {
        struct Tagger {
            prefix: bool,
            text: &'static str,
        }
        impl crate::plugins::PluginHandler for Tagger {
            fn on_event(
                &self,
                event: Arc<BusEvent>,
                _config: Value,
            ) -> crate::plugins::PluginFuture {
                let prefix = self.prefix;
                let text = self.text;
                Box::pin(async move {
                    if !matches!(event.as_ref(), BusEvent::UserMessageBeforeSend { .. }) {
                        return Ok(PluginOutput::default());
                    }
                    Ok(PluginOutput {
                        message_mutation: Some(crate::plugins::MessageMutation(Box::new(
                            move |content| {
                                if prefix {
                                    format!("{text}{content}")
                                } else {
                                    format!("{content}{text}")
                                }
                            },
                        ))),
                        ..Default::default()
                    })
                })
            }
        }
        let make = |id: &'static str, priority, prefix, text| PluginDef {
            id,
            name: id,
            version: "1.0.0",
            events: &["user.message.before_send"],
            priority,
            blocking: true,
            timeout_ms: 500,
            fail_policy: FailPolicy::Continue,
            default_enabled: true,
            default_config: Value::Null,
            config_validator: None,
            capabilities: &[Capability::MessageMutate],
            risk: RiskLevel::Low,
            handler: Arc::new(Tagger { prefix, text }),
        };
        let a = make("a", 100, true, "[A] ");
        let b = make("b", 50, false, " [B]");

        let (_dirs, handle, _bus) = spawn_bridge(vec![a, b]);
        let mut rx = subscribe(&handle, 1, 0).await;
        recv_json(&mut rx).await;

        handle
            .send(BridgeMsg::Browser {
                conn_id: 1,
                command: BrowserCommand::UserMessage {
                    content: "hello".into(),
                    client_msg_id: Some("m1".into()),
                },
            })
            .await;

        // No adapter, so the command surfaces an error - but the mutation
        // chain already ran and recorded the final content into history.
        let _err = recv_json(&mut rx).await;

        let mut rx2 = subscribe(&handle, 2, 0).await;
        let history = recv_json(&mut rx2).await;
        assert_eq!(history["type"], "message_history");
        let messages = history["messages"].as_array().unwrap();
        let user_msg = messages.iter().find(|m| m["role"] == "user").unwrap();
        assert_eq!(user_msg["content"], "[A] hello [B]");
    }

    #[tokio::test]
    async fn permission_auto_decide_removes_pending_request() {
        let mut defs = builtin::registry();
        defs.retain(|d| d.id == "permission-automation");
        let (_dirs, handle, bus) = spawn_bridge(defs);
        bus.set_config(
            "permission-automation",
            serde_json::json!({"rules": [{"tool_name": "Read", "action": "allow"}]}),
        )
        .unwrap();

        let mut rx = subscribe(&handle, 1, 0).await;
        recv_json(&mut rx).await;

        handle
            .send(BridgeMsg::Backend(BackendEvent::PermissionRequest(
                PermissionRequest {
                    request_id: "r1".into(),
                    tool_name: "Read".into(),
                    tool_use_id: None,
                    input: Value::Null,
                    command: None,
                    file_path: None,
                    permission_mode: None,
                    request_hash: None,
                },
            )))
            .await;

        let frame = recv_json(&mut rx).await;
        assert_eq!(frame["type"], "permission_request");
        tokio::task::yield_now().await;
        // Auto-decided: the pending map is empty again
        assert_eq!(handle.snapshot().pending_permissions, 0);
    }

    #[tokio::test]
    async fn revoked_auto_decide_leaves_request_pending_with_blocked_insight() {
        let mut defs = builtin::registry();
        defs.retain(|d| d.id == "permission-automation");
        let (_dirs, handle, bus) = spawn_bridge(defs);
        bus.set_config(
            "permission-automation",
            serde_json::json!({"rules": [{"tool_name": "Read", "action": "allow"}]}),
        )
        .unwrap();
        bus.set_grant(
            "permission-automation",
            Capability::PermissionAutoDecide,
            false,
        );

        let mut rx = subscribe(&handle, 1, 0).await;
        recv_json(&mut rx).await;

        handle
            .send(BridgeMsg::Backend(BackendEvent::PermissionRequest(
                PermissionRequest {
                    request_id: "r1".into(),
                    tool_name: "Read".into(),
                    tool_use_id: None,
                    input: Value::Null,
                    command: None,
                    file_path: None,
                    permission_mode: None,
                    request_hash: None,
                },
            )))
            .await;

        let frame = recv_json(&mut rx).await;
        assert_eq!(frame["type"], "permission_request");
        let insight = recv_json(&mut rx).await;
        assert_eq!(insight["type"], "insight");
        assert_eq!(insight["insight"]["title"], "Capability blocked");
        // Request stays pending for browser resolution
        assert_eq!(handle.snapshot().pending_permissions, 1);
    }

    #[tokio::test]
    async fn permission_cancelled_clears_pending_without_response() {
        let (_dirs, handle, _bus) = spawn_bridge(vec![]);
        let mut rx = subscribe(&handle, 1, 0).await;
        recv_json(&mut rx).await;

        handle
            .send(BridgeMsg::Backend(BackendEvent::PermissionRequest(
                PermissionRequest {
                    request_id: "r1".into(),
                    tool_name: "Bash".into(),
                    tool_use_id: None,
                    input: Value::Null,
                    command: None,
                    file_path: None,
                    permission_mode: None,
                    request_hash: None,
                },
            )))
            .await;
        recv_json(&mut rx).await;
        assert_eq!(handle.snapshot().pending_permissions, 1);

        handle
            .send(BridgeMsg::Backend(BackendEvent::PermissionCancelled {
                request_id: "r1".into(),
            }))
            .await;
        recv_json(&mut rx).await;
        assert_eq!(handle.snapshot().pending_permissions, 0);

        // A late browser response for the cancelled request is a no-op
        handle
            .send(BridgeMsg::Browser {
                conn_id: 1,
                command: BrowserCommand::PermissionResponse {
                    request_id: "r1".into(),
                    behavior: PermissionBehavior::Allow,
                    message: None,
                    client_msg_id: Some("k9".into()),
                },
            })
            .await;
        handle.send(status_event("probe")).await;
        let frame = recv_json(&mut rx).await;
        assert_eq!(frame["type"], "status_change");
    }

    #[tokio::test]
    async fn result_clears_tool_progress_and_streaming_state() {
        let (_dirs, handle, _bus) = spawn_bridge(vec![]);
        let mut rx = subscribe(&handle, 1, 0).await;
        recv_json(&mut rx).await;

        handle
            .send(BridgeMsg::Backend(BackendEvent::ToolProgress {
                tool_use_id: "t1".into(),
                tool_name: Some("Bash".into()),
                elapsed_ms: Some(10),
            }))
            .await;
        recv_json(&mut rx).await;

        handle
            .send(BridgeMsg::Backend(BackendEvent::StreamEvent {
                event: serde_json::json!({"delta": {"text": "partial"}}),
            }))
            .await;
        recv_json(&mut rx).await;

        handle
            .send(BridgeMsg::Backend(BackendEvent::TurnResult {
                data: serde_json::json!({"num_turns": 1}),
            }))
            .await;
        recv_json(&mut rx).await;

        // After the result, history rehydration carries no streaming draft
        let mut rx2 = subscribe(&handle, 2, 0).await;
        let history = recv_json(&mut rx2).await;
        let messages = history["messages"].as_array().unwrap();
        assert!(messages.iter().all(|m| m["content"] != "partial"));
    }

    #[tokio::test]
    async fn tool_result_block_clears_matching_timer() {
        let (_dirs, handle, _bus) = spawn_bridge(vec![]);
        let mut rx = subscribe(&handle, 1, 0).await;
        recv_json(&mut rx).await;

        handle
            .send(BridgeMsg::Backend(BackendEvent::ToolProgress {
                tool_use_id: "t1".into(),
                tool_name: Some("Bash".into()),
                elapsed_ms: None,
            }))
            .await;
        recv_json(&mut rx).await;

        handle
            .send(BridgeMsg::Backend(BackendEvent::SystemEvent {
                data: serde_json::json!({
                    "type": "user",
                    "message": {"content": [
                        {"type": "tool_result", "tool_use_id": "t1", "content": "ok"}
                    ]},
                }),
            }))
            .await;
        recv_json(&mut rx).await;

        // A later progress event for the same id restarts from zero - the
        // entry was really removed (observable via elapsed_ms reset).
        handle
            .send(BridgeMsg::Backend(BackendEvent::ToolProgress {
                tool_use_id: "t1".into(),
                tool_name: Some("Bash".into()),
                elapsed_ms: None,
            }))
            .await;
        let frame = recv_json(&mut rx).await;
        assert!(frame["elapsed_ms"].as_u64().unwrap() < 1_000);
    }

    #[tokio::test]
    async fn containerized_cwd_is_rewritten_to_host() {
        let (_dirs, handle, _bus) = spawn_bridge(vec![]);
        handle
            .send(BridgeMsg::SetContainerized {
                host_cwd: "/home/u/p".into(),
            })
            .await;
        let mut rx = subscribe(&handle, 1, 0).await;
        recv_json(&mut rx).await;

        handle
            .send(BridgeMsg::Backend(BackendEvent::SessionUpdate {
                model: None,
                permission_mode: None,
                cwd: Some("/workspace/sub".into()),
                git_branch: None,
                git_ahead: None,
                git_behind: None,
                stats: None,
            }))
            .await;
        let frame = recv_json(&mut rx).await;
        assert_eq!(frame["type"], "session_update");
        assert_eq!(frame["cwd"], "/home/u/p/sub");
        assert_eq!(frame["containerized"], true);
    }

    #[tokio::test]
    async fn kill_closes_subscribers() {
        let (_dirs, handle, _bus) = spawn_bridge(vec![]);
        let mut rx = subscribe(&handle, 1, 0).await;
        recv_json(&mut rx).await;

        let (reply_tx, reply_rx) = oneshot::channel();
        handle.send(BridgeMsg::Kill { reply: reply_tx }).await;
        reply_rx.await.unwrap();
        assert!(!handle.snapshot().live);
        // Subscriber channel closes once the bridge drops it
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn dedup_window_evicts_oldest() {
        let mut window = DedupWindow::new(2);
        assert!(!window.check_and_insert("a"));
        assert!(!window.check_and_insert("b"));
        assert!(window.check_and_insert("a"));
        assert!(!window.check_and_insert("c")); // evicts a
        assert!(!window.check_and_insert("a"));
    }
}
