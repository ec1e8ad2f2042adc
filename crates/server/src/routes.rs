//! HTTP surface of the daemon.
//!
//! Session CRUD and lifecycle, the creation pipeline (single-response and
//! SSE transports), auth bootstrap, plugin introspection, and process
//! management. Everything except `/health` and `/auth/*` sits behind the
//! bearer-token middleware.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::{
    extract::{ConnectInfo, Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::info;

use companion_connectors::{Adapter, ClaudeAdapter, CodexAdapter, LaunchSpec};
use companion_protocol::{BackendKind, PipelineStep, ServerEvent, StepProgress, StepStatus};

use crate::auth;
use crate::bridge::{BridgeHandle, BridgeMsg};
use crate::gateway;
use crate::pipeline::{self, CreateRequest, ProgressReporter};
use crate::plugins::{BusEvent, Capability};
use crate::processes;
use crate::state::Daemon;

pub fn build_router(daemon: Arc<Daemon>) -> Router {
    let token = daemon.token.clone();
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/auth/qr", get(auth_qr))
        .route("/auth/verify", post(auth_verify))
        .route("/auth/auto", get(auth_auto))
        .route("/sessions", get(list_sessions))
        .route("/sessions/create", post(create_session))
        .route("/sessions/create-stream", post(create_session_stream))
        .route("/sessions/{id}", get(get_session).delete(delete_session))
        .route("/sessions/{id}/kill", post(kill_session))
        .route("/sessions/{id}/archive", post(archive_session))
        .route("/sessions/{id}/unarchive", post(unarchive_session))
        .route("/sessions/{id}/relaunch", post(relaunch_session))
        .route("/sessions/{id}/name", post(name_session))
        .route(
            "/sessions/{id}/processes/{task_id}/kill",
            post(kill_session_task),
        )
        .route("/sessions/{id}/processes/kill-all", post(kill_session_tasks))
        .route("/processes/system", get(system_processes))
        .route("/plugins", get(list_plugins))
        .route("/plugins/{id}/toggle", post(toggle_plugin))
        .route("/plugins/{id}/config", post(configure_plugin))
        .route("/plugins/{id}/grant", post(grant_plugin))
        .route("/plugins/{id}/dry-run", post(dry_run_plugin))
        .route("/ws/browser/{session_id}", get(gateway::ws_handler))
        .layer(axum::middleware::from_fn_with_state(
            token,
            auth::auth_middleware,
        ))
        .with_state(daemon)
}

// ---------------------------------------------------------------------------
// Auth bootstrap
// ---------------------------------------------------------------------------

async fn auth_qr(State(daemon): State<Arc<Daemon>>) -> impl IntoResponse {
    let payload = json!({
        "url": "http://127.0.0.1:4800",
        "token": daemon.token,
    });
    Json(json!({
        "qr": BASE64.encode(payload.to_string()),
    }))
}

#[derive(Deserialize)]
struct VerifyBody {
    token: String,
}

async fn auth_verify(
    State(daemon): State<Arc<Daemon>>,
    Json(body): Json<VerifyBody>,
) -> impl IntoResponse {
    Json(json!({
        "valid": auth::token_matches(&daemon.token, &body.token),
    }))
}

async fn auth_auto(
    State(daemon): State<Arc<Daemon>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    if auth::is_loopback(&addr) {
        (StatusCode::OK, Json(json!({"token": daemon.token})))
    } else {
        (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "auto-auth is localhost-only"})),
        )
    }
}

// ---------------------------------------------------------------------------
// Session creation - JSON transport (first error wins)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CollectReporter {
    progress: Mutex<Vec<StepProgress>>,
    error: Mutex<Option<(String, u16, Option<PipelineStep>)>>,
}

impl ProgressReporter for CollectReporter {
    fn progress(&self, step: PipelineStep, status: StepStatus, detail: Option<String>) {
        self.progress
            .lock()
            .expect("reporter lock poisoned")
            .push(StepProgress {
                step,
                label: step.label().to_string(),
                status,
                detail,
            });
    }

    fn error(&self, message: &str, status: u16, step: Option<PipelineStep>) {
        let mut guard = self.error.lock().expect("reporter lock poisoned");
        // First error wins
        if guard.is_none() {
            *guard = Some((message.to_string(), status, step));
        }
    }
}

async fn create_session(
    State(daemon): State<Arc<Daemon>>,
    Json(req): Json<CreateRequest>,
) -> impl IntoResponse {
    let reporter = CollectReporter::default();
    match pipeline::run(&daemon, req, &reporter).await {
        Ok(descriptor) => {
            let progress = reporter.progress.into_inner().expect("reporter lock poisoned");
            (
                StatusCode::OK,
                Json(json!({"session": descriptor, "progress": progress})),
            )
        }
        Err(e) => (
            StatusCode::from_u16(e.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Json(json!({"error": e.message, "step": e.step})),
        ),
    }
}

// ---------------------------------------------------------------------------
// Session creation - SSE transport
// ---------------------------------------------------------------------------

enum SseItem {
    Progress(StepProgress),
    Done(Value),
    Error { message: String, step: Option<PipelineStep> },
}

struct StreamReporter {
    tx: mpsc::UnboundedSender<SseItem>,
}

impl ProgressReporter for StreamReporter {
    fn progress(&self, step: PipelineStep, status: StepStatus, detail: Option<String>) {
        let _ = self.tx.send(SseItem::Progress(StepProgress {
            step,
            label: step.label().to_string(),
            status,
            detail,
        }));
    }

    fn error(&self, message: &str, _status: u16, step: Option<PipelineStep>) {
        let _ = self.tx.send(SseItem::Error {
            message: message.to_string(),
            step,
        });
    }
}

async fn create_session_stream(
    State(daemon): State<Arc<Daemon>>,
    Json(req): Json<CreateRequest>,
) -> impl IntoResponse {
    let (tx, rx) = mpsc::unbounded_channel::<SseItem>();

    let reporter = StreamReporter { tx: tx.clone() };
    tokio::spawn(async move {
        if let Ok(descriptor) = pipeline::run(&daemon, req, &reporter).await {
            let _ = tx.send(SseItem::Done(
                serde_json::to_value(&descriptor).unwrap_or(Value::Null),
            ));
        }
        // The error path already emitted through the reporter
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        let item = rx.recv().await?;
        let event = match item {
            SseItem::Progress(progress) => Event::default()
                .event("progress")
                .data(serde_json::to_string(&progress).unwrap_or_default()),
            SseItem::Done(session) => Event::default()
                .event("done")
                .data(session.to_string()),
            SseItem::Error { message, step } => Event::default().event("error").data(
                json!({"error": message, "step": step}).to_string(),
            ),
        };
        Some((Ok::<Event, std::convert::Infallible>(event), rx))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ---------------------------------------------------------------------------
// Session CRUD & lifecycle
// ---------------------------------------------------------------------------

async fn list_sessions(State(daemon): State<Arc<Daemon>>) -> impl IntoResponse {
    let sessions: Vec<_> = daemon
        .store
        .list()
        .into_iter()
        .map(|r| daemon.describe(r))
        .collect();
    Json(json!({"sessions": sessions}))
}

async fn get_session(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match daemon.store.get(&id) {
        Some(record) => (StatusCode::OK, Json(json!({"session": daemon.describe(record)}))),
        None => not_found("session"),
    }
}

async fn delete_session(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if daemon.store.get(&id).is_none() {
        return not_found("session");
    }

    daemon.kill_session(&id).await;
    daemon.containers.remove(&id).await;
    daemon.containers.persist(&crate::paths::containers_path());

    // Worktree cleanup is best-effort: a dirty tree stays behind.
    let worktree_removed = daemon
        .worktrees
        .remove_by_session(&id, false)
        .await
        .unwrap_or(false);
    if !worktree_removed {
        daemon.worktrees.forget(&id);
    }

    daemon.store.remove(&id);
    info!(
        component = "routes",
        event = "session.deleted",
        session_id = %id,
        worktree_removed = worktree_removed,
        "Session deleted"
    );
    (StatusCode::OK, Json(json!({"deleted": id, "worktree_removed": worktree_removed})))
}

async fn kill_session(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if daemon.store.get(&id).is_none() {
        return not_found("session");
    }
    let killed = daemon.kill_session(&id).await;
    (StatusCode::OK, Json(json!({"killed": killed})))
}

async fn archive_session(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if daemon.store.get(&id).is_none() {
        return not_found("session");
    }
    daemon.kill_session(&id).await;
    daemon.containers.remove(&id).await;
    daemon.containers.persist(&crate::paths::containers_path());
    let _ = daemon.worktrees.remove_by_session(&id, false).await;
    daemon.store.set_archived(&id, true);
    (StatusCode::OK, Json(json!({"archived": id})))
}

async fn unarchive_session(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if !daemon.store.set_archived(&id, false) {
        return not_found("session");
    }
    (StatusCode::OK, Json(json!({"unarchived": id})))
}

async fn relaunch_session(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let Some(record) = daemon.store.get(&id) else {
        return not_found("session");
    };

    if let Some(bridge) = daemon.bridge(&id) {
        if bridge.snapshot().live {
            return (
                StatusCode::CONFLICT,
                Json(json!({"error": "session backend is already running"})),
            );
        }
    }

    let cwd = record.current_cwd.clone().unwrap_or_else(|| record.cwd.clone());
    let mut spec = LaunchSpec {
        cwd: cwd.clone(),
        model: record.model.clone(),
        permission_mode: record.permission_mode.clone(),
        ..Default::default()
    };
    if let Some(container) = &record.container {
        let docker_bin =
            std::env::var("COMPANION_DOCKER_BIN").unwrap_or_else(|_| "docker".to_string());
        spec.wrapper = vec![
            docker_bin,
            "exec".into(),
            "-i".into(),
            "-w".into(),
            crate::container::CONTAINER_WORKSPACE.into(),
            container.id.clone(),
        ];
        if record.backend == BackendKind::Codex {
            spec.app_server_port = Some(pipeline::APP_SERVER_CONTAINER_PORT);
            spec.app_server_connect_port = container
                .ports
                .get(&pipeline::APP_SERVER_CONTAINER_PORT)
                .copied();
        }
    }

    let adapter = match record.backend {
        BackendKind::Claude => ClaudeAdapter::launch(&spec).await.map(Adapter::Claude),
        BackendKind::Codex => CodexAdapter::launch(&spec).await.map(Adapter::Codex),
    };
    let adapter = match adapter {
        Ok(adapter) => adapter,
        Err(e) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": e.to_string()})),
            );
        }
    };

    match daemon.bridge(&id) {
        Some(bridge) => {
            bridge.send(BridgeMsg::AdapterAttached(Box::new(adapter))).await;
        }
        None => {
            // Dormant since boot: spin a fresh bridge (seq restarts with it)
            let bridge = BridgeHandle::spawn(
                id.clone(),
                record.backend,
                cwd,
                Some(adapter),
                daemon.plugins.clone(),
                daemon.store.clone(),
            );
            if record.container.is_some() {
                bridge
                    .send(BridgeMsg::SetContainerized {
                        host_cwd: record.cwd.clone(),
                    })
                    .await;
            }
            bridge.send(BridgeMsg::Publish(ServerEvent::CliConnected {})).await;
            daemon.add_bridge(bridge);
        }
    }

    (StatusCode::OK, Json(json!({"relaunched": id})))
}

#[derive(Deserialize)]
struct NameBody {
    #[serde(default)]
    name: Option<String>,
}

async fn name_session(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
    Json(body): Json<NameBody>,
) -> impl IntoResponse {
    let name = body.name.filter(|n| !n.trim().is_empty());
    if !daemon.store.update(&id, |r| r.name = name.clone()) {
        return not_found("session");
    }
    if let Some(bridge) = daemon.bridge(&id) {
        bridge
            .send(BridgeMsg::Publish(ServerEvent::SessionNameUpdate {
                name: name.clone(),
            }))
            .await;
    }
    (StatusCode::OK, Json(json!({"id": id, "name": name})))
}

// ---------------------------------------------------------------------------
// Processes
// ---------------------------------------------------------------------------

async fn system_processes(State(daemon): State<Arc<Daemon>>) -> impl IntoResponse {
    Json(json!({"processes": processes::list_system(&daemon)}))
}

async fn kill_session_task(
    State(daemon): State<Arc<Daemon>>,
    Path((id, task_id)): Path<(String, String)>,
) -> impl IntoResponse {
    if processes::kill_task(&daemon, &id, &task_id).await {
        (StatusCode::OK, Json(json!({"killed": task_id})))
    } else {
        not_found("process")
    }
}

async fn kill_session_tasks(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let killed = processes::kill_all(&daemon, &id).await;
    (StatusCode::OK, Json(json!({"killed": killed})))
}

// ---------------------------------------------------------------------------
// Plugins
// ---------------------------------------------------------------------------

async fn list_plugins(State(daemon): State<Arc<Daemon>>) -> impl IntoResponse {
    Json(json!({"plugins": daemon.plugins.list()}))
}

#[derive(Deserialize)]
struct ToggleBody {
    enabled: bool,
}

async fn toggle_plugin(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
    Json(body): Json<ToggleBody>,
) -> impl IntoResponse {
    if daemon.plugins.set_enabled(&id, body.enabled) {
        (StatusCode::OK, Json(json!({"id": id, "enabled": body.enabled})))
    } else {
        not_found("plugin")
    }
}

#[derive(Deserialize)]
struct ConfigBody {
    config: Value,
}

async fn configure_plugin(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
    Json(body): Json<ConfigBody>,
) -> impl IntoResponse {
    match daemon.plugins.set_config(&id, body.config) {
        Ok(()) => (StatusCode::OK, Json(json!({"id": id}))),
        Err(e) => (StatusCode::BAD_REQUEST, Json(json!({"error": e}))),
    }
}

#[derive(Deserialize)]
struct GrantBody {
    capability: Capability,
    granted: bool,
}

async fn grant_plugin(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
    Json(body): Json<GrantBody>,
) -> impl IntoResponse {
    if daemon.plugins.set_grant(&id, body.capability, body.granted) {
        (StatusCode::OK, Json(json!({"id": id})))
    } else {
        not_found("plugin capability")
    }
}

#[derive(Deserialize)]
struct DryRunBody {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

async fn dry_run_plugin(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
    Json(body): Json<DryRunBody>,
) -> impl IntoResponse {
    let event = Arc::new(BusEvent::UserMessageBeforeSend {
        session_id: body.session_id.unwrap_or_else(|| "dry-run".into()),
        content: body.content.unwrap_or_default(),
    });
    match daemon.plugins.dry_run(&id, event).await {
        Ok(result) => (
            StatusCode::OK,
            Json(serde_json::to_value(&result).unwrap_or(Value::Null)),
        ),
        Err(e) => (StatusCode::NOT_FOUND, Json(json!({"error": e}))),
    }
}

fn not_found(what: &str) -> (StatusCode, Json<Value>) {
    let err = crate::errors::RuntimeError::NotFound(what.to_string());
    (err.status(), Json(json!({"error": err.to_string()})))
}
