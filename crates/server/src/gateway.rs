//! Browser WebSocket gateway.
//!
//! Binds each accepted socket to one session (from the URL), registers it as
//! a bridge subscriber, and shuttles frames both ways. Authentication is
//! handled by the surrounding middleware; by the time the upgrade fires the
//! bearer token has been checked.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use companion_protocol::BrowserCommand;

use crate::bridge::BridgeMsg;
use crate::state::Daemon;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Per-subscriber outbound queue bound - matches the bridge's expectation
/// that a stalled browser is dropped rather than buffered without limit.
const OUTBOUND_QUEUE: usize = 100;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(daemon): State<Arc<Daemon>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, daemon))
}

async fn handle_socket(socket: WebSocket, session_id: String, daemon: Arc<Daemon>) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);

    let Some(bridge) = daemon.bridge(&session_id) else {
        warn!(
            component = "gateway",
            event = "ws.unknown_session",
            connection_id = conn_id,
            session_id = %session_id,
            "WebSocket for unknown session, closing"
        );
        let mut socket = socket;
        let _ = socket
            .send(Message::Text(
                r#"{"type":"error","message":"unknown session","code":"not_found"}"#.into(),
            ))
            .await;
        return;
    };

    info!(
        component = "gateway",
        event = "ws.connection.opened",
        connection_id = conn_id,
        session_id = %session_id,
        "Browser connection opened"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Frames from the bridge (pre-serialized) plus pong responses
    let (frame_tx, mut frame_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
    let (pong_tx, mut pong_rx) = mpsc::channel::<Bytes>(8);

    bridge
        .send(BridgeMsg::SubscriberJoin {
            conn_id,
            tx: frame_tx,
        })
        .await;

    let send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe_frame = frame_rx.recv() => {
                    let Some(frame) = maybe_frame else { break };
                    if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                maybe_pong = pong_rx.recv() => {
                    let Some(data) = maybe_pong else { break };
                    if ws_tx.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(result) = ws_rx.next().await {
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                let _ = pong_tx.send(data).await;
                continue;
            }
            Ok(Message::Close(_)) => {
                debug!(
                    component = "gateway",
                    event = "ws.connection.close_frame",
                    connection_id = conn_id,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "gateway",
                    event = "ws.connection.error",
                    connection_id = conn_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        };

        let mut command: BrowserCommand = match serde_json::from_str(&text) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!(
                    component = "gateway",
                    event = "ws.message.parse_failed",
                    connection_id = conn_id,
                    error = %e,
                    payload_bytes = text.len(),
                    "Failed to parse browser frame"
                );
                continue;
            }
        };

        // Idempotent command types get a client_msg_id stamped here when the
        // browser omitted one.
        command.ensure_client_msg_id();

        bridge
            .send(BridgeMsg::Browser { conn_id, command })
            .await;
    }

    bridge.send(BridgeMsg::SubscriberLeave { conn_id }).await;
    send_task.abort();

    info!(
        component = "gateway",
        event = "ws.connection.closed",
        connection_id = conn_id,
        session_id = %session_id,
        "Browser connection closed"
    );
}
