//! Companion Server
//!
//! Local orchestration daemon for interactive AI coding CLIs. Multiplexes
//! backend child processes to browser clients as live, reconnectable
//! sessions.

mod auth;
mod bridge;
mod container;
mod errors;
mod gateway;
mod git;
mod image_pull;
mod linear_projects;
mod logging;
mod paths;
mod persist;
mod pipeline;
mod plugins;
mod processes;
mod routes;
mod settings;
mod state;
mod store;
mod worktrees;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::bridge::BridgeHandle;
use crate::logging::init_logging;
use crate::plugins::{builtin, PluginBus};
use crate::state::Daemon;

fn main() -> anyhow::Result<()> {
    let data_dir = parse_data_dir_arg();
    paths::init_data_dir(data_dir.as_deref());
    paths::ensure_dirs()?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async_main())
}

fn parse_data_dir_arg() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--data-dir" {
            return args.next().map(PathBuf::from);
        }
        if let Some(value) = arg.strip_prefix("--data-dir=") {
            return Some(PathBuf::from(value));
        }
    }
    None
}

async fn async_main() -> anyhow::Result<()> {
    let logging = init_logging()?;
    let run_id = logging.run_id.clone();
    let _log_guard = logging.guard;
    let root_span =
        tracing::info_span!("companion_server", service = "companion-server", run_id = %run_id);
    let _root_span_guard = root_span.enter();

    info!(
        component = "server",
        event = "server.starting",
        run_id = %run_id,
        pid = std::process::id(),
        data_dir = %paths::data_dir().display(),
        "Starting Companion Server..."
    );

    let token = auth::load_or_create_token()?;
    let plugin_bus = Arc::new(PluginBus::new(builtin::registry(), paths::plugins_path()));
    let daemon = Arc::new(Daemon::new(token, plugin_bus));

    // Re-adopt containers that survived the previous daemon
    daemon.containers.restore(&paths::containers_path()).await;

    // Every non-archived session comes back as a dormant bridge, reconnectable
    // via relaunch.
    let restored = daemon.store.list();
    let mut dormant = 0usize;
    for record in restored {
        if record.archived {
            continue;
        }
        let cwd = record
            .current_cwd
            .clone()
            .unwrap_or_else(|| record.cwd.clone());
        let bridge = BridgeHandle::spawn(
            record.id.clone(),
            record.backend,
            cwd,
            None,
            daemon.plugins.clone(),
            daemon.store.clone(),
        );
        daemon.add_bridge(bridge);
        dormant += 1;
    }
    if dormant > 0 {
        info!(
            component = "restore",
            event = "restore.sessions",
            dormant_sessions = dormant,
            "Restored dormant sessions"
        );
    }

    if !daemon.containers.check_available().await {
        warn!(
            component = "server",
            event = "server.docker_unavailable",
            "Docker unavailable; containerized sessions will fail at creation"
        );
    }

    let app = routes::build_router(daemon.clone())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        );

    let port: u16 = std::env::var("COMPANION_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(4800);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!(
        component = "server",
        event = "server.listening",
        bind_address = %addr,
        "Listening for connections"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!(
        component = "server",
        event = "server.shutting_down",
        "Cancelling sessions and cleaning up containers"
    );
    daemon.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
