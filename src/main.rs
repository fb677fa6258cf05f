#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # claude-gateway
//!
//! Single-host gateway exposing interactive coding-assistant sessions to
//! remote clients over HTTP, SSE, and WebSockets. A browser client opens a
//! chat or terminal against the gateway; the gateway manages the backend
//! processes, streams their output in real time, and persists every chat
//! event to an append-only journal for cursor-based reconnect and replay.

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Extension, Router,
};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use claude_gateway::{auth::ApiKey, routes, util::expand_tilde, AppState, Config, JournalPaths};

/// Gateway for interactive coding-assistant sessions.
#[derive(Parser)]
#[command(name = "claude-gateway", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/SSE/WS server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        None => run_server(None).await,
    }
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("claude-gateway v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    if config.auth.api_key == "change-me" {
        warn!("Using default API key — set GATEWAY_API_KEY or update config");
    }

    let root = expand_tilde(&config.server.root_dir).into_owned();
    let paths = JournalPaths::new(&root);
    if let Err(e) = paths.ensure_tree().await {
        tracing::error!("Failed to create gateway root {root}: {e}");
        std::process::exit(1);
    }
    info!("Gateway root: {root}");

    let config = Arc::new(config);
    let state = AppState::new(Arc::clone(&config), paths);

    // Build router
    let public_routes = Router::new().route("/api/health", get(routes::health::health));

    let authed_routes = Router::new()
        .route("/api/sessions", get(routes::sessions::list_sessions))
        .route("/api/session/start", post(routes::sessions::start_session))
        .route(
            "/api/sessions/{id}/messages",
            post(routes::sessions::post_message),
        )
        .route(
            "/api/sessions/{id}/cancel",
            post(routes::sessions::cancel_session),
        )
        .route(
            "/api/chat-stream/stats",
            get(routes::chat_stream::chat_stream_stats),
        )
        .layer(middleware::from_fn(claude_gateway::auth::require_api_key));

    // Streaming endpoints authenticate via ?token= — EventSource and
    // WebSocket upgrades cannot carry an Authorization header.
    let stream_routes = Router::new()
        .route("/api/chat-stream", get(routes::chat_stream::chat_stream))
        .route("/api/terminal/ws", get(routes::terminal::terminal_ws))
        .route(
            "/api/terminal/stream",
            get(routes::terminal::terminal_stream),
        );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        // GUARD: Headers must be listed explicitly — `allow_headers(Any)`
        // works in Chrome but Firefox rejects requests without the listing.
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
            axum::http::HeaderName::from_static("last-event-id"),
        ]);

    let app = Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .merge(stream_routes)
        .layer(Extension(ApiKey(config.auth.api_key.clone())))
        .with_state(state.clone())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(tower::limit::ConcurrencyLimitLayer::new(
            config.server.max_connections,
        ));

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Periodic sweep: enforce terminal TTL/idle policy
    let terminals = state.terminals.clone();
    let sweep_interval = config.terminal.sweep_interval_ms;
    let sweep_task = tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_millis(sweep_interval));
        loop {
            interval.tick().await;
            terminals.sweep().await;
        }
    });

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    // Cleanup: stop watchers, terminate children, kill PTYs
    info!("Shutting down...");
    sweep_task.abort();
    state.tailers.shutdown().await;
    state.engine.shutdown_all().await;
    state.terminals.shutdown_all().await;
    info!("Goodbye");
}
