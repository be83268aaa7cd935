mod mcp_transport;
mod plugin_socket;
mod tools;
mod types;

use crate::state::AppState;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use axum::{Json, Router, extract::State};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use types::{HealthResponse, StatusResponse};

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let connections = state.bridge.connections();
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        started_at: state.started_at,
        connected: connections.ready_count(),
        pending_tasks: state.bridge.registry().len(),
        sse_sessions: state.mcp_sse_sessions.len(),
        connections: connections.snapshot(),
    })
}

/// MCP HTTP surface: health/status plus both MCP transports.
pub fn build_router(state: Arc<AppState>) -> Router {
    // Local MCP clients only; browsers on other origins get no CORS grant.
    let allowed_origins = [
        HeaderValue::from_static("http://localhost"),
        HeaderValue::from_static("http://127.0.0.1"),
    ];
    let cors = CorsLayer::new()
        .allow_origin(allowed_origins.to_vec())
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        // Legacy SSE transport
        .route("/sse", get(mcp_transport::mcp_sse_connect))
        .route("/messages", post(mcp_transport::mcp_messages))
        // Request/response transport
        .route("/mcp", post(mcp_transport::mcp_direct))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Plugin-facing WebSocket endpoint.
pub fn build_plugin_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(plugin_socket::plugin_ws))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve the MCP HTTP API until `AppState::shutdown`.
pub async fn serve_mcp(state: Arc<AppState>, listener: TcpListener) -> std::io::Result<()> {
    let app = build_router(state.clone());
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("MCP HTTP API listening on http://{addr}");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { state.shutdown_signal().await })
        .await
}

/// Serve the plugin WebSocket until `AppState::shutdown`.
pub async fn serve_plugin(state: Arc<AppState>, listener: TcpListener) -> std::io::Result<()> {
    let app = build_plugin_router(state.clone());
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Plugin socket listening on ws://{addr}/");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { state.shutdown_signal().await })
        .await
}
