use crate::state::AppState;
use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::Stream;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use uuid::Uuid;

use super::tools;
use super::types::*;

const PROTOCOL_VERSION: &str = "2024-11-05";

const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_REQUEST: i64 = -32600;

fn rpc_result(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn rpc_error(id: Value, code: i64, message: String) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

/// Handle one JSON-RPC message. Returns None for notifications, which get
/// no reply.
pub(super) async fn handle_rpc(state: &Arc<AppState>, body: &Value) -> Option<Value> {
    let id = body.get("id").cloned().unwrap_or(Value::Null);
    let Some(method) = body["method"].as_str() else {
        return Some(rpc_error(id, INVALID_REQUEST, "Missing 'method'".to_string()));
    };

    match method {
        "initialize" => Some(rpc_result(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": "penpot-mcp",
                    "version": env!("CARGO_PKG_VERSION")
                }
            }),
        )),

        // Client acknowledgment, no response needed
        "notifications/initialized" => None,

        "ping" => Some(rpc_result(id, json!({}))),

        "tools/list" => Some(rpc_result(id, json!({ "tools": tools::tool_definitions() }))),

        "tools/call" => {
            let params = body.get("params").cloned().unwrap_or(Value::Null);
            let tool_name = params["name"].as_str().unwrap_or("");
            let args = params.get("arguments").cloned().unwrap_or(json!({}));

            tracing::debug!(tool = tool_name, "tools/call");
            let result = tools::call_tool(state, tool_name, &args).await;
            let text = serde_json::to_string_pretty(&result).unwrap_or_default();
            let is_error = result.get("error").is_some();

            Some(rpc_result(
                id,
                json!({
                    "content": [{ "type": "text", "text": text }],
                    "isError": is_error
                }),
            ))
        }

        other if other.starts_with("notifications/") => None,

        other => Some(rpc_error(id, METHOD_NOT_FOUND, format!("Method not found: {other}"))),
    }
}

/// Removes an SSE session when its stream is dropped, whether the channel
/// ended or the client went away.
struct SessionGuard {
    state: Arc<AppState>,
    session_id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.state.mcp_sse_sessions.remove(&self.session_id).is_some() {
            tracing::debug!(session = %self.session_id, "MCP SSE session closed");
        }
    }
}

/// GET /sse — Establish MCP SSE transport connection
pub(super) async fn mcp_sse_connect(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let session_id = Uuid::new_v4().to_string();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    state.mcp_sse_sessions.insert(session_id.clone(), tx);
    tracing::debug!(session = %session_id, "MCP SSE session opened");

    let messages_url = format!("/messages?sessionId={session_id}");
    let guard = SessionGuard {
        state: state.clone(),
        session_id,
    };

    let stream = async_stream::stream! {
        let _guard = guard;
        // First event: tell the client where to POST messages
        yield Ok(Event::default().event("endpoint").data(messages_url));

        while let Some(msg) = rx.recv().await {
            yield Ok(Event::default().event("message").data(msg));
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// POST /messages?sessionId=xxx — JSON-RPC in, reply pushed on the SSE stream
pub(super) async fn mcp_messages(
    State(state): State<Arc<AppState>>,
    Query(query): Query<McpSessionQuery>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let tx = match state.mcp_sse_sessions.get(&query.session_id) {
        Some(entry) => entry.value().clone(),
        None => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "MCP session not found"})),
            );
        }
    };

    // A plugin task can take up to its full timeout; never hold the POST open for it
    if body["method"].as_str() == Some("tools/call") {
        tokio::spawn(async move {
            if let Some(response) = handle_rpc(&state, &body).await {
                let _ = tx.send(serde_json::to_string(&response).unwrap_or_default());
            }
        });
        return (StatusCode::ACCEPTED, Json(json!({"ok": true})));
    }

    match handle_rpc(&state, &body).await {
        Some(response) => {
            let _ = tx.send(serde_json::to_string(&response).unwrap_or_default());
            (StatusCode::OK, Json(json!({"ok": true})))
        }
        None => (StatusCode::ACCEPTED, Json(json!({}))),
    }
}

/// POST /mcp — JSON-RPC request in, JSON-RPC response out
pub(super) async fn mcp_direct(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    match handle_rpc(&state, &body).await {
        Some(response) => (StatusCode::OK, Json(response)),
        None => (StatusCode::ACCEPTED, Json(json!({}))),
    }
}
