use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::connection::ConnectionInfo;

// --- Request/Response types ---

#[derive(Serialize)]
pub(super) struct HealthResponse {
    pub ok: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct StatusResponse {
    pub version: &'static str,
    pub started_at: DateTime<Utc>,
    pub connected: usize,
    pub pending_tasks: usize,
    pub sse_sessions: usize,
    pub connections: Vec<ConnectionInfo>,
}

#[derive(Deserialize)]
pub(super) struct McpSessionQuery {
    #[serde(rename = "sessionId")]
    pub session_id: String,
}
