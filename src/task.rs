//! Units of work sent to the plugin runtime and their terminal outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Discriminator for what the plugin should do with a task payload.
///
/// Only `execute-code` is produced by the built-in tools; any other kind
/// passes through untouched so new plugin capabilities don't need a bridge
/// release.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskKind {
    ExecuteCode,
    Other(String),
}

impl TaskKind {
    pub fn as_str(&self) -> &str {
        match self {
            TaskKind::ExecuteCode => "execute-code",
            TaskKind::Other(kind) => kind,
        }
    }
}

impl From<String> for TaskKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "execute-code" => TaskKind::ExecuteCode,
            _ => TaskKind::Other(kind),
        }
    }
}

impl From<&str> for TaskKind {
    fn from(kind: &str) -> Self {
        TaskKind::from(kind.to_string())
    }
}

impl From<TaskKind> for String {
    fn from(kind: TaskKind) -> Self {
        match kind {
            TaskKind::ExecuteCode => "execute-code".to_string(),
            TaskKind::Other(kind) => kind,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of an `execute-code` task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteCodePayload {
    /// JavaScript source evaluated inside the plugin sandbox.
    pub code: String,
    /// Extra bindings injected into the execution scope.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub variables: Map<String, Value>,
}

/// What a caller submits. The bridge assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub kind: TaskKind,
    pub payload: Value,
    /// Explicit plugin instance to target, matched against the handshake's
    /// instance id or the connection id.
    pub instance_id: Option<String>,
}

impl TaskRequest {
    pub fn new(kind: impl Into<TaskKind>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            instance_id: None,
        }
    }

    pub fn execute_code(payload: ExecuteCodePayload) -> Self {
        // A struct of a String and a Map always serializes.
        let payload = serde_json::to_value(payload).unwrap_or(Value::Null);
        Self::new(TaskKind::ExecuteCode, payload)
    }

    pub fn with_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }
}

/// A task owned by the bridge from dispatch until its terminal transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub(crate) fn from_request(id: String, request: TaskRequest) -> Self {
        Self {
            id,
            kind: request.kind,
            payload: request.payload,
            created_at: Utc::now(),
        }
    }
}

/// Terminal status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Ok,
    /// The plugin replied with an error (e.g. the executed code threw).
    Error,
    Timeout,
    /// The connection dropped after dispatch, before a reply.
    Disconnected,
    /// No Ready connection at dispatch time. Nothing was registered.
    NotConnected,
    /// The envelope could not be framed or handed to the socket.
    TransportError,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Ok => "ok",
            TaskStatus::Error => "error",
            TaskStatus::Timeout => "timeout",
            TaskStatus::Disconnected => "disconnected",
            TaskStatus::NotConnected => "not-connected",
            TaskStatus::TransportError => "transport-error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl TaskResult {
    /// Successful completion. A `None` from the plugin (JS `undefined`) is
    /// carried as `null`.
    pub fn ok(data: Option<Value>) -> Self {
        Self {
            status: TaskStatus::Ok,
            task_id: None,
            data: Some(data.unwrap_or(Value::Null)),
            error_message: None,
        }
    }

    pub fn remote_error(message: impl Into<String>) -> Self {
        Self::failure(TaskStatus::Error, message)
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self::failure(
            TaskStatus::Timeout,
            format!("Task timed out after {timeout_ms}ms"),
        )
    }

    pub fn disconnected(reason: impl Into<String>) -> Self {
        Self::failure(TaskStatus::Disconnected, reason)
    }

    pub fn not_connected(message: impl Into<String>) -> Self {
        Self::failure(TaskStatus::NotConnected, message)
    }

    pub fn transport_error(message: impl Into<String>) -> Self {
        Self::failure(TaskStatus::TransportError, message)
    }

    /// Bridge-side failure that is neither the plugin's nor the socket's fault.
    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::failure(TaskStatus::Error, message)
    }

    fn failure(status: TaskStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            task_id: None,
            data: None,
            error_message: Some(message.into()),
        }
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == TaskStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_kind_from_wire_string() {
        assert_eq!(TaskKind::from("execute-code"), TaskKind::ExecuteCode);
        assert_eq!(
            TaskKind::from("export-shape"),
            TaskKind::Other("export-shape".into())
        );
        let encoded = serde_json::to_value(TaskKind::ExecuteCode).unwrap();
        assert_eq!(encoded, json!("execute-code"));
    }

    #[test]
    fn execute_code_request_omits_empty_variables() {
        let request = TaskRequest::execute_code(ExecuteCodePayload {
            code: "return 1".into(),
            variables: Map::new(),
        });
        assert_eq!(request.kind, TaskKind::ExecuteCode);
        assert_eq!(request.payload, json!({"code": "return 1"}));
        assert!(request.instance_id.is_none());
    }

    #[test]
    fn ok_result_maps_undefined_to_null() {
        let result = TaskResult::ok(None);
        assert!(result.is_ok());
        assert_eq!(result.data, Some(Value::Null));
        assert!(result.error_message.is_none());
    }

    #[test]
    fn failure_results_carry_message_and_no_data() {
        for result in [
            TaskResult::remote_error("boom"),
            TaskResult::timeout(100),
            TaskResult::disconnected("gone"),
            TaskResult::not_connected("nobody home"),
            TaskResult::transport_error("bad frame"),
        ] {
            assert!(!result.is_ok());
            assert!(result.data.is_none());
            assert!(result.error_message.is_some());
        }
        assert_eq!(
            TaskResult::timeout(100).error_message.as_deref(),
            Some("Task timed out after 100ms")
        );
    }

    #[test]
    fn result_serializes_status_in_kebab_case() {
        let result = TaskResult::not_connected("none").with_task_id("t-1");
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "not-connected");
        assert_eq!(value["taskId"], "t-1");
        assert_eq!(value["errorMessage"], "none");
        assert!(value.get("data").is_none());
    }
}
