//! Plugin socket protocol: JSON text frames tagged by `"type"`.
//!
//! Server -> plugin: `welcome`, `task`.
//! Plugin -> server: `hello`, `task-response`.
//!
//! Every `task-response` carries the `correlationId` it answers; responses
//! may arrive in any order relative to dispatch.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connection::ConnectionId;
use crate::error::TransportError;
use crate::task::{Task, TaskKind, TaskResult};

/// Handshake sent by the plugin right after the socket opens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginHello {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// A plugin's reply to one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
    pub correlation_id: String,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl TaskResponse {
    /// Convert into the caller-facing result. An error reply without a
    /// message still gets one so the status stays actionable.
    pub fn into_result(self) -> TaskResult {
        let result = match self.status {
            ResponseStatus::Ok => TaskResult::ok(self.data),
            ResponseStatus::Error => TaskResult::remote_error(
                self.error_message
                    .unwrap_or_else(|| "Plugin reported an error without a message".to_string()),
            ),
        };
        result.with_task_id(self.correlation_id)
    }
}

/// Frames the plugin sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PluginMessage {
    Hello(PluginHello),
    TaskResponse(TaskResponse),
}

/// Frames the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Welcome { connection_id: ConnectionId },
    Task(TaskEnvelope),
}

/// Outbound task envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEnvelope {
    pub correlation_id: String,
    pub kind: TaskKind,
    pub payload: Value,
}

impl From<&Task> for TaskEnvelope {
    fn from(task: &Task) -> Self {
        Self {
            correlation_id: task.id.clone(),
            kind: task.kind.clone(),
            payload: task.payload.clone(),
        }
    }
}

/// Serialize a server frame to its text form.
pub fn encode(message: &ServerMessage) -> Result<String, TransportError> {
    serde_json::to_string(message).map_err(|e| TransportError::Encode(e.to_string()))
}

/// Parse one text frame from the plugin.
pub fn decode(frame: &str) -> Result<PluginMessage, serde_json::Error> {
    serde_json::from_str(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_hello_with_optional_fields() {
        let msg = decode(r#"{"type":"hello","instanceId":"tab-1","fileName":"Landing"}"#).unwrap();
        match msg {
            PluginMessage::Hello(hello) => {
                assert_eq!(hello.instance_id.as_deref(), Some("tab-1"));
                assert_eq!(hello.file_name.as_deref(), Some("Landing"));
                assert!(hello.plugin_version.is_none());
            }
            other => panic!("Expected hello, got {other:?}"),
        }
    }

    #[test]
    fn decode_bare_hello() {
        let msg = decode(r#"{"type":"hello"}"#).unwrap();
        assert_eq!(msg, PluginMessage::Hello(PluginHello::default()));
    }

    #[test]
    fn decode_ok_response() {
        let msg = decode(
            r#"{"type":"task-response","correlationId":"abc","status":"ok","data":{"x":1}}"#,
        )
        .unwrap();
        let PluginMessage::TaskResponse(response) = msg else {
            panic!("Expected task-response");
        };
        let result = response.into_result();
        assert!(result.is_ok());
        assert_eq!(result.task_id.as_deref(), Some("abc"));
        assert_eq!(result.data, Some(json!({"x": 1})));
    }

    #[test]
    fn decode_ok_response_without_data_is_null() {
        let msg = decode(r#"{"type":"task-response","correlationId":"u","status":"ok"}"#).unwrap();
        let PluginMessage::TaskResponse(response) = msg else {
            panic!("Expected task-response");
        };
        assert_eq!(response.into_result().data, Some(Value::Null));
    }

    #[test]
    fn decode_error_response() {
        let msg = decode(
            r#"{"type":"task-response","correlationId":"e","status":"error","errorMessage":"ReferenceError: foo"}"#,
        )
        .unwrap();
        let PluginMessage::TaskResponse(response) = msg else {
            panic!("Expected task-response");
        };
        let result = response.into_result();
        assert_eq!(result.status, crate::task::TaskStatus::Error);
        assert_eq!(result.error_message.as_deref(), Some("ReferenceError: foo"));
    }

    #[test]
    fn response_without_correlation_id_is_rejected() {
        assert!(decode(r#"{"type":"task-response","status":"ok"}"#).is_err());
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        assert!(decode(r#"{"type":"subscribe"}"#).is_err());
        assert!(decode("not json").is_err());
    }

    #[test]
    fn encode_task_envelope() {
        let frame = encode(&ServerMessage::Task(TaskEnvelope {
            correlation_id: "id-1".into(),
            kind: TaskKind::ExecuteCode,
            payload: json!({"code": "return penpot.currentPage.name"}),
        }))
        .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "task");
        assert_eq!(value["correlationId"], "id-1");
        assert_eq!(value["kind"], "execute-code");
        assert_eq!(value["payload"]["code"], "return penpot.currentPage.name");
    }

    #[test]
    fn encode_welcome() {
        let frame = encode(&ServerMessage::Welcome {
            connection_id: ConnectionId::from("conn-7"),
        })
        .unwrap();
        assert_eq!(frame, r#"{"type":"welcome","connectionId":"conn-7"}"#);
    }
}
