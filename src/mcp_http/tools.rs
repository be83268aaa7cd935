//! MCP tools exposed to clients. Both run directly against the bridge.

use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;

use crate::state::AppState;
use crate::task::{ExecuteCodePayload, TaskRequest, TaskResult, TaskStatus};

const TOOL_NAMES: &str = "execute_code, plugin_status";

pub(super) fn tool_definitions() -> Value {
    json!([
        {
            "name": "execute_code",
            "description": "Run JavaScript inside the connected Penpot plugin and return its result.\n\nThe code runs as the body of an async function with the Penpot plugin API in scope as `penpot`. Use `return` to send a JSON-serializable value back. `variables` are injected as extra bindings. Keep each call small: long-running work is abandoned when the timeout elapses.",
            "inputSchema": { "type": "object", "properties": {
                "code": { "type": "string", "description": "JavaScript function body to execute" },
                "variables": { "type": "object", "description": "Extra bindings available to the code" },
                "timeoutMs": { "type": "integer", "description": "Timeout in milliseconds (default from server config)" },
                "instanceId": { "type": "string", "description": "Target plugin instance; defaults to the most recently connected one. See plugin_status." }
            }, "required": ["code"] }
        },
        {
            "name": "plugin_status",
            "description": "List connected Penpot plugin instances (instance id, file, page, idle time) and the number of in-flight tasks. Call this when execute_code reports that no plugin is connected.",
            "inputSchema": { "type": "object", "properties": {}, "required": [] }
        }
    ])
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteCodeArgs {
    code: String,
    #[serde(default)]
    variables: Option<Map<String, Value>>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    instance_id: Option<String>,
}

/// Execute an MCP tools/call. Failures come back as `{"error": ..}` values.
pub(super) async fn call_tool(state: &Arc<AppState>, name: &str, args: &Value) -> Value {
    match name {
        "execute_code" => execute_code(state, args).await,
        "plugin_status" => plugin_status(state),
        _ => json!({"error": format!("Unknown tool '{name}'. Available: {TOOL_NAMES}")}),
    }
}

async fn execute_code(state: &Arc<AppState>, args: &Value) -> Value {
    let args: ExecuteCodeArgs = match serde_json::from_value(args.clone()) {
        Ok(a) => a,
        Err(e) => {
            return json!({"error": format!("Invalid arguments for 'execute_code': {e}. 'code' (string) is required.")});
        }
    };
    if args.code.trim().is_empty() {
        return json!({"error": "'code' must not be empty"});
    }

    let mut request = TaskRequest::execute_code(ExecuteCodePayload {
        code: args.code,
        variables: args.variables.unwrap_or_default(),
    });
    if let Some(instance) = args.instance_id.filter(|s| !s.is_empty()) {
        request = request.with_instance(instance);
    }
    let timeout = args.timeout_ms.map(Duration::from_millis);

    let result = state.bridge.dispatch(request, timeout).await;
    render_result(&result)
}

/// Turn a task outcome into the tool's JSON payload. Every status gets its
/// own wording so the model can tell "nothing connected" from "too slow".
pub(super) fn render_result(result: &TaskResult) -> Value {
    let detail = result.error_message.as_deref().unwrap_or("");
    let message = match result.status {
        TaskStatus::Ok => {
            return json!({
                "status": result.status.as_str(),
                "taskId": result.task_id,
                "result": result.data.clone().unwrap_or(Value::Null),
            });
        }
        TaskStatus::Error => format!("Code execution failed in the Penpot plugin: {detail}"),
        TaskStatus::Timeout => format!(
            "{detail}. The plugin may still be running it; break the work into smaller steps or pass a larger timeoutMs."
        ),
        TaskStatus::Disconnected => format!(
            "The Penpot plugin disconnected before replying ({detail}). Reopen the plugin and retry."
        ),
        TaskStatus::NotConnected => format!(
            "{detail}. Open a file in Penpot and start the MCP plugin, then retry; plugin_status lists connected instances."
        ),
        TaskStatus::TransportError => {
            format!("Could not deliver the task to the Penpot plugin: {detail}")
        }
    };
    let mut value = json!({
        "status": result.status.as_str(),
        "error": message,
    });
    if let Some(task_id) = &result.task_id {
        value["taskId"] = json!(task_id);
    }
    value
}

fn plugin_status(state: &Arc<AppState>) -> Value {
    let connections = state.bridge.connections();
    json!({
        "connected": connections.ready_count(),
        "pendingTasks": state.bridge.registry().len(),
        "instances": connections.snapshot(),
    })
}
