//! Outbound half of the transport endpoint.
//!
//! The socket handler in `mcp_http::plugin_socket` owns the actual WebSocket;
//! this module is the send primitive the bridge talks to.

use crate::connection::{ConnectionId, ConnectionManager};
use crate::error::TransportError;
use crate::protocol::{self, ServerMessage, TaskEnvelope};

/// Deliver an envelope to one plugin connection. Must not block.
pub trait Transport: Send + Sync {
    fn send(&self, connection_id: &ConnectionId, envelope: TaskEnvelope) -> Result<(), TransportError>;
}

impl Transport for ConnectionManager {
    fn send(&self, connection_id: &ConnectionId, envelope: TaskEnvelope) -> Result<(), TransportError> {
        let outbound = self.outbound_for(connection_id)?;
        let frame = protocol::encode(&ServerMessage::Task(envelope))?;
        outbound
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed(connection_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PluginHello;
    use crate::registry::TaskRegistry;
    use crate::task::TaskKind;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn envelope(id: &str) -> TaskEnvelope {
        TaskEnvelope {
            correlation_id: id.to_string(),
            kind: TaskKind::ExecuteCode,
            payload: json!({"code": "return 42"}),
        }
    }

    #[test]
    fn send_queues_task_frame() {
        let mgr = ConnectionManager::new(Arc::new(TaskRegistry::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = mgr.accept(tx);
        mgr.mark_ready(&id, PluginHello::default()).unwrap();
        let welcome = rx.try_recv().unwrap();
        assert!(welcome.contains(r#""type":"welcome""#));

        mgr.send(&id, envelope("t-1")).unwrap();

        let frame = rx.try_recv().unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "task");
        assert_eq!(value["correlationId"], "t-1");
    }

    #[test]
    fn send_to_unknown_connection_fails() {
        let mgr = ConnectionManager::new(Arc::new(TaskRegistry::new()));
        let id = ConnectionId::from("missing");
        assert_eq!(
            mgr.send(&id, envelope("t")),
            Err(TransportError::ConnectionNotFound(id))
        );
    }

    #[test]
    fn send_to_connecting_connection_fails() {
        let mgr = ConnectionManager::new(Arc::new(TaskRegistry::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = mgr.accept(tx);
        assert_eq!(
            mgr.send(&id, envelope("t")),
            Err(TransportError::ConnectionNotFound(id))
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_after_writer_dropped_is_closed() {
        let mgr = ConnectionManager::new(Arc::new(TaskRegistry::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        let id = mgr.accept(tx);
        mgr.mark_ready(&id, PluginHello::default()).unwrap();
        drop(rx);
        assert_eq!(
            mgr.send(&id, envelope("t")),
            Err(TransportError::ConnectionClosed(id))
        );
    }
}
