//! Plugin connection lifecycle.
//!
//! Every accepted socket gets a fresh `ConnectionId` and walks
//! `Connecting -> Ready -> Closed` (or `Connecting -> Closed` when the
//! handshake never completes). A closed connection is dropped from the map
//! and its pending tasks are failed; a reconnecting plugin always gets a
//! new id.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

use crate::error::{BridgeError, LifecycleError, TransportError};
use crate::protocol::{self, PluginHello, ServerMessage};
use crate::registry::TaskRegistry;

/// Identity of one accepted plugin socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Ready,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Closed => "closed",
        }
    }
}

/// A live session with one plugin runtime instance.
#[derive(Debug)]
pub struct PluginConnection {
    pub id: ConnectionId,
    /// Accept order; the highest Ready sequence wins target selection.
    pub sequence: u64,
    pub state: ConnectionState,
    pub hello: Option<PluginHello>,
    pub connected_at: DateTime<Utc>,
    pub last_seen: Instant,
    /// Text frames queued for the socket writer task.
    outbound: UnboundedSender<String>,
}

impl PluginConnection {
    fn matches_instance(&self, instance_id: &str) -> bool {
        self.id.as_str() == instance_id
            || self
                .hello
                .as_ref()
                .and_then(|h| h.instance_id.as_deref())
                .is_some_and(|id| id == instance_id)
    }
}

/// Serializable view of a connection for status reporting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin_version: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub idle_ms: u64,
    pub pending_tasks: usize,
}

/// Single chokepoint for plugin connect/disconnect events.
pub struct ConnectionManager {
    connections: DashMap<ConnectionId, PluginConnection>,
    next_sequence: AtomicU64,
    registry: Arc<TaskRegistry>,
}

impl ConnectionManager {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self {
            connections: DashMap::new(),
            next_sequence: AtomicU64::new(1),
            registry,
        }
    }

    /// Track a freshly accepted socket. It cannot receive tasks until
    /// `mark_ready`.
    pub fn accept(&self, outbound: UnboundedSender<String>) -> ConnectionId {
        let id = ConnectionId::generate();
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        self.connections.insert(
            id.clone(),
            PluginConnection {
                id: id.clone(),
                sequence,
                state: ConnectionState::Connecting,
                hello: None,
                connected_at: Utc::now(),
                last_seen: Instant::now(),
                outbound,
            },
        );
        tracing::debug!(connection = %id, sequence, "plugin socket accepted");
        id
    }

    /// Complete the handshake. Only valid from `Connecting`.
    ///
    /// The welcome frame is queued while the entry is still locked, so it is
    /// always the first frame the plugin sees ahead of any task.
    pub fn mark_ready(&self, id: &ConnectionId, hello: PluginHello) -> Result<(), LifecycleError> {
        let mut conn = self
            .connections
            .get_mut(id)
            .ok_or_else(|| LifecycleError::UnknownConnection(id.clone()))?;
        if conn.state != ConnectionState::Connecting {
            return Err(LifecycleError::InvalidTransition {
                id: id.clone(),
                state: conn.state.as_str(),
            });
        }
        tracing::info!(
            connection = %id,
            instance = hello.instance_id.as_deref().unwrap_or("-"),
            file = hello.file_name.as_deref().unwrap_or("-"),
            "plugin instance ready"
        );
        let welcome = ServerMessage::Welcome {
            connection_id: id.clone(),
        };
        match protocol::encode(&welcome) {
            Ok(frame) => {
                if conn.outbound.send(frame).is_err() {
                    tracing::debug!(connection = %id, "socket writer gone before welcome");
                }
            }
            Err(e) => tracing::warn!(connection = %id, "could not encode welcome: {e}"),
        }
        conn.state = ConnectionState::Ready;
        conn.hello = Some(hello);
        conn.last_seen = Instant::now();
        Ok(())
    }

    /// Drop the connection (it reads as `Closed` from then on) and fail every
    /// task pending on it. Returns false if the connection was already closed or never existed.
    pub fn close(&self, id: &ConnectionId, reason: &str) -> bool {
        // Remove first so no dispatch can select this connection while its
        // pending tasks are being failed.
        let Some((_, conn)) = self.connections.remove(id) else {
            return false;
        };
        let previous = conn.state;
        let failed = self.registry.fail_all_for_connection(id, reason);
        tracing::info!(
            connection = %id,
            from = previous.as_str(),
            failed_tasks = failed,
            reason,
            "plugin connection closed"
        );
        true
    }

    /// Close every connection. Returns how many were open.
    pub fn close_all(&self, reason: &str) -> usize {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|c| c.id.clone()).collect();
        ids.iter().filter(|id| self.close(id, reason)).count()
    }

    /// Record inbound activity on a connection.
    pub fn touch(&self, id: &ConnectionId) {
        if let Some(mut conn) = self.connections.get_mut(id) {
            conn.last_seen = Instant::now();
        }
    }

    /// Closed connections leave the map, so any unknown id reads as `Closed`.
    pub fn state(&self, id: &ConnectionId) -> ConnectionState {
        self.connections
            .get(id)
            .map(|c| c.state)
            .unwrap_or(ConnectionState::Closed)
    }

    pub fn ready_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|c| c.state == ConnectionState::Ready)
            .count()
    }

    /// Pick the connection a task should go to.
    ///
    /// With an explicit `instance_id`, the newest Ready connection whose
    /// handshake instance id (or connection id) matches. Without one, the
    /// most recently connected Ready connection.
    pub fn select_target(&self, instance_id: Option<&str>) -> Result<ConnectionId, BridgeError> {
        let mut any_ready = false;
        let mut best: Option<(u64, ConnectionId)> = None;

        for conn in self.connections.iter() {
            if conn.state != ConnectionState::Ready {
                continue;
            }
            any_ready = true;
            if let Some(wanted) = instance_id
                && !conn.matches_instance(wanted)
            {
                continue;
            }
            if best.as_ref().is_none_or(|(seq, _)| conn.sequence > *seq) {
                best = Some((conn.sequence, conn.id.clone()));
            }
        }

        match (best, instance_id) {
            (Some((_, id)), _) => Ok(id),
            (None, Some(wanted)) if any_ready => Err(BridgeError::UnknownInstance(wanted.to_string())),
            (None, _) => Err(BridgeError::NotConnected),
        }
    }

    /// Outbound queue of a Ready connection.
    pub(crate) fn outbound_for(
        &self,
        id: &ConnectionId,
    ) -> Result<UnboundedSender<String>, TransportError> {
        match self.connections.get(id) {
            Some(conn) if conn.state == ConnectionState::Ready => Ok(conn.outbound.clone()),
            _ => Err(TransportError::ConnectionNotFound(id.clone())),
        }
    }

    /// Connections ordered newest first.
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let now = Instant::now();
        let mut items: Vec<(u64, ConnectionInfo)> = self
            .connections
            .iter()
            .map(|conn| {
                let hello = conn.hello.clone().unwrap_or_default();
                let info = ConnectionInfo {
                    connection_id: conn.id.clone(),
                    state: conn.state,
                    instance_id: hello.instance_id,
                    file_name: hello.file_name,
                    page_name: hello.page_name,
                    plugin_version: hello.plugin_version,
                    connected_at: conn.connected_at,
                    idle_ms: now.saturating_duration_since(conn.last_seen).as_millis() as u64,
                    pending_tasks: 0,
                };
                (conn.sequence, info)
            })
            .collect();
        items.sort_by(|a, b| b.0.cmp(&a.0));
        items
            .into_iter()
            .map(|(_, mut info)| {
                info.pending_tasks = self.registry.pending_for(&info.connection_id);
                info
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Deadline;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn manager() -> (ConnectionManager, Arc<TaskRegistry>) {
        let registry = Arc::new(TaskRegistry::new());
        (ConnectionManager::new(registry.clone()), registry)
    }

    fn hello(instance: &str) -> PluginHello {
        PluginHello {
            instance_id: Some(instance.to_string()),
            ..Default::default()
        }
    }

    fn connect_ready(mgr: &ConnectionManager, instance: &str) -> ConnectionId {
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = mgr.accept(tx);
        mgr.mark_ready(&id, hello(instance)).unwrap();
        id
    }

    #[test]
    fn handshake_moves_connecting_to_ready() {
        let (mgr, _) = manager();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = mgr.accept(tx);
        assert_eq!(mgr.state(&id), ConnectionState::Connecting);
        assert_eq!(mgr.ready_count(), 0);

        mgr.mark_ready(&id, PluginHello::default()).unwrap();
        assert_eq!(mgr.state(&id), ConnectionState::Ready);
        assert_eq!(mgr.ready_count(), 1);

        let err = mgr.mark_ready(&id, PluginHello::default()).unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidTransition { state: "ready", .. }));
    }

    #[test]
    fn ready_queues_welcome_first() {
        let (mgr, _) = manager();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = mgr.accept(tx);
        assert!(rx.try_recv().is_err());

        mgr.mark_ready(&id, hello("tab")).unwrap();
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame, format!(r#"{{"type":"welcome","connectionId":"{id}"}}"#));
    }

    #[test]
    fn closed_is_terminal() {
        let (mgr, _) = manager();
        let id = connect_ready(&mgr, "tab");
        assert!(mgr.close(&id, "socket closed"));
        assert!(!mgr.close(&id, "again"));
        assert_eq!(mgr.state(&id), ConnectionState::Closed);
        assert_eq!(
            mgr.mark_ready(&id, PluginHello::default()),
            Err(LifecycleError::UnknownConnection(id.clone()))
        );
    }

    #[tokio::test]
    async fn close_all_drops_outbound_queues() {
        let (mgr, registry) = manager();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = mgr.accept(tx);
        mgr.mark_ready(&id, hello("a")).unwrap();
        connect_ready(&mgr, "b");
        let pending = registry
            .register("t", &id, Deadline::after(Duration::from_secs(30)))
            .unwrap();

        assert_eq!(mgr.close_all("shutting down"), 2);
        assert_eq!(mgr.ready_count(), 0);
        assert_eq!(pending.await.unwrap().status, crate::task::TaskStatus::Disconnected);

        // Welcome frame, then the writer sees the queue end
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn handshake_failure_closes_connecting() {
        let (mgr, _) = manager();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = mgr.accept(tx);
        assert!(mgr.close(&id, "handshake timeout"));
        assert_eq!(mgr.state(&id), ConnectionState::Closed);
        // Closed connections are dropped, not kept around as entries
        assert!(mgr.snapshot().is_empty());
        assert!(!mgr.close(&id, "again"));
    }

    #[test]
    fn no_ready_connection_is_not_connected() {
        let (mgr, _) = manager();
        assert_eq!(mgr.select_target(None), Err(BridgeError::NotConnected));

        // A socket mid-handshake does not count
        let (tx, _rx) = mpsc::unbounded_channel();
        mgr.accept(tx);
        assert_eq!(mgr.select_target(None), Err(BridgeError::NotConnected));
        assert_eq!(mgr.select_target(Some("x")), Err(BridgeError::NotConnected));
    }

    #[test]
    fn most_recent_ready_connection_wins() {
        let (mgr, _) = manager();
        let first = connect_ready(&mgr, "first");
        let second = connect_ready(&mgr, "second");
        assert_eq!(mgr.select_target(None), Ok(second.clone()));

        mgr.close(&second, "tab closed");
        assert_eq!(mgr.select_target(None), Ok(first));
    }

    #[test]
    fn explicit_instance_selection() {
        let (mgr, _) = manager();
        let first = connect_ready(&mgr, "first");
        let second = connect_ready(&mgr, "second");
        assert_eq!(mgr.select_target(Some("first")), Ok(first));
        assert_eq!(mgr.select_target(Some(second.as_str())), Ok(second));
        assert_eq!(
            mgr.select_target(Some("third")),
            Err(BridgeError::UnknownInstance("third".into()))
        );
    }

    #[test]
    fn outbound_requires_ready() {
        let (mgr, _) = manager();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = mgr.accept(tx);
        assert_eq!(
            mgr.outbound_for(&id).unwrap_err(),
            TransportError::ConnectionNotFound(id.clone())
        );
        mgr.mark_ready(&id, PluginHello::default()).unwrap();
        assert!(mgr.outbound_for(&id).is_ok());
    }

    #[tokio::test]
    async fn close_fails_pending_tasks() {
        let (mgr, registry) = manager();
        let id = connect_ready(&mgr, "tab");
        let deadline = Deadline::after(Duration::from_secs(30));
        let rx1 = registry.register("t1", &id, deadline).unwrap();
        let rx2 = registry.register("t2", &id, deadline).unwrap();

        mgr.close(&id, "socket closed");
        assert_eq!(registry.pending_for(&id), 0);
        for rx in [rx1, rx2] {
            assert_eq!(
                rx.await.unwrap().status,
                crate::task::TaskStatus::Disconnected
            );
        }
    }

    #[test]
    fn snapshot_lists_newest_first_with_pending_counts() {
        let (mgr, registry) = manager();
        let old = connect_ready(&mgr, "old");
        let new = connect_ready(&mgr, "new");
        let _rx = registry
            .register("t", &old, Deadline::after(Duration::from_secs(30)))
            .unwrap();

        let snapshot = mgr.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].connection_id, new);
        assert_eq!(snapshot[0].pending_tasks, 0);
        assert_eq!(snapshot[1].instance_id.as_deref(), Some("old"));
        assert_eq!(snapshot[1].pending_tasks, 1);
    }
}
