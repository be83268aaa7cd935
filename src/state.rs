use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::bridge::PluginTaskBridge;
use crate::config::BridgeConfig;

/// Shared state behind every HTTP and WebSocket handler.
pub struct AppState {
    pub bridge: Arc<PluginTaskBridge>,
    pub config: RwLock<BridgeConfig>,
    /// MCP SSE sessions: session_id -> channel feeding the SSE stream
    pub(crate) mcp_sse_sessions: DashMap<String, mpsc::UnboundedSender<String>>,
    pub started_at: DateTime<Utc>,
    shutdown_tx: watch::Sender<bool>,
}

impl AppState {
    pub fn new(config: BridgeConfig) -> Arc<Self> {
        let bridge = Arc::new(PluginTaskBridge::new(config.bridge_settings()));
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            bridge,
            config: RwLock::new(config),
            mcp_sse_sessions: DashMap::new(),
            started_at: Utc::now(),
            shutdown_tx,
        })
    }

    /// Ask both listeners to stop, close plugin sockets (failing their
    /// pending tasks) and end open SSE streams.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let closed = self.bridge.connections().close_all("server shutting down");
        self.mcp_sse_sessions.clear();
        tracing::info!(plugin_connections = closed, "shutdown requested");
    }

    /// Resolves once `shutdown` has been called.
    pub async fn shutdown_signal(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        // Err means the sender is gone, which only happens with the state itself
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn bridge_uses_configured_timeouts() {
        let state = AppState::new(BridgeConfig {
            task_timeout_ms: 1_000,
            max_task_timeout_ms: 2_000,
            ..Default::default()
        });
        let settings = state.bridge.settings();
        assert_eq!(settings.default_timeout, Duration::from_secs(1));
        assert_eq!(settings.max_timeout, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn shutdown_signal_fires_after_shutdown() {
        let state = AppState::new(BridgeConfig::default());
        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.shutdown_signal().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        state.shutdown();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("signal fired")
            .unwrap();
    }

    #[tokio::test]
    async fn late_subscriber_sees_earlier_shutdown() {
        let state = AppState::new(BridgeConfig::default());
        state.shutdown();
        tokio::time::timeout(Duration::from_secs(1), state.shutdown_signal())
            .await
            .expect("already shut down");
    }
}
