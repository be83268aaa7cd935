pub mod bridge;
pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod mcp_http;
pub mod protocol;
pub mod registry;
pub mod state;
pub mod task;
pub mod transport;

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub use bridge::{BridgeSettings, PluginTaskBridge};
pub use config::BridgeConfig;
pub use state::AppState;
pub use task::{TaskRequest, TaskResult, TaskStatus};

/// Time given to in-flight HTTP and socket handlers after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Both listeners plus the registry sweeper, running.
pub struct Server {
    state: Arc<AppState>,
    mcp_addr: SocketAddr,
    plugin_addr: SocketAddr,
    servers: Vec<JoinHandle<std::io::Result<()>>>,
    sweeper: JoinHandle<()>,
}

impl Server {
    /// Bind both ports and start serving. Port 0 picks a free port.
    pub async fn start(config: BridgeConfig) -> anyhow::Result<Self> {
        config.validate().context("invalid configuration")?;
        let mcp_bind = format!("{}:{}", config.host, config.mcp_port);
        let plugin_bind = format!("{}:{}", config.host, config.plugin_port);

        let mcp_listener = TcpListener::bind(&mcp_bind)
            .await
            .with_context(|| format!("failed to bind MCP HTTP on {mcp_bind}"))?;
        let plugin_listener = TcpListener::bind(&plugin_bind)
            .await
            .with_context(|| format!("failed to bind plugin socket on {plugin_bind}"))?;
        let mcp_addr = mcp_listener.local_addr()?;
        let plugin_addr = plugin_listener.local_addr()?;

        let sweep_interval = config.sweep_interval();
        let state = AppState::new(config);
        let sweeper = state.bridge.spawn_sweeper(sweep_interval);

        let servers = vec![
            tokio::spawn(mcp_http::serve_mcp(state.clone(), mcp_listener)),
            tokio::spawn(mcp_http::serve_plugin(state.clone(), plugin_listener)),
        ];

        Ok(Self {
            state,
            mcp_addr,
            plugin_addr,
            servers,
            sweeper,
        })
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn mcp_addr(&self) -> SocketAddr {
        self.mcp_addr
    }

    pub fn plugin_addr(&self) -> SocketAddr {
        self.plugin_addr
    }

    /// Stop both listeners, fail pending tasks, and wait for the servers
    /// to drain (bounded by a grace period).
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.state.shutdown();
        self.sweeper.abort();

        for server in self.servers {
            let abort = server.abort_handle();
            match tokio::time::timeout(SHUTDOWN_GRACE, server).await {
                Ok(Ok(result)) => result.context("server error")?,
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => return Err(anyhow::Error::new(e).context("server task panicked")),
                Err(_) => {
                    tracing::warn!("server did not drain within {SHUTDOWN_GRACE:?}, aborting");
                    abort.abort();
                }
            }
        }
        Ok(())
    }
}

/// Run until Ctrl-C.
pub async fn run(config: BridgeConfig) -> anyhow::Result<()> {
    let server = Server::start(config).await?;
    tracing::info!(
        mcp = %server.mcp_addr(),
        plugin = %server.plugin_addr(),
        "penpot-mcp {} ready",
        env!("CARGO_PKG_VERSION")
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("Ctrl-C received, shutting down");
    server.shutdown().await
}
