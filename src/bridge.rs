//! Plugin task bridge: the only entry point callers use to run work inside
//! a connected plugin.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::connection::{ConnectionId, ConnectionManager};
use crate::error::{LifecycleError, RegistryError};
use crate::protocol::{PluginMessage, TaskEnvelope, TaskResponse};
use crate::registry::{Deadline, ResultReceiver, TaskRegistry};
use crate::task::{Task, TaskRequest, TaskResult};
use crate::transport::Transport;

/// Default per-task timeout, matching what MCP clients observe.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound a caller may request.
pub const MAX_TASK_TIMEOUT: Duration = Duration::from_secs(300);

/// Attempts at drawing an unused correlation id before giving up.
const MAX_ID_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeSettings {
    pub default_timeout: Duration,
    pub max_timeout: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TASK_TIMEOUT,
            max_timeout: MAX_TASK_TIMEOUT,
        }
    }
}

pub struct PluginTaskBridge {
    registry: Arc<TaskRegistry>,
    connections: Arc<ConnectionManager>,
    transport: Arc<dyn Transport>,
    settings: BridgeSettings,
}

impl PluginTaskBridge {
    /// Bridge wired to its own registry and connection manager, with the
    /// manager as transport.
    pub fn new(settings: BridgeSettings) -> Self {
        let registry = Arc::new(TaskRegistry::new());
        let connections = Arc::new(ConnectionManager::new(registry.clone()));
        let transport: Arc<dyn Transport> = connections.clone();
        Self::with_transport(registry, connections, transport, settings)
    }

    pub fn with_transport(
        registry: Arc<TaskRegistry>,
        connections: Arc<ConnectionManager>,
        transport: Arc<dyn Transport>,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            registry,
            connections,
            transport,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn settings(&self) -> BridgeSettings {
        self.settings
    }

    /// Resolve the caller's timeout against the configured default and cap.
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        requested
            .filter(|t| !t.is_zero())
            .unwrap_or(self.settings.default_timeout)
            .min(self.settings.max_timeout)
    }

    /// Run a task on a connected plugin and wait for its outcome.
    ///
    /// Never fails and never hangs past the deadline: every outcome,
    /// including "nothing connected", comes back as a `TaskResult`.
    pub async fn dispatch(&self, request: TaskRequest, timeout: Option<Duration>) -> TaskResult {
        let timeout = self.effective_timeout(timeout);

        let target = match self.connections.select_target(request.instance_id.as_deref()) {
            Ok(id) => id,
            Err(e) => {
                tracing::debug!(kind = %request.kind, "dispatch rejected: {e}");
                return TaskResult::not_connected(e.to_string());
            }
        };

        let now = Instant::now();
        self.registry.sweep_expired(now);
        let deadline = Deadline::new(now, timeout);

        let (task_id, rx) = match self.register_fresh(&target, deadline) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(connection = %target, "could not register task: {e}");
                debug_assert!(false, "task id allocation failed: {e}");
                return TaskResult::internal(e.to_string());
            }
        };

        let task = Task::from_request(task_id, request);
        tracing::debug!(
            task = %task.id,
            kind = %task.kind,
            connection = %target,
            timeout_ms = timeout.as_millis() as u64,
            "dispatching task"
        );

        if let Err(e) = self.transport.send(&target, TaskEnvelope::from(&task)) {
            tracing::warn!(task = %task.id, connection = %target, "send failed: {e}");
            let result = if e.is_connection_loss() {
                TaskResult::disconnected(e.to_string())
            } else {
                TaskResult::transport_error(e.to_string())
            };
            // May lose to a concurrent disconnect; either way rx is ready now.
            self.registry.resolve(&task.id, result);
        }

        self.await_result(&task.id, rx, deadline).await
    }

    /// Route one decoded frame from a plugin socket.
    ///
    /// `hello` completes the handshake; a `task-response` resolves its task
    /// whichever connection it arrived on, since correlation ids are unique.
    pub fn handle_plugin_message(
        &self,
        connection_id: &ConnectionId,
        message: PluginMessage,
    ) -> Result<(), LifecycleError> {
        match message {
            PluginMessage::Hello(hello) => self.connections.mark_ready(connection_id, hello),
            PluginMessage::TaskResponse(response) => {
                self.handle_response(connection_id, response);
                Ok(())
            }
        }
    }

    /// Deliver a plugin reply. Returns false when the reply matched nothing
    /// in flight (duplicate, late after timeout, or never dispatched).
    pub fn handle_response(&self, connection_id: &ConnectionId, response: TaskResponse) -> bool {
        let task_id = response.correlation_id.clone();
        let delivered = self.registry.resolve(&task_id, response.into_result());
        if delivered {
            tracing::debug!(task = %task_id, connection = %connection_id, "task resolved");
        } else {
            tracing::debug!(
                task = %task_id,
                connection = %connection_id,
                "dropping reply for unknown or completed task"
            );
        }
        delivered
    }

    /// Periodically expire overdue entries so tasks whose callers stopped
    /// waiting don't linger.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let expired = registry.sweep_expired(Instant::now());
                if expired > 0 {
                    tracing::debug!(expired, "sweeper expired tasks");
                }
            }
        })
    }

    fn register_fresh(
        &self,
        target: &ConnectionId,
        deadline: Deadline,
    ) -> Result<(String, ResultReceiver), RegistryError> {
        let mut last_err = None;
        for _ in 0..MAX_ID_ATTEMPTS {
            let task_id = uuid::Uuid::new_v4().to_string();
            match self.registry.register(&task_id, target, deadline) {
                Ok(rx) => return Ok((task_id, rx)),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| RegistryError::DuplicateTask(String::new())))
    }

    async fn await_result(&self, task_id: &str, mut rx: ResultReceiver, deadline: Deadline) -> TaskResult {
        let outcome = tokio::select! {
            res = &mut rx => res,
            _ = tokio::time::sleep_until(deadline.at) => {
                // The registry decides: if a reply got in first, rx holds it.
                self.registry.sweep_expired(Instant::now());
                rx.await
            }
        };
        outcome.unwrap_or_else(|_| {
            TaskResult::internal("task resolver dropped without a result").with_task_id(task_id)
        })
    }
}
