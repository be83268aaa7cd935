//! In-flight task bookkeeping.
//!
//! The registry is the single source of truth for which tasks are awaiting a
//! reply. Every entry leaves the map exactly once: by `resolve`, by
//! `fail_all_for_connection`, or by `sweep_expired`, whichever gets the lock
//! first. Every later attempt finds nothing and is a no-op.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::connection::ConnectionId;
use crate::error::RegistryError;
use crate::task::TaskResult;

/// Receiving half handed back to the dispatcher.
pub type ResultReceiver = oneshot::Receiver<TaskResult>;

/// When a task expires, together with the timeout the caller asked for.
///
/// The requested duration travels with the instant so the timeout message
/// reports it exactly instead of re-deriving it from the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    pub at: Instant,
    pub timeout: Duration,
}

impl Deadline {
    pub fn new(start: Instant, timeout: Duration) -> Self {
        Self {
            at: start + timeout,
            timeout,
        }
    }

    /// `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self::new(Instant::now(), timeout)
    }
}

/// Bookkeeping record for one in-flight task.
#[derive(Debug)]
pub struct PendingEntry {
    pub task_id: String,
    pub connection_id: ConnectionId,
    pub deadline: Deadline,
    resolver: oneshot::Sender<TaskResult>,
}

impl PendingEntry {
    /// Hand the result to the waiting caller. The caller may have stopped
    /// listening; that is fine, the entry is gone either way.
    fn complete(self, result: TaskResult) {
        let result = result.with_task_id(self.task_id);
        let _ = self.resolver.send(result);
    }
}

#[derive(Default)]
pub struct TaskRegistry {
    entries: Mutex<HashMap<String, PendingEntry>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending task. Fails only if the id is already present,
    /// which means the id generator is broken.
    pub fn register(
        &self,
        task_id: &str,
        connection_id: &ConnectionId,
        deadline: Deadline,
    ) -> Result<ResultReceiver, RegistryError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(task_id) {
            return Err(RegistryError::DuplicateTask(task_id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        entries.insert(
            task_id.to_string(),
            PendingEntry {
                task_id: task_id.to_string(),
                connection_id: connection_id.clone(),
                deadline,
                resolver: tx,
            },
        );
        Ok(rx)
    }

    /// Complete a task with `result`. Returns false when the entry was
    /// already completed (duplicate delivery, or lost a race with a timeout
    /// or disconnect) or was never registered.
    pub fn resolve(&self, task_id: &str, result: TaskResult) -> bool {
        let entry = self.entries.lock().remove(task_id);
        match entry {
            Some(entry) => {
                entry.complete(result);
                true
            }
            None => false,
        }
    }

    /// Fail every task bound to `connection_id` with `Disconnected`.
    /// Returns how many entries were failed.
    pub fn fail_all_for_connection(&self, connection_id: &ConnectionId, reason: &str) -> usize {
        let failed: Vec<PendingEntry> = {
            let mut entries = self.entries.lock();
            let ids: Vec<String> = entries
                .values()
                .filter(|e| &e.connection_id == connection_id)
                .map(|e| e.task_id.clone())
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };

        let count = failed.len();
        for entry in failed {
            let message = format!("Plugin connection {connection_id} closed: {reason}");
            entry.complete(TaskResult::disconnected(message));
        }
        if count > 0 {
            tracing::warn!(connection = %connection_id, count, reason, "failed pending tasks on disconnect");
        }
        count
    }

    /// Fail every task whose deadline is at or before `now` with `Timeout`.
    /// Returns how many entries expired.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let expired: Vec<PendingEntry> = {
            let mut entries = self.entries.lock();
            let ids: Vec<String> = entries
                .values()
                .filter(|e| e.deadline.at <= now)
                .map(|e| e.task_id.clone())
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };

        let count = expired.len();
        for entry in expired {
            tracing::debug!(task = %entry.task_id, connection = %entry.connection_id, "task deadline elapsed");
            let timeout_ms = entry.deadline.timeout.as_millis() as u64;
            entry.complete(TaskResult::timeout(timeout_ms));
        }
        count
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.entries.lock().contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Number of in-flight tasks bound to one connection.
    pub fn pending_for(&self, connection_id: &ConnectionId) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|e| &e.connection_id == connection_id)
            .count()
    }

    /// Earliest deadline among pending tasks.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.lock().values().map(|e| e.deadline.at).min()
    }
}
