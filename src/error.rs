//! Error types for the plugin bridge.
//!
//! None of these cross `PluginTaskBridge::dispatch`: the bridge folds them
//! into a `TaskResult` status. They exist so the layers underneath can
//! report precisely what went wrong.

use thiserror::Error;

use crate::connection::ConnectionId;

/// Failure to hand an envelope to a plugin connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Unknown id, or the connection has not completed its handshake.
    #[error("plugin connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    /// The socket writer is gone (connection dropped between lookup and send).
    #[error("plugin connection closed: {0}")]
    ConnectionClosed(ConnectionId),

    /// The envelope could not be framed.
    #[error("failed to encode envelope: {0}")]
    Encode(String),
}

impl TransportError {
    /// True when the failure means the connection itself is gone, as opposed
    /// to a framing problem on our side.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionNotFound(_) | TransportError::ConnectionClosed(_)
        )
    }
}

/// Task registry misuse. Only reachable through a bug in the bridge.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("task already registered: {0}")]
    DuplicateTask(String),
}

/// Invalid connection lifecycle transition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("unknown plugin connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("plugin connection {id} is {state}, expected connecting")]
    InvalidTransition { id: ConnectionId, state: &'static str },
}

/// Reasons a dispatch cannot pick a target connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("No Penpot plugin instances are currently connected")]
    NotConnected,

    #[error("No connected Penpot plugin instance matches '{0}'")]
    UnknownInstance(String),
}

/// Configuration loading failures that should stop startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write config {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config value: {0}")]
    Invalid(String),
}
