use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bridge::BridgeSettings;
use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.json";

/// Upper bound for every `*_ms` setting (1 hour).
pub const MAX_DURATION_MS: u64 = 60 * 60 * 1000;

/// Platform config directory for the server.
///
/// - macOS: `~/Library/Application Support/penpot-mcp/`
/// - Linux: `~/.config/penpot-mcp/` (or `$XDG_CONFIG_HOME`)
/// - Windows: `%APPDATA%/penpot-mcp/`
///
/// Falls back to `~/.penpot-mcp/` if the platform dir is unavailable.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("penpot-mcp"))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".penpot-mcp")
        })
}

pub fn default_config_path() -> PathBuf {
    config_dir().join(CONFIG_FILE)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Interface both listeners bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// MCP HTTP port (0 = OS-assigned)
    #[serde(default = "default_mcp_port")]
    pub mcp_port: u16,
    /// Plugin WebSocket port (0 = OS-assigned)
    #[serde(default = "default_plugin_port")]
    pub plugin_port: u16,
    /// tracing filter directive, e.g. "info" or "penpot_mcp_lib=debug"
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    /// Cap applied to caller-supplied timeouts
    #[serde(default = "default_max_task_timeout_ms")]
    pub max_task_timeout_ms: u64,
    /// How long a fresh socket may stay silent before sending `hello`
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Close a plugin socket after this long without any inbound frame
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_mcp_port() -> u16 {
    4401
}

fn default_plugin_port() -> u16 {
    4402
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_task_timeout_ms() -> u64 {
    30_000
}

fn default_max_task_timeout_ms() -> u64 {
    300_000
}

fn default_handshake_timeout_ms() -> u64 {
    5_000
}

fn default_heartbeat_interval_ms() -> u64 {
    10_000
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            mcp_port: default_mcp_port(),
            plugin_port: default_plugin_port(),
            log_level: default_log_level(),
            task_timeout_ms: default_task_timeout_ms(),
            max_task_timeout_ms: default_max_task_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".into()));
        }
        if self.mcp_port != 0 && self.mcp_port == self.plugin_port {
            return Err(ConfigError::Invalid(format!(
                "mcp_port and plugin_port are both {}",
                self.mcp_port
            )));
        }
        for (name, value) in [
            ("task_timeout_ms", self.task_timeout_ms),
            ("max_task_timeout_ms", self.max_task_timeout_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("idle_timeout_ms", self.idle_timeout_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
            }
            if value > MAX_DURATION_MS {
                return Err(ConfigError::Invalid(format!(
                    "{name} ({value}) exceeds the {MAX_DURATION_MS}ms limit"
                )));
            }
        }
        if self.task_timeout_ms > self.max_task_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "task_timeout_ms ({}) exceeds max_task_timeout_ms ({})",
                self.task_timeout_ms, self.max_task_timeout_ms
            )));
        }
        if self.heartbeat_interval_ms >= self.idle_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "heartbeat_interval_ms ({}) must be shorter than idle_timeout_ms ({})",
                self.heartbeat_interval_ms, self.idle_timeout_ms
            )));
        }
        Ok(())
    }

    pub fn bridge_settings(&self) -> BridgeSettings {
        BridgeSettings {
            default_timeout: Duration::from_millis(self.task_timeout_ms),
            max_timeout: Duration::from_millis(self.max_task_timeout_ms),
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Strict read: errors when the file is unreadable or malformed.
pub fn read_config(path: &Path) -> Result<BridgeConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

/// Load the config file, returning defaults if missing or corrupt.
/// Prints a warning when the file exists but cannot be used. This runs
/// before the subscriber is installed, hence stderr rather than tracing.
pub fn load_config(path: &Path) -> BridgeConfig {
    if !path.exists() {
        return BridgeConfig::default();
    }
    match read_config(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: {e}. Using defaults.");
            BridgeConfig::default()
        }
    }
}

/// Save the config atomically (temp file + rename).
pub fn save_config(path: &Path, config: &BridgeConfig) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Write {
        path: path.display().to_string(),
        source,
    };
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(io_err)?;
    }

    let json = serde_json::to_string_pretty(config).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| CONFIG_FILE.to_string());
    let temp = path.with_file_name(format!("{file_name}.tmp.{}", std::process::id()));

    std::fs::write(&temp, &json).map_err(io_err)?;

    // Either the old file or the new one exists, never a partial write
    std::fs::rename(&temp, path).map_err(|e| {
        let _ = std::fs::remove_file(&temp);
        io_err(e)
    })?;

    Ok(())
}

/// Command line. Every flag overrides the matching config file value.
#[derive(Debug, Default, Parser)]
#[command(
    name = "penpot-mcp",
    version,
    about = "MCP server that runs tasks inside the Penpot plugin"
)]
pub struct Cli {
    /// Config file (default: platform config dir/penpot-mcp/config.json)
    #[arg(long, env = "PENPOT_MCP_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "PENPOT_MCP_HOST")]
    pub host: Option<String>,

    /// MCP HTTP port
    #[arg(long, env = "PENPOT_MCP_PORT")]
    pub mcp_port: Option<u16>,

    /// Plugin WebSocket port
    #[arg(long, env = "PENPOT_MCP_PLUGIN_PORT")]
    pub plugin_port: Option<u16>,

    /// Log filter; RUST_LOG takes precedence when set
    #[arg(long, env = "PENPOT_MCP_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Default task timeout in milliseconds
    #[arg(long, env = "PENPOT_MCP_TASK_TIMEOUT_MS")]
    pub task_timeout_ms: Option<u64>,

    /// Write the effective config to the config file and exit
    #[arg(long)]
    pub write_config: bool,
}

impl Cli {
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(default_config_path)
    }

    pub fn apply(&self, config: &mut BridgeConfig) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.mcp_port {
            config.mcp_port = port;
        }
        if let Some(port) = self.plugin_port {
            config.plugin_port = port;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if let Some(ms) = self.task_timeout_ms {
            config.task_timeout_ms = ms;
        }
    }

    /// File values with CLI overrides applied, validated.
    pub fn resolve(&self) -> Result<BridgeConfig, ConfigError> {
        let mut config = load_config(&self.config_path());
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }
}
