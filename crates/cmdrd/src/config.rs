//! Daemon configuration.
//!
//! Loads settings from /etc/cmdr/config.toml or falls back to defaults.
//! Targets for the standalone daemon can be declared inline; in the managed
//! deployment the management layer owns them and this list stays empty.

use anyhow::{Context, Result};
use cmdr_common::ai_client::AiConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Config file path.
pub const CONFIG_PATH: &str = "/etc/cmdr/config.toml";

/// SSH transport bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Connect + handshake + auth bound.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Per-command execution bound.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_command_timeout() -> u64 {
    60
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

/// Ledger storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    "/var/lib/cmdr/ledger.db".to_string()
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Chat/orchestration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Most-recent-N history turns forwarded to the intent parser.
    #[serde(default = "default_max_history")]
    pub max_history: usize,

    /// Lifetime of a pending confirmation before it counts as declined.
    #[serde(default = "default_confirmation_ttl")]
    pub confirmation_ttl_secs: u64,
}

fn default_max_history() -> usize {
    20
}

fn default_confirmation_ttl() -> u64 {
    120
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_history: default_max_history(),
            confirmation_ttl_secs: default_confirmation_ttl(),
        }
    }
}

/// Inline target declaration for the standalone daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetEntry {
    pub id: i64,
    pub name: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    /// Owning operator id; inline targets default to operator 1.
    #[serde(default = "default_owner")]
    pub user_id: i64,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_owner() -> i64 {
    1
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommanderConfig {
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub targets: Vec<TargetEntry>,
}

impl CommanderConfig {
    /// Load from a path, parsing strictly.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: CommanderConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load from the default path, warning and falling back to defaults
    /// when the file is missing or unreadable.
    pub fn load_or_default() -> Self {
        let path = Path::new(CONFIG_PATH);
        if !path.exists() {
            info!("No config at {CONFIG_PATH}, using defaults");
            return Self::default();
        }
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!("Config load failed ({e:#}); using defaults");
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CommanderConfig::default();
        assert_eq!(config.ssh.connect_timeout_secs, 15);
        assert_eq!(config.ssh.command_timeout_secs, 60);
        assert_eq!(config.chat.max_history, 20);
        assert_eq!(config.chat.confirmation_ttl_secs, 120);
        assert!(config.targets.is_empty());
    }

    #[test]
    fn test_parse_partial_config() {
        let raw = r#"
            [ssh]
            command_timeout_secs = 10

            [[targets]]
            id = 7
            name = "db-01"
            host = "10.0.0.5"
            username = "ops"
            password = "s3cret"
        "#;
        let config: CommanderConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.ssh.command_timeout_secs, 10);
        assert_eq!(config.ssh.connect_timeout_secs, 15);
        assert_eq!(config.targets.len(), 1);
        assert_eq!(config.targets[0].port, 22);
        assert_eq!(config.targets[0].user_id, 1);
    }
}
