use crate::core::error::Family;
use crate::core::shell::DEFAULT_TIMEOUT_SECS;
use crate::utils::{get_data_dir, write_private_atomic};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Bounds applied to `command_timeout_secs`
pub const MIN_TIMEOUT_SECS: u64 = 1;
pub const MAX_TIMEOUT_SECS: u64 = 300;

const CONFIG_FILE: &str = "config.json";

/// Persistent application configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Seconds a single firewall command may take before the root shell is
    /// considered wedged (clamped to 1..=300)
    #[serde(default = "default_timeout")]
    pub command_timeout_secs: u64,
    /// Install the postrouting masquerade chain for marked traffic
    #[serde(default = "default_true")]
    pub masquerade: bool,
    #[serde(default = "default_iptables")]
    pub iptables_command: String,
    #[serde(default = "default_ip6tables")]
    pub ip6tables_command: String,
    /// Append privileged operations to the audit log (opt-in, disabled by default)
    #[serde(default)]
    pub enable_audit_log: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: DEFAULT_TIMEOUT_SECS,
            masquerade: true,
            iptables_command: default_iptables(),
            ip6tables_command: default_ip6tables(),
            enable_audit_log: false, // Opt-in only for privacy/disk space
        }
    }
}

impl AppConfig {
    pub fn timeout_secs(&self) -> u64 {
        self.command_timeout_secs
            .clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS)
    }

    /// Binary used for `family`; blank values fall back to the build default
    pub fn binary(&self, family: Family) -> &str {
        let configured = match family {
            Family::V4 => &self.iptables_command,
            Family::V6 => &self.ip6tables_command,
        };
        if configured.trim().is_empty() {
            family.default_binary()
        } else {
            configured
        }
    }
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_true() -> bool {
    true
}

fn default_iptables() -> String {
    Family::V4.default_binary().to_string()
}

fn default_ip6tables() -> String {
    Family::V6.default_binary().to_string()
}

/// Location of `config.json` in the data directory
pub fn config_path() -> Option<PathBuf> {
    get_data_dir().map(|dir| dir.join(CONFIG_FILE))
}

/// Saves the config to the data directory, see [`save_config_to`]
pub async fn save_config(config: &AppConfig) -> std::io::Result<()> {
    match config_path() {
        Some(path) => save_config_to(config, &path).await,
        None => Ok(()),
    }
}

/// Saves the config to `path`, atomically and readable by the owner only
pub async fn save_config_to(config: &AppConfig, path: &Path) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    write_private_atomic(path, json.as_bytes()).await
}

/// Loads the config from the data directory, or returns default if not found
pub async fn load_config() -> AppConfig {
    match config_path() {
        Some(path) => load_config_from(&path).await,
        None => AppConfig::default(),
    }
}

/// Loads the config from `path`; a missing or unreadable file yields defaults
pub async fn load_config_from(path: &Path) -> AppConfig {
    match tokio::fs::read_to_string(path).await {
        Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), "Ignoring invalid config: {e}");
            AppConfig::default()
        }),
        Err(_) => AppConfig::default(),
    }
}
