//! Bridge configuration management
//!
//! Loads TOML configuration with defaults for missing values, validates it,
//! and applies `MT5_BRIDGE_*` environment overrides on top.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Subtrees of the vendor installation worth keeping in the template
pub const DEFAULT_KEEP_SUBTREES: &[&str] = &["Config", "MQL5", "Sounds", "Profiles", "Templates"];

/// Bridge configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Host to bind to (default: 127.0.0.1)
    pub host: String,

    /// Port to listen on (default: 3000)
    pub port: u16,

    /// Log level (debug, info, warn, error)
    pub log_level: String,

    /// Shared API token; when set, requests must carry it in `x-api-token`
    pub bridge_token: Option<String>,

    /// Filesystem root under which the template and session dirs live
    pub sessions_base_path: PathBuf,

    /// Absolute path to the vendor terminal executable used as template source
    pub portable_terminal_path: PathBuf,

    /// Worker executable; defaults to the `mt5-worker` binary next to the server
    pub worker_command: Option<PathBuf>,

    /// Installation subtrees replicated into the template
    pub template_keep_subtrees: Vec<String>,

    /// Idle age after which the reaper evicts a session (default: 3600)
    pub session_idle_timeout_seconds: u64,

    /// Reaper wake-up interval (default: 60)
    pub reaper_interval_seconds: u64,

    /// Per-command round-trip budget (default: 30)
    pub command_timeout_seconds: u64,

    /// Budget for the worker's init line after spawn (default: 60)
    pub init_timeout_seconds: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let data_root = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mt5-bridge");

        let terminal = if cfg!(windows) {
            PathBuf::from(r"C:\MT5_portable\terminal64.exe")
        } else {
            PathBuf::from("/opt/mt5/terminal64.exe")
        };

        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            bridge_token: None,
            sessions_base_path: data_root.join("sessions"),
            portable_terminal_path: terminal,
            worker_command: None,
            template_keep_subtrees: DEFAULT_KEEP_SUBTREES.iter().map(|s| s.to_string()).collect(),
            session_idle_timeout_seconds: 3600,
            reaper_interval_seconds: 60,
            command_timeout_seconds: 30,
            init_timeout_seconds: 60,
        }
    }
}

impl BridgeConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("Invalid port: {} (must be 1-65535)", self.port);
        }

        match self.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            level => anyhow::bail!(
                "Invalid log level: {} (must be trace, debug, info, warn, or error)",
                level
            ),
        }

        if self.session_idle_timeout_seconds == 0 {
            anyhow::bail!("session_idle_timeout_seconds must be greater than 0");
        }
        if self.reaper_interval_seconds == 0 {
            anyhow::bail!("reaper_interval_seconds must be greater than 0");
        }
        if self.command_timeout_seconds == 0 {
            anyhow::bail!("command_timeout_seconds must be greater than 0");
        }
        if self.init_timeout_seconds == 0 {
            anyhow::bail!("init_timeout_seconds must be greater than 0");
        }
        if self.sessions_base_path.as_os_str().is_empty() {
            anyhow::bail!("sessions_base_path must not be empty");
        }
        if self.portable_terminal_path.as_os_str().is_empty() {
            anyhow::bail!("portable_terminal_path must not be empty");
        }

        Ok(())
    }

    /// Load configuration from file, with defaults for missing values
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents =
            std::fs::read_to_string(path).context("Failed to read configuration file")?;

        let config: Self = toml::from_str(&contents).context("Failed to parse configuration file")?;

        config.validate()?;

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create configuration directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        std::fs::write(path, contents).context("Failed to write configuration file")?;

        Ok(())
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "host" => self.host = value.to_string(),
            "port" => self.port = value.parse().context("Failed to parse port")?,
            "log_level" => self.log_level = value.to_string(),
            "bridge_token" => {
                self.bridge_token = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "sessions_base_path" => self.sessions_base_path = PathBuf::from(value),
            "portable_terminal_path" => self.portable_terminal_path = PathBuf::from(value),
            "worker_command" => {
                self.worker_command = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            "template_keep_subtrees" => {
                self.template_keep_subtrees = value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            "session_idle_timeout_seconds" => {
                self.session_idle_timeout_seconds = value
                    .parse()
                    .context("Failed to parse session_idle_timeout_seconds")?;
            }
            "reaper_interval_seconds" => {
                self.reaper_interval_seconds = value
                    .parse()
                    .context("Failed to parse reaper_interval_seconds")?;
            }
            "command_timeout_seconds" => {
                self.command_timeout_seconds = value
                    .parse()
                    .context("Failed to parse command_timeout_seconds")?;
            }
            "init_timeout_seconds" => {
                self.init_timeout_seconds =
                    value.parse().context("Failed to parse init_timeout_seconds")?;
            }
            _ => anyhow::bail!("Unknown configuration key: {}", key),
        }

        Ok(())
    }

    /// Apply `MT5_BRIDGE_<KEY>` environment overrides on top of the loaded file
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        const KEYS: &[&str] = &[
            "host",
            "port",
            "log_level",
            "bridge_token",
            "sessions_base_path",
            "portable_terminal_path",
            "worker_command",
            "template_keep_subtrees",
            "session_idle_timeout_seconds",
            "reaper_interval_seconds",
            "command_timeout_seconds",
            "init_timeout_seconds",
        ];

        for key in KEYS {
            let var = format!("MT5_BRIDGE_{}", key.to_uppercase());
            if let Ok(value) = std::env::var(&var) {
                self.set(key, &value)
                    .with_context(|| format!("Invalid value in {}", var))?;
            }
        }

        self.validate()
    }

    /// Load from the default location, then apply environment overrides
    pub fn load_with_env(path: &Path) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Default configuration file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mt5-bridge")
            .join("config.toml")
    }

    /// Template directory derived from the sessions root
    pub fn template_dir(&self) -> PathBuf {
        self.sessions_base_path.join("_template")
    }

    /// File name of the terminal executable, e.g. `terminal64.exe`
    pub fn terminal_file_name(&self) -> String {
        self.portable_terminal_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| {
                warn!(
                    path = %self.portable_terminal_path.display(),
                    "portable_terminal_path has no file name, assuming terminal64.exe"
                );
                "terminal64.exe".to_string()
            })
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_seconds)
    }
}
