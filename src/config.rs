//! Configuration loading and persistence.
//!
//! Settings live in `config.json` inside [`Config::config_dir`]. Every field
//! has a default, so a missing file is not an error, and the `PLUGDIR_*`
//! environment variables override whatever the file says.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use std::{fs, path::PathBuf};

use crate::constants::{DEFAULT_SOCKET_MODE, POLL_INTERVAL, PROBE_TIMEOUT};

/// Configuration shared by plugin processes and callers.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Discovery directory holding one socket per plugin.
    pub plugins_dir: PathBuf,
    /// Per-socket connect probe budget, in milliseconds.
    pub probe_timeout_ms: u64,
    /// Interval between rescans while waiting or watching, in milliseconds.
    pub poll_interval_ms: u64,
    /// Mode applied to sockets a plugin binds.
    pub socket_mode: u32,
}

impl Default for Config {
    fn default() -> Self {
        let plugins_dir = dirs::home_dir()
            .map(|h| h.join(".plugdir").join("plugins"))
            .unwrap_or_else(|| {
                log::warn!("Could not determine home directory for plugins_dir");
                PathBuf::from(".plugdir/plugins")
            });

        Self {
            plugins_dir,
            probe_timeout_ms: PROBE_TIMEOUT.as_millis() as u64,
            poll_interval_ms: POLL_INTERVAL.as_millis() as u64,
            socket_mode: DEFAULT_SOCKET_MODE,
        }
    }
}

impl Config {
    /// Returns the configuration directory path.
    ///
    /// `PLUGDIR_CONFIG_DIR` wins; otherwise the platform config dir
    /// (e.g. `~/.config/plugdir`).
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("PLUGDIR_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("plugdir"))
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = match Self::config_dir() {
            Ok(dir) => Self::load_from(&dir.join("config.json"))?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Read `path`, falling back to defaults if it does not exist.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid config: {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("PLUGDIR_PLUGINS_DIR") {
            self.plugins_dir = PathBuf::from(dir);
        }

        if let Ok(timeout) = std::env::var("PLUGDIR_PROBE_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse::<u64>() {
                self.probe_timeout_ms = ms;
            }
        }

        if let Ok(interval) = std::env::var("PLUGDIR_POLL_INTERVAL_MS") {
            if let Ok(ms) = interval.parse::<u64>() {
                self.poll_interval_ms = ms;
            }
        }
    }

    /// Persists the current configuration to disk.
    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config dir: {}", dir.display()))?;
        let config_path = dir.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;

        // Set restrictive permissions (owner read/write only)
        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Probe budget as a `Duration`.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Poll interval as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
