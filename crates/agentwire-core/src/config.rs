//! Configuration resolution for agentwire.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/agentwire/settings.json)
//! 3. Project config (.agentwire/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::ndjson::MAX_BUFFER_SIZE;

/// Complete agentwire configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

/// Transport and decoder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Explicit path to the agent CLI; skips discovery when set.
    pub cli_path: Option<PathBuf>,
    /// Ceiling for the decoder's raw buffer, in bytes.
    pub max_buffer_size: usize,
    /// Capacity of the message and error streams.
    pub channel_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            cli_path: None,
            max_buffer_size: MAX_BUFFER_SIZE,
            channel_capacity: 64,
        }
    }
}

/// Session queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Fallback poll interval for idle workers (milliseconds).
    pub poll_interval_ms: u64,
    /// How long `close` waits for workers before aborting them (seconds).
    pub shutdown_timeout_secs: u64,
    /// Finished messages retained per session.
    pub history_limit: usize,
    /// How long a worker drains a cancelled turn's output (seconds).
    pub drain_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            shutdown_timeout_secs: 10,
            history_limit: 100,
            drain_timeout_secs: 30,
        }
    }
}

impl QueueConfig {
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        config = merge_file(config, &global_path)?;
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".agentwire").join("settings.json");
        if project_path.exists() {
            config = merge_file(config, &project_path)?;
        }
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        dirs::home_dir().map(|h| h.join("Library/Application Support/agentwire/settings.json"))
    }
    #[cfg(not(target_os = "macos"))]
    {
        dirs::config_dir().map(|p| p.join("agentwire").join("settings.json"))
    }
}

/// Overlay a settings file on `base`.
///
/// Only keys present in the file override; the file is merged at the JSON
/// level so a partial file never resets unrelated fields to defaults.
fn merge_file(base: Config, path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let overlay: serde_json::Value = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;

    let mut merged = serde_json::to_value(base)?;
    merge_json(&mut merged, overlay);
    serde_json::from_value(merged).map_err(|e| {
        Error::Config(format!("Invalid config file {}: {}", path.display(), e))
    })
}

fn merge_json(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
            for (key, value) in overlay {
                merge_json(base.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (slot, value) => *slot = value,
    }
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(val) = var("AGENTWIRE_CLI_PATH")
        && !val.is_empty()
    {
        config.transport.cli_path = Some(PathBuf::from(val));
    }
    if let Some(n) = var("AGENTWIRE_MAX_BUFFER_SIZE").and_then(|v| v.parse().ok()) {
        config.transport.max_buffer_size = n;
    }
    if let Some(n) = var("AGENTWIRE_CHANNEL_CAPACITY").and_then(|v| v.parse().ok()) {
        config.transport.channel_capacity = n;
    }
    if let Some(n) = var("AGENTWIRE_SHUTDOWN_TIMEOUT").and_then(|v| v.parse().ok()) {
        config.queue.shutdown_timeout_secs = n;
    }
}
