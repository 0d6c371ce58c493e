//! Manager Configuration
//!
//! Loaded from a TOML file (`pplugins.toml`); every field is optional.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

/// Name of the plugin host binary
pub const HOST_BINARY: &str = "pplugins-host";

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse TOML: {0}")]
    TomlParseError(#[from] toml::de::Error),
}

/// Configuration for a [`PluginManager`](crate::PluginManager)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// How long the shutdown hook may wait for a plugin to exit on its own
    #[serde(default = "default_timeout", rename = "stop_timeout_ms", with = "duration_ms")]
    pub stop_timeout: Duration,

    /// How long to wait for a plugin to die after forced termination
    #[serde(default = "default_timeout", rename = "kill_timeout_ms", with = "duration_ms")]
    pub kill_timeout: Duration,

    /// How long a single frame write to a plugin's stdin may block
    #[serde(default = "default_send_timeout", rename = "send_timeout_ms", with = "duration_ms")]
    pub send_timeout: Duration,

    /// Process used to host plugins
    #[serde(default)]
    pub host: HostConfig,

    /// Per-plugin settings, keyed by plugin name
    #[serde(default)]
    pub plugins: HashMap<String, PluginSettings>,
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_send_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            stop_timeout: default_timeout(),
            kill_timeout: default_timeout(),
            send_timeout: default_send_timeout(),
            host: HostConfig::default(),
            plugins: HashMap::new(),
        }
    }
}

/// Plugin host command. The plugin name is appended as the last argument.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    /// Host program; defaults to [`HOST_BINARY`] next to the current executable, then on PATH
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<PathBuf>,

    /// Extra arguments placed before the plugin name
    #[serde(default)]
    pub args: Vec<String>,
}

/// Settings for a single plugin
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginSettings {
    /// Sent to the plugin in its `Start` frame
    #[serde(default)]
    pub config: serde_json::Value,
}

impl ManagerConfig {
    /// Load from a TOML file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::ReadError {
                path: path.to_path_buf(),
                source,
            })?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded manager config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = timeout;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Use `program` (with `args` before the plugin name) as the plugin host
    pub fn with_host(mut self, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        self.host = HostConfig {
            program: Some(program.into()),
            args,
        };
        self
    }

    pub fn with_plugin_config(mut self, name: impl Into<String>, config: serde_json::Value) -> Self {
        self.plugins.insert(name.into(), PluginSettings { config });
        self
    }

    /// Configuration sent to `name` when it starts
    pub fn plugin_config(&self, name: &str) -> serde_json::Value {
        self.plugins
            .get(name)
            .map(|settings| settings.config.clone())
            .unwrap_or(serde_json::Value::Null)
    }
}

impl HostConfig {
    /// Resolve the host program path
    pub fn program_path(&self) -> PathBuf {
        if let Some(program) = &self.program {
            return program.clone();
        }

        // Try to find in same directory as current executable
        if let Some(dir) = std::env::current_exe().ok().and_then(|exe| exe.parent().map(Path::to_path_buf)) {
            let host_path = dir.join(HOST_BINARY);
            if host_path.exists() {
                return host_path;
            }
        }

        // Fall back to PATH
        PathBuf::from(HOST_BINARY)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
