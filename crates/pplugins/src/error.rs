//! Plugin lifecycle errors

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Error
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can occur while starting, running or stopping a plugin.
///
/// Every variant tied to a specific plugin carries its name, and the
/// rendered message always ends with `(plugin: <name>)`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PluginError {
    #[error("Plugin is already running (plugin: {0})")]
    AlreadyRunning(String),

    #[error("Plugin isn't running (plugin: {0})")]
    NotRunning(String),

    #[error("Unable to load plugin: {reason} (plugin: {plugin})")]
    Load { plugin: String, reason: String },

    #[error("Unable to create plugin process: {reason} (plugin: {plugin})")]
    Spawn { plugin: String, reason: String },

    #[error("IPC error: {reason} (plugin: {plugin})")]
    Ipc { plugin: String, reason: String },

    #[error("Channel closed (plugin: {0})")]
    ChannelClosed(String),

    #[error("Plugin failed: {reason} (plugin: {plugin})")]
    Failed { plugin: String, reason: String },
}

impl PluginError {
    pub fn load(plugin: impl Into<String>, reason: impl ToString) -> Self {
        Self::Load {
            plugin: plugin.into(),
            reason: reason.to_string(),
        }
    }

    pub fn ipc(plugin: impl Into<String>, reason: impl ToString) -> Self {
        Self::Ipc {
            plugin: plugin.into(),
            reason: reason.to_string(),
        }
    }

    pub fn failed(plugin: impl Into<String>, reason: impl ToString) -> Self {
        Self::Failed {
            plugin: plugin.into(),
            reason: reason.to_string(),
        }
    }

    /// Name of the plugin this error concerns
    pub fn plugin(&self) -> &str {
        match self {
            Self::AlreadyRunning(plugin)
            | Self::NotRunning(plugin)
            | Self::ChannelClosed(plugin)
            | Self::Load { plugin, .. }
            | Self::Spawn { plugin, .. }
            | Self::Ipc { plugin, .. }
            | Self::Failed { plugin, .. } => plugin,
        }
    }
}

/// Result type for plugin operations
pub type PluginResult<T> = Result<T, PluginError>;
