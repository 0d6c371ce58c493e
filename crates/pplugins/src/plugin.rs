//! Plugin contract
//!
//! A plugin is constructed inside its host process from a [`PluginContext`]
//! and then driven through [`Plugin::run`] until it returns.

use std::sync::Arc;

use async_trait::async_trait;

use crate::interface::PluginInterface;

/// Everything a plugin is constructed with
#[derive(Debug)]
pub struct PluginContext {
    /// Name the plugin was started under
    pub name: String,

    /// Configuration sent by the manager (`null` if none)
    pub config: serde_json::Value,

    /// Channel to the manager
    pub interface: PluginInterface,
}

impl PluginContext {
    pub fn new(name: impl Into<String>, config: serde_json::Value, interface: PluginInterface) -> Self {
        Self {
            name: name.into(),
            config,
            interface,
        }
    }

    /// Get a config value as a specific type
    pub fn get_config<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.config.get(key).and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// A unit of work running in its own process
///
/// `run` should poll the interface regularly and return promptly once it sees
/// [`PluginEvent::Shutdown`](crate::PluginEvent::Shutdown); the manager kills
/// plugins that outlive its stop timeout. Returning an error makes the host
/// exit with a non-zero status.
#[async_trait]
pub trait Plugin: Send + 'static {
    async fn run(&mut self) -> anyhow::Result<()>;
}

/// Builds a plugin from its context
pub type PluginConstructor =
    Arc<dyn Fn(PluginContext) -> anyhow::Result<Box<dyn Plugin>> + Send + Sync>;
