//! Manager customization points

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::PluginRecord;
use crate::error::PluginResult;

/// Application-level behaviour plugged into a [`PluginManager`](super::PluginManager)
///
/// Both methods have defaults; override the ones your protocol needs.
#[async_trait]
pub trait ManagerHooks: Send + Sync + 'static {
    /// Ask a plugin to shut down cleanly and give it up to `timeout` to exit.
    ///
    /// The manager force-terminates the process afterwards if it is still
    /// alive, so this only has to cover the cooperative part. The manager
    /// also cancels it once `timeout` has passed.
    async fn stop_plugin(&self, record: &mut PluginRecord, timeout: Duration) -> PluginResult<()> {
        info!(
            "Waiting up to {:?} for plugin {} to shut down",
            timeout,
            record.name()
        );
        let deadline = Instant::now() + timeout;

        // Writing the sentinel counts against the same budget as the wait
        match tokio::time::timeout(timeout, record.send_shutdown()).await {
            Ok(sent) => sent?,
            Err(_) => {
                warn!("Plugin {} did not accept the shutdown request", record.name());
                return Ok(());
            }
        }
        record.wait(deadline.saturating_duration_since(Instant::now())).await;
        Ok(())
    }

    /// Handle a message a plugin sent back to the manager
    fn process_message(&self, plugin: &str, message: serde_json::Value) {
        info!(plugin, %message, "Message from plugin");
    }
}

/// Sentinel-then-wait shutdown, messages logged
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl ManagerHooks for DefaultHooks {}

/// No shutdown handshake: plugins are terminated straight away
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminateOnly;

#[async_trait]
impl ManagerHooks for TerminateOnly {
    async fn stop_plugin(&self, record: &mut PluginRecord, _timeout: Duration) -> PluginResult<()> {
        debug!("Skipping clean shutdown of plugin {}", record.name());
        Ok(())
    }
}
