use async_trait::async_trait;
use pplugins::{Plugin, PluginContext, PluginEvent, PluginInterface};
use serde_json::json;
use tracing::debug;

/// Sends each payload back, wrapped as `{"prefix": .., "payload": ..}` when
/// a `prefix` is configured
pub struct EchoPlugin {
    interface: PluginInterface,
    prefix: Option<String>,
}

impl EchoPlugin {
    pub fn new(ctx: PluginContext) -> Self {
        let prefix = ctx.get_config::<String>("prefix");
        Self {
            interface: ctx.interface,
            prefix,
        }
    }
}

#[async_trait]
impl Plugin for EchoPlugin {
    async fn run(&mut self) -> anyhow::Result<()> {
        while let Some(event) = self.interface.get_event().await {
            let PluginEvent::Payload(payload) = event else {
                break;
            };
            debug!(%payload, "Echoing");
            let reply = match &self.prefix {
                Some(prefix) => json!({ "prefix": prefix, "payload": payload }),
                None => payload,
            };
            self.interface.add_message(&reply)?;
        }
        Ok(())
    }
}
