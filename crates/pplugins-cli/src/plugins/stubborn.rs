use async_trait::async_trait;
use pplugins::{Plugin, PluginContext, PluginEvent, PluginInterface};
use tracing::warn;

/// Never leaves its run loop; the manager has to kill it
pub struct StubbornPlugin {
    interface: PluginInterface,
}

impl StubbornPlugin {
    pub fn new(ctx: PluginContext) -> Self {
        Self {
            interface: ctx.interface,
        }
    }
}

#[async_trait]
impl Plugin for StubbornPlugin {
    async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            match self.interface.get_event().await {
                Some(PluginEvent::Shutdown) => warn!("Ignoring shutdown request"),
                Some(PluginEvent::Payload(_)) => {}
                None => std::future::pending::<()>().await,
            }
        }
    }
}
