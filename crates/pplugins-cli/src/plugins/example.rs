use std::time::Duration;

use async_trait::async_trait;
use pplugins::{Plugin, PluginContext, PluginEvent, PluginInterface};
use tracing::{debug, info};

/// Polls its event queue without blocking and sleeps while it is empty
pub struct ExamplePlugin {
    interface: PluginInterface,
    poll_interval: Duration,
}

impl ExamplePlugin {
    pub fn new(ctx: PluginContext) -> Self {
        let poll_interval = ctx
            .get_config::<u64>("poll_interval_ms")
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(1));

        Self {
            interface: ctx.interface,
            poll_interval,
        }
    }
}

#[async_trait]
impl Plugin for ExamplePlugin {
    async fn run(&mut self) -> anyhow::Result<()> {
        info!("Example plugin started");

        loop {
            match self.interface.try_get_event() {
                None => {
                    debug!("No event, waiting {:?}", self.poll_interval);
                    tokio::time::sleep(self.poll_interval).await;
                }
                Some(PluginEvent::Payload(event)) => info!(%event, "Received event"),
                Some(PluginEvent::Shutdown) => {
                    info!("Example plugin exiting");
                    return Ok(());
                }
            }
        }
    }
}
