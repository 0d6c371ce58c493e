use async_trait::async_trait;
use pplugins::{Plugin, PluginContext};

/// Fails immediately with the configured `reason`
pub struct FaultyPlugin {
    reason: String,
}

impl FaultyPlugin {
    pub fn new(ctx: PluginContext) -> Self {
        let reason = ctx
            .get_config::<String>("reason")
            .unwrap_or_else(|| "faulty plugin refuses to run".to_string());
        Self { reason }
    }
}

#[async_trait]
impl Plugin for FaultyPlugin {
    async fn run(&mut self) -> anyhow::Result<()> {
        anyhow::bail!("{}", self.reason)
    }
}
