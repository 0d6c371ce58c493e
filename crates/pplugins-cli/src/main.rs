//! pplugins-run
//!
//! Starts the given plugins, lets them run for a while relaying their
//! messages, then stops them.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use pplugins::{ManagerConfig, PluginManager};

/// Process-based plugin manager
#[derive(Parser, Debug)]
#[command(name = "pplugins-run")]
#[command(about = "Run plugins in their own processes", long_about = None)]
struct Args {
    /// Plugins to start
    #[arg(required = true)]
    plugins: Vec<String>,

    /// Manager configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Plugin host binary
    #[arg(long)]
    host: Option<PathBuf>,

    /// Seconds to let the plugins run before stopping them
    #[arg(short, long, default_value = "2")]
    duration: u64,

    /// Seconds to wait for a clean shutdown before killing a plugin
    #[arg(long)]
    stop_timeout: Option<u64>,

    /// JSON payload sent to every plugin once started (repeatable)
    #[arg(short, long = "event")]
    events: Vec<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn main() -> Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> Result<()> {
    let args = Args::parse();

    let _ = pplugins::logging::init("pplugins=info,pplugins_run=info", args.log_json);

    info!("Starting pplugins-run v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => ManagerConfig::load(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?,
        None => ManagerConfig::default(),
    };
    if let Some(host) = args.host.clone() {
        config.host.program = Some(host);
    }
    if let Some(secs) = args.stop_timeout {
        config.stop_timeout = Duration::from_secs(secs);
    }

    let events = args
        .events
        .iter()
        .map(|raw| serde_json::from_str::<serde_json::Value>(raw).with_context(|| format!("parsing event {raw}")))
        .collect::<Result<Vec<_>>>()?;

    let mut manager = PluginManager::new(config);

    for name in &args.plugins {
        if let Err(e) = manager.start_plugin(name).await {
            error!("{}", e);
            continue;
        }
        for event in &events {
            if let Err(e) = manager.send_event(name, event.clone()).await {
                warn!("{}", e);
            }
        }
    }

    // Relay messages while the plugins run
    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.duration);
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    while tokio::time::Instant::now() < deadline {
        ticker.tick().await;
        manager.process_messages().await;
    }

    for name in &args.plugins {
        match manager.stop_plugin(name).await {
            Ok(outcome) => info!("Plugin {} stopped: {}", name, outcome),
            Err(e) => warn!("{}", e),
        }
    }

    manager.close().await;
    Ok(())
}
