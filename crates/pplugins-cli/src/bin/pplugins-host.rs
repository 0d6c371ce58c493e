//! Plugin host
//!
//! Spawned by a `PluginManager` as `pplugins-host <plugin>`. Stdin and stdout
//! carry IPC frames; logs go to stderr.

use anyhow::Result;
use clap::Parser;
use tracing::info;

use pplugins::{PluginRunner, exit_code};
use pplugins_cli::plugins;

#[derive(Parser, Debug)]
#[command(name = "pplugins-host")]
#[command(about = "Runs a single plugin for a pplugins manager", long_about = None)]
struct Args {
    /// Name of the plugin to run
    plugin: String,
}

fn main() -> Result<()> {
    let _ = pplugins::logging::init_host("info");

    let args = Args::parse();
    info!("Loading plugin: {}", args.plugin);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let runner = PluginRunner::new(plugins::registry());
    let result = rt.block_on(runner.run_stdio(&args.plugin));

    // Exit without dropping the runtime: its stdin reader may be parked in a blocking read
    std::process::exit(exit_code(&result))
}
