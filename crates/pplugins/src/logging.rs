//! Tracing setup for the manager and host binaries
//!
//! Library code only emits events; binaries install a subscriber once at
//! startup. `RUST_LOG` overrides the default filter.

use std::io;

use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt};

fn filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Subscriber for the manager process, writing to stdout
pub fn init(default_filter: &str, json: bool) -> Result<(), TryInitError> {
    let registry = tracing_subscriber::registry().with(filter(default_filter));
    if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    }
}

/// Subscriber for a plugin host. Logs go to stderr because stdout carries IPC frames.
pub fn init_host(default_filter: &str) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(filter(default_filter))
        .with(fmt::layer().with_writer(io::stderr))
        .try_init()
}
