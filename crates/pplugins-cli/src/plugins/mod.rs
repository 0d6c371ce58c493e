//! Bundled plugins
//!
//! - `example`: polls for events, exits on shutdown
//! - `echo`: sends every payload back to the manager
//! - `stubborn`: ignores shutdown requests
//! - `faulty`: fails as soon as it runs

mod echo;
mod example;
mod faulty;
mod stubborn;

pub use echo::EchoPlugin;
pub use example::ExamplePlugin;
pub use faulty::FaultyPlugin;
pub use stubborn::StubbornPlugin;

use pplugins::PluginRegistry;

/// Registry of every bundled plugin
pub fn registry() -> PluginRegistry {
    PluginRegistry::new()
        .with("example", |ctx| Ok(Box::new(ExamplePlugin::new(ctx))))
        .with("echo", |ctx| Ok(Box::new(EchoPlugin::new(ctx))))
        .with("stubborn", |ctx| Ok(Box::new(StubbornPlugin::new(ctx))))
        .with("faulty", |ctx| Ok(Box::new(FaultyPlugin::new(ctx))))
}
