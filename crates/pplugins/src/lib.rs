//! pplugins - process-based plugins
//!
//! A [`PluginManager`] runs each plugin in its own host process and talks to
//! it over framed stdin/stdout:
//! - Manager side: [`PluginManager`], [`ManagerHooks`], [`ManagerConfig`]
//! - Host side: [`PluginRunner`] resolving names through a [`PluginLoader`]
//! - Plugin side: the [`Plugin`] trait and its [`PluginInterface`]

pub mod config;
pub mod error;
pub mod interface;
pub mod ipc;
pub mod logging;
pub mod manager;
pub mod plugin;
pub mod runner;

pub use config::{ConfigError, HostConfig, ManagerConfig, PluginSettings};
pub use error::{PluginError, PluginResult};
pub use interface::{InterfaceLink, PluginEvent, PluginInterface};
pub use manager::{
    DefaultHooks, ManagerHooks, PluginManager, PluginRecord, PluginStatus, ReapedPlugin, StopOutcome,
    TerminateOnly,
};
pub use plugin::{Plugin, PluginConstructor, PluginContext};
pub use runner::{PluginLoader, PluginRegistry, PluginRunner, exit_code};
