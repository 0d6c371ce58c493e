//! Plugin Runner
//!
//! Entry point of the child process: resolves a plugin name through a
//! [`PluginLoader`], performs the Ready/Start handshake and runs the plugin.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};

use crate::error::{PluginError, PluginResult};
use crate::interface::PluginInterface;
use crate::ipc::{ErrorPayload, Frame, FrameReader, FrameWriter, MessageType, StartPayload};
use crate::plugin::{Plugin, PluginConstructor, PluginContext};

/// Host exit status when the plugin returned an error
pub const EXIT_PLUGIN_FAILED: i32 = 1;

/// Host exit status when the plugin could not be loaded
pub const EXIT_LOAD_FAILED: i32 = 2;

/// How long to wait for queued messages to reach the manager after `run`
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

// ─────────────────────────────────────────────────────────────────────────────
// Loading
// ─────────────────────────────────────────────────────────────────────────────

/// Resolves a plugin name to its constructor
pub trait PluginLoader: Send + Sync {
    fn load(&self, name: &str) -> PluginResult<PluginConstructor>;
}

/// Name → constructor table
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, PluginConstructor>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor under `name`, replacing any previous one
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(PluginContext) -> anyhow::Result<Box<dyn Plugin>> + Send + Sync + 'static,
    {
        self.plugins.insert(name.into(), Arc::new(constructor));
        self
    }

    pub fn with<F>(mut self, name: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(PluginContext) -> anyhow::Result<Box<dyn Plugin>> + Send + Sync + 'static,
    {
        self.register(name, constructor);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// Registered plugin names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.plugins.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl PluginLoader for PluginRegistry {
    fn load(&self, name: &str) -> PluginResult<PluginConstructor> {
        self.plugins
            .get(name)
            .cloned()
            .ok_or_else(|| PluginError::load(name, "Unable to find plugin"))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Runner
// ─────────────────────────────────────────────────────────────────────────────

/// Loads and runs one plugin inside the host process
pub struct PluginRunner<L> {
    loader: L,
}

impl<L: PluginLoader> PluginRunner<L> {
    pub fn new(loader: L) -> Self {
        Self { loader }
    }

    /// Run `name` over the process's stdin/stdout
    pub async fn run_stdio(&self, name: &str) -> PluginResult<()> {
        self.run(name, tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Run `name`, reading frames from `reader` and writing to `writer`
    pub async fn run<R, W>(&self, name: &str, reader: R, writer: W) -> PluginResult<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut reader = FrameReader::new(reader);
        let mut writer = FrameWriter::new(writer);

        let constructor = match self.loader.load(name) {
            Ok(constructor) => constructor,
            Err(e) => {
                error!("{}", e);
                let report = ErrorPayload {
                    message: e.to_string(),
                };
                let _ = writer.send_json(MessageType::Error, &report).await;
                return Err(e);
            }
        };

        writer
            .send(&Frame::empty(MessageType::Ready))
            .await
            .map_err(|e| PluginError::ipc(name, e))?;

        let Some(config) = wait_for_start(name, &mut reader).await? else {
            info!("Plugin {} stopped before it was started", name);
            return Ok(());
        };

        let (interface, link) = PluginInterface::connect(name, reader, writer);
        let ctx = PluginContext::new(name, config, interface);

        let result = match constructor(ctx) {
            Ok(mut plugin) => {
                info!("Running plugin {}", name);
                plugin.run().await
            }
            Err(e) => Err(e.context("Error starting plugin")),
        };

        let result = result.map_err(|e| {
            error!("Plugin {} failed: {:#}", name, e);
            link.report_error(format!("{e:#}"));
            PluginError::failed(name, format!("{e:#}"))
        });

        if tokio::time::timeout(FLUSH_TIMEOUT, link.finish()).await.is_err() {
            warn!("Plugin {} still holds its interface, dropping queued messages", name);
        }

        if result.is_ok() {
            info!("Plugin {} exited", name);
        }
        result
    }
}

/// Wait for the manager's `Start` frame. `None` if it stopped us first.
async fn wait_for_start<R: AsyncRead + Unpin>(
    name: &str,
    reader: &mut FrameReader<R>,
) -> PluginResult<Option<serde_json::Value>> {
    loop {
        let frame = reader.recv().await.map_err(|e| PluginError::ipc(name, e))?;
        match frame {
            Some(frame) if frame.msg_type == MessageType::Start => {
                let start: StartPayload = frame.parse_json().map_err(|e| PluginError::ipc(name, e))?;
                debug!("Plugin {} received Start", name);
                return Ok(Some(start.config));
            }
            Some(frame) if frame.msg_type == MessageType::Stop => return Ok(None),
            Some(frame) => warn!("Ignoring {:?} before Start", frame.msg_type),
            None => return Ok(None),
        }
    }
}

/// Process exit status for a runner outcome
pub fn exit_code(result: &PluginResult<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(PluginError::Load { .. }) => EXIT_LOAD_FAILED,
        Err(_) => EXIT_PLUGIN_FAILED,
    }
}
