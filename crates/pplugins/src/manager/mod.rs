//! Plugin Manager
//!
//! Starts, stops and reaps named plugin processes.
//!
//! # Lifecycle
//!
//! - `start_plugin`: spawn the host process and send it `Start`
//! - `stop_plugin`: run the shutdown hook, then terminate if still alive
//! - `reap_plugins`: forget plugins whose process exited on its own
//! - `close`: stop everything that is left; dropping the manager kills leftovers

mod hooks;
mod record;

pub use hooks::*;
pub use record::*;

use std::collections::HashMap;
use std::process::ExitStatus;
use std::time::Duration;

use futures::future::join_all;
use tracing::{error, info, warn};

use crate::config::ManagerConfig;
use crate::error::{PluginError, PluginResult};

/// How long to let a record's reader drain after its process exited
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

// ─────────────────────────────────────────────────────────────────────────────
// Outcomes
// ─────────────────────────────────────────────────────────────────────────────

/// How a stopped plugin went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited during the shutdown hook
    Clean(ExitStatus),
    /// Had to be forcibly terminated
    Terminated(ExitStatus),
    /// Survived termination and was left behind
    Abandoned,
}

impl StopOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, StopOutcome::Clean(_))
    }
}

impl std::fmt::Display for StopOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopOutcome::Clean(status) => write!(f, "clean ({status})"),
            StopOutcome::Terminated(status) => write!(f, "terminated ({status})"),
            StopOutcome::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// A plugin whose process exited without being stopped
#[derive(Debug, Clone)]
pub struct ReapedPlugin {
    pub name: String,
    pub status: ExitStatus,
    pub last_error: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Coordinator for a set of named plugin processes
///
/// At most one process runs per name. Operations take `&mut self`, so starts
/// and stops of the same plugin never overlap.
pub struct PluginManager<H: ManagerHooks = DefaultHooks> {
    config: ManagerConfig,
    hooks: H,
    plugins: HashMap<String, PluginRecord>,
}

impl PluginManager<DefaultHooks> {
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_hooks(config, DefaultHooks)
    }
}

impl<H: ManagerHooks> PluginManager<H> {
    pub fn with_hooks(config: ManagerConfig, hooks: H) -> Self {
        Self {
            config,
            hooks,
            plugins: HashMap::new(),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Start `name` with the configuration from [`ManagerConfig::plugins`]
    pub async fn start_plugin(&mut self, name: &str) -> PluginResult<()> {
        let config = self.config.plugin_config(name);
        self.start_plugin_with_config(name, config).await
    }

    /// Start `name`, sending it `config`
    pub async fn start_plugin_with_config(
        &mut self,
        name: &str,
        config: serde_json::Value,
    ) -> PluginResult<()> {
        self.reap_plugins().await;

        // Don't run two instances of the same plugin
        if self.plugins.contains_key(name) {
            return Err(PluginError::AlreadyRunning(name.to_string()));
        }

        info!("Starting plugin {}", name);

        let mut record = PluginRecord::spawn(name, &self.config.host, self.config.send_timeout).inspect_err(|e| {
            error!("{}", e);
        })?;

        // A host that dies before reading Start is picked up by reaping
        if let Err(e) = record.send_start(config).await {
            warn!("Plugin {} did not accept Start: {}", name, e);
        }

        info!(pid = ?record.pid(), "Started plugin {}", name);
        self.plugins.insert(name.to_string(), record);
        Ok(())
    }

    /// Stop `name`: clean shutdown first, then force.
    ///
    /// Slow or hung plugins do not make this fail; the outcome says what happened.
    pub async fn stop_plugin(&mut self, name: &str) -> PluginResult<StopOutcome> {
        self.reap_plugins().await;

        info!("Stopping plugin {}", name);

        let Some(record) = self.plugins.remove(name) else {
            info!("Plugin {} isn't running", name);
            return Err(PluginError::NotRunning(name.to_string()));
        };

        Ok(self.shutdown_record(record).await)
    }

    /// Send an application payload to `name`
    pub async fn send_event(&mut self, name: &str, event: serde_json::Value) -> PluginResult<()> {
        let record = self
            .plugins
            .get_mut(name)
            .ok_or_else(|| PluginError::NotRunning(name.to_string()))?;
        record.send_event(&event).await
    }

    /// Hand every message received from plugins to the hooks.
    ///
    /// Returns how many messages were processed, including those left behind
    /// by plugins reaped on the way.
    pub async fn process_messages(&mut self) -> usize {
        let (_, mut processed) = self.reap().await;

        for (name, record) in self.plugins.iter_mut() {
            for message in record.drain_messages() {
                self.hooks.process_message(name, message);
                processed += 1;
            }
        }
        processed
    }

    /// Forget plugins whose process has exited on its own
    pub async fn reap_plugins(&mut self) -> Vec<ReapedPlugin> {
        self.reap().await.0
    }

    /// Reap exited plugins; also returns how many of their messages went to the hooks
    async fn reap(&mut self) -> (Vec<ReapedPlugin>, usize) {
        let exited: Vec<(String, ExitStatus)> = self
            .plugins
            .iter_mut()
            .filter_map(|(name, record)| record.try_exit_status().map(|status| (name.clone(), status)))
            .collect();

        let mut reaped = Vec::with_capacity(exited.len());
        let mut processed = 0;
        for (name, status) in exited {
            let Some(mut record) = self.plugins.remove(&name) else {
                continue;
            };
            record.finish_reading(DRAIN_TIMEOUT).await;
            for message in record.drain_messages() {
                self.hooks.process_message(&name, message);
                processed += 1;
            }

            let last_error = record.last_error();
            match &last_error {
                Some(reason) => warn!("Plugin {} has terminated itself ({}): {}", name, status, reason),
                None => warn!("Plugin {} has terminated itself ({})", name, status),
            }
            reaped.push(ReapedPlugin {
                name,
                status,
                last_error,
            });
        }
        (reaped, processed)
    }

    /// Stop every remaining plugin. Does nothing when none are running.
    pub async fn close(&mut self) {
        self.reap_plugins().await;
        if self.plugins.is_empty() {
            return;
        }

        let records: Vec<PluginRecord> = self.plugins.drain().map(|(_, record)| record).collect();
        info!("Stopping {} remaining plugins", records.len());

        let this = &*self;
        join_all(records.into_iter().map(|record| this.shutdown_record(record))).await;
    }

    /// Check if a plugin is recorded as running
    pub fn is_running(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// Names of running plugins, sorted
    pub fn running_plugins(&self) -> Vec<String> {
        let mut names: Vec<_> = self.plugins.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub fn get(&self, name: &str) -> Option<&PluginRecord> {
        self.plugins.get(name)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    async fn shutdown_record(&self, mut record: PluginRecord) -> StopOutcome {
        let name = record.name().to_string();

        // Try cleanly shutting it down, but never for longer than stop_timeout
        let timeout = self.config.stop_timeout;
        match tokio::time::timeout(timeout, self.hooks.stop_plugin(&mut record, timeout)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Clean shutdown of plugin {} failed: {}", name, e),
            Err(_) => warn!("Shutdown hook for plugin {} ran over {:?}", name, timeout),
        }

        // Make sure it died or kill it
        let outcome = match record.try_exit_status() {
            Some(status) => StopOutcome::Clean(status),
            None => {
                info!("Forcefully killing plugin {}", name);
                if let Err(e) = record.terminate() {
                    error!("{}", e);
                }

                info!(
                    "Waiting up to {:?} for plugin {} to die",
                    self.config.kill_timeout, name
                );
                match record.wait(self.config.kill_timeout).await {
                    Some(status) => StopOutcome::Terminated(status),
                    None => StopOutcome::Abandoned,
                }
            }
        };

        if outcome == StopOutcome::Abandoned {
            error!("Unable to kill plugin {} -- ignoring it", name);
            return outcome;
        }

        record.finish_reading(DRAIN_TIMEOUT).await;
        for message in record.drain_messages() {
            self.hooks.process_message(&name, message);
        }

        info!("Successfully shut down plugin {}: {}", name, outcome);
        outcome
    }
}

impl<H: ManagerHooks> Drop for PluginManager<H> {
    fn drop(&mut self) {
        for (name, record) in self.plugins.iter_mut() {
            if record.is_alive() {
                warn!("Plugin {} still running when manager dropped, killing it", name);
                let _ = record.terminate();
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::ipc::MessageType;
    use async_trait::async_trait;
    use serde_json::json;

    /// Host every plugin with `sh -c <script>`; the plugin name becomes `$0`.
    fn sh_config(script: &str) -> ManagerConfig {
        ManagerConfig::default()
            .with_host("sh", vec!["-c".to_string(), script.to_string()])
            .with_stop_timeout(Duration::from_millis(300))
            .with_kill_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_stop_unknown_plugin() {
        let mut manager = PluginManager::new(sh_config("exec sleep 30"));
        let err = manager.stop_plugin("ghost").await.unwrap_err();
        assert_eq!(err, PluginError::NotRunning("ghost".into()));

        let err = manager.send_event("ghost", serde_json::json!(1)).await.unwrap_err();
        assert_eq!(err, PluginError::NotRunning("ghost".into()));
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let mut manager = PluginManager::new(sh_config("exec sleep 30"));
        manager.start_plugin("test").await.unwrap();

        let err = manager.start_plugin("test").await.unwrap_err();
        assert_eq!(err, PluginError::AlreadyRunning("test".into()));
        assert_eq!(manager.len(), 1);

        manager.stop_plugin("test").await.unwrap();
        assert!(manager.is_empty());

        // Startable again once stopped
        manager.start_plugin("test").await.unwrap();
        manager.close().await;
    }

    #[tokio::test]
    async fn test_ignored_sentinel_escalates_to_termination() {
        let mut manager = PluginManager::new(sh_config("exec sleep 30"));
        manager.start_plugin("stubborn").await.unwrap();

        let outcome = manager.stop_plugin("stubborn").await.unwrap();
        assert!(matches!(outcome, StopOutcome::Terminated(_)));
        assert!(!manager.is_running("stubborn"));
    }

    #[tokio::test]
    async fn test_clean_exit_after_sentinel() {
        // Start frame with a null config is 20 bytes, Stop is 5
        let mut manager = PluginManager::new(sh_config("exec head -c 25 > /dev/null"));
        manager.start_plugin("polite").await.unwrap();

        let outcome = manager.stop_plugin("polite").await.unwrap();
        assert!(outcome.is_clean(), "unexpected outcome: {outcome}");
    }

    #[tokio::test]
    async fn test_terminate_only_hooks_skip_the_handshake() {
        let mut manager = PluginManager::with_hooks(sh_config("exec sleep 30"), TerminateOnly);
        manager.start_plugin("test").await.unwrap();

        let started = std::time::Instant::now();
        let outcome = manager.stop_plugin("test").await.unwrap();
        assert!(matches!(outcome, StopOutcome::Terminated(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_reaps_plugins_that_exit_on_their_own() {
        let mut manager = PluginManager::new(sh_config("exit 3"));
        manager.start_plugin("short-lived").await.unwrap();

        let mut reaped = Vec::new();
        for _ in 0..50 {
            reaped = manager.reap_plugins().await;
            if !reaped.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].name, "short-lived");
        assert_eq!(reaped[0].status.code(), Some(3));
        assert!(manager.is_empty());
        assert!(matches!(
            manager.stop_plugin("short-lived").await,
            Err(PluginError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_stopping_one_plugin_leaves_others_running() {
        let mut manager = PluginManager::new(sh_config("exec sleep 30"));
        manager.start_plugin("a").await.unwrap();
        manager.start_plugin("b").await.unwrap();
        assert_eq!(manager.running_plugins(), vec!["a", "b"]);

        manager.stop_plugin("a").await.unwrap();

        assert!(!manager.is_running("a"));
        assert!(manager.is_running("b"));
        assert!(manager.reap_plugins().await.is_empty());

        manager.close().await;
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut manager = PluginManager::new(sh_config("exec sleep 30"));
        manager.close().await;

        manager.start_plugin("x").await.unwrap();
        manager.close().await;
        manager.close().await;
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_no_record() {
        let config = ManagerConfig::default().with_host("/nonexistent/pplugins-host", Vec::new());
        let mut manager = PluginManager::new(config);

        let err = manager.start_plugin("test").await.unwrap_err();
        assert!(matches!(err, PluginError::Spawn { .. }));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_stop_is_bounded_when_the_input_pipe_is_full() {
        let config = sh_config("exec sleep 60").with_kill_timeout(Duration::from_secs(2));
        let mut manager = PluginManager::new(config);
        manager.start_plugin("deaf").await.unwrap();

        // With the 20 byte Start frame this leaves 3 bytes of a 64 KiB pipe, too few for Stop
        let filler = json!("x".repeat(65506));
        let _ = manager.send_event("deaf", filler).await;

        let started = std::time::Instant::now();
        let outcome = tokio::time::timeout(Duration::from_secs(8), manager.stop_plugin("deaf"))
            .await
            .expect("stop_plugin blocked on a full pipe")
            .unwrap();

        assert!(matches!(outcome, StopOutcome::Terminated(_)), "unexpected outcome: {outcome}");
        assert!(started.elapsed() < Duration::from_millis(2300) + Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_stalled_write_closes_the_channel() {
        let config = sh_config("exec sleep 60").with_send_timeout(Duration::from_millis(200));
        let mut manager = PluginManager::new(config);
        manager.start_plugin("deaf").await.unwrap();

        let err = manager
            .send_event("deaf", json!("x".repeat(256 * 1024)))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Ipc { .. }), "unexpected error: {err}");

        let err = manager.send_event("deaf", json!(1)).await.unwrap_err();
        assert_eq!(err, PluginError::ChannelClosed("deaf".into()));

        let outcome = manager.stop_plugin("deaf").await.unwrap();
        assert!(matches!(outcome, StopOutcome::Terminated(_)), "unexpected outcome: {outcome}");
    }

    struct HangingHooks;

    #[async_trait]
    impl ManagerHooks for HangingHooks {
        async fn stop_plugin(&self, _record: &mut PluginRecord, _timeout: Duration) -> PluginResult<()> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_hung_shutdown_hook_is_cut_off() {
        let mut manager = PluginManager::with_hooks(sh_config("exec sleep 60"), HangingHooks);
        manager.start_plugin("a").await.unwrap();
        manager.start_plugin("b").await.unwrap();

        let started = std::time::Instant::now();
        let outcome = manager.stop_plugin("a").await.unwrap();
        assert!(matches!(outcome, StopOutcome::Terminated(_)), "unexpected outcome: {outcome}");

        manager.close().await;
        assert!(manager.is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    /// Asks for shutdown twice, then checks the event channel is closed
    struct ShutdownTwice;

    #[async_trait]
    impl ManagerHooks for ShutdownTwice {
        async fn stop_plugin(&self, record: &mut PluginRecord, timeout: Duration) -> PluginResult<()> {
            record.send_shutdown().await?;
            record.send_shutdown().await?;
            assert!(record.shutdown_sent());

            let err = record.send_event(&json!("late")).await.unwrap_err();
            assert_eq!(err, PluginError::ChannelClosed(record.name().to_string()));

            record.wait(timeout).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_sentinel_is_sent_once() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input");
        let script = format!("exec cat > '{}'", input.display());

        let mut manager = PluginManager::with_hooks(sh_config(&script), ShutdownTwice);
        manager.start_plugin("recorder").await.unwrap();
        manager.stop_plugin("recorder").await.unwrap();

        // Start frame (20 bytes), then exactly one Stop frame
        let bytes = std::fs::read(&input).unwrap();
        assert_eq!(bytes.len(), 25, "unexpected input: {bytes:?}");
        assert_eq!(&bytes[20..], &[0, 0, 0, 1, MessageType::Stop as u8]);
    }

    #[tokio::test]
    async fn test_process_messages_counts_messages_of_reaped_plugins() {
        // One Message frame holding `{}`, then exit
        let mut manager = PluginManager::new(sh_config(r"printf '\000\000\000\003\014{}'"));
        manager.start_plugin("chatty").await.unwrap();

        let mut processed = 0;
        for _ in 0..50 {
            processed += manager.process_messages().await;
            if manager.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert!(manager.is_empty());
        assert_eq!(processed, 1);
    }

    /// Running, and not a zombie waiting to be reaped
    #[cfg(target_os = "linux")]
    fn process_alive(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(") ")
                .is_some_and(|(_, rest)| !matches!(rest.chars().next(), Some('Z' | 'X'))),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_dropping_the_manager_kills_children() {
        let mut manager = PluginManager::new(sh_config("exec sleep 30"));
        manager.start_plugin("orphan").await.unwrap();
        let pid = manager.get("orphan").and_then(PluginRecord::pid).unwrap();
        assert!(process_alive(pid));

        drop(manager);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while process_alive(pid) {
            assert!(std::time::Instant::now() < deadline, "plugin {pid} outlived its manager");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}
