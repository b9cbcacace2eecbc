//! Lifecycle of the local helper process that marks commands for encryption.

pub mod probe;
pub mod process;

use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use url::Url;

pub use probe::{ClientProbe, LivenessProbe, TcpProbe};
pub use process::{HelperProcess, ProcessLauncher, TokioLauncher};

use crate::error::{Error, Result};

pub const DEFAULT_HELPER_URI: &str = "mongodb://localhost:27020";
pub const DEFAULT_HELPER_BINARY: &str = "mongocryptd";
pub const DEFAULT_SPAWN_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_HELPER_PORT: u16 = 27020;
const IDLE_SHUTDOWN_ARG: &str = "--idleShutdownTimeoutSecs";
const IDLE_SHUTDOWN_SECS: &str = "60";

#[derive(Debug, Clone)]
pub struct HelperOptions {
    pub uri: String,
    /// Helper binary; looked up on `PATH` when unset.
    pub spawn_path: Option<PathBuf>,
    pub spawn_args: Vec<String>,
    /// Never start the helper; assume something else manages it.
    pub bypass_spawn: bool,
    /// How long a freshly spawned helper gets to start answering.
    pub spawn_timeout: Duration,
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for HelperOptions {
    fn default() -> Self {
        Self {
            uri: DEFAULT_HELPER_URI.to_owned(),
            spawn_path: None,
            spawn_args: Vec::new(),
            bypass_spawn: false,
            spawn_timeout: DEFAULT_SPAWN_TIMEOUT,
            poll_interval: Duration::from_millis(100),
            probe_timeout: Duration::from_secs(1),
        }
    }
}

impl HelperOptions {
    pub fn validate(&self) -> Result<()> {
        self.address()?;
        if self.spawn_timeout.is_zero() {
            return Err(Error::configuration("helper spawn timeout must be positive"));
        }
        Ok(())
    }

    /// Host and port the helper listens on.
    pub fn address(&self) -> Result<(String, u16)> {
        let url = Url::parse(&self.uri)
            .map_err(|e| Error::configuration(format!("invalid helper URI {:?}: {e}", self.uri)))?;
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| Error::configuration(format!("helper URI {:?} has no host", self.uri)))?;
        Ok((host.to_owned(), url.port().unwrap_or(DEFAULT_HELPER_PORT)))
    }

    /// Arguments passed to the helper. An idle shutdown timeout is added
    /// unless one was given.
    pub fn effective_args(&self) -> Vec<String> {
        let mut args = self.spawn_args.clone();
        if !args.iter().any(|arg| arg.starts_with(IDLE_SHUTDOWN_ARG)) {
            args.push(IDLE_SHUTDOWN_ARG.to_owned());
            args.push(IDLE_SHUTDOWN_SECS.to_owned());
        }
        args
    }

    pub fn resolve_spawn_path(&self) -> PathBuf {
        match &self.spawn_path {
            Some(path) => path.clone(),
            None => which::which(DEFAULT_HELPER_BINARY)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_HELPER_BINARY)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperState {
    /// Not known to be running.
    Absent,
    Spawning,
    Ready,
    /// The last spawn attempt failed.
    Dead,
}

/// Makes sure a helper is answering before markings are requested.
///
/// Probing and spawning are serialized, so concurrent callers never start
/// more than one process.
pub struct HelperManager {
    options: HelperOptions,
    probe: Arc<dyn LivenessProbe>,
    launcher: Arc<dyn ProcessLauncher>,
    state: Mutex<HelperState>,
    process: tokio::sync::Mutex<Option<HelperProcess>>,
}

impl HelperManager {
    pub fn new(
        options: HelperOptions,
        probe: Arc<dyn LivenessProbe>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        Self {
            options,
            probe,
            launcher,
            state: Mutex::new(HelperState::Absent),
            process: tokio::sync::Mutex::new(None),
        }
    }

    /// Manager that probes the helper's TCP port and spawns it with tokio.
    pub fn with_tcp_probe(options: HelperOptions) -> Result<Self> {
        let (host, port) = options.address()?;
        let probe = TcpProbe::new(host, port, options.probe_timeout);
        Ok(Self::new(
            options,
            Arc::new(probe),
            Arc::new(TokioLauncher::new()),
        ))
    }

    pub fn options(&self) -> &HelperOptions {
        &self.options
    }

    pub fn state(&self) -> HelperState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: HelperState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Probe the helper and spawn it if it does not answer. With spawning
    /// bypassed, an unreachable helper is left alone and this returns `Ok`.
    pub async fn ensure_running(&self) -> Result<()> {
        let mut process = self.process.lock().await;
        match self.probe.probe().await {
            Ok(()) => {
                self.set_state(HelperState::Ready);
                return Ok(());
            }
            Err(e) => tracing::debug!(error = %e, "helper is not answering"),
        }
        if self.options.bypass_spawn {
            tracing::debug!("helper spawning is bypassed");
            return Ok(());
        }
        if let Some(stale) = process.take() {
            stale.terminate();
        }

        let path = self.options.resolve_spawn_path();
        let args = self.options.effective_args();
        tracing::info!(path = %path.display(), ?args, "spawning helper");
        self.set_state(HelperState::Spawning);

        let spawn_failed = |reason: String| {
            self.set_state(HelperState::Dead);
            Error::HelperSpawn {
                path: path.display().to_string(),
                reason,
            }
        };
        let child = self
            .launcher
            .launch(&path, &args)
            .map_err(|e| spawn_failed(e.to_string()))?;

        let outcome = tokio::time::timeout(self.options.spawn_timeout, self.wait_ready(&child))
            .await
            .unwrap_or_else(|_| {
                Err(format!(
                    "not accepting connections after {}",
                    humantime::format_duration(self.options.spawn_timeout)
                ))
            });
        match outcome {
            Ok(()) => {
                tracing::info!(pid = child.pid(), "helper is ready");
                self.set_state(HelperState::Ready);
                *process = Some(child);
                Ok(())
            }
            Err(reason) => {
                child.terminate();
                Err(spawn_failed(reason))
            }
        }
    }

    async fn wait_ready(&self, child: &HelperProcess) -> std::result::Result<(), String> {
        loop {
            if self.probe.probe().await.is_ok() {
                return Ok(());
            }
            if let Some(status) = child.exit_status() {
                return Err(format!("exited before accepting connections ({status})"));
            }
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    /// Run `op`; if it fails because the helper refused the connection,
    /// make sure the helper is running and retry exactly once.
    pub async fn run_with_respawn<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match op().await {
            Err(e) if e.is_connection_refused() => {
                tracing::warn!(error = %e, "helper refused the connection, respawning");
                self.ensure_running().await?;
                op().await
            }
            other => other,
        }
    }

    /// Stop the helper if this manager started it.
    pub async fn shutdown(&self) {
        let mut process = self.process.lock().await;
        if let Some(child) = process.take() {
            tracing::debug!(pid = child.pid(), "stopping helper");
            child.terminate();
        }
        self.launcher.shutdown().await;
        self.set_state(HelperState::Absent);
    }
}

impl std::fmt::Debug for HelperManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelperManager")
            .field("options", &self.options)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
