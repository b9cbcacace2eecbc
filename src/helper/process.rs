//! Launching and supervising the helper binary.

use std::io;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::utils::tasks::TaskManager;

/// Handle to a launched helper.
///
/// Dropping the handle leaves the process running; [`HelperProcess::terminate`]
/// or the launcher's shutdown stops it.
#[derive(Debug)]
pub struct HelperProcess {
    pid: Option<u32>,
    exit: watch::Receiver<Option<String>>,
    stop: CancellationToken,
}

impl HelperProcess {
    /// `exit` receives a description of the exit status once the process is gone.
    pub fn new(
        pid: Option<u32>,
        exit: watch::Receiver<Option<String>>,
        stop: CancellationToken,
    ) -> Self {
        Self { pid, exit, stop }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status, if the process has exited.
    pub fn exit_status(&self) -> Option<String> {
        self.exit.borrow().clone()
    }

    /// Ask the process to stop; does not wait for it.
    pub fn terminate(&self) {
        self.stop.cancel();
    }
}

/// Starts helper processes.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, path: &Path, args: &[String]) -> io::Result<HelperProcess>;

    /// Stop every process started by this launcher.
    async fn shutdown(&self);
}

/// Spawns the helper with tokio, detached from our stdio and process group.
#[derive(Debug, Default)]
pub struct TokioLauncher {
    subtasks: TaskManager,
}

impl TokioLauncher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessLauncher for TokioLauncher {
    fn launch(&self, path: &Path, args: &[String]) -> io::Result<HelperProcess> {
        if self.subtasks.is_shutting_down() {
            return Err(io::Error::other("helper launcher has been shut down"));
        }

        let mut command = Command::new(path);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            // Aborting the supervision task after the grace period kills the child.
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .inspect_err(|e| tracing::error!(error = ?e, ?command, "failed to start helper binary"))?;
        let pid = child.id();
        tracing::debug!(?command, pid, "helper started");

        let (exit_tx, exit_rx) = watch::channel(None);
        let stop = self.subtasks.cancellation_token.child_token();
        let cancel = stop.clone();
        self.subtasks.spawn(async move {
            // Wait for the process to exit or for a stop request
            let outcome = tokio::select! {
                exited = child.wait() => match exited {
                    Err(e) => {
                        tracing::error!(error = ?e, "helper process failed");
                        format!("wait failed: {e}")
                    }
                    Ok(status) => {
                        tracing::debug!(%status, "helper process exited");
                        status.to_string()
                    }
                },
                _ = cancel.cancelled() => {
                    tracing::debug!(pid, "stopping helper, sending SIGTERM");
                    signal_term(&mut child)
                        .unwrap_or_else(|e| tracing::error!(error = ?e, "failed to send SIGTERM to helper"));
                    match child.wait().await {
                        Ok(status) => {
                            tracing::debug!(%status, "helper stopped");
                            status.to_string()
                        }
                        Err(e) => {
                            tracing::error!(error = ?e, "failed to wait for helper to exit");
                            format!("wait failed: {e}")
                        }
                    }
                }
            };
            exit_tx.send_replace(Some(outcome));
        });

        Ok(HelperProcess::new(pid, exit_rx, stop))
    }

    async fn shutdown(&self) {
        self.subtasks.shutdown().await;
    }
}

/// Ask the helper to exit. Only on UNIX-like systems.
#[cfg(unix)]
fn signal_term(child: &mut Child) -> Result<(), String> {
    let Some(raw_pid) = child.id() else {
        tracing::trace!("helper already reaped, nothing to signal");
        return Ok(());
    };
    let pid = nix::unistd::Pid::from_raw(raw_pid as i32);
    nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM)
        .map_err(|e| format!("SIGTERM to helper({raw_pid}): {e}"))
}

#[cfg(not(unix))]
fn signal_term(child: &mut Child) -> Result<(), String> {
    child.start_kill().map_err(|e| e.to_string())
}
