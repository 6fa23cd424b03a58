//! Process lifecycle: spawning the server, reaping it, and deciding
//! whether a crash warrants another attempt.
//!
//! The [`Launcher`] trait is the seam between lifecycle logic and the
//! operating system; [`ProcessLauncher`] is the real implementation and
//! tests substitute in-memory connections.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::time::Instant;

use crate::error::SpawnError;
use crate::types::{ClientConfig, RestartPolicy};

/// The duplex byte stream bound to one spawned process. Never reused: a
/// restart always produces a fresh connection.
pub struct Connection {
    pub(crate) reader: Box<dyn AsyncRead + Send + Unpin>,
    pub(crate) writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub(crate) process: Option<ServerProcess>,
}

impl Connection {
    /// Build a connection from raw stream halves, with no OS process
    /// behind it. Used by custom launchers and tests.
    #[must_use]
    pub fn from_parts(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            process: None,
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("process", &self.process)
            .finish_non_exhaustive()
    }
}

/// Produces one fresh [`Connection`] per call.
pub trait Launcher: Send + Sync + 'static {
    fn launch(&self) -> impl Future<Output = Result<Connection, SpawnError>> + Send;
}

/// Spawns the configured executable with piped stdio.
pub struct ProcessLauncher {
    command: String,
    args: Vec<String>,
    workdir: Option<PathBuf>,
}

impl ProcessLauncher {
    #[must_use]
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            command: config.command(),
            args: config.args.clone(),
            workdir: config.workdir.clone(),
        }
    }
}

impl Launcher for ProcessLauncher {
    async fn launch(&self) -> Result<Connection, SpawnError> {
        let resolved = which::which(&self.command).map_err(|source| SpawnError::NotFound {
            command: self.command.clone(),
            source,
        })?;

        let mut cmd = Command::new(&resolved);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| SpawnError::Io {
            command: self.command.clone(),
            source,
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or(SpawnError::MissingPipe("stdout"))?;
        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;

        tracing::info!(command = %resolved.display(), "language server spawned");
        Ok(Connection {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            process: Some(ServerProcess {
                child,
                command: self.command.clone(),
            }),
        })
    }
}

/// Handle on the spawned OS process, owned until confirmed exit.
pub(crate) struct ServerProcess {
    child: Child,
    command: String,
}

impl std::fmt::Debug for ServerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerProcess")
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

impl ServerProcess {
    /// Wait up to `grace` for the process to exit on its own, then kill.
    /// Consumes the handle; the process is gone either way.
    pub async fn wait_or_kill(mut self, grace: Duration) {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(command = %self.command, %status, "server process exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(command = %self.command, "failed to reap server process: {e}");
            }
            Err(_) => {
                tracing::debug!(command = %self.command, "server did not exit within grace period, killing");
                let _ = self.child.kill().await;
            }
        }
    }
}

/// Outcome of consulting the restart policy after a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RestartDecision {
    /// Try again after sleeping out the backoff.
    Restart { delay: Duration },
    /// The bound is exhausted; the session is terminally crashed.
    GiveUp,
}

/// Bounded crash accounting over a sliding window, with exponential
/// backoff between attempts. Crash-looping servers must not be respawned
/// indefinitely.
pub(crate) struct RestartTracker {
    max_restarts: u32,
    window: Duration,
    base_backoff: Duration,
    max_backoff: Duration,
    crashes: VecDeque<Instant>,
}

impl RestartTracker {
    pub fn new(policy: &RestartPolicy) -> Self {
        Self {
            max_restarts: policy.max_restarts,
            window: policy.window(),
            base_backoff: policy.base_backoff(),
            max_backoff: policy.max_backoff(),
            crashes: VecDeque::new(),
        }
    }

    /// Record a crash at `now` and decide whether to try again.
    pub fn on_crash(&mut self, now: Instant) -> RestartDecision {
        while let Some(oldest) = self.crashes.front() {
            if now.duration_since(*oldest) > self.window {
                self.crashes.pop_front();
            } else {
                break;
            }
        }
        self.crashes.push_back(now);

        let in_window = self.crashes.len() as u32;
        if in_window > self.max_restarts {
            return RestartDecision::GiveUp;
        }
        let exponent = in_window.saturating_sub(1).min(16);
        let delay = self
            .base_backoff
            .saturating_mul(1 << exponent)
            .min(self.max_backoff);
        RestartDecision::Restart { delay }
    }
}
