//! Spawning and stopping worker processes.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::error::SupervisorError;
use super::spec::WorkerSpec;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub description: String,
}

/// A running worker.
#[async_trait]
pub trait WorkerHandle: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// `Some` once the process has exited. Never blocks.
    fn try_exit(&mut self) -> Option<ExitInfo>;

    /// Graceful termination, forced after `timeout`.
    async fn stop(&mut self, timeout: Duration);
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn spawn(&self, spec: &WorkerSpec) -> Result<Box<dyn WorkerHandle>, SupervisorError>;
}

/// Launches workers as child processes. When a log directory is set, each
/// worker's stdout and stderr are appended to `<log_dir>/<name>.log`.
#[derive(Debug, Clone, Default)]
pub struct TokioLauncher {
    log_dir: Option<PathBuf>,
}

impl TokioLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    fn output(&self, name: &str) -> std::io::Result<(Stdio, Stdio)> {
        let Some(dir) = &self.log_dir else {
            return Ok((Stdio::null(), Stdio::null()));
        };
        std::fs::create_dir_all(dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{name}.log")))?;
        let err = file.try_clone()?;
        Ok((Stdio::from(file), Stdio::from(err)))
    }
}

#[async_trait]
impl ProcessLauncher for TokioLauncher {
    async fn spawn(&self, spec: &WorkerSpec) -> Result<Box<dyn WorkerHandle>, SupervisorError> {
        let (exe, args) = spec
            .command
            .split_first()
            .ok_or_else(|| SupervisorError::EmptyCommand {
                worker: spec.name.clone(),
            })?;
        let (stdout, stderr) = self.output(&spec.name)?;

        let mut cmd = Command::new(exe);
        cmd.args(args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|e| SupervisorError::Spawn {
            worker: spec.name.clone(),
            reason: e.to_string(),
        })?;
        debug!(worker = %spec.name, pid = ?child.id(), "worker spawned");
        Ok(Box::new(ChildHandle { child }))
    }
}

struct ChildHandle {
    child: Child,
}

#[async_trait]
impl WorkerHandle for ChildHandle {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_exit(&mut self) -> Option<ExitInfo> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(ExitInfo {
                code: status.code(),
                description: status.to_string(),
            }),
            Ok(None) => None,
            Err(e) => Some(ExitInfo {
                code: None,
                description: format!("wait failed: {e}"),
            }),
        }
    }

    async fn stop(&mut self, timeout: Duration) {
        if let Some(pid) = self.child.id() {
            if let Err(e) = terminate_pid(pid) {
                debug!(pid, error = %e, "SIGTERM failed");
            }
        }
        if tokio::time::timeout(timeout, self.child.wait()).await.is_err() {
            warn!(pid = ?self.child.id(), "worker ignored SIGTERM, killing");
            if let Err(e) = self.child.kill().await {
                warn!(error = %e, "kill failed");
            }
        }
    }
}

/// Send SIGTERM to `pid`.
#[cfg(unix)]
pub fn terminate_pid(pid: u32) -> std::io::Result<()> {
    let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if result == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub fn terminate_pid(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "graceful termination needs unix signals",
    ))
}

/// Whether a process with `pid` exists (signal 0 only checks existence).
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}
