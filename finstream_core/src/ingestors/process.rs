//! # Ingestor Process Capability
//!
//! The supervisor never touches `tokio::process` directly. It launches through a
//! [`ProcessLauncher`] and drives the result through [`IngestorChild`], so the
//! whole lifecycle can run against scripted fakes in tests. [`TokioLauncher`] is
//! the real implementation: stdout and stderr piped, stdin closed, graceful stop
//! by SIGTERM and forced stop by SIGKILL.

use std::fmt;
use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};

use crate::configs::engine_config::AssetDefinition;

/// Environment variable through which an ingestor learns which asset it serves.
pub const ASSET_ID_VAR: &str = "FINSTREAM_ASSET_ID";

/// Boxed output stream of a child process.
pub type ChildOutput = Box<dyn AsyncRead + Send + Unpin>;

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessExit {
    /// Exit code, when the process exited on its own.
    pub code: Option<i32>,
    /// Terminating signal, when it was killed by one.
    pub signal: Option<i32>,
}

impl ProcessExit {
    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signalled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(sig)) => write!(f, "signal {sig}"),
            (None, None) => f.write_str("unknown exit"),
        }
    }
}

impl From<std::process::ExitStatus> for ProcessExit {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Starts ingestor processes.
pub trait ProcessLauncher: Send + Sync + 'static {
    /// Spawns the process described by `def`. Must not block.
    fn spawn(&self, def: &AssetDefinition) -> io::Result<Box<dyn IngestorChild>>;
}

/// A running ingestor process.
#[async_trait]
pub trait IngestorChild: Send {
    /// OS process id, if still known.
    fn id(&self) -> Option<u32>;

    /// Hands out stdout once.
    fn take_stdout(&mut self) -> Option<ChildOutput>;

    /// Hands out stderr once.
    fn take_stderr(&mut self) -> Option<ChildOutput>;

    /// Asks the process to stop (SIGTERM).
    fn terminate(&mut self) -> io::Result<()>;

    /// Forces the process to stop (SIGKILL). Does not wait for the exit.
    fn kill(&mut self) -> io::Result<()>;

    /// Waits for the process to exit. Cancel safe.
    async fn wait(&mut self) -> io::Result<ProcessExit>;
}

/// Launches ingestors as OS processes with `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioLauncher;

impl ProcessLauncher for TokioLauncher {
    fn spawn(&self, def: &AssetDefinition) -> io::Result<Box<dyn IngestorChild>> {
        let mut command = Command::new(&def.command);
        command
            .args(&def.args)
            .envs(&def.env)
            .env(ASSET_ID_VAR, &def.id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = command.spawn()?;
        tracing::debug!(asset = %def.id, pid = ?child.id(), command = %def.command, "ingestor process spawned");
        Ok(Box::new(TokioChild { child }))
    }
}

struct TokioChild {
    child: Child,
}

#[async_trait]
impl IngestorChild for TokioChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn take_stdout(&mut self) -> Option<ChildOutput> {
        self.child.stdout.take().map(|s| Box::new(s) as ChildOutput)
    }

    fn take_stderr(&mut self) -> Option<ChildOutput> {
        self.child.stderr.take().map(|s| Box::new(s) as ChildOutput)
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        // Already reaped: nothing left to signal.
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(io::Error::from)
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    fn kill(&mut self) -> io::Result<()> {
        match self.child.start_kill() {
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }

    async fn wait(&mut self) -> io::Result<ProcessExit> {
        self.child.wait().await.map(ProcessExit::from)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn sh(script: &str) -> AssetDefinition {
        AssetDefinition::new("T", "/bin/sh", vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn test_stdout_and_asset_env_reach_the_child() {
        let mut child = TokioLauncher.spawn(&sh("echo \"$FINSTREAM_ASSET_ID\"")).unwrap();
        let mut stdout = child.take_stdout().unwrap();
        assert!(child.take_stdout().is_none());
        let mut out = String::new();
        stdout.read_to_string(&mut out).await.unwrap();
        assert_eq!(out.trim(), "T");
        assert!(child.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_terminate_sends_sigterm() {
        let mut child = TokioLauncher.spawn(&sh("exec sleep 30")).unwrap();
        child.terminate().unwrap();
        let exit = child.wait().await.unwrap();
        assert_eq!(exit.signal, Some(nix::sys::signal::Signal::SIGTERM as i32));
    }

    #[test]
    fn test_missing_binary_is_a_spawn_error() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let def = AssetDefinition::new("T", "/definitely/not/here", vec![]);
        let result = rt.block_on(async { TokioLauncher.spawn(&def).map(|_| ()) });
        assert!(result.is_err());
    }
}
