//! Core command types and the runner abstraction.

use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::RemoteError;

const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Future returned by runner and child-process operations.
pub type RunnerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RemoteError>> + Send + 'a>>;

/// Result of running an external command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Whether the command was killed because it exceeded its time limit.
    pub timed_out: bool,
}

impl CommandOutput {
    /// Returns `true` when the command finished in time with exit code zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        !self.timed_out && matches!(self.code, Some(0))
    }

    /// Human readable exit status used in error messages.
    #[must_use]
    pub fn status_text(&self) -> String {
        if self.timed_out {
            return String::from("timeout");
        }
        self.code
            .map_or_else(|| String::from("unknown"), |code| code.to_string())
    }
}

/// Whether a spawned process is tied to its handle or left running.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SpawnMode {
    /// The process is killed when its handle is dropped.
    Supervised,
    /// The process keeps running after its handle is dropped.
    Detached,
}

/// Handle to a long-lived process such as an ssh tunnel.
pub trait ChildProcess: Send {
    /// Operating system process id, when still known.
    fn id(&self) -> Option<u32>;

    /// Returns `true` while the process has not exited.
    fn is_alive(&mut self) -> bool;

    /// Waits for the process to exit and returns its exit code.
    ///
    /// The returned future is cancel safe; dropping it leaves the process
    /// untouched.
    fn wait(&mut self) -> RunnerFuture<'_, Option<i32>>;

    /// Sends a kill signal without waiting for the exit.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Wait`] when the signal cannot be delivered.
    fn kill(&mut self) -> Result<(), RemoteError>;
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` to completion, capturing stdout and stderr. When
    /// `limit` elapses the process is killed and the output is returned with
    /// [`CommandOutput::timed_out`] set.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Spawn`] if the command cannot be started.
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        limit: Duration,
    ) -> RunnerFuture<'a, CommandOutput>;

    /// Starts `program` in the background and returns a handle to it.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Spawn`] if the command cannot be started.
    fn spawn(
        &self,
        program: &str,
        args: &[OsString],
        mode: SpawnMode,
    ) -> Result<Box<dyn ChildProcess>, RemoteError>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        limit: Duration,
    ) -> RunnerFuture<'a, CommandOutput> {
        Box::pin(async move {
            let mut child = Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|err| RemoteError::Spawn {
                    program: program.to_owned(),
                    message: err.to_string(),
                })?;

            let stdout = tokio::spawn(drain(child.stdout.take()));
            let stderr = tokio::spawn(drain(child.stderr.take()));

            let (code, timed_out) = match timeout(limit, child.wait()).await {
                Ok(Ok(status)) => (status.code(), false),
                Ok(Err(err)) => {
                    return Err(RemoteError::Wait {
                        program: program.to_owned(),
                        message: err.to_string(),
                    });
                }
                Err(_) => {
                    warn!(
                        program,
                        timeout_secs = limit.as_secs(),
                        "command exceeded its time limit; killing it"
                    );
                    if let Err(err) = child.kill().await {
                        warn!(program, error = %err, "failed to kill timed out command");
                    }
                    (None, true)
                }
            };

            Ok(CommandOutput {
                code,
                stdout: collect(stdout).await,
                stderr: collect(stderr).await,
                timed_out,
            })
        })
    }

    fn spawn(
        &self,
        program: &str,
        args: &[OsString],
        mode: SpawnMode,
    ) -> Result<Box<dyn ChildProcess>, RemoteError> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(mode == SpawnMode::Supervised)
            .spawn()
            .map_err(|err| RemoteError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;
        debug!(program, pid = child.id(), ?mode, "spawned background process");
        Ok(Box::new(ProcessChild {
            program: program.to_owned(),
            child,
        }))
    }
}

struct ProcessChild {
    program: String,
    child: Child,
}

impl ChildProcess for ProcessChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn wait(&mut self) -> RunnerFuture<'_, Option<i32>> {
        Box::pin(async move {
            let status = self.child.wait().await.map_err(|err| RemoteError::Wait {
                program: self.program.clone(),
                message: err.to_string(),
            })?;
            Ok(status.code())
        })
    }

    fn kill(&mut self) -> Result<(), RemoteError> {
        self.child.start_kill().map_err(|err| RemoteError::Wait {
            program: self.program.clone(),
            message: err.to_string(),
        })
    }
}

async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buffer = Vec::new();
    if let Some(mut reader) = pipe
        && let Err(err) = reader.read_to_end(&mut buffer).await
    {
        debug!(error = %err, "stopped reading command output early");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

// Grandchildren may keep the pipe open after the direct child exited.
async fn collect(handle: JoinHandle<String>) -> String {
    match timeout(OUTPUT_DRAIN_TIMEOUT, handle).await {
        Ok(Ok(text)) => text,
        _ => String::new(),
    }
}
