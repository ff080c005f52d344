//! Command execution and ssh/scp plumbing for reaching remote instances.
//!
//! Every external program the crate touches (the instance driver, `ssh`,
//! `scp`, `adb`, `gcloud`) goes through the [`CommandRunner`] abstraction so
//! tests can script outcomes without spawning processes. The formatter
//! submodule builds argument vectors with the fixed hardening options, and
//! [`RemoteHost`] binds them to a concrete key, user and host.

use camino::Utf8PathBuf;
use thiserror::Error;

mod formatter;
mod host;
mod types;
mod util;

pub use formatter::{
    CopyDirection, RemoteTarget, SSH_HARDENING_OPTIONS, copy_args, exec_args, tunnel_args,
};
pub use host::RemoteHost;
pub use types::{
    ChildProcess, CommandOutput, CommandRunner, ProcessCommandRunner, RunnerFuture, SpawnMode,
};
pub use util::expand_tilde;

/// Errors surfaced while running local or remote commands.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RemoteError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when waiting on or signalling a running process fails.
    #[error("failed to supervise {program}: {message}")]
    Wait {
        /// Command being supervised.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a command completes unsuccessfully or times out.
    #[error("{program} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Command name used for the attempted operation.
        program: String,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the process.
        stderr: String,
    },
    /// Raised when a local file system operation fails.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
}

impl RemoteError {
    /// Builds a [`RemoteError::CommandFailure`] from captured output.
    #[must_use]
    pub fn from_output(program: &str, output: &CommandOutput) -> Self {
        Self::CommandFailure {
            program: program.to_owned(),
            status_text: output.status_text(),
            stderr: output.stderr.trim().to_owned(),
        }
    }
}
