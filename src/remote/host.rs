//! A remote instance reachable over ssh, bound to a runner and key.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use super::formatter::{CopyDirection, RemoteTarget, copy_args, exec_args, tunnel_args};
use super::{ChildProcess, CommandOutput, CommandRunner, RemoteError, SpawnMode};

/// Runs commands on, and copies files to and from, a single instance.
#[derive(Clone, Debug)]
pub struct RemoteHost<R> {
    runner: R,
    ssh_bin: String,
    scp_bin: String,
    target: RemoteTarget,
    command_timeout: Duration,
}

impl<R: CommandRunner> RemoteHost<R> {
    /// Creates a host wrapper.
    #[must_use]
    pub fn new(
        runner: R,
        ssh_bin: impl Into<String>,
        scp_bin: impl Into<String>,
        target: RemoteTarget,
        command_timeout: Duration,
    ) -> Self {
        Self {
            runner,
            ssh_bin: ssh_bin.into(),
            scp_bin: scp_bin.into(),
            target,
            command_timeout,
        }
    }

    /// Returns the ssh target this host connects to.
    #[must_use]
    pub const fn target(&self) -> &RemoteTarget {
        &self.target
    }

    /// Runs `command` over ssh with the default short-command timeout. The
    /// output is returned whatever the exit status.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError`] when ssh cannot be started.
    pub async fn exec(&self, command: &[&str]) -> Result<CommandOutput, RemoteError> {
        self.exec_with_timeout(command, self.command_timeout).await
    }

    /// Runs `command` over ssh, bounded by `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError`] when ssh cannot be started.
    pub async fn exec_with_timeout(
        &self,
        command: &[&str],
        limit: Duration,
    ) -> Result<CommandOutput, RemoteError> {
        let args = exec_args(&self.target, &[], command);
        debug!(host = %self.target.host, command = %command.join(" "), "running remote command");
        self.runner.run(&self.ssh_bin, &args, limit).await
    }

    /// Starts an ssh process forwarding `local_port` on the loopback
    /// interface to `remote_port` on the instance. The process is killed
    /// when the returned handle is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Spawn`] when ssh cannot be started.
    pub fn open_tunnel(
        &self,
        local_port: u16,
        remote_port: u16,
    ) -> Result<Box<dyn ChildProcess>, RemoteError> {
        let args = tunnel_args(&self.target, local_port, remote_port);
        debug!(host = %self.target.host, local_port, remote_port, "opening tunnel");
        self.runner
            .spawn(&self.ssh_bin, &args, SpawnMode::Supervised)
    }

    /// Copies a single remote file to `local`.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::CommandFailure`] when scp fails or times out.
    pub async fn fetch_file(
        &self,
        remote: &str,
        local: &Utf8Path,
    ) -> Result<Utf8PathBuf, RemoteError> {
        self.copy(remote, local, CopyDirection::Pull, false).await?;
        Ok(local.to_path_buf())
    }

    /// Copies a remote directory recursively into `local`.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::CommandFailure`] when scp fails or times out.
    pub async fn fetch_dir(
        &self,
        remote: &str,
        local: &Utf8Path,
    ) -> Result<Utf8PathBuf, RemoteError> {
        self.copy(remote, local, CopyDirection::Pull, true).await?;
        Ok(local.to_path_buf())
    }

    /// Copies a local file to `remote`.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::CommandFailure`] when scp fails or times out.
    pub async fn push_file(&self, local: &Utf8Path, remote: &str) -> Result<(), RemoteError> {
        self.copy(remote, local, CopyDirection::Push, false).await
    }

    async fn copy(
        &self,
        remote: &str,
        local: &Utf8Path,
        direction: CopyDirection,
        recursive: bool,
    ) -> Result<(), RemoteError> {
        let args = copy_args(&self.target, remote, local.as_str(), direction, recursive);
        let output = self
            .runner
            .run(&self.scp_bin, &args, self.command_timeout)
            .await?;
        if output.is_success() {
            return Ok(());
        }
        Err(RemoteError::from_output(&self.scp_bin, &output))
    }
}
