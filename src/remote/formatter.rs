//! Argument builders for `ssh` and `scp`.
//!
//! These are pure functions: they never touch the network or the file
//! system, which keeps the hardening options easy to assert in tests.

use std::ffi::OsString;

use camino::Utf8PathBuf;

use super::expand_tilde;

/// Options applied to every ssh and scp invocation. Instances are ephemeral,
/// so host keys are never recorded or verified.
pub const SSH_HARDENING_OPTIONS: [&str; 6] = [
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "ServerAliveInterval=10",
];

/// Identity and address used to reach an instance over ssh.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteTarget {
    /// Private key passed with `-i`.
    pub key: Utf8PathBuf,
    /// Login user on the instance.
    pub user: String,
    /// Hostname or IP address of the instance.
    pub host: String,
}

impl RemoteTarget {
    /// Creates a target from its parts.
    #[must_use]
    pub fn new(key: impl Into<Utf8PathBuf>, user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            user: user.into(),
            host: host.into(),
        }
    }

    fn login(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Direction of an scp transfer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CopyDirection {
    /// Copy from the instance to the local machine.
    Pull,
    /// Copy from the local machine to the instance.
    Push,
}

fn common_options(target: &RemoteTarget) -> Vec<OsString> {
    let mut args: Vec<OsString> = SSH_HARDENING_OPTIONS
        .iter()
        .map(OsString::from)
        .collect();
    args.push(OsString::from("-i"));
    args.push(OsString::from(expand_tilde(target.key.as_str())));
    args
}

/// Builds `ssh` arguments that run `command` on the target.
///
/// `extra_options` are inserted after the hardening options and before the
/// login, so callers can add flags such as `-t`.
#[must_use]
pub fn exec_args(target: &RemoteTarget, extra_options: &[&str], command: &[&str]) -> Vec<OsString> {
    let mut args = common_options(target);
    args.extend(extra_options.iter().map(OsString::from));
    args.push(OsString::from(target.login()));
    args.extend(command.iter().map(OsString::from));
    args
}

/// Builds `scp` arguments copying between `remote_path` and `local_path`.
#[must_use]
pub fn copy_args(
    target: &RemoteTarget,
    remote_path: &str,
    local_path: &str,
    direction: CopyDirection,
    recursive: bool,
) -> Vec<OsString> {
    let mut args = common_options(target);
    if recursive {
        args.push(OsString::from("-r"));
    }
    let remote = OsString::from(format!("{}:{remote_path}", target.login()));
    let local = OsString::from(local_path);
    match direction {
        CopyDirection::Pull => {
            args.push(remote);
            args.push(local);
        }
        CopyDirection::Push => {
            args.push(local);
            args.push(remote);
        }
    }
    args
}

/// Builds `ssh` arguments for a local port forward to the instance's debug
/// bridge port. The process runs without a remote command (`-N`) and exits if
/// the forward cannot be established.
#[must_use]
pub fn tunnel_args(target: &RemoteTarget, local_port: u16, remote_port: u16) -> Vec<OsString> {
    let mut args = common_options(target);
    args.push(OsString::from("-o"));
    args.push(OsString::from("ExitOnForwardFailure=yes"));
    args.push(OsString::from("-N"));
    args.push(OsString::from("-L"));
    args.push(OsString::from(format!(
        "{local_port}:127.0.0.1:{remote_port}"
    )));
    args.push(OsString::from(target.login()));
    args
}
