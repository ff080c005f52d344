//! Command-line interface definitions for the `avd-tether` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `avd-tether` binary.
#[derive(Debug, Parser)]
#[command(
    name = "avd-tether",
    version,
    about = "Launch a remote Android virtual device, tunnel its debug bridge, and tear it down",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Bring a device up, run a local command against it, then tear down.
    #[command(
        name = "run",
        about = "Bring a device up, run a local command against it, then tear down"
    )]
    Run(RunCommand),
    /// Delete an instance left behind by an earlier run.
    #[command(name = "delete", about = "Delete an instance left behind by an earlier run")]
    Delete(DeleteCommand),
}

/// Arguments for the `avd-tether run` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RunCommand {
    /// Launch onto this already running host instead of creating an
    /// instance from a build.
    #[arg(long, value_name = "HOST")]
    pub(crate) host: Option<String>,
    /// Leave the instance running after the command finishes.
    ///
    /// Diagnostics are still collected and the tunnel is still closed. Use
    /// `avd-tether delete` to remove the instance later.
    #[arg(long)]
    pub(crate) keep_instance: bool,
    /// Command to run locally with `ANDROID_SERIAL` set to the device (use
    /// -- to separate flags).
    #[arg(required = true, trailing_var_arg = true)]
    pub(crate) command: Vec<String>,
}

/// Arguments for the `avd-tether delete` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct DeleteCommand {
    /// Name of the instance, as printed by the driver (`ins-...`).
    #[arg(long, value_name = "NAME")]
    pub(crate) instance_name: String,
}
