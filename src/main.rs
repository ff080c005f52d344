//! Binary entry point for the avd-tether CLI.

use std::io::{self, Write};
use std::process;

use camino::Utf8Path;
use clap::Parser;
use shell_escape::unix::escape;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use avd_tether::attributes::INSTANCE_NAME;
use avd_tether::{
    AdbBridge, ArtifactDir, ArtifactError, BuildAttributes, ConfigError, DeviceSession,
    InstanceManager, ManagerError, ProcessCommandRunner, SessionConfig, SessionError,
    TeardownReport,
};

mod cli;

use cli::{Cli, DeleteCommand, RunCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error("instance {0} could not be deleted")]
    Delete(String),
    #[error("invalid command argument: {0}")]
    InvalidCommand(String),
    #[error("failed to start {program}: {message}")]
    Spawn { program: String, message: String },
    #[error("device has no bridge address")]
    MissingSerial,
    #[error("command terminated without an exit status")]
    MissingExitCode,
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Run(command) => run_command(command).await,
        Cli::Delete(command) => delete_command(command).await,
    }
}

async fn run_command(args: RunCommand) -> Result<i32, CliError> {
    let RunCommand {
        host,
        keep_instance,
        command,
    } = args;
    validate_command_args(&command)?;

    let mut config = SessionConfig::load_without_cli_args()?;
    config.skip_teardown |= keep_instance;
    config.validate()?;
    let artifacts = ArtifactDir::create(Utf8Path::new(&config.artifact_dir))?;
    info!(artifacts = %artifacts.root(), "saving diagnostics");

    let runner = ProcessCommandRunner;
    let bridge = AdbBridge::new(runner, config.adb_bin.clone(), config.command_timeout());
    let mut session = DeviceSession::new(runner, bridge, config, artifacts)?;
    if let Some(existing) = host {
        session = session.with_existing_host(existing);
    }

    let outcome = match session.setup().await {
        Ok(()) => run_local(&command, session.serial()).await,
        Err(err) => Err(CliError::Session(err)),
    };
    let failure = outcome.as_ref().err().map(ToString::to_string);
    let report = session.teardown(failure.as_deref()).await;
    log_teardown(&report);
    outcome
}

async fn run_local(command: &[String], device_serial: Option<String>) -> Result<i32, CliError> {
    let Some((program, rest)) = command.split_first() else {
        return Err(CliError::InvalidCommand(String::from("command is empty")));
    };
    let serial = device_serial.ok_or(CliError::MissingSerial)?;
    info!(command = %render_command(command), serial = %serial, "running command against device");
    let status = Command::new(program)
        .args(rest)
        .env("ANDROID_SERIAL", &serial)
        .status()
        .await
        .map_err(|err| CliError::Spawn {
            program: program.clone(),
            message: err.to_string(),
        })?;
    status.code().ok_or(CliError::MissingExitCode)
}

async fn delete_command(args: DeleteCommand) -> Result<i32, CliError> {
    let DeleteCommand { instance_name } = args;
    let config = SessionConfig::load_without_cli_args()?;
    config.validate_driver()?;
    let attributes = BuildAttributes::new();
    attributes.set(INSTANCE_NAME, instance_name.as_str());
    let mut manager = InstanceManager::new(ProcessCommandRunner, config, attributes)?;
    manager.preflight_driver()?;
    if manager.shutdown().await {
        info!(instance = %instance_name, "instance deleted");
        Ok(0)
    } else {
        Err(CliError::Delete(instance_name))
    }
}

fn log_teardown(report: &TeardownReport) {
    for (step, outcome) in report.failures() {
        warn!(step = %step, outcome = ?outcome, "teardown step did not complete");
    }
    info!(
        artifacts = report.artifacts().len(),
        clean = report.is_clean(),
        "teardown finished"
    );
}

fn render_command(args: &[String]) -> String {
    args.iter()
        .map(|arg| escape(arg.as_str().into()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn validate_command_args(args: &[String]) -> Result<(), CliError> {
    for arg in args {
        if arg.chars().any(|ch| matches!(ch, '\u{0000}'..='\u{001F}' | '\u{007F}')) {
            return Err(CliError::InvalidCommand(String::from(concat!(
                "command arguments must not contain control characters (ASCII ",
                "0x00-0x1F or 0x7F, e.g. newline, carriage return, tab, NUL)"
            ))));
        }
    }
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
