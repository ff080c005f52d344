//! Argument vectors for the instance driver and related pure helpers.

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8Path;
use regex::Regex;

use crate::config::{InstanceType, SessionConfig};

/// Pattern matching an instance name echoed by the driver while it is still
/// booting the instance.
pub const INSTANCE_NAME_PATTERN: &str = r"'name': '((?:gce-|ins-)[^']*)'";

/// Paths shared by one driver invocation.
#[derive(Clone, Copy, Debug)]
pub struct DriverFiles<'a> {
    /// Private copy of the driver configuration.
    pub config: &'a Utf8Path,
    /// File the driver writes its JSON report to.
    pub report: &'a Utf8Path,
}

fn push_pair(args: &mut Vec<OsString>, flag: &str, value: impl Into<OsString>) {
    args.push(OsString::from(flag));
    args.push(value.into());
}

fn push_optional(args: &mut Vec<OsString>, flag: &str, value: Option<&str>) {
    if let Some(text) = value.map(str::trim).filter(|text| !text.is_empty()) {
        push_pair(args, flag, text);
    }
}

/// Builds the driver `create` invocation.
///
/// With `existing_host` the driver reuses that machine (`--host`) instead of
/// launching from a build.
#[must_use]
pub fn create_args(
    config: &SessionConfig,
    files: DriverFiles<'_>,
    boot_timeout: Duration,
    existing_host: Option<&str>,
) -> Vec<OsString> {
    let mut args = vec![OsString::from("create")];
    if let Some(host) = existing_host {
        push_pair(&mut args, "--host", host);
        let user = config.host_user.as_deref().unwrap_or(&config.instance_user);
        push_pair(&mut args, "--host-user", user);
    } else {
        push_optional(&mut args, "--build_target", config.build_target.as_deref());
        push_optional(&mut args, "--branch", config.build_branch.as_deref());
        push_optional(&mut args, "--build_id", config.build_id.as_deref());
    }
    push_pair(&mut args, "--config_file", files.config.as_str());
    push_pair(
        &mut args,
        "--boot-timeout",
        boot_timeout.as_secs().to_string(),
    );
    push_pair(&mut args, "--report_file", files.report.as_str());
    args.extend(
        ["--no-autoconnect", "--yes", "--skip-pre-run-check"]
            .into_iter()
            .map(OsString::from),
    );
    if config.driver_verbose {
        args.push(OsString::from("-v"));
    }
    push_optional(
        &mut args,
        "--service_account_json_private_key_path",
        config.service_account_key_path.as_deref(),
    );
    push_optional(&mut args, "--email", config.email.as_deref());
    args
}

/// Builds the driver `delete` invocation.
#[must_use]
pub fn delete_args(instance_name: &str, files: DriverFiles<'_>) -> Vec<OsString> {
    let mut args = vec![OsString::from("delete")];
    push_pair(&mut args, "--instance_names", instance_name);
    push_pair(&mut args, "--config_file", files.config.as_str());
    push_pair(&mut args, "--report_file", files.report.as_str());
    args
}

/// Finds the instance name the driver printed before it timed out.
#[must_use]
pub fn scrape_instance_name(output: &str) -> Option<String> {
    let pattern = Regex::new(INSTANCE_NAME_PATTERN).ok()?;
    pattern
        .captures(output)
        .and_then(|captures| captures.get(1))
        .map(|name| name.as_str().to_owned())
}

/// Extracts the remote path from `bugreportz` output (`OK:<path>`).
#[must_use]
pub fn bugreport_path(stdout: &str) -> Option<&str> {
    stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix("OK:"))
        .map(str::trim)
        .filter(|path| !path.is_empty())
}

/// Remote log files worth salvaging for `instance_type`.
#[must_use]
pub fn known_remote_logs(instance_type: InstanceType, user: &str) -> Vec<String> {
    match instance_type {
        InstanceType::Cuttlefish | InstanceType::RemoteNestedAvd => [
            "kernel.log",
            "logcat",
            "cuttlefish_config.json",
            "launcher.log",
        ]
        .iter()
        .map(|file| format!("{}/{file}", nested_runtime_dir(user)))
        .collect(),
        InstanceType::Emulator => ["logcat.log", "adb.log", "kernel.log"]
            .iter()
            .map(|file| format!("/home/{user}/log/{file}"))
            .collect(),
        InstanceType::Gce | InstanceType::RemoteAvd => vec![String::from("/var/log/kern.log")],
    }
}

/// Runtime directory of the nested device owned by `user`.
#[must_use]
pub fn nested_runtime_dir(user: &str) -> String {
    format!("/home/{user}/cuttlefish_runtime")
}

/// Arguments fetching the serial console of `instance_name`.
#[must_use]
pub fn serial_port_args(instance_name: &str, project: &str, zone: &str) -> Vec<OsString> {
    [
        "compute",
        "instances",
        "get-serial-port-output",
        instance_name,
        "--project",
        project,
        "--zone",
        zone,
        "--port",
        "1",
    ]
    .into_iter()
    .map(OsString::from)
    .collect()
}

/// Arguments activating a service account before console retrieval.
#[must_use]
pub fn activate_service_account_args(key_file: &str) -> Vec<OsString> {
    ["auth", "activate-service-account", "--key-file", key_file]
        .into_iter()
        .map(OsString::from)
        .collect()
}
