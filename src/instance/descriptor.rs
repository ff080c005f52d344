//! Typed view of the driver's JSON report.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use camino::Utf8Path;
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Build metadata keys copied from a device entry when present.
pub const BUILD_VAR_KEYS: [&str; 12] = [
    "branch",
    "build_id",
    "build_target",
    "gcs_bucket_build_id",
    "kernel_branch",
    "kernel_build_id",
    "kernel_build_target",
    "system_branch",
    "system_build_id",
    "system_build_target",
    "emulator_branch",
    "emulator_build_id",
];

/// Outcome reported by the driver.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum InstanceStatus {
    /// Instance launched and booted.
    Success,
    /// Instance could not be launched.
    Fail,
    /// Instance launched but the device did not boot.
    BootFail,
    /// Device booted but never came online over the bridge.
    DeviceOffline,
}

impl InstanceStatus {
    /// Returns the wire spelling of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Fail => "FAIL",
            Self::BootFail => "BOOT_FAIL",
            Self::DeviceOffline => "DEVICE_OFFLINE",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "SUCCESS" => Ok(Self::Success),
            "FAIL" => Ok(Self::Fail),
            "BOOT_FAIL" => Ok(Self::BootFail),
            "DEVICE_OFFLINE" => Ok(Self::DeviceOffline),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

/// Network endpoint of the device's debug-bridge port.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Endpoint {
    /// Instance hostname or IP address.
    pub host: String,
    /// Debug-bridge port.
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parsed result of a driver invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceDescriptor {
    name: Option<String>,
    endpoint: Option<Endpoint>,
    status: InstanceStatus,
    errors: String,
    build_vars: BTreeMap<String, String>,
}

impl InstanceDescriptor {
    /// Builds a descriptor for an instance that timed out while booting,
    /// known only by its name.
    #[must_use]
    pub fn boot_failure(name: impl Into<String>, errors: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            endpoint: None,
            status: InstanceStatus::BootFail,
            errors: errors.into(),
            build_vars: BTreeMap::new(),
        }
    }

    /// Instance name assigned by the driver.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Debug-bridge endpoint, present for every `SUCCESS` descriptor.
    #[must_use]
    pub const fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> InstanceStatus {
        self.status
    }

    /// Error text reported by the driver, joined by newlines.
    #[must_use]
    pub fn errors(&self) -> &str {
        &self.errors
    }

    /// Build metadata reported for the device.
    #[must_use]
    pub const fn build_vars(&self) -> &BTreeMap<String, String> {
        &self.build_vars
    }

    /// Downgrades a `SUCCESS` descriptor to `DEVICE_OFFLINE` or `FAIL`.
    /// Returns `false` and leaves the status untouched for any other
    /// transition.
    pub fn downgrade(&mut self, status: InstanceStatus) -> bool {
        let allowed = self.status == InstanceStatus::Success
            && matches!(status, InstanceStatus::DeviceOffline | InstanceStatus::Fail);
        if allowed {
            self.status = status;
        } else {
            warn!(from = %self.status, to = %status, "refusing status transition");
        }
        allowed
    }
}

/// Errors raised while reading a driver report.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DescriptorError {
    /// The report could not yield a descriptor. The message is the driver's
    /// error text, or the raw report when that is unavailable.
    #[error("instance setup failed: {message}")]
    Setup {
        /// Driver error text or raw report.
        message: String,
    },
    /// The report file could not be read.
    #[error("failed to read driver report {path}: {message}")]
    Unreadable {
        /// Report path.
        path: String,
        /// Operating system error string.
        message: String,
    },
}

impl DescriptorError {
    /// Message carried by the error.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Setup { message } | Self::Unreadable { message, .. } => message,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Report {
    status: Option<String>,
    data: Option<ReportData>,
}

#[derive(Debug, Deserialize)]
struct ReportData {
    devices: Option<Vec<DeviceEntry>>,
    devices_failing_boot: Option<Vec<DeviceEntry>>,
}

#[derive(Debug, Deserialize)]
struct DeviceEntry {
    ip: Option<String>,
    instance_name: Option<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

/// Parses report text. `default_port` is used when the device entry's `ip`
/// carries no port.
///
/// Returns `Ok(None)` when the selected device list does not hold exactly
/// one entry.
///
/// # Errors
///
/// Returns [`DescriptorError::Setup`] when the report is structurally
/// unusable.
pub fn parse_report(
    text: &str,
    default_port: u16,
) -> Result<Option<InstanceDescriptor>, DescriptorError> {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return Err(setup_error(None, text));
    };
    let report = serde_json::from_value::<Report>(value.clone())
        .map_err(|_| setup_error(Some(&value), text))?;
    let status = report
        .status
        .as_deref()
        .and_then(|raw| raw.parse::<InstanceStatus>().ok())
        .ok_or_else(|| setup_error(Some(&value), text))?;
    let data = report.data.ok_or_else(|| setup_error(Some(&value), text))?;
    let entries = match status {
        InstanceStatus::Fail | InstanceStatus::BootFail => data.devices_failing_boot,
        InstanceStatus::Success | InstanceStatus::DeviceOffline => data.devices,
    }
    .ok_or_else(|| setup_error(Some(&value), text))?;

    let count = entries.len();
    let mut entries = entries.into_iter();
    let (Some(entry), None) = (entries.next(), entries.next()) else {
        warn!(count, %status, "driver report must list exactly one device");
        return Ok(None);
    };

    let endpoint = entry.ip.as_deref().map(|ip| split_endpoint(ip, default_port));
    if status == InstanceStatus::Success && endpoint.is_none() {
        return Err(setup_error(Some(&value), text));
    }

    Ok(Some(InstanceDescriptor {
        name: entry
            .instance_name
            .map(|name| name.trim().to_owned())
            .filter(|name| !name.is_empty()),
        endpoint,
        status,
        errors: joined_errors(&value).unwrap_or_default(),
        build_vars: build_vars(&entry.extra),
    }))
}

/// Reads and parses the report at `path`.
///
/// # Errors
///
/// Returns [`DescriptorError::Unreadable`] when the file cannot be read and
/// [`DescriptorError::Setup`] when its content is unusable.
pub fn parse_report_file(
    path: &Utf8Path,
    default_port: u16,
) -> Result<Option<InstanceDescriptor>, DescriptorError> {
    let unreadable = |message: String| DescriptorError::Unreadable {
        path: path.to_string(),
        message,
    };
    let parent = path
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| unreadable(String::from("path has no file name")))?;
    let text = Dir::open_ambient_dir(parent, ambient_authority())
        .and_then(|dir| dir.read_to_string(file_name))
        .map_err(|err| unreadable(err.to_string()))?;
    if text.trim().is_empty() {
        return Err(unreadable(String::from("report is empty")));
    }
    parse_report(&text, default_port)
}

fn split_endpoint(ip: &str, default_port: u16) -> Endpoint {
    let trimmed = ip.trim();
    if let Some((host, port)) = trimmed.rsplit_once(':')
        && let Ok(port) = port.parse::<u16>()
        && !host.contains(':')
    {
        return Endpoint {
            host: host.to_owned(),
            port,
        };
    }
    Endpoint {
        host: trimmed.to_owned(),
        port: default_port,
    }
}

fn build_vars(extra: &BTreeMap<String, Value>) -> BTreeMap<String, String> {
    BUILD_VAR_KEYS
        .iter()
        .filter_map(|key| {
            let text = match extra.get(*key)? {
                Value::String(text) => text.trim().to_owned(),
                Value::Number(number) => number.to_string(),
                _ => return None,
            };
            (!text.is_empty()).then(|| ((*key).to_owned(), text))
        })
        .collect()
}

fn joined_errors(value: &Value) -> Option<String> {
    let lines = value
        .get("errors")?
        .as_array()?
        .iter()
        .map(|line| line.as_str().map(str::to_owned))
        .collect::<Option<Vec<_>>>()?;
    (!lines.is_empty()).then(|| lines.join("\n"))
}

fn setup_error(value: Option<&Value>, raw: &str) -> DescriptorError {
    let message = value
        .and_then(joined_errors)
        .unwrap_or_else(|| raw.to_owned());
    DescriptorError::Setup { message }
}
