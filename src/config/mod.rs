//! Session configuration loaded via `ortho-config`.
//!
//! [`SessionConfig`] merges defaults, `avd-tether.toml` and `AVD_TETHER_*`
//! environment variables. It is loaded once per invocation and treated as
//! read-only afterwards. The [`driver_file`] submodule reads the driver's own
//! flat configuration file.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

pub mod driver_file;

pub use driver_file::{DriverConfig, parse_driver_config};

/// Application name used for configuration discovery and temporary files.
pub const APP_NAME: &str = "avd-tether";

/// Largest accepted timeout, one week in seconds.
pub const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Kind of virtual device instance being managed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum InstanceType {
    /// Cloud virtual machine launched with the legacy image.
    Gce,
    /// Cloud virtual machine running a remote device image.
    RemoteAvd,
    /// Cuttlefish device hosted on a cloud virtual machine.
    Cuttlefish,
    /// Device nested inside another remote virtual machine.
    RemoteNestedAvd,
    /// Emulator hosted on a cloud virtual machine.
    Emulator,
}

impl InstanceType {
    /// Returns the configuration spelling of the type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gce => "gce",
            Self::RemoteAvd => "remote-avd",
            Self::Cuttlefish => "cuttlefish",
            Self::RemoteNestedAvd => "remote-nested-avd",
            Self::Emulator => "emulator",
        }
    }

    /// Whether the device runs directly on a cloud image whose `adbd` needs
    /// a restart before tunnelling.
    #[must_use]
    pub const fn is_cloud(self) -> bool {
        matches!(self, Self::Gce | Self::RemoteAvd)
    }

    /// Whether the device is driven by the nested runtime under
    /// `cuttlefish_runtime`.
    #[must_use]
    pub const fn is_nested_runtime(self) -> bool {
        matches!(self, Self::Cuttlefish | Self::RemoteNestedAvd)
    }

    /// Debug-bridge port the device listens on inside the instance.
    #[must_use]
    pub const fn default_adb_port(self) -> u16 {
        match self {
            Self::Emulator => 5555,
            _ => 6520,
        }
    }
}

impl fmt::Display for InstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceType {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "gce" => Ok(Self::Gce),
            "remote-avd" => Ok(Self::RemoteAvd),
            "cuttlefish" => Ok(Self::Cuttlefish),
            "remote-nested-avd" => Ok(Self::RemoteNestedAvd),
            "emulator" => Ok(Self::Emulator),
            other => Err(ConfigError::Invalid(format!(
                "unknown instance type '{other}': expected one of gce, remote-avd, \
                 cuttlefish, remote-nested-avd, emulator (AVD_TETHER_INSTANCE_TYPE or \
                 instance_type in avd-tether.toml)"
            ))),
        }
    }
}

/// Settings for one device session.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "AVD_TETHER",
    discovery(
        app_name = "avd-tether",
        env_var = "AVD_TETHER_CONFIG_PATH",
        config_file_name = "avd-tether.toml",
        dotfile_name = ".avd-tether.toml",
        project_file_name = "avd-tether.toml"
    )
)]
#[expect(
    clippy::struct_excessive_bools,
    reason = "configuration struct with user-facing toggle settings that are naturally expressed as booleans"
)]
pub struct SessionConfig {
    /// Path to the instance driver executable.
    #[ortho_config(default = "acloud".to_owned())]
    pub driver_bin: String,
    /// Driver configuration file passed with `--config_file`.
    pub driver_config: Option<String>,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    #[ortho_config(default = "scp".to_owned())]
    pub scp_bin: String,
    /// Path to the `adb` executable.
    #[ortho_config(default = "adb".to_owned())]
    pub adb_bin: String,
    /// Path to the `gcloud` executable used for serial console output.
    #[ortho_config(default = "gcloud".to_owned())]
    pub gcloud_bin: String,
    /// Private key used to reach instances. Supports tilde expansion.
    pub ssh_key_path: Option<String>,
    /// Login user on the instance.
    #[ortho_config(default = "vsoc-01".to_owned())]
    pub instance_user: String,
    /// One of `gce`, `remote-avd`, `cuttlefish`, `remote-nested-avd`,
    /// `emulator`.
    #[ortho_config(default = "cuttlefish".to_owned())]
    pub instance_type: String,
    /// Build target to launch.
    pub build_target: Option<String>,
    /// Build branch to launch.
    pub build_branch: Option<String>,
    /// Build id to launch.
    pub build_id: Option<String>,
    /// Login user on an existing host passed with `--host`.
    pub host_user: Option<String>,
    /// Service account key forwarded to the driver and to `gcloud`.
    pub service_account_key_path: Option<String>,
    /// Account email forwarded to the driver.
    pub email: Option<String>,
    /// Overall budget for launching and booting, in seconds.
    #[ortho_config(default = 1800)]
    pub boot_timeout_secs: u64,
    /// Budget for a re-established tunnel to come alive, in seconds.
    #[ortho_config(default = 120)]
    pub tunnel_online_timeout_secs: u64,
    /// Budget for the bridge to connect after a tunnel restart, in seconds.
    #[ortho_config(default = 60)]
    pub adb_connect_timeout_secs: u64,
    /// Limit for short remote commands and copies, in seconds.
    #[ortho_config(default = 60)]
    pub command_timeout_secs: u64,
    /// Number of times a launch is attempted before giving up.
    #[ortho_config(default = 1)]
    pub max_launch_attempts: u32,
    /// Comma-separated remote paths fetched in addition to the known logs.
    pub extra_remote_logs: Option<String>,
    /// Debug-bridge port inside the instance; defaults per instance type.
    pub remote_adb_port: Option<u16>,
    /// Whether the driver runs with `-v`.
    #[ortho_config(default = true)]
    pub driver_verbose: bool,
    /// Leaves the instance running after teardown.
    #[ortho_config(default = false)]
    pub skip_teardown: bool,
    /// Deletes the instance in the background without waiting.
    #[ortho_config(default = false)]
    pub nonblocking_teardown: bool,
    /// Local directory receiving salvaged logs and reports.
    #[ortho_config(default = "avd-artifacts".to_owned())]
    pub artifact_dir: String,
    /// Host-local users for nested resets as `address=user` pairs separated
    /// by commas.
    pub nested_user_map: Option<String>,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to avd-tether.toml",
            self.description, self.env_var, self.toml_key
        ))
    }
}

impl SessionConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from(APP_NAME)])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    fn require_field(value: Option<&str>, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        match value {
            Some(text) if !text.trim().is_empty() => Ok(()),
            _ => Err(metadata.missing()),
        }
    }

    fn require_positive(value: u64, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(ConfigError::Invalid(format!(
                "{} must be greater than zero: set {} or {} in avd-tether.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    fn require_bounded(value: u64, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value > MAX_TIMEOUT_SECS {
            return Err(ConfigError::Invalid(format!(
                "{} must be at most {MAX_TIMEOUT_SECS} seconds: set {} or {} in avd-tether.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Validates only what a bare driver invocation needs: the driver
    /// binary, its configuration file and the instance type. Used when
    /// deleting an instance left behind by an earlier run.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] or [`ConfigError::Invalid`] as
    /// [`Self::validate`] does for those fields.
    pub fn validate_driver(&self) -> Result<(), ConfigError> {
        Self::require_field(
            Some(&self.driver_bin),
            &FieldMetadata::new("driver binary", "AVD_TETHER_DRIVER_BIN", "driver_bin"),
        )?;
        Self::require_field(
            self.driver_config.as_deref(),
            &FieldMetadata::new(
                "driver configuration file",
                "AVD_TETHER_DRIVER_CONFIG",
                "driver_config",
            ),
        )?;
        self.instance_type()?;
        Ok(())
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and TOML key that supply the value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required value is absent
    /// and [`ConfigError::Invalid`] when a value cannot be used.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_driver()?;
        Self::require_field(
            self.ssh_key_path.as_deref(),
            &FieldMetadata::new("ssh private key", "AVD_TETHER_SSH_KEY_PATH", "ssh_key_path"),
        )?;
        Self::require_field(
            Some(&self.instance_user),
            &FieldMetadata::new("instance user", "AVD_TETHER_INSTANCE_USER", "instance_user"),
        )?;
        Self::require_field(
            Some(&self.artifact_dir),
            &FieldMetadata::new("artifact directory", "AVD_TETHER_ARTIFACT_DIR", "artifact_dir"),
        )?;
        self.instance_type()?;
        Self::require_positive(
            self.boot_timeout_secs,
            &FieldMetadata::new("boot timeout", "AVD_TETHER_BOOT_TIMEOUT_SECS", "boot_timeout_secs"),
        )?;
        Self::require_positive(
            self.command_timeout_secs,
            &FieldMetadata::new(
                "command timeout",
                "AVD_TETHER_COMMAND_TIMEOUT_SECS",
                "command_timeout_secs",
            ),
        )?;
        Self::require_positive(
            u64::from(self.max_launch_attempts),
            &FieldMetadata::new(
                "launch attempt count",
                "AVD_TETHER_MAX_LAUNCH_ATTEMPTS",
                "max_launch_attempts",
            ),
        )?;
        for (value, metadata) in [
            (
                self.boot_timeout_secs,
                FieldMetadata::new("boot timeout", "AVD_TETHER_BOOT_TIMEOUT_SECS", "boot_timeout_secs"),
            ),
            (
                self.tunnel_online_timeout_secs,
                FieldMetadata::new(
                    "tunnel online timeout",
                    "AVD_TETHER_TUNNEL_ONLINE_TIMEOUT_SECS",
                    "tunnel_online_timeout_secs",
                ),
            ),
            (
                self.adb_connect_timeout_secs,
                FieldMetadata::new(
                    "bridge connect timeout",
                    "AVD_TETHER_ADB_CONNECT_TIMEOUT_SECS",
                    "adb_connect_timeout_secs",
                ),
            ),
            (
                self.command_timeout_secs,
                FieldMetadata::new(
                    "command timeout",
                    "AVD_TETHER_COMMAND_TIMEOUT_SECS",
                    "command_timeout_secs",
                ),
            ),
        ] {
            Self::require_bounded(value, &metadata)?;
        }
        self.nested_users()?;
        Ok(())
    }

    /// Parses the configured instance type.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unknown type.
    pub fn instance_type(&self) -> Result<InstanceType, ConfigError> {
        self.instance_type.parse()
    }

    /// Debug-bridge port inside the instance.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unknown instance type.
    pub fn adb_port(&self) -> Result<u16, ConfigError> {
        match self.remote_adb_port {
            Some(port) => Ok(port),
            None => Ok(self.instance_type()?.default_adb_port()),
        }
    }

    /// Driver configuration file path.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when it is not configured.
    pub fn driver_config_path(&self) -> Result<Utf8PathBuf, ConfigError> {
        self.driver_config
            .as_deref()
            .filter(|path| !path.trim().is_empty())
            .map(Utf8PathBuf::from)
            .ok_or_else(|| {
                FieldMetadata::new(
                    "driver configuration file",
                    "AVD_TETHER_DRIVER_CONFIG",
                    "driver_config",
                )
                .missing()
            })
    }

    /// Private key path with a leading `~/` expanded.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when no key is configured.
    pub fn ssh_key(&self) -> Result<Utf8PathBuf, ConfigError> {
        self.ssh_key_path
            .as_deref()
            .filter(|path| !path.trim().is_empty())
            .map(|path| Utf8PathBuf::from(crate::remote::expand_tilde(path)))
            .ok_or_else(|| {
                FieldMetadata::new("ssh private key", "AVD_TETHER_SSH_KEY_PATH", "ssh_key_path")
                    .missing()
            })
    }

    /// Overall launch and boot budget.
    #[must_use]
    pub const fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_secs)
    }

    /// Budget for a restarted tunnel to come alive.
    #[must_use]
    pub const fn tunnel_online_timeout(&self) -> Duration {
        Duration::from_secs(self.tunnel_online_timeout_secs)
    }

    /// Budget for the bridge to reconnect.
    #[must_use]
    pub const fn adb_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.adb_connect_timeout_secs)
    }

    /// Limit for short remote commands.
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Extra remote log paths, trimmed and without empty entries.
    #[must_use]
    pub fn extra_remote_logs(&self) -> Vec<String> {
        self.extra_remote_logs
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|path| !path.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Parses the nested host-user mapping into `address -> user`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when an entry is not `address=user`.
    pub fn nested_users(&self) -> Result<BTreeMap<String, String>, ConfigError> {
        let mut users = BTreeMap::new();
        let Some(raw) = self.nested_user_map.as_deref() else {
            return Ok(users);
        };
        for entry in raw.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
            let parsed = entry
                .split_once('=')
                .map(|(address, user)| (address.trim(), user.trim()))
                .filter(|(address, user)| !address.is_empty() && !user.is_empty());
            let Some((address, user)) = parsed else {
                return Err(ConfigError::Invalid(format!(
                    "nested user entry '{entry}' must look like address=user \
                     (AVD_TETHER_NESTED_USER_MAP or nested_user_map in avd-tether.toml)"
                )));
            };
            users.insert(address.to_owned(), user.to_owned());
        }
        Ok(users)
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configured value cannot be used.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

#[cfg(test)]
mod tests;
