//! Driver-backed instance manager.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use tempfile::TempPath;
use tracing::{debug, info, warn};

use super::descriptor::{InstanceDescriptor, InstanceStatus, parse_report_file};
use super::driver::{
    DriverFiles, activate_service_account_args, bugreport_path, create_args, delete_args,
    known_remote_logs, nested_runtime_dir, scrape_instance_name, serial_port_args,
};
use super::{DescriptorError, ManagerError};
use crate::artifacts::ArtifactDir;
use crate::attributes::{BuildAttributes, CLEANUP_ATTEMPTED, INSTANCE_NAME};
use crate::config::{APP_NAME, InstanceType, SessionConfig, parse_driver_config};
use crate::remote::{
    ChildProcess, CommandOutput, CommandRunner, RemoteError, RemoteHost, RemoteTarget, SpawnMode,
};

const LAUNCH_SLACK: Duration = Duration::from_secs(30);
const DELETE_TIMEOUT: Duration = Duration::from_secs(300);
const BUGREPORT_TIMEOUT: Duration = Duration::from_secs(300);

/// Temporary files backing one driver invocation. Both are removed on drop.
struct InvocationFiles {
    config: TempPath,
    report: TempPath,
    config_path: Utf8PathBuf,
    report_path: Utf8PathBuf,
}

impl InvocationFiles {
    fn prepare(config: &SessionConfig) -> Result<Self, ManagerError> {
        let source = config.driver_config_path()?;
        let text = read_utf8(&source).map_err(|err| ManagerError::Io {
            path: source.to_string(),
            message: err.to_string(),
        })?;
        let mut copy = tempfile::Builder::new()
            .prefix(&format!("{APP_NAME}-config-"))
            .suffix(".cfg")
            .tempfile()
            .map_err(|err| temp_error("driver config copy", &err))?;
        copy.write_all(text.as_bytes())
            .map_err(|err| temp_error("driver config copy", &err))?;
        let report = tempfile::Builder::new()
            .prefix(&format!("{APP_NAME}-report-"))
            .suffix(".json")
            .tempfile()
            .map_err(|err| temp_error("driver report", &err))?
            .into_temp_path();
        let config_copy = copy.into_temp_path();
        Ok(Self {
            config_path: utf8(&config_copy)?,
            report_path: utf8(&report)?,
            config: config_copy,
            report,
        })
    }

    fn driver_files(&self) -> DriverFiles<'_> {
        DriverFiles {
            config: &self.config_path,
            report: &self.report_path,
        }
    }

    fn close(self) {
        for (path, temp) in [(self.config_path, self.config), (self.report_path, self.report)] {
            if let Err(err) = temp.close() {
                warn!(path = %path, error = %err, "failed to remove temporary file");
            }
        }
    }
}

fn temp_error(what: &str, err: &std::io::Error) -> ManagerError {
    ManagerError::Io {
        path: what.to_owned(),
        message: err.to_string(),
    }
}

fn utf8(path: &Path) -> Result<Utf8PathBuf, ManagerError> {
    Utf8PathBuf::from_path_buf(path.to_path_buf()).map_err(|raw| ManagerError::Io {
        path: raw.display().to_string(),
        message: String::from("temporary path is not valid UTF-8"),
    })
}

fn split_parent(path: &Utf8Path) -> std::io::Result<(Dir, &str)> {
    let parent = path
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name")
    })?;
    Ok((Dir::open_ambient_dir(parent, ambient_authority())?, file_name))
}

fn read_utf8(path: &Utf8Path) -> std::io::Result<String> {
    let (dir, file_name) = split_parent(path)?;
    dir.read_to_string(file_name)
}

fn describe_failure(output: &CommandOutput) -> String {
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        return format!("driver exited with status {}", output.status_text());
    }
    format!("driver exited with status {}: {stderr}", output.status_text())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

fn find_executable(program: &str) -> bool {
    if program.contains('/') {
        return is_executable(Path::new(program));
    }
    std::env::var_os("PATH").is_some_and(|paths| {
        std::env::split_paths(&paths).any(|dir| is_executable(&dir.join(program)))
    })
}

/// Creates, tracks and deletes one instance through the driver binary.
#[derive(Debug)]
pub struct InstanceManager<R> {
    runner: R,
    config: SessionConfig,
    instance_type: InstanceType,
    adb_port: u16,
    attributes: BuildAttributes,
    descriptor: Option<InstanceDescriptor>,
}

impl<R> InstanceManager<R>
where
    R: CommandRunner + Clone + 'static,
{
    /// Creates a manager for `config`, recording metadata into `attributes`.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Config`] when the instance type is unknown.
    pub fn new(
        runner: R,
        config: SessionConfig,
        attributes: BuildAttributes,
    ) -> Result<Self, ManagerError> {
        let instance_type = config.instance_type()?;
        let adb_port = config.adb_port()?;
        Ok(Self {
            runner,
            config,
            instance_type,
            adb_port,
            attributes,
            descriptor: None,
        })
    }

    /// Instance type being managed.
    #[must_use]
    pub const fn instance_type(&self) -> InstanceType {
        self.instance_type
    }

    /// Debug-bridge port inside the instance.
    #[must_use]
    pub const fn adb_port(&self) -> u16 {
        self.adb_port
    }

    /// Session configuration.
    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Descriptor of the current instance, if one was launched.
    #[must_use]
    pub const fn descriptor(&self) -> Option<&InstanceDescriptor> {
        self.descriptor.as_ref()
    }

    /// Downgrades the cached descriptor's status. Returns `false` when there
    /// is no descriptor or the transition is not a downgrade.
    pub fn downgrade(&mut self, status: InstanceStatus) -> bool {
        self.descriptor
            .as_mut()
            .is_some_and(|descriptor| descriptor.downgrade(status))
    }

    /// Sets the user passed to the driver when launching onto an existing
    /// host.
    pub fn set_host_user(&mut self, user: &str) {
        self.config.host_user = Some(user.to_owned());
    }

    /// Drops the cached descriptor.
    pub fn clear(&mut self) {
        self.descriptor = None;
    }

    /// Checks that the driver binary is executable and the ssh key readable.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Preflight`] naming the unusable file, or
    /// [`ManagerError::Config`] when the key is not configured.
    pub fn preflight(&self) -> Result<(), ManagerError> {
        self.preflight_driver()?;
        let key = self.config.ssh_key()?;
        split_parent(&key)
            .and_then(|(dir, file_name)| dir.open(file_name))
            .map_err(|err| ManagerError::Preflight {
                message: format!("ssh key {key} is not readable: {err}"),
            })?;
        Ok(())
    }

    /// Checks only that the driver binary is executable.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Preflight`] naming the driver binary.
    pub fn preflight_driver(&self) -> Result<(), ManagerError> {
        if find_executable(&self.config.driver_bin) {
            return Ok(());
        }
        Err(ManagerError::Preflight {
            message: format!(
                "driver binary '{}' is missing or not executable: set \
                 AVD_TETHER_DRIVER_BIN or driver_bin in avd-tether.toml",
                self.config.driver_bin
            ),
        })
    }

    fn record(&mut self, descriptor: &InstanceDescriptor) {
        if let Some(name) = descriptor.name() {
            self.attributes.set(INSTANCE_NAME, name);
        }
        self.attributes.extend(descriptor.build_vars());
        self.descriptor = Some(descriptor.clone());
    }

    /// Runs the driver `create` command once.
    ///
    /// A driver timeout yields a `BOOT_FAIL` descriptor when the instance
    /// name can be recovered from its output. A failed driver run still
    /// returns the report's descriptor when the report is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError`] when no descriptor can be obtained.
    pub async fn launch(
        &mut self,
        existing_host: Option<&str>,
    ) -> Result<InstanceDescriptor, ManagerError> {
        let files = InvocationFiles::prepare(&self.config)?;
        let boot_timeout = self.config.boot_timeout();
        let args = create_args(&self.config, files.driver_files(), boot_timeout, existing_host);
        info!(
            driver = %self.config.driver_bin,
            instance_type = %self.instance_type,
            host = existing_host.unwrap_or("<new>"),
            "launching instance"
        );
        let output = self
            .runner
            .run(&self.config.driver_bin, &args, boot_timeout.saturating_add(LAUNCH_SLACK))
            .await?;

        let descriptor = if output.timed_out {
            let scraped = scrape_instance_name(&output.stderr)
                .or_else(|| scrape_instance_name(&output.stdout));
            let Some(name) = scraped else {
                files.close();
                return Err(ManagerError::Launch {
                    message: format!(
                        "driver timed out after {}s and reported no instance name",
                        boot_timeout.as_secs()
                    ),
                });
            };
            warn!(instance = %name, "driver timed out; instance failed to boot");
            InstanceDescriptor::boot_failure(
                name,
                format!("driver timed out after {}s", boot_timeout.as_secs()),
            )
        } else {
            let parsed = parse_report_file(&files.report_path, self.adb_port);
            match parsed {
                Ok(Some(descriptor)) => descriptor,
                Ok(None) => {
                    files.close();
                    return Err(ManagerError::Launch {
                        message: if output.is_success() {
                            String::from("driver report did not describe exactly one device")
                        } else {
                            describe_failure(&output)
                        },
                    });
                }
                Err(err @ DescriptorError::Setup { .. }) => {
                    files.close();
                    return Err(err.into());
                }
                Err(err) => {
                    files.close();
                    debug!(error = %err, "driver report unavailable");
                    return Err(ManagerError::Launch {
                        message: describe_failure(&output),
                    });
                }
            }
        };
        files.close();
        info!(
            instance = descriptor.name().unwrap_or("<unnamed>"),
            status = %descriptor.status(),
            "driver finished"
        );
        self.record(&descriptor);
        Ok(descriptor)
    }

    /// Calls [`Self::launch`] up to `attempts` times, returning the first
    /// descriptor or the last error. Configuration errors are not retried.
    ///
    /// # Errors
    ///
    /// Returns the last [`ManagerError`] when every attempt fails.
    pub async fn launch_with_attempts(
        &mut self,
        existing_host: Option<&str>,
        attempts: u32,
    ) -> Result<InstanceDescriptor, ManagerError> {
        let attempts = attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.launch(existing_host).await {
                Ok(descriptor) => return Ok(descriptor),
                Err(err) if err.is_configuration() => return Err(err),
                Err(err) => {
                    warn!(attempt, attempts, error = %err, "launch attempt failed");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| ManagerError::Launch {
            message: String::from("no launch attempt was made"),
        }))
    }

    /// Deletes the instance.
    ///
    /// The name comes from the cached descriptor, else from the
    /// `instance_name` attribute. Returns `false` without running anything
    /// when neither is available. Otherwise the cleanup-attempted attribute is
    /// set and the driver's `delete` runs, either to completion or detached
    /// when non-blocking teardown is configured. The cached descriptor is
    /// always dropped.
    pub async fn shutdown(&mut self) -> bool {
        let cached = self
            .descriptor
            .take()
            .and_then(|descriptor| descriptor.name().map(str::to_owned));
        let Some(name) = cached.or_else(|| self.attributes.get(INSTANCE_NAME)) else {
            debug!("no instance name known; nothing to delete");
            return false;
        };
        self.attributes.set(CLEANUP_ATTEMPTED, "true");

        let files = match InvocationFiles::prepare(&self.config) {
            Ok(files) => files,
            Err(err) => {
                warn!(instance = %name, error = %err, "cannot prepare instance deletion");
                return false;
            }
        };
        let args = delete_args(&name, files.driver_files());
        let driver = &self.config.driver_bin;

        if self.config.nonblocking_teardown {
            return match self.runner.spawn(driver, &args, SpawnMode::Detached) {
                Ok(child) => {
                    info!(instance = %name, "deleting instance in the background");
                    tokio::spawn(reap_deletion(child, files, name));
                    true
                }
                Err(err) => {
                    warn!(instance = %name, error = %err, "failed to start instance deletion");
                    files.close();
                    false
                }
            };
        }

        let outcome = self.runner.run(driver, &args, DELETE_TIMEOUT).await;
        files.close();
        match outcome {
            Ok(output) if output.is_success() => {
                info!(instance = %name, "instance deleted");
                true
            }
            Ok(output) => {
                warn!(
                    instance = %name,
                    status = %output.status_text(),
                    stderr = %output.stderr.trim(),
                    "instance deletion failed"
                );
                false
            }
            Err(err) => {
                warn!(instance = %name, error = %err, "instance deletion failed");
                false
            }
        }
    }

    /// Ssh access to the instance, available once a descriptor with an
    /// endpoint exists.
    #[must_use]
    pub fn remote_host(&self) -> Option<RemoteHost<R>> {
        let endpoint = self.descriptor.as_ref()?.endpoint()?;
        let key = self.config.ssh_key().ok()?;
        Some(self.host_for(key, &self.config.instance_user, &endpoint.host))
    }

    /// Ssh access to `host` as `user` with the configured key.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Config`] when no key is configured.
    pub fn host_as(&self, user: &str, host: &str) -> Result<RemoteHost<R>, ManagerError> {
        let key = self.config.ssh_key()?;
        Ok(self.host_for(key, user, host))
    }

    fn host_for(&self, key: Utf8PathBuf, user: &str, host: &str) -> RemoteHost<R> {
        RemoteHost::new(
            self.runner.clone(),
            &self.config.ssh_bin,
            &self.config.scp_bin,
            RemoteTarget::new(key, user, host),
            self.config.command_timeout(),
        )
    }

    /// Generates a bugreport on the instance over ssh and copies it into
    /// `artifacts`. Output without an `OK:<path>` line yields `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Remote`] when ssh or scp fail.
    pub async fn fetch_bugreport(
        &self,
        artifacts: &ArtifactDir,
    ) -> Result<Option<Utf8PathBuf>, ManagerError> {
        let Some(host) = self.remote_host() else {
            debug!("no instance endpoint; skipping bugreport");
            return Ok(None);
        };
        Self::bugreport_from(&host, artifacts, "bugreport").await
    }

    pub(crate) async fn bugreport_from(
        host: &RemoteHost<R>,
        artifacts: &ArtifactDir,
        label: &str,
    ) -> Result<Option<Utf8PathBuf>, ManagerError> {
        let output = host
            .exec_with_timeout(&["bugreportz"], BUGREPORT_TIMEOUT)
            .await?;
        let Some(remote) = bugreport_path(&output.stdout) else {
            warn!(
                stdout = %output.stdout.trim(),
                status = %output.status_text(),
                "bugreportz did not report a file"
            );
            return Ok(None);
        };
        let file_name = Utf8Path::new(remote).file_name().unwrap_or("bugreport.zip");
        let local = artifacts.path_for(&format!("{label}-{file_name}"));
        host.fetch_file(remote, &local).await?;
        info!(path = %local, "bugreport saved");
        Ok(Some(local))
    }

    /// Copies the known logs for the instance type plus configured extra
    /// paths into `artifacts`. Individual failures are logged and skipped.
    pub async fn fetch_remote_logs(&self, artifacts: &ArtifactDir) -> Vec<Utf8PathBuf> {
        let Some(host) = self.remote_host() else {
            debug!("no instance endpoint; skipping remote logs");
            return Vec::new();
        };
        let mut paths = known_remote_logs(self.instance_type, &self.config.instance_user);
        paths.extend(self.config.extra_remote_logs());
        fetch_each(&host, artifacts, "", &paths).await
    }

    /// Copies the nested runtime's `tombstones` directory into `artifacts`.
    /// Other instance types have none.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Remote`] when the copy fails.
    pub async fn fetch_tombstones(
        &self,
        artifacts: &ArtifactDir,
    ) -> Result<Option<Utf8PathBuf>, ManagerError> {
        if !self.instance_type.is_nested_runtime() {
            return Ok(None);
        }
        let Some(host) = self.remote_host() else {
            return Ok(None);
        };
        let remote = format!(
            "{}/tombstones",
            nested_runtime_dir(&self.config.instance_user)
        );
        let local = artifacts.path_for("tombstones");
        host.fetch_dir(&remote, &local).await?;
        Ok(Some(local))
    }

    /// Saves the instance's serial console output into `artifacts`.
    ///
    /// Requires `project` and `zone` in the driver configuration; without
    /// them, or without an instance name, this yields `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError`] when `gcloud` fails or the file cannot be
    /// written.
    pub async fn fetch_serial_log(
        &self,
        artifacts: &ArtifactDir,
    ) -> Result<Option<Utf8PathBuf>, ManagerError> {
        let name = self
            .descriptor
            .as_ref()
            .and_then(|descriptor| descriptor.name().map(str::to_owned))
            .or_else(|| self.attributes.get(INSTANCE_NAME));
        let Some(name) = name else {
            return Ok(None);
        };
        let driver_config = parse_driver_config(&self.config.driver_config_path()?);
        let project_zone = driver_config
            .as_ref()
            .and_then(|parsed| Some((parsed.project()?, parsed.zone()?)));
        let Some((project, zone)) = project_zone else {
            warn!("driver configuration lacks project or zone; skipping serial console");
            return Ok(None);
        };

        let key = self
            .config
            .service_account_key_path
            .as_deref()
            .or_else(|| driver_config.as_ref().and_then(|parsed| parsed.service_account_key()));
        let gcloud = &self.config.gcloud_bin;
        if let Some(key) = key {
            let activate = activate_service_account_args(key);
            let output = self
                .runner
                .run(gcloud, &activate, self.config.command_timeout())
                .await?;
            if !output.is_success() {
                warn!(status = %output.status_text(), "service account activation failed");
            }
        }

        let args = serial_port_args(&name, project, zone);
        let output = self
            .runner
            .run(gcloud, &args, self.config.command_timeout())
            .await?;
        if !output.is_success() {
            return Err(RemoteError::from_output(gcloud, &output).into());
        }
        let path = artifacts.write("serial_console.log", &output.stdout)?;
        Ok(Some(path))
    }
}

/// Copies each remote path into `artifacts`, prefixing local names with
/// `prefix`. Failures are logged and skipped.
pub(crate) async fn fetch_each<R: CommandRunner>(
    host: &RemoteHost<R>,
    artifacts: &ArtifactDir,
    prefix: &str,
    paths: &[String],
) -> Vec<Utf8PathBuf> {
    let mut fetched = Vec::with_capacity(paths.len());
    for remote in paths {
        let local = artifacts.path_for(&format!("{prefix}{remote}"));
        match host.fetch_file(remote, &local).await {
            Ok(path) => fetched.push(path),
            Err(err) => warn!(remote = %remote, error = %err, "failed to fetch remote log"),
        }
    }
    fetched
}

async fn reap_deletion(mut child: Box<dyn ChildProcess>, files: InvocationFiles, instance: String) {
    match child.wait().await {
        Ok(code) => debug!(instance = %instance, ?code, "background deletion finished"),
        Err(err) => warn!(instance = %instance, error = %err, "lost track of background deletion"),
    }
    files.close();
}
