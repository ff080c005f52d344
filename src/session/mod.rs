//! Device session orchestration.
//!
//! [`DeviceSession`] ties an [`InstanceManager`], a [`TunnelMonitor`] and a
//! [`DebugBridge`] together. It brings a device up, recovers and reboots it
//! while in use, and tears everything down while saving diagnostics.
//! Teardown runs every step whatever happened before. Each step's outcome is
//! recorded in a [`TeardownReport`] instead of being returned as an error.

use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::artifacts::ArtifactDir;
use crate::attributes::{BuildAttributes, INSTANCE_NAME};
use crate::bridge::{DebugBridge, DeviceHandle, DeviceState, RebootMode};
use crate::config::SessionConfig;
use crate::instance::{InstanceDescriptor, InstanceManager, InstanceStatus};
use crate::remote::{CommandRunner, RemoteHost};
use crate::tunnel::{MonitorState, MonitorTimings, TunnelMonitor, TunnelTarget};

mod error;
mod nested;
mod report;

pub use error::SessionError;
pub use nested::{NestedReset, host_lock};
pub use report::{StepOutcome, TeardownReport, TeardownStep};

/// Fixed delays used by the session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionTimings {
    /// Pause after issuing a reboot before connectivity is re-checked.
    pub reboot_grace: Duration,
    /// Interval between device state polls.
    pub poll_interval: Duration,
    /// Number of slices the online wait is split into.
    pub online_slices: u32,
    /// Pause after relaunching a nested device before reattaching.
    pub nested_settle: Duration,
    /// Bound on waiting for the tunnel monitor to stop.
    pub monitor_join: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            reboot_grace: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            online_slices: 5,
            nested_settle: Duration::from_secs(10),
            monitor_join: Duration::from_secs(30),
        }
    }
}

/// One remote device from launch to deletion.
#[derive(Debug)]
pub struct DeviceSession<R, B> {
    manager: InstanceManager<R>,
    bridge: B,
    device: DeviceHandle,
    attributes: BuildAttributes,
    artifacts: ArtifactDir,
    timings: SessionTimings,
    monitor_timings: MonitorTimings,
    monitor: Option<TunnelMonitor>,
    existing_host: Option<String>,
}

impl<R, B> DeviceSession<R, B>
where
    R: CommandRunner + Clone + 'static,
    B: DebugBridge + Clone + 'static,
{
    /// Creates a session that saves diagnostics into `artifacts`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Config`] when the configuration names an
    /// unknown instance type.
    pub fn new(
        runner: R,
        bridge: B,
        config: SessionConfig,
        artifacts: ArtifactDir,
    ) -> Result<Self, SessionError> {
        let attributes = BuildAttributes::new();
        let manager = InstanceManager::new(runner, config, attributes.clone())?;
        Ok(Self {
            manager,
            bridge,
            device: DeviceHandle::new(),
            attributes,
            artifacts,
            timings: SessionTimings::default(),
            monitor_timings: MonitorTimings::default(),
            monitor: None,
            existing_host: None,
        })
    }

    /// Replaces the session delays.
    #[must_use]
    pub const fn with_timings(mut self, timings: SessionTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Replaces the tunnel monitor delays.
    #[must_use]
    pub const fn with_monitor_timings(mut self, timings: MonitorTimings) -> Self {
        self.monitor_timings = timings;
        self
    }

    /// Launches onto an already running host instead of creating one.
    #[must_use]
    pub fn with_existing_host(mut self, host: impl Into<String>) -> Self {
        self.existing_host = Some(host.into());
        self
    }

    /// Handle whose address follows the current tunnel.
    #[must_use]
    pub const fn device(&self) -> &DeviceHandle {
        &self.device
    }

    /// Session metadata.
    #[must_use]
    pub const fn attributes(&self) -> &BuildAttributes {
        &self.attributes
    }

    /// Where diagnostics are saved.
    #[must_use]
    pub const fn artifacts(&self) -> &ArtifactDir {
        &self.artifacts
    }

    /// Descriptor of the launched instance.
    #[must_use]
    pub const fn descriptor(&self) -> Option<&InstanceDescriptor> {
        self.manager.descriptor()
    }

    /// Running tunnel monitor, if any.
    #[must_use]
    pub const fn monitor(&self) -> Option<&TunnelMonitor> {
        self.monitor.as_ref()
    }

    /// Bridge serial of the device (`127.0.0.1:<port>`).
    #[must_use]
    pub fn serial(&self) -> Option<String> {
        self.device.current_address()
    }

    const fn config(&self) -> &SessionConfig {
        self.manager.config()
    }

    fn require_serial(&self) -> Result<String, SessionError> {
        self.serial()
            .ok_or_else(|| SessionError::unavailable("no bridge address; tunnel was never bridged"))
    }

    /// Launches the instance, opens the tunnel and waits for the device.
    ///
    /// The boot timeout covers the whole call; time spent launching is
    /// subtracted before the tunnel and online phases.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Config`] for unusable configuration,
    /// [`SessionError::Setup`] when the launch fails, and
    /// [`SessionError::DeviceUnavailable`] when the device does not come
    /// online.
    pub async fn setup(&mut self) -> Result<(), SessionError> {
        let started = Instant::now();
        self.stop_monitor().await;
        self.manager.clear();
        self.manager.preflight()?;

        let attempts = self.config().max_launch_attempts;
        let descriptor = self
            .manager
            .launch_with_attempts(self.existing_host.as_deref(), attempts)
            .await?;
        if descriptor.status() == InstanceStatus::BootFail {
            return Err(SessionError::setup(format!(
                "instance {} failed to boot: {}",
                descriptor.name().unwrap_or("<unnamed>"),
                descriptor.errors()
            )));
        }
        let Some(host) = self.manager.remote_host() else {
            return Err(SessionError::setup("launched instance has no reachable endpoint"));
        };

        let boot_timeout = self.config().boot_timeout();
        let remaining = boot_timeout
            .checked_sub(started.elapsed())
            .filter(|left| !left.is_zero())
            .ok_or_else(|| {
                SessionError::setup(format!(
                    "launch used the whole boot timeout of {}s",
                    boot_timeout.as_secs()
                ))
            })?;
        let deadline = deadline_after(remaining);

        self.start_monitor(host);
        if let Err(err) = self.wait_online(remaining).await {
            self.manager.downgrade(InstanceStatus::DeviceOffline);
            return Err(err);
        }

        let serial = self.require_serial()?;
        let left = deadline.saturating_duration_since(Instant::now());
        if let Err(err) = self.bridge.wait_for_available(&serial, left).await {
            self.manager.downgrade(InstanceStatus::DeviceOffline);
            return Err(err.into());
        }
        info!(serial, "device ready");
        Ok(())
    }

    fn start_monitor(&mut self, host: RemoteHost<R>) {
        let target = TunnelTarget {
            host,
            bridge: self.bridge.clone(),
            device: self.device.clone(),
            attributes: self.attributes.clone(),
            instance_type: self.manager.instance_type(),
            remote_port: self.manager.adb_port(),
        };
        self.monitor = Some(TunnelMonitor::start(target, self.monitor_timings));
    }

    async fn stop_monitor(&mut self) -> Option<(Vec<String>, bool)> {
        let mut monitor = self.monitor.take()?;
        let log = monitor.captured_log();
        monitor.shutdown();
        let joined = monitor.join(self.timings.monitor_join).await;
        Some((log, joined))
    }

    async fn wait_online(&self, remaining: Duration) -> Result<(), SessionError> {
        let slices = self.timings.online_slices.max(1);
        let slice = remaining / slices;
        for index in 1..=slices {
            if let Some(monitor) = &self.monitor {
                let status = monitor.status();
                if status.state.is_terminal() {
                    let reason = monitor
                        .last_error()
                        .unwrap_or_else(|| format!("monitor {}", status.state));
                    return Err(SessionError::unavailable(format!(
                        "tunnel monitor stopped: {reason}"
                    )));
                }
            }
            if self.poll_online(slice).await {
                return Ok(());
            }
            debug!(slice = index, slices, "device not online yet");
            if let Some(serial) = self.serial() {
                if let Err(err) = self.bridge.connect(&serial).await {
                    debug!(serial, error = %err, "bridge reconnect between slices failed");
                }
            }
        }
        Err(SessionError::unavailable(format!(
            "device did not come online within {}s",
            remaining.as_secs()
        )))
    }

    /// Polls the bridge until the device reports online or `limit` elapses.
    async fn poll_online(&self, limit: Duration) -> bool {
        let deadline = deadline_after(limit);
        loop {
            let bridged = self
                .monitor
                .as_ref()
                .is_some_and(TunnelMonitor::is_tunnel_alive);
            if let Some(serial) = self.serial().filter(|_| bridged) {
                match self.bridge.state(&serial).await {
                    Ok(DeviceState::Online) => return true,
                    Ok(state) => debug!(serial, ?state, "device not online"),
                    Err(err) => debug!(serial, error = %err, "device state query failed"),
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep(self.timings.poll_interval.min(deadline - now)).await;
        }
    }

    /// Polls until the bridge sees the device online, reconnecting between
    /// polls.
    ///
    /// Re-reads the tunnel address on every poll and returns the one that
    /// answered.
    async fn wait_bridge_connected(&self, limit: Duration) -> Result<String, SessionError> {
        let deadline = deadline_after(limit);
        loop {
            let serial = self.require_serial()?;
            if matches!(self.bridge.state(&serial).await, Ok(DeviceState::Online)) {
                return Ok(serial);
            }
            if Instant::now() >= deadline {
                return Err(SessionError::unavailable(format!(
                    "bridge did not reach {serial} within {}s",
                    limit.as_secs()
                )));
            }
            if let Err(err) = self.bridge.connect(&serial).await {
                debug!(serial, error = %err, "bridge connect failed");
            }
            sleep(self.timings.poll_interval).await;
        }
    }

    /// Rebuilds the tunnel and waits for the device again.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::DeviceUnavailable`] when the tunnel is not
    /// restored within the tunnel-online timeout or the bridge cannot reach
    /// the device.
    pub async fn recover_device(&mut self) -> Result<(), SessionError> {
        let Some(monitor) = &self.monitor else {
            return Err(SessionError::unavailable("no tunnel monitor is running"));
        };
        info!("recovering device connection");
        let replaced = monitor.request_reconnect();
        let online_timeout = self.config().tunnel_online_timeout();
        monitor
            .wait_bridged(replaced, online_timeout)
            .await
            .map_err(|err| SessionError::unavailable(format!("tunnel not restored: {err}")))?;

        let serial = self
            .wait_bridge_connected(self.config().adb_connect_timeout())
            .await?;
        self.bridge
            .wait_for_available(&serial, self.config().boot_timeout())
            .await?;
        info!(serial, "device recovered");
        Ok(())
    }

    /// Reboots the device through the bridge and re-checks connectivity.
    ///
    /// The tunnel monitor is told first so the tunnel exit that follows is
    /// expected.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::DeviceUnavailable`] when the reboot cannot be
    /// issued or the device does not return.
    pub async fn reboot(&mut self, mode: RebootMode, reason: &str) -> Result<(), SessionError> {
        let serial = self.require_serial()?;
        info!(serial, %mode, reason, "rebooting device");
        let Some(monitor) = &self.monitor else {
            return Err(SessionError::unavailable("no tunnel monitor is running"));
        };
        let before = monitor.status().generation;
        monitor.flag_reboot();
        self.bridge.reboot(&serial, mode).await?;
        sleep(self.timings.reboot_grace).await;

        // A tunnel that outlived the reboot is reused; once it has exited only
        // a newer one counts.
        let status = monitor.status();
        let survived = status.state == MonitorState::Bridged && status.generation == before;
        let since = if survived { before.saturating_sub(1) } else { before };
        debug!(before, since, survived, "revalidating tunnel after reboot");
        monitor
            .wait_bridged(since, self.config().tunnel_online_timeout())
            .await?;
        let current = self
            .wait_bridge_connected(self.config().adb_connect_timeout())
            .await?;
        self.bridge
            .wait_for_available(&current, self.config().boot_timeout())
            .await?;
        Ok(())
    }

    /// Salvages diagnostics, stops the tunnel, deletes the instance and
    /// drops cached state. Every step runs; failures are recorded in the
    /// report, which also keeps `failure` unchanged.
    pub async fn teardown(&mut self, failure: Option<&str>) -> TeardownReport {
        let mut report = TeardownReport::new(failure);
        if let Some(failure) = failure {
            info!(failure, "tearing down after failure");
        }

        self.capture_logcat(&mut report).await;

        let succeeded = self
            .manager
            .descriptor()
            .is_some_and(|descriptor| descriptor.status() == InstanceStatus::Success);
        let bugreport = if succeeded {
            StepOutcome::skipped("bring-up succeeded")
        } else {
            match self.manager.fetch_bugreport(&self.artifacts).await {
                Ok(Some(path)) => StepOutcome::saved([path]),
                Ok(None) => StepOutcome::skipped("no bugreport produced"),
                Err(err) => StepOutcome::failed(err),
            }
        };
        report.record(TeardownStep::Bugreport, bugreport);

        let serial_log = match self.manager.fetch_serial_log(&self.artifacts).await {
            Ok(Some(path)) => StepOutcome::saved([path]),
            Ok(None) => StepOutcome::skipped("serial console not available"),
            Err(err) => StepOutcome::failed(err),
        };
        report.record(TeardownStep::SerialLog, serial_log);
        let logs = self.manager.fetch_remote_logs(&self.artifacts).await;
        report.record(TeardownStep::RemoteLogs, StepOutcome::saved(logs));
        let tombstones = match self.manager.fetch_tombstones(&self.artifacts).await {
            Ok(Some(path)) => StepOutcome::saved([path]),
            Ok(None) => StepOutcome::skipped("no tombstones for this instance type"),
            Err(err) => StepOutcome::failed(err),
        };
        report.record(TeardownStep::Tombstones, tombstones);

        let stopped = self.stop_monitor().await;
        let tunnel = stopped.map_or_else(
            || StepOutcome::skipped("no tunnel monitor"),
            |(log, joined)| {
                let saved = self
                    .artifacts
                    .write("tunnel_monitor.log", &log.join("\n"));
                match (saved, joined) {
                    (Ok(path), true) => StepOutcome::saved([path]),
                    (Ok(_), false) => StepOutcome::failed("tunnel monitor did not stop in time"),
                    (Err(err), _) => StepOutcome::failed(err),
                }
            },
        );
        report.record(TeardownStep::TunnelStop, tunnel);

        let delete = self.delete_instance().await;
        report.record(TeardownStep::Delete, delete);

        self.manager.clear();
        self.device.set_address(None);
        report.record(TeardownStep::Clear, StepOutcome::done());
        report
    }

    async fn capture_logcat(&self, report: &mut TeardownReport) {
        let Some(serial) = self.serial() else {
            report.record(TeardownStep::Logcat, StepOutcome::skipped("no bridge address"));
            report.record(
                TeardownStep::ClearLogcat,
                StepOutcome::skipped("no bridge address"),
            );
            return;
        };
        let logcat = match self.bridge.dump_logcat(&serial).await {
            Ok(text) => match self.artifacts.write("logcat.txt", &text) {
                Ok(path) => StepOutcome::saved([path]),
                Err(err) => StepOutcome::failed(err),
            },
            Err(err) => StepOutcome::failed(err),
        };
        report.record(TeardownStep::Logcat, logcat);
        let cleared = match self.bridge.clear_logcat(&serial).await {
            Ok(()) => StepOutcome::done(),
            Err(err) => StepOutcome::failed(err),
        };
        report.record(TeardownStep::ClearLogcat, cleared);
    }

    async fn delete_instance(&mut self) -> StepOutcome {
        let name = self
            .manager
            .descriptor()
            .and_then(|descriptor| descriptor.name().map(str::to_owned))
            .or_else(|| self.attributes.get(INSTANCE_NAME));
        let Some(name) = name else {
            return StepOutcome::skipped("no instance name known");
        };
        if self.config().skip_teardown {
            info!(instance = %name, "skip_teardown set; leaving instance running");
            return StepOutcome::skipped("skip_teardown set");
        }
        if self.manager.shutdown().await {
            StepOutcome::done()
        } else {
            StepOutcome::failed(format!("deleting instance {name} failed"))
        }
    }

    pub(crate) const fn manager(&self) -> &InstanceManager<R> {
        &self.manager
    }

    pub(crate) const fn manager_mut(&mut self) -> &mut InstanceManager<R> {
        &mut self.manager
    }

    pub(crate) fn set_existing_host(&mut self, host: &str) {
        self.existing_host = Some(host.to_owned());
    }

    pub(crate) const fn timings(&self) -> &SessionTimings {
        &self.timings
    }

    pub(crate) async fn stop_tunnel(&mut self) {
        if let Some((_, joined)) = self.stop_monitor().await {
            if !joined {
                warn!("tunnel monitor did not stop in time");
            }
        }
    }
}

/// About thirty years; stands in for deadlines that overflow `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline_after(limit: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(limit)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}
