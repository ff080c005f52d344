//! `adb` implementation of [`DebugBridge`].

use std::ffi::OsString;
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::{debug, info};

use super::{BridgeError, BridgeFuture, DebugBridge, DeviceState, RebootMode};
use crate::remote::{CommandOutput, CommandRunner};

const BOOT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const LOGCAT_TAIL_LINES: &str = "5000";

/// Debug bridge backed by the `adb` command-line client.
#[derive(Clone, Debug)]
pub struct AdbBridge<R> {
    runner: R,
    adb_bin: String,
    command_timeout: Duration,
    boot_poll_interval: Duration,
}

impl<R: CommandRunner> AdbBridge<R> {
    /// Creates a bridge running `adb_bin` through `runner`.
    #[must_use]
    pub fn new(runner: R, adb_bin: impl Into<String>, command_timeout: Duration) -> Self {
        Self {
            runner,
            adb_bin: adb_bin.into(),
            command_timeout,
            boot_poll_interval: BOOT_POLL_INTERVAL,
        }
    }

    /// Overrides the interval between boot-completion probes.
    #[must_use]
    pub const fn with_boot_poll_interval(mut self, interval: Duration) -> Self {
        self.boot_poll_interval = interval;
        self
    }

    async fn adb(&self, args: &[&str]) -> Result<CommandOutput, BridgeError> {
        let argv: Vec<OsString> = args.iter().map(OsString::from).collect();
        let output = self
            .runner
            .run(&self.adb_bin, &argv, self.command_timeout)
            .await?;
        Ok(output)
    }

    async fn device_command(
        &self,
        serial: &str,
        command: &str,
        args: &[&str],
    ) -> Result<CommandOutput, BridgeError> {
        let mut argv = vec!["-s", serial];
        argv.extend_from_slice(args);
        let output = self.adb(&argv).await?;
        if output.is_success() {
            return Ok(output);
        }
        Err(BridgeError::Command {
            serial: serial.to_owned(),
            command: command.to_owned(),
            message: describe(&output),
        })
    }
}

impl<R: CommandRunner> DebugBridge for AdbBridge<R> {
    fn connect<'a>(&'a self, address: &'a str) -> BridgeFuture<'a, ()> {
        Box::pin(async move {
            let output = self.adb(&["connect", address]).await?;
            // adb exits 0 even when the connection is refused.
            let stdout = output.stdout.trim();
            if output.is_success() && stdout.contains("connected to") && !stdout.contains("failed")
            {
                info!(address, "bridge connected");
                return Ok(());
            }
            Err(BridgeError::Connect {
                address: address.to_owned(),
                message: describe(&output),
            })
        })
    }

    fn disconnect<'a>(&'a self, address: &'a str) -> BridgeFuture<'a, ()> {
        Box::pin(async move {
            let output = self.adb(&["disconnect", address]).await?;
            if output.is_success() {
                debug!(address, "bridge disconnected");
                return Ok(());
            }
            Err(BridgeError::Command {
                serial: address.to_owned(),
                command: String::from("disconnect"),
                message: describe(&output),
            })
        })
    }

    fn state<'a>(&'a self, serial: &'a str) -> BridgeFuture<'a, DeviceState> {
        Box::pin(async move {
            let output = self.adb(&["-s", serial, "get-state"]).await?;
            if !output.is_success() {
                return Ok(DeviceState::NotAvailable);
            }
            Ok(DeviceState::from_adb_state(&output.stdout))
        })
    }

    fn wait_for_available<'a>(
        &'a self,
        serial: &'a str,
        limit: Duration,
    ) -> BridgeFuture<'a, ()> {
        Box::pin(async move {
            let started = Instant::now();
            // Probes at least once, even with no time left.
            loop {
                let probe = self
                    .adb(&["-s", serial, "shell", "getprop", "sys.boot_completed"])
                    .await?;
                if probe.is_success() && probe.stdout.trim() == "1" {
                    debug!(serial, "device finished booting");
                    return Ok(());
                }
                let waited = started.elapsed();
                if waited >= limit {
                    return Err(BridgeError::Timeout {
                        serial: serial.to_owned(),
                        waited,
                    });
                }
                sleep(self.boot_poll_interval.min(limit - waited)).await;
            }
        })
    }

    fn reboot<'a>(&'a self, serial: &'a str, mode: RebootMode) -> BridgeFuture<'a, ()> {
        Box::pin(async move {
            let args: &[&str] = match mode {
                RebootMode::Full => &["reboot"],
                RebootMode::Userspace => &["reboot", "userspace"],
            };
            self.device_command(serial, "reboot", args).await?;
            Ok(())
        })
    }

    fn dump_logcat<'a>(&'a self, serial: &'a str) -> BridgeFuture<'a, String> {
        Box::pin(async move {
            let output = self
                .device_command(serial, "logcat", &["logcat", "-d", "-t", LOGCAT_TAIL_LINES])
                .await?;
            Ok(output.stdout)
        })
    }

    fn clear_logcat<'a>(&'a self, serial: &'a str) -> BridgeFuture<'a, ()> {
        Box::pin(async move {
            self.device_command(serial, "logcat -c", &["logcat", "-c"])
                .await?;
            Ok(())
        })
    }
}

fn describe(output: &CommandOutput) -> String {
    let stdout = output.stdout.trim();
    let stderr = output.stderr.trim();
    let mut message = format!("status {}", output.status_text());
    if !stdout.is_empty() {
        message.push_str("; stdout: ");
        message.push_str(stdout);
    }
    if !stderr.is_empty() {
        message.push_str("; stderr: ");
        message.push_str(stderr);
    }
    message
}
