//! Supervision of the ssh tunnel that carries debug-bridge traffic.
//!
//! [`TunnelMonitor`] owns one background task. Each iteration of that task
//! prepares the remote bridge daemon (cloud instance types only), opens a
//! port forward, points the shared [`DeviceHandle`] at it, and connects the
//! bridge. It then waits for the tunnel to exit or for a request to close it.
//! After the tunnel is closed the task starts a fresh one. It keeps doing so
//! until [`TunnelMonitor::shutdown`] is called.
//!
//! The task is the only owner of the live tunnel. Closing consumes the
//! tunnel, so each tunnel is closed once. A new tunnel is never opened
//! before the previous one has been closed.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::attributes::{BRIDGE_ADDRESS, BuildAttributes};
use crate::bridge::{DebugBridge, DeviceHandle};
use crate::config::InstanceType;
use crate::remote::{CommandRunner, RemoteHost};

mod session;

use session::{TunnelSession, allocate_port};

/// Phase of the monitor loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MonitorState {
    /// Between iterations.
    Init,
    /// Restarting the remote bridge daemon.
    Prestep,
    /// Tunnel process spawned, warming up.
    TunnelStarting,
    /// Tunnel process survived warm-up.
    TunnelAlive,
    /// Bridge connect issued through the tunnel.
    Bridged,
    /// Stopped on request.
    Shutdown,
    /// Gave up; see [`TunnelMonitor::last_error`].
    Failed,
}

impl MonitorState {
    /// Returns `true` once the loop has ended.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Shutdown | Self::Failed)
    }

    /// Lowercase name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Prestep => "prestep",
            Self::TunnelStarting => "tunnel-starting",
            Self::TunnelAlive => "tunnel-alive",
            Self::Bridged => "bridged",
            Self::Shutdown => "shutdown",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot published on every state change.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MonitorStatus {
    /// Current phase.
    pub state: MonitorState,
    /// Number of tunnels opened so far.
    pub generation: u64,
}

/// Fixed delays used by the monitor loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MonitorTimings {
    /// Wait between spawning the tunnel and checking it is still alive.
    pub warmup: Duration,
    /// Pause after a flagged reboot before the tunnel is reopened.
    pub reboot_grace: Duration,
    /// Delay between attempts of a failing prestep command.
    pub prestep_retry_delay: Duration,
    /// Attempts per prestep command.
    pub prestep_attempts: u32,
    /// Bound on waiting for a killed tunnel process to exit.
    pub close_wait: Duration,
}

impl Default for MonitorTimings {
    fn default() -> Self {
        Self {
            warmup: Duration::from_secs(2),
            reboot_grace: Duration::from_secs(60),
            prestep_retry_delay: Duration::from_secs(5),
            prestep_attempts: 3,
            close_wait: Duration::from_secs(10),
        }
    }
}

/// Errors reported while waiting on the monitor.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TunnelError {
    /// The loop ended before the tunnel was bridged.
    #[error("tunnel monitor {state}: {reason}")]
    Stopped {
        /// Terminal state the loop ended in.
        state: MonitorState,
        /// Last recorded error, if any.
        reason: String,
    },
    /// The tunnel was not bridged in time.
    #[error("tunnel not bridged after {waited:?}")]
    Timeout {
        /// Duration that elapsed.
        waited: Duration,
    },
}

struct Shared {
    quit: AtomicBool,
    reconnect: AtomicBool,
    rebooting: AtomicBool,
    wake: Notify,
    status: watch::Sender<MonitorStatus>,
    last_error: Mutex<Option<String>>,
    log: Mutex<Vec<String>>,
}

impl Shared {
    fn new() -> Self {
        let (status, _) = watch::channel(MonitorStatus {
            state: MonitorState::Init,
            generation: 0,
        });
        Self {
            quit: AtomicBool::new(false),
            reconnect: AtomicBool::new(false),
            rebooting: AtomicBool::new(false),
            wake: Notify::new(),
            status,
            last_error: Mutex::new(None),
            log: Mutex::new(Vec::new()),
        }
    }

    fn stopping(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    /// Consumes a pending close request.
    fn close_requested(&self) -> bool {
        self.reconnect.swap(false, Ordering::SeqCst) || self.stopping()
    }

    fn set_state(&self, state: MonitorState) {
        self.status.send_modify(|status| status.state = state);
        debug!(state = %state, "tunnel monitor state");
    }

    fn begin_tunnel(&self) {
        self.reconnect.store(false, Ordering::SeqCst);
        self.status.send_modify(|status| {
            status.generation += 1;
            status.state = MonitorState::TunnelStarting;
        });
    }

    fn note(&self, line: impl Into<String>) {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.into());
    }

    fn fail(&self, reason: String) {
        warn!(reason = %reason, "tunnel monitor giving up");
        self.note(format!("failed: {reason}"));
        *self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reason);
        self.set_state(MonitorState::Failed);
    }

    /// Sleeps for `delay` unless woken by a close or stop request.
    async fn pause(&self, delay: Duration) {
        tokio::select! {
            () = sleep(delay) => {}
            () = self.wake.notified() => {}
        }
    }
}

/// Handle to a running tunnel monitor.
pub struct TunnelMonitor {
    shared: Arc<Shared>,
    task: Option<JoinHandle<()>>,
}

impl fmt::Debug for TunnelMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelMonitor")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Everything the monitor loop needs to reach the device.
#[derive(Clone, Debug)]
pub struct TunnelTarget<R, B> {
    /// Instance the tunnel is opened to.
    pub host: RemoteHost<R>,
    /// Bridge client connected through the tunnel.
    pub bridge: B,
    /// Handle updated with the tunnel address.
    pub device: DeviceHandle,
    /// Attributes receiving the tunnel address.
    pub attributes: BuildAttributes,
    /// Kind of instance; cloud types get the bridge daemon restarted first.
    pub instance_type: InstanceType,
    /// Bridge port on the instance.
    pub remote_port: u16,
}

impl TunnelMonitor {
    /// Spawns the monitor loop on the current runtime.
    #[must_use]
    pub fn start<R, B>(target: TunnelTarget<R, B>, timings: MonitorTimings) -> Self
    where
        R: CommandRunner + Clone + 'static,
        B: DebugBridge + Clone + 'static,
    {
        let shared = Arc::new(Shared::new());
        let worker = Worker {
            target,
            timings,
            shared: Arc::clone(&shared),
        };
        info!(
            host = %worker.target.host.target().host,
            remote_port = worker.target.remote_port,
            "starting tunnel monitor"
        );
        let task = tokio::spawn(worker.run());
        Self {
            shared,
            task: Some(task),
        }
    }

    /// Current state and tunnel generation.
    #[must_use]
    pub fn status(&self) -> MonitorStatus {
        *self.shared.status.borrow()
    }

    /// Subscribes to state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<MonitorStatus> {
        self.shared.status.subscribe()
    }

    /// Returns `true` while a tunnel is alive or bridged. Drops to `false`
    /// as soon as the tunnel process has exited and been closed.
    #[must_use]
    pub fn is_tunnel_alive(&self) -> bool {
        matches!(
            self.status().state,
            MonitorState::TunnelAlive | MonitorState::Bridged
        )
    }

    /// Last error that made the loop give up.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.shared
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events recorded by the loop, oldest first.
    #[must_use]
    pub fn captured_log(&self) -> Vec<String> {
        self.shared
            .log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Flags an imminent reboot so the next tunnel waits out the grace
    /// period.
    pub fn flag_reboot(&self) {
        self.shared.rebooting.store(true, Ordering::SeqCst);
    }

    /// Asks the loop to close the current tunnel and open a new one.
    /// Returns the generation of the tunnel being replaced.
    #[must_use]
    pub fn request_reconnect(&self) -> u64 {
        let generation = self.status().generation;
        self.shared.reconnect.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
        generation
    }

    /// Stops the loop. The current tunnel is closed by the loop itself.
    pub fn shutdown(&self) {
        if !self.shared.quit.swap(true, Ordering::SeqCst) {
            info!("stopping tunnel monitor");
        }
        self.shared.wake.notify_one();
    }

    /// Waits until a tunnel newer than `after_generation` is bridged.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Stopped`] if the loop ends first and
    /// [`TunnelError::Timeout`] when `limit` elapses.
    pub async fn wait_bridged(
        &self,
        after_generation: u64,
        limit: Duration,
    ) -> Result<(), TunnelError> {
        let mut status = self.subscribe();
        let reached = timeout(
            limit,
            status.wait_for(|current| {
                current.state.is_terminal()
                    || (current.state == MonitorState::Bridged
                        && current.generation > after_generation)
            }),
        )
        .await;
        let current = match reached {
            Ok(Ok(current)) => *current,
            Ok(Err(_)) => self.status(),
            Err(_) => return Err(TunnelError::Timeout { waited: limit }),
        };
        if current.state.is_terminal() {
            return Err(TunnelError::Stopped {
                state: current.state,
                reason: self.last_error().unwrap_or_else(|| String::from("stopped")),
            });
        }
        Ok(())
    }

    /// Waits up to `limit` for the loop to end, aborting it when the bound
    /// elapses. Returns `true` when the loop ended on its own.
    pub async fn join(&mut self, limit: Duration) -> bool {
        let Some(mut task) = self.task.take() else {
            return true;
        };
        match timeout(limit, &mut task).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                warn!(error = %err, "tunnel monitor task ended abnormally");
                false
            }
            Err(_) => {
                warn!(
                    limit_secs = limit.as_secs(),
                    "tunnel monitor did not stop in time; aborting"
                );
                task.abort();
                false
            }
        }
    }
}

impl Drop for TunnelMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            self.shared.quit.store(true, Ordering::SeqCst);
            task.abort();
        }
    }
}

struct Worker<R, B> {
    target: TunnelTarget<R, B>,
    timings: MonitorTimings,
    shared: Arc<Shared>,
}

impl<R, B> Worker<R, B>
where
    R: CommandRunner + Clone + 'static,
    B: DebugBridge + Clone + 'static,
{
    async fn run(self) {
        let mut previous_port = None;
        while !self.shared.stopping() {
            self.shared.set_state(MonitorState::Init);
            if self.target.instance_type.is_cloud() {
                self.shared.set_state(MonitorState::Prestep);
                if let Err(reason) = self.prestep().await {
                    self.shared.fail(reason);
                    return;
                }
                if self.shared.stopping() {
                    break;
                }
            }
            self.shared.begin_tunnel();
            let tunnel = match self.open(previous_port) {
                Ok(tunnel) => tunnel,
                Err(reason) => {
                    self.shared.fail(reason);
                    return;
                }
            };
            previous_port = Some(tunnel.port());
            if let Err(reason) = self.supervise(tunnel).await {
                self.shared.fail(reason);
                return;
            }
            if self.shared.rebooting.swap(false, Ordering::SeqCst) && !self.shared.stopping() {
                self.shared.note("waiting out reboot grace");
                self.shared.pause(self.timings.reboot_grace).await;
            }
        }
        self.shared.note("stopped");
        self.shared.set_state(MonitorState::Shutdown);
        info!("tunnel monitor stopped");
    }

    async fn prestep(&self) -> Result<(), String> {
        for command in [["stop", "adbd"], ["start", "adbd"]] {
            self.run_with_retries(&command).await?;
        }
        Ok(())
    }

    async fn run_with_retries(&self, command: &[&str]) -> Result<(), String> {
        let attempts = self.timings.prestep_attempts.max(1);
        let shown = command.join(" ");
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            if self.shared.stopping() {
                return Ok(());
            }
            match self.target.host.exec(command).await {
                Ok(output) if output.is_success() => {
                    self.shared.note(format!("remote `{shown}` succeeded"));
                    return Ok(());
                }
                Ok(output) => {
                    last_error = format!(
                        "status {}: {}",
                        output.status_text(),
                        output.stderr.trim()
                    );
                }
                Err(err) => last_error = err.to_string(),
            }
            warn!(attempt, attempts, command = %shown, error = %last_error, "remote bridge preparation failed");
            if attempt < attempts {
                self.shared.pause(self.timings.prestep_retry_delay).await;
            }
        }
        Err(format!(
            "remote `{shown}` failed after {attempts} attempts: {last_error}"
        ))
    }

    fn open(&self, previous_port: Option<u16>) -> Result<TunnelSession, String> {
        let port = allocate_port(previous_port)
            .map_err(|err| format!("no local port available for the tunnel: {err}"))?;
        if previous_port.is_some_and(|previous| previous != port) {
            self.shared
                .note(format!("switched tunnel to ephemeral port {port}"));
        }
        let child = self
            .target
            .host
            .open_tunnel(port, self.target.remote_port)
            .map_err(|err| err.to_string())?;
        self.shared
            .note(format!("tunnel started on local port {port}"));
        Ok(TunnelSession::new(port, child))
    }

    async fn supervise(&self, mut tunnel: TunnelSession) -> Result<(), String> {
        let close_wait = self.timings.close_wait;
        self.shared.pause(self.timings.warmup).await;
        if self.shared.close_requested() {
            tunnel.close(&self.target.bridge, close_wait).await;
            self.shared.set_state(MonitorState::Init);
            return Ok(());
        }
        if !tunnel.is_alive() {
            let port = tunnel.port();
            tunnel.close(&self.target.bridge, close_wait).await;
            return Err(format!(
                "tunnel on local port {port} exited during warm-up"
            ));
        }
        self.shared.set_state(MonitorState::TunnelAlive);

        let address = tunnel.address();
        self.target.device.set_address(Some(address.clone()));
        self.target.attributes.set(BRIDGE_ADDRESS, address.clone());
        match self.target.bridge.connect(&address).await {
            Ok(()) => self.shared.note(format!("bridge connected to {address}")),
            Err(err) => {
                warn!(address, error = %err, "bridge connect through tunnel failed");
                self.shared.note(format!("bridge connect failed: {err}"));
            }
        }
        self.shared.set_state(MonitorState::Bridged);

        tokio::select! {
            code = tunnel.exited() => {
                info!(address, ?code, "tunnel exited");
                self.shared.note(format!("tunnel on {address} exited with {code:?}"));
            }
            () = self.shared.wake.notified() => {
                self.shared.reconnect.store(false, Ordering::SeqCst);
                debug!(address, "tunnel close requested");
            }
        }
        tunnel.close(&self.target.bridge, close_wait).await;
        // Closed tunnels stop counting as alive before any reboot grace.
        self.shared.set_state(MonitorState::Init);
        self.shared.note(format!("tunnel on {address} closed"));
        Ok(())
    }
}

#[cfg(test)]
mod tests;
