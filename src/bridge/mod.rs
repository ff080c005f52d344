//! Debug-bridge client abstraction.
//!
//! The session and the tunnel monitor talk to the device through
//! [`DebugBridge`]; [`AdbBridge`] implements it by shelling out to `adb`.
//! [`DeviceHandle`] carries the address the bridge currently reaches the
//! device on, which only the tunnel monitor updates.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use thiserror::Error;

use crate::remote::RemoteError;

mod adb;

pub use adb::AdbBridge;

/// Future returned by bridge operations.
pub type BridgeFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BridgeError>> + Send + 'a>>;

/// Connection state reported by the bridge for a serial.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceState {
    /// Connected and accepting commands.
    Online,
    /// Known to the bridge but not responding.
    Offline,
    /// Booted into recovery.
    Recovery,
    /// Visible but the host key was not accepted.
    Unauthorized,
    /// Not known to the bridge at all.
    NotAvailable,
}

impl DeviceState {
    /// Maps the output of `adb get-state` to a state.
    #[must_use]
    pub fn from_adb_state(raw: &str) -> Self {
        match raw.trim() {
            "device" => Self::Online,
            "offline" => Self::Offline,
            "recovery" => Self::Recovery,
            "unauthorized" => Self::Unauthorized,
            _ => Self::NotAvailable,
        }
    }
}

/// Kind of reboot requested through the bridge.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RebootMode {
    /// Full reboot of the device.
    Full,
    /// Restart of userspace only.
    Userspace,
}

impl fmt::Display for RebootMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => f.write_str("full"),
            Self::Userspace => f.write_str("userspace"),
        }
    }
}

/// Errors raised by bridge operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BridgeError {
    /// Raised when `connect` does not report a connection.
    #[error("failed to connect to {address}: {message}")]
    Connect {
        /// Address that was dialled.
        address: String,
        /// Bridge output describing the failure.
        message: String,
    },
    /// Raised when a device command completes unsuccessfully.
    #[error("bridge command `{command}` failed for {serial}: {message}")]
    Command {
        /// Device serial the command targeted.
        serial: String,
        /// Short name of the command.
        command: String,
        /// Output describing the failure.
        message: String,
    },
    /// Raised when the device does not reach the expected state in time.
    #[error("device {serial} not available after {waited:?}")]
    Timeout {
        /// Device serial being waited on.
        serial: String,
        /// Duration that elapsed.
        waited: Duration,
    },
    /// Raised when the bridge client itself cannot run.
    #[error(transparent)]
    Runner(#[from] RemoteError),
}

/// Operations the session needs from the debug bridge.
pub trait DebugBridge: Send + Sync {
    /// Connects the bridge client to `address` (`host:port`).
    fn connect<'a>(&'a self, address: &'a str) -> BridgeFuture<'a, ()>;

    /// Drops the bridge connection to `address`.
    fn disconnect<'a>(&'a self, address: &'a str) -> BridgeFuture<'a, ()>;

    /// Reports the current state of `serial`.
    fn state<'a>(&'a self, serial: &'a str) -> BridgeFuture<'a, DeviceState>;

    /// Waits until `serial` finished booting and accepts commands.
    fn wait_for_available<'a>(&'a self, serial: &'a str, limit: Duration)
    -> BridgeFuture<'a, ()>;

    /// Issues a reboot of `serial`.
    fn reboot<'a>(&'a self, serial: &'a str, mode: RebootMode) -> BridgeFuture<'a, ()>;

    /// Returns the tail of the device log.
    fn dump_logcat<'a>(&'a self, serial: &'a str) -> BridgeFuture<'a, String>;

    /// Clears the device log buffers.
    fn clear_logcat<'a>(&'a self, serial: &'a str) -> BridgeFuture<'a, ()>;
}

/// Shared handle to the device's bridge address.
///
/// Clones observe the same address. The tunnel monitor is the only writer.
#[derive(Clone, Debug, Default)]
pub struct DeviceHandle {
    address: Arc<RwLock<Option<String>>>,
}

impl DeviceHandle {
    /// Creates a handle without an address.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the address the bridge currently reaches the device on.
    #[must_use]
    pub fn current_address(&self) -> Option<String> {
        self.address
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_address(&self, address: Option<String>) {
        *self
            .address
            .write()
            .unwrap_or_else(PoisonError::into_inner) = address;
    }
}

#[cfg(test)]
mod tests;
