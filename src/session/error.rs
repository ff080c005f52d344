//! Errors returned by device session operations.

use thiserror::Error;

use crate::bridge::BridgeError;
use crate::config::ConfigError;
use crate::instance::ManagerError;
use crate::remote::RemoteError;
use crate::tunnel::TunnelError;

/// Failure kinds surfaced by setup, recovery and reboot.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SessionError {
    /// The device could not be brought up; not recoverable.
    #[error("device setup failed: {message}")]
    Setup {
        /// What went wrong.
        message: String,
    },
    /// The device is offline or the tunnel could not be restored.
    #[error("device unavailable: {message}")]
    DeviceUnavailable {
        /// What went wrong.
        message: String,
    },
    /// Configuration prevents the session from starting.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SessionError {
    pub(crate) fn setup(message: impl Into<String>) -> Self {
        Self::Setup {
            message: message.into(),
        }
    }

    pub(crate) fn unavailable(message: impl Into<String>) -> Self {
        Self::DeviceUnavailable {
            message: message.into(),
        }
    }
}

impl From<ManagerError> for SessionError {
    fn from(value: ManagerError) -> Self {
        match value {
            ManagerError::Config(err) => Self::Config(err),
            ManagerError::Preflight { message } => Self::Config(ConfigError::Invalid(message)),
            other => Self::setup(other.to_string()),
        }
    }
}

impl From<BridgeError> for SessionError {
    fn from(value: BridgeError) -> Self {
        Self::unavailable(value.to_string())
    }
}

impl From<TunnelError> for SessionError {
    fn from(value: TunnelError) -> Self {
        Self::unavailable(value.to_string())
    }
}

impl From<RemoteError> for SessionError {
    fn from(value: RemoteError) -> Self {
        Self::setup(value.to_string())
    }
}
