//! Instance lifecycle through the external driver.
//!
//! [`InstanceManager`] creates and deletes instances by invoking the driver
//! binary, parses its report into an [`InstanceDescriptor`], and salvages
//! diagnostics (logs, bugreports, tombstones, serial console) from the
//! instance before it is deleted.

use thiserror::Error;

use crate::artifacts::ArtifactError;
use crate::config::ConfigError;
use crate::remote::RemoteError;

pub mod descriptor;
pub mod driver;
mod manager;

pub use descriptor::{
    DescriptorError, Endpoint, InstanceDescriptor, InstanceStatus, parse_report,
    parse_report_file,
};
pub use manager::InstanceManager;
pub(crate) use manager::fetch_each;

/// Errors raised by the instance manager.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ManagerError {
    /// Configuration is incomplete.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The driver binary or ssh key cannot be used.
    #[error("preflight check failed: {message}")]
    Preflight {
        /// What is missing and how to fix it.
        message: String,
    },
    /// The driver failed without producing a usable report.
    #[error("instance launch failed: {message}")]
    Launch {
        /// Driver status and output.
        message: String,
    },
    /// The driver report could not be turned into a descriptor.
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    /// A remote command or copy failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// An artifact could not be written locally.
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    /// A temporary file could not be prepared.
    #[error("failed to prepare {path}: {message}")]
    Io {
        /// Path being prepared.
        path: String,
        /// Operating system error string.
        message: String,
    },
}

impl ManagerError {
    /// Whether retrying the operation cannot help.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Preflight { .. })
    }
}
