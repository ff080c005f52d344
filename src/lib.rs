//! Core library for the avd-tether remote device tool.
//!
//! The crate launches a remote Android virtual device through an external
//! driver binary, keeps an ssh tunnel open so a local debug-bridge client can
//! reach it, and tears everything down while saving diagnostics
//! (launch → tunnel → device online → teardown).

pub mod artifacts;
pub mod attributes;
pub mod bridge;
pub mod config;
pub mod instance;
pub mod remote;
pub mod session;
pub mod test_support;
pub mod tunnel;

pub use artifacts::{ArtifactDir, ArtifactError};
pub use attributes::BuildAttributes;
pub use bridge::{AdbBridge, BridgeError, DebugBridge, DeviceHandle, DeviceState, RebootMode};
pub use config::{ConfigError, InstanceType, SessionConfig};
pub use instance::{InstanceDescriptor, InstanceManager, InstanceStatus, ManagerError};
pub use remote::{CommandOutput, CommandRunner, ProcessCommandRunner, RemoteError, RemoteHost};
pub use session::{DeviceSession, SessionError, StepOutcome, TeardownReport, TeardownStep};
pub use tunnel::{MonitorState, TunnelError, TunnelMonitor};
