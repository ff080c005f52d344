//! One ssh port-forward process and its local port.

use std::io;
use std::net::TcpListener;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::bridge::DebugBridge;
use crate::remote::ChildProcess;

/// Picks the local port for a new tunnel, reusing `previous` when it can
/// still be bound.
pub(crate) fn allocate_port(previous: Option<u16>) -> io::Result<u16> {
    if let Some(port) = previous {
        if TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return Ok(port);
        }
        info!(port, "previous tunnel port is busy; switching to an ephemeral port");
    }
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// A spawned tunnel. Closing consumes it, so a tunnel is closed at most
/// once.
pub(crate) struct TunnelSession {
    port: u16,
    child: Box<dyn ChildProcess>,
}

impl TunnelSession {
    pub(crate) const fn new(port: u16, child: Box<dyn ChildProcess>) -> Self {
        Self { port, child }
    }

    pub(crate) const fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn address(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub(crate) fn is_alive(&mut self) -> bool {
        self.child.is_alive()
    }

    /// Resolves when the ssh process exits.
    pub(crate) async fn exited(&mut self) -> Option<i32> {
        match self.child.wait().await {
            Ok(code) => code,
            Err(err) => {
                warn!(port = self.port, error = %err, "lost track of tunnel process");
                None
            }
        }
    }

    /// Disconnects the bridge, then kills the process and waits up to
    /// `wait` for it to exit.
    pub(crate) async fn close<B: DebugBridge>(mut self, bridge: &B, wait: Duration) {
        let address = self.address();
        if let Err(err) = bridge.disconnect(&address).await {
            debug!(address, error = %err, "bridge disconnect failed");
        }
        if !self.child.is_alive() {
            debug!(port = self.port, "tunnel process already exited");
            return;
        }
        if let Err(err) = self.child.kill() {
            warn!(port = self.port, error = %err, "failed to signal tunnel process");
        }
        match timeout(wait, self.child.wait()).await {
            Ok(Ok(code)) => debug!(port = self.port, ?code, "tunnel process exited"),
            Ok(Err(err)) => warn!(port = self.port, error = %err, "failed to reap tunnel process"),
            Err(_) => warn!(
                port = self.port,
                wait_secs = wait.as_secs(),
                "tunnel process did not exit in time"
            ),
        }
    }
}
