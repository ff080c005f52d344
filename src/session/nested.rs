//! In-place reset of nested devices.
//!
//! Several nested devices can share one physical host, each owned by a
//! host-local user. A reset stops that user's device and relaunches it on
//! the same data, then reattaches the session. Resets on the same host are
//! serialised through [`host_lock`].

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{DeviceSession, SessionError};
use crate::bridge::DebugBridge;
use crate::config::SessionConfig;
use crate::instance::driver::known_remote_logs;
use crate::instance::{InstanceManager, fetch_each};
use crate::remote::CommandRunner;

static HOST_LOCKS: LazyLock<Mutex<BTreeMap<String, Arc<AsyncMutex<()>>>>> =
    LazyLock::new(|| Mutex::new(BTreeMap::new()));

/// Returns the lock serialising resets on `host`. Every caller naming the
/// same host gets the same lock.
#[must_use]
pub fn host_lock(host: &str) -> Arc<AsyncMutex<()>> {
    let mut locks = HOST_LOCKS.lock().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(locks.entry(host.to_owned()).or_default())
}

/// A planned reset of one nested device.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NestedReset {
    /// Physical host running the device.
    pub host: String,
    /// Host-local user owning the device.
    pub user: String,
    /// Failure that triggered the reset, if any. Diagnostics are saved
    /// before relaunching when present.
    pub failure: Option<String>,
}

impl NestedReset {
    /// Plans a reset of the device on `host`. The user comes from the
    /// configured address-to-user map, falling back to the instance user.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Config`] when the user map is malformed.
    pub fn plan(
        config: &SessionConfig,
        host: &str,
        failure: Option<&str>,
    ) -> Result<Self, SessionError> {
        let users = config.nested_users()?;
        let user = users.get(host).cloned().unwrap_or_else(|| {
            debug!(host, "no nested user mapped; using the instance user");
            config.instance_user.clone()
        });
        Ok(Self {
            host: host.to_owned(),
            user,
            failure: failure.map(str::to_owned),
        })
    }

    fn home(&self) -> String {
        format!("/home/{}", self.user)
    }

    /// Remote command stopping the device.
    #[must_use]
    pub fn stop_command(&self) -> Vec<String> {
        vec![
            format!("HOME={}", self.home()),
            format!("{}/bin/stop_cvd", self.home()),
        ]
    }

    /// Remote command relaunching the device on its existing data.
    #[must_use]
    pub fn launch_command(&self) -> Vec<String> {
        vec![
            format!("HOME={}", self.home()),
            format!("{}/bin/launch_cvd", self.home()),
            String::from("-daemon"),
            String::from("-data_policy"),
            String::from("use_existing"),
        ]
    }
}

fn as_args(command: &[String]) -> Vec<&str> {
    command.iter().map(String::as_str).collect()
}

impl<R, B> DeviceSession<R, B>
where
    R: CommandRunner + Clone + 'static,
    B: DebugBridge + Clone + 'static,
{
    /// Stops and relaunches the nested device in place, then reattaches by
    /// running [`Self::setup`] against the same host.
    ///
    /// With `failure` set, the device's logs and a bugreport are saved
    /// first, since relaunching discards them.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Setup`] when the session has no nested
    /// device or the relaunch fails, and any error from [`Self::setup`].
    pub async fn reset_in_place(&mut self, failure: Option<&str>) -> Result<(), SessionError> {
        if !self.manager().instance_type().is_nested_runtime() {
            return Err(SessionError::setup("in-place reset needs a nested runtime instance"));
        }
        let host = self
            .descriptor()
            .and_then(|descriptor| descriptor.endpoint())
            .map(|endpoint| endpoint.host.clone())
            .ok_or_else(|| SessionError::setup("no launched instance to reset"))?;
        let reset = NestedReset::plan(self.manager().config(), &host, failure)?;

        let lock = host_lock(&reset.host);
        let _guard = lock.lock().await;
        info!(host = %reset.host, user = %reset.user, "resetting nested device in place");

        let remote = self.manager().host_as(&reset.user, &reset.host)?;
        if reset.failure.is_some() {
            debug!("saving nested device diagnostics before relaunch");
            let logs = known_remote_logs(self.manager().instance_type(), &reset.user);
            let saved = fetch_each(&remote, self.artifacts(), "reset-", &logs).await;
            debug!(count = saved.len(), "nested logs saved");
            let bugreport =
                InstanceManager::<R>::bugreport_from(&remote, self.artifacts(), "reset-bugreport");
            if let Err(err) = bugreport.await {
                warn!(error = %err, "bugreport before reset failed");
            }
        }

        self.stop_tunnel().await;
        let stop = remote.exec(&as_args(&reset.stop_command())).await?;
        if !stop.is_success() {
            warn!(
                status = %stop.status_text(),
                stderr = %stop.stderr.trim(),
                "stopping nested device failed; relaunching anyway"
            );
        }
        let boot_timeout = self.manager().config().boot_timeout();
        let launch = remote
            .exec_with_timeout(&as_args(&reset.launch_command()), boot_timeout)
            .await?;
        if !launch.is_success() {
            return Err(SessionError::setup(format!(
                "relaunching nested device for {} failed with status {}: {}",
                reset.user,
                launch.status_text(),
                launch.stderr.trim()
            )));
        }
        sleep(self.timings().nested_settle).await;

        self.manager_mut().set_host_user(&reset.user);
        self.set_existing_host(&reset.host);
        self.setup().await
    }
}
