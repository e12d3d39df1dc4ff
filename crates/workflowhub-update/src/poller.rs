//! Periodic update checks for long-lived pages.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use workflowhub_common::{load_json_config, parse_json_config, ConfigError};
use workflowhub_sw::UpdateCheck;

use crate::coordinator::RegistrationHandle;

/// Default time between update checks.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

/// Update coordinator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
        }
    }
}

impl UpdateConfig {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = parse_json_config(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = load_json_config(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::invalid("poll_interval_secs must be at least 1"));
        }
        Ok(())
    }
}

/// Spawns the background update check.
pub struct UpdatePoller;

impl UpdatePoller {
    /// Call `update()` on the registration every `interval`, starting one
    /// interval from now. Failures are logged and polling continues.
    pub fn spawn<R>(registration: R, interval: Duration) -> PollerHandle
    where
        R: RegistrationHandle + 'static,
    {
        let (cancel_tx, mut cancel_rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = interval.as_secs(), "Update polling started");

            loop {
                tokio::select! {
                    _ = cancel_rx.recv() => break,
                    _ = ticker.tick() => match registration.update().await {
                        Ok(UpdateCheck::NoUpdate) => debug!("Update check: no update"),
                        Ok(check) => info!(?check, "Update check found a new worker"),
                        Err(e) => warn!(error = %e, "Update check failed"),
                    },
                }
            }

            debug!("Update polling stopped");
        });

        PollerHandle {
            cancel_tx: Some(cancel_tx),
            task: Some(task),
        }
    }
}

/// Owner of a running poller. Dropping it cancels the task.
pub struct PollerHandle {
    cancel_tx: Option<mpsc::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl PollerHandle {
    /// Cancel the poller and wait for it to finish.
    pub async fn stop(mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Update poller ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
