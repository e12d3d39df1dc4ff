//! # WorkflowHub Update Coordinator
//!
//! Runs on the page. Detects a newly installed worker waiting behind the
//! current one, offers the update, and performs the hand-off:
//!
//! ```text
//! waiting worker ──► prompt ──► "update now" ──► SKIP_WAITING ──► controller change ──► reload
//!                      │
//!                      └── "later" ──► idle (worker keeps waiting)
//! ```
//!
//! A background [`UpdatePoller`] asks the registration for updates on a
//! fixed interval so long-lived tabs still notice new releases.

use thiserror::Error;
use workflowhub_common::ConfigError;
use workflowhub_sw::RegistrationError;

pub mod coordinator;
pub mod poller;
pub mod recovery;
pub mod state;

pub use coordinator::{PageHost, RegistrationHandle, UpdateCoordinator, UserAction};
pub use poller::{PollerHandle, UpdateConfig, UpdatePoller, DEFAULT_POLL_INTERVAL_SECS};
pub use recovery::reset_and_reload;
pub use state::{UpdateCommand, UpdateInput, UpdateState};

/// Errors raised by the update coordinator.
#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Skip-waiting signal failed: {0}")]
    Signal(#[from] RegistrationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}
