//! # WorkflowHub Offline Cache Worker
//!
//! The installable-app cache worker for WorkflowHub and the in-process
//! registration facility that hosts it.
//!
//! ## Features
//!
//! - **Versioned caches**: one current cache name, everything else evicted
//!   on activation
//! - **Bootstrap set**: offline document and manifest cached at install
//! - **Fetch policy**: pass-through for other origins, network-first for
//!   navigations, cache-first for the rest
//! - **Registration**: install/waiting/active slots, skip-waiting,
//!   controller changes
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer
//!     │
//!     └── ServiceWorkerRegistration (scope)
//!             ├── installing ─┐
//!             ├── waiting     ├── OfflineCacheWorker ── policy (pure)
//!             └── active ─────┘        │
//!                                      ├── Network
//!                                      └── CacheStore
//!                                              └── Cache ("workflowhub-v2")
//! ```

use thiserror::Error;
use workflowhub_common::ConfigError;

pub mod cache;
pub mod config;
pub mod message;
pub mod policy;
pub mod registration;
pub mod reset;
pub mod worker;

pub use cache::{Cache, CacheEntry, CacheError, CacheKey, CacheStore, MemoryCacheStore};
pub use config::WorkerConfig;
pub use message::WorkerMessage;
pub use policy::{Effect, RequestClass};
pub use registration::{
    ContainerRegistration, ScriptSource, ServiceWorker, ServiceWorkerContainer,
    ServiceWorkerEvent, ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState,
    UpdateCheck,
};
pub use reset::{reset_offline_state, ResetReport};
pub use worker::{
    ActivateReport, FetchOutcome, InstallOutcome, MessageOutcome, OfflineCacheWorker,
    WorkerScript,
};

// ==================== Errors ====================

/// Errors raised by worker lifecycle handlers.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Install failed for {url}: {reason}")]
    Install { url: String, reason: String },

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl WorkerError {
    /// Create an install error for a bootstrap resource.
    pub fn install(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Install {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

/// Errors surfaced to the page from fetch interception.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("No network, cached page, or offline document for {0}")]
    NoFallback(String),
}

/// Errors raised by the registration facility.
#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("Security error: {0}")]
    Security(String),

    #[error("Invalid script URL: {0}")]
    InvalidScript(String),

    #[error("Script fetch failed: {0}")]
    ScriptFetch(String),

    #[error("Worker {worker_id} failed to install: {source}")]
    InstallFailed {
        worker_id: ServiceWorkerId,
        #[source]
        source: WorkerError,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("State error: {0}")]
    State(String),
}
