//! The offline cache worker.
//!
//! A thin adapter between the lifecycle/fetch events delivered by the
//! registration host and the pure policy in [`crate::policy`]. Every handler
//! is an `async fn` the host awaits to completion, which is what keeps the
//! surrounding lifecycle event pending while caches and the network are in
//! flight. Hung handlers are left to the host's own worker timeout.

use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use workflowhub_net::{Network, Request, Response};

use crate::cache::{CacheEntry, CacheKey, CacheStore};
use crate::config::WorkerConfig;
use crate::message::WorkerMessage;
use crate::policy::{self, Effect, RequestClass};
use crate::{FetchError, WorkerError};

/// Result of intercepting a request.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Not intercepted; the request goes to the network untouched.
    PassThrough,
    /// Respond with this response.
    Respond(Response),
}

impl FetchOutcome {
    pub fn into_response(self) -> Option<Response> {
        match self {
            FetchOutcome::PassThrough => None,
            FetchOutcome::Respond(response) => Some(response),
        }
    }
}

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    pub cache_name: String,
    pub cached: Vec<String>,
    /// The worker asks to skip the waiting phase.
    pub skip_waiting: bool,
}

/// Result of activation cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateReport {
    pub kept: String,
    pub deleted: Vec<String>,
    pub failed: Vec<(String, String)>,
    /// The worker takes control of open clients immediately.
    pub claim_clients: bool,
}

/// What the worker wants done after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    SkipWaiting,
    Ignored,
}

/// A worker script as seen by the registration host.
pub trait WorkerScript: Send + Sync + 'static {
    /// Version discriminator used to detect updates.
    fn version(&self) -> &str;

    /// Handle the install event.
    fn install(&self) -> impl Future<Output = Result<InstallOutcome, WorkerError>> + Send;

    /// Handle the activate event.
    fn activate(&self) -> impl Future<Output = Result<ActivateReport, WorkerError>> + Send;

    /// Handle a fetch from a client this worker controls.
    fn fetch(
        &self,
        request: Request,
    ) -> impl Future<Output = Result<FetchOutcome, FetchError>> + Send;

    /// Handle a message posted to this worker instance.
    fn on_message(&self, message: &WorkerMessage) -> MessageOutcome;
}

/// Offline cache worker for one configuration.
pub struct OfflineCacheWorker<N, C> {
    config: Arc<WorkerConfig>,
    network: N,
    caches: C,
}

impl<N: Network, C: CacheStore> OfflineCacheWorker<N, C> {
    pub fn new(config: Arc<WorkerConfig>, network: N, caches: C) -> Self {
        Self {
            config,
            network,
            caches,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn caches(&self) -> &C {
        &self.caches
    }

    /// Populate the current cache with the bootstrap set.
    ///
    /// All-or-nothing: every resource is fetched before anything is written,
    /// and any failure fails the install. Not retried.
    pub async fn install(&self) -> Result<InstallOutcome, WorkerError> {
        let cache_name = self.config.cache_name();
        info!(cache = %cache_name, resources = self.config.bootstrap.len(), "Installing worker");

        self.caches.open(&cache_name).await?;

        let mut entries = Vec::with_capacity(self.config.bootstrap.len());
        for path in &self.config.bootstrap {
            let url = self.config.resolve(path)?;
            let request = Request::get(url);
            let response = self
                .network
                .fetch(request.clone())
                .await
                .map_err(|e| WorkerError::install(path, e.to_string()))?;
            if !response.ok() {
                return Err(WorkerError::install(
                    path,
                    format!("bad status {}", response.status),
                ));
            }
            let snapshot = response
                .snapshot()
                .await
                .map_err(|e| WorkerError::install(path, e.to_string()))?;
            entries.push(CacheEntry::from_snapshot(
                CacheKey::for_request(&request),
                snapshot,
            ));
        }

        for entry in entries {
            self.caches.put(&cache_name, entry).await?;
        }

        info!(cache = %cache_name, "Bootstrap resources cached");
        Ok(InstallOutcome {
            cache_name,
            cached: self.config.bootstrap.clone(),
            skip_waiting: self.config.skip_waiting_on_install,
        })
    }

    /// Delete every cache other than the current one.
    ///
    /// Deletions run concurrently and settle independently; one failure is
    /// recorded without stopping the rest.
    pub async fn activate(&self) -> Result<ActivateReport, WorkerError> {
        let current = self.config.cache_name();
        let stale: Vec<String> = self
            .caches
            .cache_names()
            .await?
            .into_iter()
            .filter(|name| *name != current)
            .collect();

        let results = join_all(stale.into_iter().map(|name| async move {
            let result = self.caches.delete_cache(&name).await;
            (name, result)
        }))
        .await;

        let mut deleted = Vec::new();
        let mut failed = Vec::new();
        for (name, result) in results {
            match result {
                Ok(_) => {
                    info!(cache = %name, "Deleted old cache");
                    deleted.push(name);
                }
                Err(e) => {
                    warn!(cache = %name, error = %e, "Failed to delete old cache");
                    failed.push((name, e.to_string()));
                }
            }
        }

        Ok(ActivateReport {
            kept: current,
            deleted,
            failed,
            claim_clients: true,
        })
    }

    /// Intercept one request.
    pub async fn handle_fetch(&self, request: Request) -> Result<FetchOutcome, FetchError> {
        match policy::classify(&self.config, &request) {
            RequestClass::CrossOrigin => {
                trace!(url = %request.url, "Cross-origin request passed through");
                Ok(FetchOutcome::PassThrough)
            }
            RequestClass::Navigation => self.network_first(request).await.map(FetchOutcome::Respond),
            RequestClass::Asset => Ok(FetchOutcome::Respond(self.cache_first(request).await)),
        }
    }

    /// Handle a message posted to this worker.
    pub fn handle_message(&self, message: &WorkerMessage) -> MessageOutcome {
        match message {
            WorkerMessage::SkipWaiting => {
                debug!(version = %self.config.version, "Skip-waiting requested by client");
                MessageOutcome::SkipWaiting
            }
        }
    }

    async fn network_first(&self, request: Request) -> Result<Response, FetchError> {
        let fetched = match self.network.fetch(request.clone()).await {
            Ok(response) => response.snapshot().await,
            Err(e) => Err(e),
        };

        match fetched {
            Ok(snapshot) => {
                let effect = policy::navigation_from_network(&self.config, &request, snapshot);
                Ok(self.apply(effect).await)
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Navigation failed, falling back");
                let cached = self.lookup(&CacheKey::for_request(&request)).await;
                let offline = match cached {
                    Some(_) => None,
                    None => self.offline_entry().await,
                };
                let effect = policy::navigation_fallback(&request, cached, offline)?;
                Ok(self.apply(effect).await)
            }
        }
    }

    async fn cache_first(&self, request: Request) -> Response {
        let cacheable = policy::uses_cache(&request);
        if cacheable {
            if let Some(entry) = self.lookup(&CacheKey::for_request(&request)).await {
                trace!(url = %request.url, "Cache hit");
                return self.apply(policy::asset_from_cache(&entry)).await;
            }
        }

        let response = match self.network.fetch(request.clone()).await {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %request.url, error = %e, "Fetch failed");
                return self.apply(policy::asset_network_failure()).await;
            }
        };

        if !cacheable || !policy::is_cacheable(response.status, response.response_type) {
            return response;
        }

        match response.snapshot().await {
            Ok(snapshot) => {
                let effect = policy::asset_from_network(&self.config, &request, snapshot);
                self.apply(effect).await
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "Response body failed");
                self.apply(policy::asset_network_failure()).await
            }
        }
    }

    async fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        match self.caches.match_in(&self.config.cache_name(), key).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(url = %key.url, error = %e, "Cache lookup failed");
                None
            }
        }
    }

    async fn offline_entry(&self) -> Option<CacheEntry> {
        let url = self.config.resolve(&self.config.offline_url).ok()?;
        self.lookup(&CacheKey::get(&url)).await
    }

    /// Run the cache writes, then hand back the response. A failed write
    /// never fails the fetch.
    async fn apply(&self, effect: Effect) -> Response {
        for write in effect.cache_writes {
            let url = write.entry.key.url.clone();
            if let Err(e) = self.caches.put(&write.cache_name, write.entry).await {
                warn!(cache = %write.cache_name, url = %url, error = %e, "Cache write failed");
            }
        }
        effect.respond_with
    }
}

impl<N, C> WorkerScript for OfflineCacheWorker<N, C>
where
    N: Network + 'static,
    C: CacheStore + 'static,
{
    fn version(&self) -> &str {
        &self.config.version
    }

    fn install(&self) -> impl Future<Output = Result<InstallOutcome, WorkerError>> + Send {
        OfflineCacheWorker::install(self)
    }

    fn activate(&self) -> impl Future<Output = Result<ActivateReport, WorkerError>> + Send {
        OfflineCacheWorker::activate(self)
    }

    fn fetch(
        &self,
        request: Request,
    ) -> impl Future<Output = Result<FetchOutcome, FetchError>> + Send {
        self.handle_fetch(request)
    }

    fn on_message(&self, message: &WorkerMessage) -> MessageOutcome {
        self.handle_message(message)
    }
}
