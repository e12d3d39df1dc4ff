//! In-process worker registration facility.
//!
//! Owns the installing/waiting/active slots and the page's controller, and
//! is the only thing that changes a worker's lifecycle state. Registration
//! jobs (register, update, skip-waiting) are serialized through one job
//! lock; slot bookkeeping takes the state lock only briefly, never across a
//! worker handler. A skip-waiting request sent to a worker that is still
//! installing is recorded and applied once the install succeeds.
//!
//! ```text
//! update() ── fetch script ── same version? ── NoUpdate
//!                  │
//!                  └── installing ──install()──► installed (waiting)
//!                                                   │ no active worker,
//!                                                   │ or skip-waiting
//!                                                   ▼
//!                                 activating ──activate()──► activated
//!                                                   │ page already controlled,
//!                                                   │ or claim
//!                                                   ▼
//!                                           ControllerChange
//! ```
//!
//! The previous active worker keeps serving the page's fetches until its
//! successor reaches `Activated`, and only then becomes redundant.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use url::Url;
use workflowhub_net::Request;

use crate::message::WorkerMessage;
use crate::worker::{FetchOutcome, MessageOutcome, WorkerScript};
use crate::{FetchError, RegistrationError};

// ==================== Types ====================

/// Unique identifier for a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    /// Allocate a fresh, process-unique ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for ServiceWorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ServiceWorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sw-{}", self.0)
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceWorkerState {
    /// Initial state, script parsed.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Redundant (replaced or install failed).
    Redundant,
}

/// A worker instance.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Script URL.
    pub script_url: Url,

    /// Version reported by the script.
    pub version: String,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Time of last state change.
    pub state_changed_at: Instant,
}

impl ServiceWorker {
    /// Create a new worker record.
    pub fn new(script_url: Url, version: impl Into<String>) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            script_url,
            version: version.into(),
            state: ServiceWorkerState::Parsed,
            state_changed_at: Instant::now(),
        }
    }

    /// Set state.
    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }
}

/// A worker registration for one scope.
#[derive(Debug, Clone)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Script the registration was made with.
    pub script_url: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,

    /// Last update check time.
    pub last_update_check: Option<Instant>,
}

impl ServiceWorkerRegistration {
    /// Create a new registration.
    pub fn new(scope: Url, script_url: Url) -> Self {
        Self {
            scope,
            script_url,
            installing: None,
            waiting: None,
            active: None,
            last_update_check: None,
        }
    }

    /// Workers currently in any slot.
    pub fn workers(&self) -> impl Iterator<Item = &ServiceWorker> {
        self.installing
            .iter()
            .chain(self.waiting.iter())
            .chain(self.active.iter())
    }

    /// Whether a live worker with `version` already exists.
    pub fn has_version(&self, version: &str) -> bool {
        self.workers()
            .any(|w| w.version == version && !w.is_redundant())
    }

    fn mark_all_redundant(&mut self) -> Vec<ServiceWorkerId> {
        let mut ids = Vec::new();
        for slot in [&mut self.installing, &mut self.waiting, &mut self.active] {
            if let Some(mut worker) = slot.take() {
                worker.set_state(ServiceWorkerState::Redundant);
                ids.push(worker.id);
            }
        }
        ids
    }
}

/// Events observed by pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// A new worker started installing.
    UpdateFound { scope: String },
    /// A worker changed state.
    StateChange {
        scope: String,
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// The worker controlling the page changed. `previous` is `None` when
    /// the page was uncontrolled before.
    ControllerChange {
        worker_id: ServiceWorkerId,
        previous: Option<ServiceWorkerId>,
    },
}

/// Result of an update check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateCheck {
    /// The script version is already installed.
    NoUpdate,
    /// A new worker installed and is waiting.
    Waiting(ServiceWorkerId),
    /// A new worker installed and activated.
    Activated(ServiceWorkerId),
}

/// Where worker scripts come from.
pub trait ScriptSource<S>: Send + Sync {
    /// Fetch the current script for `script_url`.
    fn fetch_script(
        &self,
        script_url: &Url,
    ) -> impl Future<Output = Result<Arc<S>, RegistrationError>> + Send;
}

impl<S, L: ScriptSource<S>> ScriptSource<S> for Arc<L> {
    fn fetch_script(
        &self,
        script_url: &Url,
    ) -> impl Future<Output = Result<Arc<S>, RegistrationError>> + Send {
        (**self).fetch_script(script_url)
    }
}

// ==================== Container ====================

struct Slot<S> {
    registration: ServiceWorkerRegistration,
    scripts: HashMap<ServiceWorkerId, Arc<S>>,
    /// Previous active worker, still serving fetches while its successor
    /// activates.
    outgoing: Option<ServiceWorker>,
    /// Installing worker that already asked to skip waiting.
    skip_waiting: Option<ServiceWorkerId>,
}

impl<S> Slot<S> {
    fn new(registration: ServiceWorkerRegistration) -> Self {
        Self {
            registration,
            scripts: HashMap::new(),
            outgoing: None,
            skip_waiting: None,
        }
    }

    fn worker(&self, worker_id: ServiceWorkerId) -> Option<&ServiceWorker> {
        self.registration
            .workers()
            .chain(self.outgoing.iter())
            .find(|w| w.id == worker_id)
    }
}

/// The registration facility for one origin.
pub struct ServiceWorkerContainer<S, L> {
    origin: Url,
    source: L,
    slots: RwLock<HashMap<String, Slot<S>>>,
    controller: RwLock<Option<ServiceWorkerId>>,
    jobs: Mutex<()>,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl<S: WorkerScript, L: ScriptSource<S>> ServiceWorkerContainer<S, L> {
    /// Create a new container.
    pub fn new(origin: Url, source: L) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                origin,
                source,
                slots: RwLock::new(HashMap::new()),
                controller: RwLock::new(None),
                jobs: Mutex::new(()),
                event_tx,
            },
            event_rx,
        )
    }

    /// Register the worker script. Idempotent: registering again is an
    /// update check, not a second install.
    pub async fn register(
        self: &Arc<Self>,
        script_url: &str,
    ) -> Result<ContainerRegistration<S, L>, RegistrationError> {
        let script_url = self
            .origin
            .join(script_url)
            .map_err(|e| RegistrationError::InvalidScript(e.to_string()))?;
        if script_url.origin() != self.origin.origin() {
            return Err(RegistrationError::Security(format!(
                "{script_url} is not same-origin with {}",
                self.origin
            )));
        }

        let scope = default_scope(&script_url);
        let scope_key = scope.to_string();
        {
            let mut slots = self.slots.write().await;
            match slots.get_mut(&scope_key) {
                Some(slot) => slot.registration.script_url = script_url.clone(),
                None => {
                    info!(scope = %scope_key, script = %script_url, "New registration");
                    slots.insert(
                        scope_key.clone(),
                        Slot::new(ServiceWorkerRegistration::new(scope, script_url)),
                    );
                }
            }
        }

        self.update(&scope_key).await?;

        Ok(ContainerRegistration {
            container: Arc::clone(self),
            scope: scope_key,
        })
    }

    /// Handle for an existing registration.
    pub async fn registration(self: &Arc<Self>, scope: &str) -> Option<ContainerRegistration<S, L>> {
        self.slots.read().await.contains_key(scope).then(|| ContainerRegistration {
            container: Arc::clone(self),
            scope: scope.to_string(),
        })
    }

    /// Check for a new script version and install it if found.
    pub async fn update(&self, scope: &str) -> Result<UpdateCheck, RegistrationError> {
        let _job = self.jobs.lock().await;

        let script_url = self
            .with_slot(scope, |slot| {
                slot.registration.last_update_check = Some(Instant::now());
                slot.registration.script_url.clone()
            })
            .await?;

        let script = self.source.fetch_script(&script_url).await?;
        let version = script.version().to_string();

        let known = self
            .with_slot(scope, |slot| slot.registration.has_version(&version))
            .await?;
        if known {
            debug!(scope = %scope, version = %version, "No update found");
            return Ok(UpdateCheck::NoUpdate);
        }

        self.install(scope, script_url, script).await
    }

    async fn install(
        &self,
        scope: &str,
        script_url: Url,
        script: Arc<S>,
    ) -> Result<UpdateCheck, RegistrationError> {
        let mut worker = ServiceWorker::new(script_url, script.version());
        worker.set_state(ServiceWorkerState::Installing);
        let worker_id = worker.id;
        info!(scope = %scope, %worker_id, version = %worker.version, "Installing new worker");

        let handler = Arc::clone(&script);
        self.with_slot(scope, move |slot| {
            slot.registration.installing = Some(worker);
            slot.scripts.insert(worker_id, script);
        })
        .await?;
        self.emit(ServiceWorkerEvent::UpdateFound {
            scope: scope.to_string(),
        });
        self.emit_state(scope, worker_id, ServiceWorkerState::Installing);

        let outcome = match handler.install().await {
            Ok(outcome) => outcome,
            Err(source) => {
                error!(scope = %scope, %worker_id, error = %source, "Install failed, keeping current worker");
                self.with_slot(scope, |slot| {
                    if let Some(mut failed) = slot.registration.installing.take() {
                        failed.set_state(ServiceWorkerState::Redundant);
                    }
                    slot.scripts.remove(&worker_id);
                    slot.skip_waiting = None;
                })
                .await?;
                self.emit_state(scope, worker_id, ServiceWorkerState::Redundant);
                return Err(RegistrationError::InstallFailed { worker_id, source });
            }
        };

        let (has_active, replaced, requested) = self
            .with_slot(scope, |slot| {
                let mut replaced = None;
                let requested = slot.skip_waiting.take() == Some(worker_id);
                if let Some(mut installed) = slot.registration.installing.take() {
                    installed.set_state(ServiceWorkerState::Installed);
                    if let Some(mut old) = slot.registration.waiting.replace(installed) {
                        old.set_state(ServiceWorkerState::Redundant);
                        slot.scripts.remove(&old.id);
                        replaced = Some(old.id);
                    }
                }
                (slot.registration.active.is_some(), replaced, requested)
            })
            .await?;
        if let Some(old) = replaced {
            self.emit_state(scope, old, ServiceWorkerState::Redundant);
        }
        self.emit_state(scope, worker_id, ServiceWorkerState::Installed);

        if !has_active || outcome.skip_waiting || requested {
            self.activate_waiting(scope).await?;
            return Ok(UpdateCheck::Activated(worker_id));
        }

        info!(scope = %scope, %worker_id, "Worker installed, waiting for activation");
        Ok(UpdateCheck::Waiting(worker_id))
    }

    async fn activate_waiting(&self, scope: &str) -> Result<ServiceWorkerId, RegistrationError> {
        let (worker_id, script, previous) = self
            .with_slot(scope, |slot| {
                let worker_id = slot.registration.waiting.as_ref()?.id;
                let script = slot.scripts.get(&worker_id).cloned()?;
                let mut worker = slot.registration.waiting.take()?;
                worker.set_state(ServiceWorkerState::Activating);

                slot.outgoing = slot.registration.active.replace(worker);
                let previous = slot.outgoing.as_ref().map(|old| old.id);
                Some((worker_id, script, previous))
            })
            .await?
            .ok_or_else(|| RegistrationError::State(format!("no waiting worker in {scope}")))?;
        self.emit_state(scope, worker_id, ServiceWorkerState::Activating);

        let claim = match script.activate().await {
            Ok(report) => {
                info!(
                    scope = %scope,
                    %worker_id,
                    cache = %report.kept,
                    deleted = report.deleted.len(),
                    failed = report.failed.len(),
                    "Worker activated"
                );
                report.claim_clients
            }
            Err(e) => {
                warn!(scope = %scope, %worker_id, error = %e, "Activate handler failed");
                false
            }
        };

        self.with_slot(scope, |slot| {
            if let Some(active) = slot.registration.active.as_mut().filter(|w| w.id == worker_id) {
                active.set_state(ServiceWorkerState::Activated);
            }
            if let Some(mut old) = slot.outgoing.take() {
                old.set_state(ServiceWorkerState::Redundant);
                slot.scripts.remove(&old.id);
            }
        })
        .await?;
        self.emit_state(scope, worker_id, ServiceWorkerState::Activated);
        if let Some(old) = previous {
            self.emit_state(scope, old, ServiceWorkerState::Redundant);
        }

        // Pages the old worker controlled always follow the new one; an
        // uncontrolled page is only taken over by an explicit claim.
        let moved = {
            let mut controller = self.controller.write().await;
            let current = *controller;
            let controlled = current.is_some() && current == previous;
            if (claim || controlled) && current != Some(worker_id) {
                *controller = Some(worker_id);
                Some(current)
            } else {
                None
            }
        };
        if let Some(previous) = moved {
            debug!(%worker_id, ?previous, "Controller changed");
            self.emit(ServiceWorkerEvent::ControllerChange { worker_id, previous });
        }

        Ok(worker_id)
    }

    /// Deliver a message to one worker instance.
    pub async fn post_message(
        &self,
        worker_id: ServiceWorkerId,
        message: WorkerMessage,
    ) -> Result<(), RegistrationError> {
        let (scope, script) = {
            let slots = self.slots.read().await;
            let found = slots.iter().find_map(|(scope, slot)| {
                let script = slot.scripts.get(&worker_id)?;
                Some((scope.clone(), Arc::clone(script)))
            });
            found.ok_or_else(|| RegistrationError::NotFound(worker_id.to_string()))?
        };

        debug!(%worker_id, message = message.type_name(), "Delivering message");
        match script.on_message(&message) {
            MessageOutcome::SkipWaiting => self.skip_waiting(&scope, worker_id).await,
            MessageOutcome::Ignored => Ok(()),
        }
    }

    async fn skip_waiting(
        &self,
        scope: &str,
        worker_id: ServiceWorkerId,
    ) -> Result<(), RegistrationError> {
        // Still installing: remember the request, install() honours it.
        let installing = self
            .with_slot(scope, |slot| {
                let installing = slot
                    .registration
                    .installing
                    .as_ref()
                    .is_some_and(|w| w.id == worker_id);
                if installing {
                    slot.skip_waiting = Some(worker_id);
                }
                installing
            })
            .await?;
        if installing {
            debug!(%worker_id, "Skip-waiting recorded for installing worker");
            return Ok(());
        }

        let _job = self.jobs.lock().await;
        let waiting = self
            .with_slot(scope, |slot| {
                slot.registration
                    .waiting
                    .as_ref()
                    .is_some_and(|w| w.id == worker_id)
            })
            .await?;
        if waiting {
            self.activate_waiting(scope).await?;
        } else {
            debug!(%worker_id, "Worker is not waiting, skip-waiting has no effect");
        }
        Ok(())
    }

    /// Deliver a raw posted value; unknown messages are dropped.
    pub async fn post_raw(
        &self,
        worker_id: ServiceWorkerId,
        value: &JsonValue,
    ) -> Result<(), RegistrationError> {
        match WorkerMessage::parse(value) {
            Some(message) => self.post_message(worker_id, message).await,
            None => {
                debug!(%worker_id, "Ignoring unrecognized message");
                Ok(())
            }
        }
    }

    /// Route a page fetch through the controlling worker, if any.
    pub async fn fetch(&self, request: Request) -> Result<FetchOutcome, FetchError> {
        let script = {
            let Some(worker_id) = *self.controller.read().await else {
                return Ok(FetchOutcome::PassThrough);
            };
            let slots = self.slots.read().await;
            slots
                .values()
                .find_map(|slot| slot.scripts.get(&worker_id).cloned())
        };

        match script {
            Some(script) => script.fetch(request).await,
            None => Ok(FetchOutcome::PassThrough),
        }
    }

    /// The worker controlling the page.
    pub async fn controller(&self) -> Option<ServiceWorker> {
        let worker_id = (*self.controller.read().await)?;
        let slots = self.slots.read().await;
        slots
            .values()
            .find_map(|slot| slot.worker(worker_id).cloned())
    }

    /// Snapshot of a registration.
    pub async fn get_registration(&self, scope: &str) -> Option<ServiceWorkerRegistration> {
        self.slots
            .read()
            .await
            .get(scope)
            .map(|slot| slot.registration.clone())
    }

    /// All registered scopes.
    pub async fn get_registrations(&self) -> Vec<String> {
        self.slots.read().await.keys().cloned().collect()
    }

    /// Remove a registration. Its workers become redundant and stop
    /// controlling the page.
    pub async fn unregister(&self, scope: &str) -> bool {
        let _job = self.jobs.lock().await;
        let Some(mut slot) = self.slots.write().await.remove(scope) else {
            return false;
        };
        let retired = slot.registration.mark_all_redundant();
        {
            let mut controller = self.controller.write().await;
            if controller.is_some_and(|id| retired.contains(&id)) {
                *controller = None;
            }
        }
        for worker_id in retired {
            self.emit_state(scope, worker_id, ServiceWorkerState::Redundant);
        }
        info!(scope = %scope, "Unregistered");
        true
    }

    async fn with_slot<T>(
        &self,
        scope: &str,
        f: impl FnOnce(&mut Slot<S>) -> T,
    ) -> Result<T, RegistrationError> {
        let mut slots = self.slots.write().await;
        let slot = slots
            .get_mut(scope)
            .ok_or_else(|| RegistrationError::NotFound(scope.to_string()))?;
        Ok(f(slot))
    }

    fn emit_state(&self, scope: &str, worker_id: ServiceWorkerId, new_state: ServiceWorkerState) {
        self.emit(ServiceWorkerEvent::StateChange {
            scope: scope.to_string(),
            worker_id,
            new_state,
        });
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        // Pages may have gone away; a closed channel is not an error here.
        let _ = self.event_tx.send(event);
    }
}

/// Scope defaults to the script's directory.
fn default_scope(script_url: &Url) -> Url {
    let mut scope = script_url.clone();
    let dir = script_url
        .path()
        .rsplit_once('/')
        .map(|(p, _)| format!("{p}/"))
        .unwrap_or_else(|| "/".to_string());
    scope.set_path(&dir);
    scope.set_query(None);
    scope.set_fragment(None);
    scope
}

// ==================== Registration handle ====================

/// A page-side handle to one registration.
pub struct ContainerRegistration<S, L> {
    container: Arc<ServiceWorkerContainer<S, L>>,
    scope: String,
}

impl<S, L> Clone for ContainerRegistration<S, L> {
    fn clone(&self) -> Self {
        Self {
            container: Arc::clone(&self.container),
            scope: self.scope.clone(),
        }
    }
}

impl<S: WorkerScript, L: ScriptSource<S>> ContainerRegistration<S, L> {
    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn container(&self) -> &Arc<ServiceWorkerContainer<S, L>> {
        &self.container
    }

    pub async fn installing(&self) -> Option<ServiceWorker> {
        self.snapshot().await.and_then(|r| r.installing)
    }

    pub async fn waiting(&self) -> Option<ServiceWorker> {
        self.snapshot().await.and_then(|r| r.waiting)
    }

    pub async fn active(&self) -> Option<ServiceWorker> {
        self.snapshot().await.and_then(|r| r.active)
    }

    pub async fn has_controller(&self) -> bool {
        self.container.controller().await.is_some()
    }

    pub async fn update(&self) -> Result<UpdateCheck, RegistrationError> {
        self.container.update(&self.scope).await
    }

    pub async fn post_message(
        &self,
        worker_id: ServiceWorkerId,
        message: WorkerMessage,
    ) -> Result<(), RegistrationError> {
        self.container.post_message(worker_id, message).await
    }

    async fn snapshot(&self) -> Option<ServiceWorkerRegistration> {
        self.container.get_registration(&self.scope).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::{CacheEntry, CacheError, CacheKey, CacheStore, MemoryCacheStore};
    use crate::worker::tests::{config, FakeNetwork, ORIGIN};
    use crate::worker::OfflineCacheWorker;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex as StdMutex;

    pub(crate) type TestWorker = OfflineCacheWorker<Arc<FakeNetwork>, TestStore>;
    pub(crate) type TestContainer = ServiceWorkerContainer<TestWorker, FakeSource>;

    /// Memory store whose listing can be broken, which makes activation fail.
    #[derive(Clone, Default)]
    pub(crate) struct TestStore {
        inner: MemoryCacheStore,
        listing_broken: Arc<AtomicBool>,
    }

    impl TestStore {
        pub(crate) fn break_listing(&self) {
            self.listing_broken.store(true, Ordering::SeqCst);
        }
    }

    impl CacheStore for TestStore {
        async fn open(&self, name: &str) -> Result<(), CacheError> {
            self.inner.open(name).await
        }

        async fn match_in(&self, name: &str, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
            self.inner.match_in(name, key).await
        }

        async fn put(&self, name: &str, entry: CacheEntry) -> Result<(), CacheError> {
            self.inner.put(name, entry).await
        }

        async fn delete_cache(&self, name: &str) -> Result<bool, CacheError> {
            self.inner.delete_cache(name).await
        }

        async fn cache_names(&self) -> Result<Vec<String>, CacheError> {
            if self.listing_broken.load(Ordering::SeqCst) {
                return Err(CacheError::Storage("listing unavailable".to_string()));
            }
            self.inner.cache_names().await
        }

        async fn keys(&self, name: &str) -> Result<Vec<CacheKey>, CacheError> {
            self.inner.keys(name).await
        }
    }

    /// Serves whichever worker version was published last.
    pub(crate) struct FakeSource {
        current: StdMutex<Option<Arc<TestWorker>>>,
    }

    impl FakeSource {
        pub(crate) fn publish(&self, worker: TestWorker) {
            *self.current.lock().unwrap() = Some(Arc::new(worker));
        }
    }

    impl ScriptSource<TestWorker> for FakeSource {
        async fn fetch_script(&self, script_url: &Url) -> Result<Arc<TestWorker>, RegistrationError> {
            self.current
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| RegistrationError::ScriptFetch(script_url.to_string()))
        }
    }

    pub(crate) struct Harness {
        pub(crate) container: Arc<TestContainer>,
        pub(crate) events: mpsc::UnboundedReceiver<ServiceWorkerEvent>,
        pub(crate) network: Arc<FakeNetwork>,
        pub(crate) caches: TestStore,
    }

    impl Harness {
        pub(crate) fn new() -> Self {
            let _ = workflowhub_common::try_init_logging(
                workflowhub_common::LogConfig::debug().with_filter("workflowhub_sw=debug"),
            );
            let source = FakeSource {
                current: StdMutex::new(None),
            };
            let (container, events) = ServiceWorkerContainer::new(Url::parse(ORIGIN).unwrap(), source);
            Self {
                container: Arc::new(container),
                events,
                network: Arc::new(FakeNetwork::with_bootstrap()),
                caches: TestStore::default(),
            }
        }

        pub(crate) fn publish(&self, version: &str, skip_waiting: bool) {
            let config = Arc::new(config(version).as_ref().clone().with_skip_waiting(skip_waiting));
            self.container.source.publish(OfflineCacheWorker::new(
                config,
                Arc::clone(&self.network),
                self.caches.clone(),
            ));
        }

        pub(crate) fn drain(&mut self) -> Vec<ServiceWorkerEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }
    }

    fn controller_changes(events: &[ServiceWorkerEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, ServiceWorkerEvent::ControllerChange { .. }))
            .count()
    }

    #[test]
    fn test_default_scope() {
        let script = Url::parse("https://app.workflowhub.test/service-worker.js").unwrap();
        assert_eq!(default_scope(&script).as_str(), "https://app.workflowhub.test/");

        let nested = Url::parse("https://app.workflowhub.test/app/sw.js?v=2").unwrap();
        assert_eq!(default_scope(&nested).as_str(), "https://app.workflowhub.test/app/");
    }

    #[test]
    fn test_service_worker_state_transitions() {
        let url = Url::parse("https://app.workflowhub.test/service-worker.js").unwrap();
        let mut worker = ServiceWorker::new(url, "v1");
        assert_eq!(worker.state, ServiceWorkerState::Parsed);

        worker.set_state(ServiceWorkerState::Activated);
        assert!(worker.is_active());
        worker.set_state(ServiceWorkerState::Redundant);
        assert!(worker.is_redundant());
    }

    #[tokio::test]
    async fn test_first_register_installs_and_activates() {
        let mut h = Harness::new();
        h.publish("v1", true);

        let registration = h.container.register("/service-worker.js").await.unwrap();

        let active = registration.active().await.unwrap();
        assert_eq!(active.version, "v1");
        assert!(active.is_active());
        assert!(registration.waiting().await.is_none());
        assert_eq!(h.container.controller().await.unwrap().id, active.id);
        assert_eq!(h.caches.cache_names().await.unwrap(), vec!["workflowhub-v1"]);

        let events = h.drain();
        assert!(matches!(events[0], ServiceWorkerEvent::UpdateFound { .. }));
        assert_eq!(controller_changes(&events), 1);
    }

    #[tokio::test]
    async fn test_reregister_same_version_is_update_check() {
        let mut h = Harness::new();
        h.publish("v1", true);
        let first = h.container.register("/service-worker.js").await.unwrap();
        let active = first.active().await.unwrap();
        h.drain();

        let again = h.container.register("/service-worker.js").await.unwrap();
        assert_eq!(again.scope(), first.scope());
        assert_eq!(again.active().await.unwrap().id, active.id);
        assert_eq!(h.container.get_registrations().await.len(), 1);
        assert!(h.drain().is_empty());
        assert_eq!(first.update().await.unwrap(), UpdateCheck::NoUpdate);
    }

    #[tokio::test]
    async fn test_update_waits_until_skip_waiting_message() {
        let mut h = Harness::new();
        h.publish("v1", true);
        let registration = h.container.register("/service-worker.js").await.unwrap();
        let v1 = registration.active().await.unwrap();
        h.drain();

        h.publish("v2", false);
        let check = registration.update().await.unwrap();
        let UpdateCheck::Waiting(v2_id) = check else {
            panic!("expected waiting worker, got {check:?}");
        };
        assert_eq!(registration.active().await.unwrap().id, v1.id);
        assert_eq!(registration.waiting().await.unwrap().id, v2_id);
        assert_eq!(controller_changes(&h.drain()), 0);

        registration
            .post_message(v2_id, WorkerMessage::SkipWaiting)
            .await
            .unwrap();

        assert_eq!(registration.active().await.unwrap().id, v2_id);
        assert!(registration.waiting().await.is_none());
        assert_eq!(h.container.controller().await.unwrap().id, v2_id);
        assert_eq!(h.caches.cache_names().await.unwrap(), vec!["workflowhub-v2"]);

        let events = h.drain();
        assert!(events.contains(&ServiceWorkerEvent::StateChange {
            scope: registration.scope().to_string(),
            worker_id: v1.id,
            new_state: ServiceWorkerState::Redundant,
        }));
        assert_eq!(controller_changes(&events), 1);
    }

    #[tokio::test]
    async fn test_skip_waiting_on_install_activates_immediately() {
        let mut h = Harness::new();
        h.publish("v1", true);
        let registration = h.container.register("/service-worker.js").await.unwrap();
        h.drain();

        h.publish("v2", true);
        let check = registration.update().await.unwrap();
        assert!(matches!(check, UpdateCheck::Activated(_)));
        assert_eq!(registration.active().await.unwrap().version, "v2");
        assert_eq!(controller_changes(&h.drain()), 1);
    }

    #[tokio::test]
    async fn test_failed_install_keeps_previous_worker() {
        let mut h = Harness::new();
        h.publish("v1", true);
        let registration = h.container.register("/service-worker.js").await.unwrap();
        let v1 = registration.active().await.unwrap();
        h.drain();

        h.network.route("/manifest.json", 500, "oops");
        h.publish("v2", true);
        let result = registration.update().await;

        assert!(matches!(result, Err(RegistrationError::InstallFailed { .. })));
        assert_eq!(registration.active().await.unwrap().id, v1.id);
        assert!(registration.installing().await.is_none());
        assert!(registration.waiting().await.is_none());
        assert_eq!(h.container.controller().await.unwrap().id, v1.id);
        assert_eq!(controller_changes(&h.drain()), 0);
    }

    #[tokio::test]
    async fn test_post_message_to_unknown_worker() {
        let h = Harness::new();
        h.publish("v1", true);
        let registration = h.container.register("/service-worker.js").await.unwrap();
        let bogus = ServiceWorkerId::new();

        let result = registration.post_message(bogus, WorkerMessage::SkipWaiting).await;
        assert!(matches!(result, Err(RegistrationError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_post_raw_ignores_unknown_messages() {
        let h = Harness::new();
        h.publish("v1", true);
        let registration = h.container.register("/service-worker.js").await.unwrap();
        let active = registration.active().await.unwrap();

        h.container
            .post_raw(active.id, &serde_json::json!({ "type": "PING" }))
            .await
            .unwrap();
        assert_eq!(registration.active().await.unwrap().id, active.id);
    }

    #[tokio::test]
    async fn test_fetch_requires_active_controller() {
        let h = Harness::new();
        let url = Url::parse(ORIGIN).unwrap().join("/app.js").unwrap();
        h.network.route("/app.js", 200, "js");

        let before = h.container.fetch(Request::get(url.clone())).await.unwrap();
        assert!(matches!(before, FetchOutcome::PassThrough));

        h.publish("v1", true);
        h.container.register("/service-worker.js").await.unwrap();
        let after = h.container.fetch(Request::get(url)).await.unwrap();
        assert!(matches!(after, FetchOutcome::Respond(_)));
    }

    #[tokio::test]
    async fn test_register_rejects_cross_origin_script() {
        let h = Harness::new();
        h.publish("v1", true);
        let result = h
            .container
            .register("https://cdn.example.com/service-worker.js")
            .await;
        assert!(matches!(result, Err(RegistrationError::Security(_))));
    }

    #[tokio::test]
    async fn test_register_without_script_fails() {
        let h = Harness::new();
        let result = h.container.register("/service-worker.js").await;
        assert!(matches!(result, Err(RegistrationError::ScriptFetch(_))));
    }

    #[tokio::test]
    async fn test_unregister() {
        let h = Harness::new();
        h.publish("v1", true);
        let registration = h.container.register("/service-worker.js").await.unwrap();

        assert!(h.container.controller().await.is_some());

        assert!(h.container.unregister(registration.scope()).await);
        assert!(h.container.get_registrations().await.is_empty());
        assert!(h.container.controller().await.is_none());
        assert!(!h.container.unregister(registration.scope()).await);

        let url = Url::parse(ORIGIN).unwrap().join("/app.js").unwrap();
        let outcome = h.container.fetch(Request::get(url)).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::PassThrough));
    }

    #[tokio::test]
    async fn test_failed_activate_still_hands_over_controlled_page() {
        let mut h = Harness::new();
        h.publish("v1", true);
        let registration = h.container.register("/service-worker.js").await.unwrap();
        let v1 = registration.active().await.unwrap();
        h.drain();

        h.caches.break_listing();
        h.publish("v2", true);
        let check = registration.update().await.unwrap();
        let UpdateCheck::Activated(v2_id) = check else {
            panic!("expected activated worker, got {check:?}");
        };

        let controller = h.container.controller().await.unwrap();
        assert_eq!(controller.id, v2_id);
        assert!(controller.is_active());
        assert!(h.drain().contains(&ServiceWorkerEvent::ControllerChange {
            worker_id: v2_id,
            previous: Some(v1.id),
        }));

        let result = h
            .container
            .post_message(v1.id, WorkerMessage::SkipWaiting)
            .await;
        assert!(matches!(result, Err(RegistrationError::NotFound(_))));

        h.network.route("/app.js", 200, "js");
        let url = Url::parse(ORIGIN).unwrap().join("/app.js").unwrap();
        let outcome = h.container.fetch(Request::get(url)).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::Respond(_)));
    }

    #[tokio::test]
    async fn test_skip_waiting_sent_while_installing_is_kept() {
        let mut h = Harness::new();
        h.publish("v1", true);
        let registration = h.container.register("/service-worker.js").await.unwrap();
        h.drain();

        h.network.hold();
        h.publish("v2", false);
        let job = tokio::spawn({
            let registration = registration.clone();
            async move { registration.update().await }
        });

        let installing = loop {
            if let Some(worker) = registration.installing().await {
                break worker;
            }
            tokio::task::yield_now().await;
        };
        registration
            .post_message(installing.id, WorkerMessage::SkipWaiting)
            .await
            .unwrap();
        assert_eq!(registration.active().await.unwrap().version, "v1");

        h.network.release();
        let check = job.await.unwrap().unwrap();

        assert_eq!(check, UpdateCheck::Activated(installing.id));
        assert_eq!(registration.active().await.unwrap().id, installing.id);
        assert!(registration.waiting().await.is_none());
        assert_eq!(h.container.controller().await.unwrap().id, installing.id);
    }
}
