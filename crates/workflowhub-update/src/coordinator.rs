//! Page-side update coordinator.
//!
//! Watches the registration for a waiting worker, offers the update, and
//! drives the hand-off: skip-waiting to that worker, wait for the controller
//! to change, then reload exactly once. A controller swap the page did not
//! ask for (a worker that skips waiting on its own) reloads as well; the
//! first controller of an uncontrolled page does not.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use workflowhub_sw::{
    ContainerRegistration, RegistrationError, ScriptSource, ServiceWorkerEvent, ServiceWorkerId,
    ServiceWorkerState, UpdateCheck, WorkerMessage, WorkerScript,
};

use crate::state::{UpdateCommand, UpdateInput, UpdateState};
use crate::UpdateError;

/// The registration as the coordinator sees it.
pub trait RegistrationHandle: Send + Sync {
    /// Worker in the waiting slot.
    fn waiting(&self) -> impl Future<Output = Option<ServiceWorkerId>> + Send;

    /// Worker in the installing slot.
    fn installing(&self) -> impl Future<Output = Option<ServiceWorkerId>> + Send;

    /// Whether the page is already controlled.
    fn has_controller(&self) -> impl Future<Output = bool> + Send;

    /// Ask for an update check.
    fn update(&self) -> impl Future<Output = Result<UpdateCheck, RegistrationError>> + Send;

    /// Post a message to one worker instance.
    fn post_message(
        &self,
        worker: ServiceWorkerId,
        message: WorkerMessage,
    ) -> impl Future<Output = Result<(), RegistrationError>> + Send;
}

impl<R: RegistrationHandle> RegistrationHandle for Arc<R> {
    fn waiting(&self) -> impl Future<Output = Option<ServiceWorkerId>> + Send {
        (**self).waiting()
    }

    fn installing(&self) -> impl Future<Output = Option<ServiceWorkerId>> + Send {
        (**self).installing()
    }

    fn has_controller(&self) -> impl Future<Output = bool> + Send {
        (**self).has_controller()
    }

    fn update(&self) -> impl Future<Output = Result<UpdateCheck, RegistrationError>> + Send {
        (**self).update()
    }

    fn post_message(
        &self,
        worker: ServiceWorkerId,
        message: WorkerMessage,
    ) -> impl Future<Output = Result<(), RegistrationError>> + Send {
        (**self).post_message(worker, message)
    }
}

impl<S: WorkerScript, L: ScriptSource<S>> RegistrationHandle for ContainerRegistration<S, L> {
    async fn waiting(&self) -> Option<ServiceWorkerId> {
        ContainerRegistration::waiting(self).await.map(|w| w.id)
    }

    async fn installing(&self) -> Option<ServiceWorkerId> {
        ContainerRegistration::installing(self).await.map(|w| w.id)
    }

    async fn has_controller(&self) -> bool {
        ContainerRegistration::has_controller(self).await
    }

    async fn update(&self) -> Result<UpdateCheck, RegistrationError> {
        ContainerRegistration::update(self).await
    }

    async fn post_message(
        &self,
        worker: ServiceWorkerId,
        message: WorkerMessage,
    ) -> Result<(), RegistrationError> {
        ContainerRegistration::post_message(self, worker, message).await
    }
}

/// The page surface the coordinator drives.
pub trait PageHost: Send + Sync {
    fn show_prompt(&self);
    fn hide_prompt(&self);
    /// Full reload of the page.
    fn reload(&self);
}

impl<P: PageHost> PageHost for Arc<P> {
    fn show_prompt(&self) {
        (**self).show_prompt()
    }

    fn hide_prompt(&self) {
        (**self).hide_prompt()
    }

    fn reload(&self) {
        (**self).reload()
    }
}

/// The user's answer to the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    UpdateNow,
    Later,
}

/// Coordinates the hand-off between the current and a waiting worker.
pub struct UpdateCoordinator<R, P> {
    registration: R,
    page: P,
    state: UpdateState,
    installing: Option<ServiceWorkerId>,
}

impl<R: RegistrationHandle, P: PageHost> UpdateCoordinator<R, P> {
    pub fn new(registration: R, page: P) -> Self {
        Self {
            registration,
            page,
            state: UpdateState::Idle,
            installing: None,
        }
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    pub fn is_update_pending(&self) -> bool {
        self.state.is_update_pending()
    }

    pub fn registration(&self) -> &R {
        &self.registration
    }

    /// Look at the registration slots. Run at start-up and on every
    /// update-found event.
    pub async fn check_registration(&mut self) {
        self.installing = self.registration.installing().await;
        if let Some(worker) = self.registration.waiting().await {
            debug!(%worker, "Waiting worker found in registration");
            self.feed(UpdateInput::WaitingFound(worker));
        }
    }

    /// React to one registration event.
    pub async fn on_event(&mut self, event: ServiceWorkerEvent) {
        match event {
            ServiceWorkerEvent::UpdateFound { scope } => {
                debug!(scope = %scope, "Update found");
                self.check_registration().await;
            }
            ServiceWorkerEvent::StateChange {
                worker_id,
                new_state: ServiceWorkerState::Installed,
                ..
            } => {
                if self.installing.is_some_and(|id| id != worker_id) {
                    return;
                }
                self.installing = None;
                // First installs and already-promoted workers are not updates.
                if self.registration.has_controller().await
                    && self.registration.waiting().await == Some(worker_id)
                {
                    self.feed(UpdateInput::WaitingFound(worker_id));
                }
            }
            ServiceWorkerEvent::StateChange { .. } => {}
            ServiceWorkerEvent::ControllerChange { worker_id, previous } => {
                debug!(%worker_id, ?previous, "Controller changed");
                self.feed(UpdateInput::ControllerChanged {
                    replaced: previous.is_some(),
                });
            }
        }
    }

    /// The user chose "update now".
    pub async fn confirm(&mut self) -> Result<(), UpdateError> {
        for command in self.transition(UpdateInput::Confirm) {
            let UpdateCommand::PostSkipWaiting(worker) = command else {
                self.execute(command);
                continue;
            };
            info!(%worker, "Sending skip-waiting to waiting worker");
            if let Err(e) = self
                .registration
                .post_message(worker, WorkerMessage::SkipWaiting)
                .await
            {
                warn!(%worker, error = %e, "Skip-waiting signal failed");
                self.feed(UpdateInput::SignalFailed);
                return Err(UpdateError::Signal(e));
            }
        }
        Ok(())
    }

    /// The user chose "later".
    pub fn dismiss(&mut self) {
        self.feed(UpdateInput::Dismiss);
    }

    /// Consume registration events and user actions until the page reloads
    /// or the event channel closes. Returns the final state.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ServiceWorkerEvent>,
        mut actions: mpsc::UnboundedReceiver<UserAction>,
    ) -> UpdateState {
        self.check_registration().await;

        let mut actions_open = true;
        while self.state != UpdateState::Reloading {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.on_event(event).await,
                    None => break,
                },
                action = actions.recv(), if actions_open => match action {
                    Some(UserAction::UpdateNow) => {
                        if let Err(e) = self.confirm().await {
                            warn!(error = %e, "Update hand-off aborted");
                        }
                    }
                    Some(UserAction::Later) => self.dismiss(),
                    None => actions_open = false,
                },
            }
        }

        info!(state = self.state.name(), "Update coordinator stopped");
        self.state
    }

    fn feed(&mut self, input: UpdateInput) {
        for command in self.transition(input) {
            self.execute(command);
        }
        if matches!(self.state, UpdateState::WaitingDetected { .. }) {
            for command in self.transition(UpdateInput::Prompt) {
                self.execute(command);
            }
        }
    }

    fn transition(&mut self, input: UpdateInput) -> Vec<UpdateCommand> {
        let (next, commands) = self.state.step(input);
        if next != self.state {
            debug!(from = self.state.name(), to = next.name(), input = ?input, "Update state changed");
        }
        self.state = next;
        commands
    }

    fn execute(&self, command: UpdateCommand) {
        match command {
            UpdateCommand::ShowPrompt => self.page.show_prompt(),
            UpdateCommand::HidePrompt => self.page.hide_prompt(),
            UpdateCommand::Reload => {
                info!("Reloading under new controller");
                self.page.reload();
            }
            UpdateCommand::PostSkipWaiting(worker) => {
                // Only produced by Confirm, which goes through confirm().
                warn!(%worker, "Skip-waiting outside of confirm ignored");
            }
        }
    }
}
