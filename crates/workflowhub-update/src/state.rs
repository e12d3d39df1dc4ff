//! The update hand-off state machine.
//!
//! ```text
//!            WaitingFound            (immediate)
//!   Idle ─────────────────► WaitingDetected ───────► Prompted
//!    ▲                                                 │   │
//!    │               Dismiss                           │   │ Confirm
//!    └─────────────────────────────────────────────────┘   ▼
//!                                                       Updating
//!                                                          │ ControllerChanged
//!                                                          ▼
//!                                                      Reloading
//! ```
//!
//! A controller change that replaces an existing controller reloads from
//! any non-terminal state, since the page's assets may now come from a
//! different cache. Taking control of a previously uncontrolled page does
//! not reload.
//!
//! Pure: [`UpdateState::step`] returns the next state and the commands for
//! the coordinator to carry out. Reloading is terminal.

use serde::Serialize;
use workflowhub_sw::ServiceWorkerId;

/// Where the page is in the update hand-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum UpdateState {
    /// Nothing pending.
    #[default]
    Idle,
    /// A waiting worker was found and the prompt is about to be shown.
    WaitingDetected { worker: ServiceWorkerId },
    /// The user is being offered "update now" or "later".
    Prompted { worker: ServiceWorkerId },
    /// Skip-waiting was sent; waiting for the controller to change.
    Updating { worker: ServiceWorkerId },
    /// The page is reloading under the new controller.
    Reloading,
}

/// Something the coordinator observed or the user did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateInput {
    /// A worker sits in the waiting slot.
    WaitingFound(ServiceWorkerId),
    /// Advance from detection to the prompt.
    Prompt,
    /// The user chose "update now".
    Confirm,
    /// The user chose "later".
    Dismiss,
    /// The page's controller changed. `replaced` is false when the page had
    /// no controller before.
    ControllerChanged { replaced: bool },
    /// The skip-waiting signal could not be delivered.
    SignalFailed,
}

/// Side effects requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateCommand {
    ShowPrompt,
    HidePrompt,
    PostSkipWaiting(ServiceWorkerId),
    Reload,
}

impl UpdateState {
    /// Apply one input.
    pub fn step(self, input: UpdateInput) -> (UpdateState, Vec<UpdateCommand>) {
        use UpdateCommand::*;
        use UpdateInput::*;
        use UpdateState::*;

        match (self, input) {
            (Idle, WaitingFound(worker)) => (WaitingDetected { worker }, vec![]),
            // A newer waiting worker replaces the one being offered.
            (WaitingDetected { .. }, WaitingFound(worker)) => (WaitingDetected { worker }, vec![]),
            (Prompted { .. }, WaitingFound(worker)) => (Prompted { worker }, vec![]),
            (WaitingDetected { worker }, Prompt) => (Prompted { worker }, vec![ShowPrompt]),
            (Prompted { worker }, Confirm) => {
                (Updating { worker }, vec![HidePrompt, PostSkipWaiting(worker)])
            }
            (Prompted { .. }, Dismiss) => (Idle, vec![HidePrompt]),
            (Updating { .. }, ControllerChanged { .. }) => (Reloading, vec![Reload]),
            (Idle | WaitingDetected { .. }, ControllerChanged { replaced: true }) => {
                (Reloading, vec![Reload])
            }
            (Prompted { .. }, ControllerChanged { replaced: true }) => {
                (Reloading, vec![HidePrompt, Reload])
            }
            (WaitingDetected { .. }, ControllerChanged { replaced: false }) => (Idle, vec![]),
            (Prompted { .. }, ControllerChanged { replaced: false }) => (Idle, vec![HidePrompt]),
            (Updating { .. }, SignalFailed) => (Idle, vec![]),
            (state, _) => (state, vec![]),
        }
    }

    /// True while a waiting worker is known and not yet promoted.
    pub fn is_update_pending(&self) -> bool {
        matches!(self, UpdateState::WaitingDetected { .. } | UpdateState::Prompted { .. })
    }

    /// The worker this state refers to, if any.
    pub fn worker(&self) -> Option<ServiceWorkerId> {
        match self {
            UpdateState::WaitingDetected { worker }
            | UpdateState::Prompted { worker }
            | UpdateState::Updating { worker } => Some(*worker),
            UpdateState::Idle | UpdateState::Reloading => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            UpdateState::Idle => "idle",
            UpdateState::WaitingDetected { .. } => "waiting_detected",
            UpdateState::Prompted { .. } => "prompted",
            UpdateState::Updating { .. } => "updating",
            UpdateState::Reloading => "reloading",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use UpdateCommand::*;
    use UpdateInput::*;

    fn prompted(worker: ServiceWorkerId) -> UpdateState {
        let (state, _) = UpdateState::Idle.step(WaitingFound(worker));
        let (state, commands) = state.step(Prompt);
        assert_eq!(commands, vec![ShowPrompt]);
        state
    }

    #[test]
    fn test_waiting_found_is_detected_then_prompted() {
        let worker = ServiceWorkerId::new();
        let (state, commands) = UpdateState::Idle.step(WaitingFound(worker));
        assert_eq!(state, UpdateState::WaitingDetected { worker });
        assert!(commands.is_empty());
        assert!(state.is_update_pending());

        let (state, commands) = state.step(Prompt);
        assert_eq!(state, UpdateState::Prompted { worker });
        assert_eq!(commands, vec![ShowPrompt]);
    }

    #[test]
    fn test_confirm_signals_the_waiting_worker() {
        let worker = ServiceWorkerId::new();
        let (state, commands) = prompted(worker).step(Confirm);
        assert_eq!(state, UpdateState::Updating { worker });
        assert_eq!(commands, vec![HidePrompt, PostSkipWaiting(worker)]);
        assert!(!state.is_update_pending());
    }

    #[test]
    fn test_reload_only_after_controller_change() {
        let worker = ServiceWorkerId::new();
        let (updating, _) = prompted(worker).step(Confirm);

        for input in [Confirm, Dismiss, Prompt, WaitingFound(ServiceWorkerId::new())] {
            let (state, commands) = updating.step(input);
            assert_eq!(state, updating);
            assert!(!commands.contains(&Reload));
        }

        let (state, commands) = updating.step(ControllerChanged { replaced: true });
        assert_eq!(state, UpdateState::Reloading);
        assert_eq!(commands, vec![Reload]);

        let (state, commands) = state.step(ControllerChanged { replaced: true });
        assert_eq!(state, UpdateState::Reloading);
        assert!(commands.is_empty(), "reloaded twice");
    }

    #[test]
    fn test_dismiss_clears_pending_without_signal() {
        let (state, commands) = prompted(ServiceWorkerId::new()).step(Dismiss);
        assert_eq!(state, UpdateState::Idle);
        assert_eq!(commands, vec![HidePrompt]);
        assert!(!state.is_update_pending());
    }

    #[test]
    fn test_replaced_controller_reloads_from_any_state() {
        let worker = ServiceWorkerId::new();
        for state in [
            UpdateState::Idle,
            UpdateState::WaitingDetected { worker },
            prompted(worker),
        ] {
            let (next, commands) = state.step(ControllerChanged { replaced: true });
            assert_eq!(next, UpdateState::Reloading);
            assert_eq!(commands.iter().filter(|c| **c == Reload).count(), 1);
        }

        let (_, commands) = prompted(worker).step(ControllerChanged { replaced: true });
        assert_eq!(commands, vec![HidePrompt, Reload]);
    }

    #[test]
    fn test_first_controller_never_reloads() {
        let worker = ServiceWorkerId::new();
        for state in [
            UpdateState::Idle,
            UpdateState::WaitingDetected { worker },
            prompted(worker),
        ] {
            let (next, commands) = state.step(ControllerChanged { replaced: false });
            assert_eq!(next, UpdateState::Idle);
            assert!(!commands.contains(&Reload));
        }
    }

    #[test]
    fn test_signal_failure_returns_to_idle() {
        let (updating, _) = prompted(ServiceWorkerId::new()).step(Confirm);
        let (state, commands) = updating.step(SignalFailed);
        assert_eq!(state, UpdateState::Idle);
        assert!(commands.is_empty());
    }

    #[test]
    fn test_newer_waiting_worker_replaces_prompted_one() {
        let first = ServiceWorkerId::new();
        let second = ServiceWorkerId::new();
        let (state, commands) = prompted(first).step(WaitingFound(second));
        assert_eq!(state.worker(), Some(second));
        assert!(commands.is_empty());
    }

    #[test]
    fn test_state_serializes_with_name() {
        let worker = ServiceWorkerId::new();
        let json = serde_json::to_value(UpdateState::Prompted { worker }).unwrap();
        assert_eq!(json["state"], "prompted");
        assert_eq!(json["worker"], worker.raw());
        assert_eq!(UpdateState::Idle.name(), "idle");
    }
}
