//! Module lifecycle states and module kinds.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a registered module.
///
/// `Unregistered -> Registered -> Running <-> Paused -> Stopped`. A stopped
/// module may be started again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Unregistered,
    Registered,
    Running,
    Paused,
    Stopped,
}

impl LifecycleState {
    /// Whether `self -> next` is an allowed transition.
    #[must_use]
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Unregistered, Registered)
                | (Registered, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Stopped, Running)
                | (Registered | Running | Paused, Stopped)
                | (_, Unregistered)
        )
    }

    /// Checked transition.
    pub fn transition(self, next: LifecycleState) -> crate::Result<LifecycleState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(crate::Error::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unregistered => "unregistered",
            Self::Registered => "registered",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a module consumes dispatched requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    /// Handler returns a response; the dispatcher stamps and sends it.
    #[default]
    RequestResponse,
    /// Module receives the raw request together with the connection and
    /// replies on its own.
    TransportOwning,
}

impl ModuleKind {
    /// Decodes the value returned by a guest's `mx_kind` export.
    #[must_use]
    pub fn from_abi(value: i32) -> Self {
        if value == 1 {
            Self::TransportOwning
        } else {
            Self::RequestResponse
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_and_paused_toggle() {
        assert!(LifecycleState::Running.can_transition_to(LifecycleState::Paused));
        assert!(LifecycleState::Paused.can_transition_to(LifecycleState::Running));
    }

    #[test]
    fn cannot_pause_registered_module() {
        let err = LifecycleState::Registered
            .transition(LifecycleState::Paused)
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid lifecycle transition: registered -> paused");
    }

    #[test]
    fn stopped_module_can_restart() {
        assert_eq!(
            LifecycleState::Stopped.transition(LifecycleState::Running).unwrap(),
            LifecycleState::Running
        );
    }

    #[test]
    fn kind_from_abi() {
        assert_eq!(ModuleKind::from_abi(0), ModuleKind::RequestResponse);
        assert_eq!(ModuleKind::from_abi(1), ModuleKind::TransportOwning);
        assert_eq!(ModuleKind::from_abi(7), ModuleKind::RequestResponse);
    }
}
