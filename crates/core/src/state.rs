//! Application lifecycle state machine.
//!
//! ```text
//! Created --start()--> Running --done + evaluate ok--> Finished --join()--> Joined
//! Created --start(): run() failed--> Failed
//! Running --poll/evaluate failed--> Failed
//! Created | Running --cancel()--> Cancelled
//! Joined/Cancelled/Failed -> ERROR (terminal, no further transitions)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

use crate::error::ControllerError;

/// Lifecycle state of a controlled application.
///
/// Each state owns a distinct bit so that several states can be tested
/// at once through a [`StateSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum AppState {
    /// Constructed, work not launched yet
    Created = 0b0000_0001,
    /// Work launched, monitor polling
    Running = 0b0000_0010,
    /// Work completed, results waiting to be joined
    Finished = 0b0000_0100,
    /// Results harvested by the caller
    Joined = 0b0000_1000,
    /// Aborted by the caller
    Cancelled = 0b0001_0000,
    /// Launch, poll or evaluation failed
    Failed = 0b0010_0000,
}

impl AppState {
    /// All states, in lifecycle order.
    pub const ALL: [AppState; 6] = [
        AppState::Created,
        AppState::Running,
        AppState::Finished,
        AppState::Joined,
        AppState::Cancelled,
        AppState::Failed,
    ];

    /// Bit representation.
    pub const fn bits(self) -> u8 {
        self as u8
    }

    /// Returns `true` once no further transition is possible.
    pub fn is_terminal(self) -> bool {
        StateSet::TERMINAL.contains(self)
    }

    /// Returns `true` once the work is no longer running.
    pub fn is_settled(self) -> bool {
        !matches!(self, AppState::Created | AppState::Running)
    }
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppState::Created => write!(f, "created"),
            AppState::Running => write!(f, "running"),
            AppState::Finished => write!(f, "finished"),
            AppState::Joined => write!(f, "joined"),
            AppState::Cancelled => write!(f, "cancelled"),
            AppState::Failed => write!(f, "failed"),
        }
    }
}

/// A set of [`AppState`]s, stored as a bit mask.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct StateSet(u8);

impl StateSet {
    /// No state at all.
    pub const EMPTY: StateSet = StateSet(0);

    /// Every state.
    pub const ANY: StateSet = StateSet(0b0011_1111);

    /// States after which nothing can change.
    pub const TERMINAL: StateSet = StateSet(
        AppState::Joined.bits() | AppState::Cancelled.bits() | AppState::Failed.bits(),
    );

    /// Set holding a single state.
    pub const fn only(state: AppState) -> Self {
        StateSet(state.bits())
    }

    /// Returns a copy with `state` added.
    pub const fn with(self, state: AppState) -> Self {
        StateSet(self.0 | state.bits())
    }

    /// Membership test.
    pub const fn contains(self, state: AppState) -> bool {
        self.0 & state.bits() != 0
    }

    /// Whether no state is present.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Raw mask.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Members in lifecycle order.
    pub fn iter(self) -> impl Iterator<Item = AppState> {
        AppState::ALL.into_iter().filter(move |s| self.contains(*s))
    }
}

impl From<AppState> for StateSet {
    fn from(state: AppState) -> Self {
        StateSet::only(state)
    }
}

impl BitOr for AppState {
    type Output = StateSet;

    fn bitor(self, rhs: AppState) -> StateSet {
        StateSet::only(self).with(rhs)
    }
}

impl BitOr<AppState> for StateSet {
    type Output = StateSet;

    fn bitor(self, rhs: AppState) -> StateSet {
        self.with(rhs)
    }
}

impl fmt::Debug for StateSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for StateSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.iter().map(|s| s.to_string()).collect();
        write!(f, "{}", names.join(" | "))
    }
}

/// Legal states for each public controller operation.
pub mod legal {
    use super::{AppState, StateSet};

    /// `start` launches the work exactly once.
    pub const START: StateSet = StateSet::only(AppState::Created);

    /// `join` waits for and harvests the outcome.
    pub const JOIN: StateSet = StateSet::only(AppState::Running)
        .with(AppState::Finished)
        .with(AppState::Failed);

    /// `cancel` aborts unsettled work.
    pub const CANCEL: StateSet = StateSet::only(AppState::Created).with(AppState::Running);
}

/// Guard: fail unless `current` is one of `allowed`.
///
/// Must be called while holding the lock that guards state mutation.
pub fn require_state(
    operation: &'static str,
    current: AppState,
    allowed: StateSet,
) -> Result<(), ControllerError> {
    if allowed.contains(current) {
        Ok(())
    } else {
        Err(ControllerError::InvalidState {
            operation,
            required: allowed,
            actual: current,
        })
    }
}

/// Validate a lifecycle transition.
pub fn validate_transition(from: AppState, to: AppState) -> Result<(), ControllerError> {
    let legal = match from {
        AppState::Created => {
            matches!(to, AppState::Running | AppState::Cancelled | AppState::Failed)
        }
        AppState::Running => {
            matches!(to, AppState::Finished | AppState::Cancelled | AppState::Failed)
        }
        AppState::Finished => to == AppState::Joined,
        AppState::Joined | AppState::Cancelled | AppState::Failed => false,
    };

    if legal {
        Ok(())
    } else {
        Err(ControllerError::InvalidTransition { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_are_distinct() {
        let mut seen = 0u8;
        for state in AppState::ALL {
            assert_eq!(seen & state.bits(), 0, "{state} shares a bit");
            seen |= state.bits();
        }
        assert_eq!(seen, StateSet::ANY.bits());
    }

    #[test]
    fn test_state_set_membership() {
        let set = AppState::Running | AppState::Finished;
        assert!(set.contains(AppState::Running));
        assert!(set.contains(AppState::Finished));
        assert!(!set.contains(AppState::Created));
        assert_eq!(set.iter().count(), 2);
        assert!(StateSet::EMPTY.is_empty());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!AppState::Created.is_terminal());
        assert!(!AppState::Running.is_terminal());
        assert!(!AppState::Finished.is_terminal());
        assert!(AppState::Joined.is_terminal());
        assert!(AppState::Cancelled.is_terminal());
        assert!(AppState::Failed.is_terminal());
    }

    #[test]
    fn test_require_state_rejects_with_details() {
        assert!(require_state("start", AppState::Created, legal::START).is_ok());

        match require_state("start", AppState::Running, legal::START) {
            Err(ControllerError::InvalidState {
                operation,
                required,
                actual,
            }) => {
                assert_eq!(operation, "start");
                assert_eq!(required, legal::START);
                assert_eq!(actual, AppState::Running);
            }
            other => panic!("Expected InvalidState, got: {:?}", other),
        }
    }

    #[test]
    fn test_valid_transitions() {
        assert!(validate_transition(AppState::Created, AppState::Running).is_ok());
        assert!(validate_transition(AppState::Created, AppState::Cancelled).is_ok());
        assert!(validate_transition(AppState::Created, AppState::Failed).is_ok());
        assert!(validate_transition(AppState::Running, AppState::Finished).is_ok());
        assert!(validate_transition(AppState::Running, AppState::Cancelled).is_ok());
        assert!(validate_transition(AppState::Running, AppState::Failed).is_ok());
        assert!(validate_transition(AppState::Finished, AppState::Joined).is_ok());
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(validate_transition(AppState::Created, AppState::Finished).is_err());
        assert!(validate_transition(AppState::Running, AppState::Running).is_err());
        assert!(validate_transition(AppState::Running, AppState::Joined).is_err());
        assert!(validate_transition(AppState::Finished, AppState::Cancelled).is_err());
    }

    #[test]
    fn test_terminal_states_reject_all_transitions() {
        for terminal in [AppState::Joined, AppState::Cancelled, AppState::Failed] {
            for target in AppState::ALL {
                assert!(
                    validate_transition(terminal, target).is_err(),
                    "Expected error for {:?} -> {:?}",
                    terminal,
                    target
                );
            }
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(AppState::Cancelled.to_string(), "cancelled");
        assert_eq!(legal::CANCEL.to_string(), "created | running");
        assert_eq!(
            serde_json::to_string(&AppState::Finished).unwrap(),
            "\"finished\""
        );
    }
}
