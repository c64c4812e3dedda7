//! Controller error types.

use std::time::Duration;

use crate::state::{AppState, StateSet};

/// Result type for controller operations.
pub type Result<T> = std::result::Result<T, ControllerError>;

/// Errors returned by [`Controller`](crate::Controller) operations.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// Operation invoked outside its legal states; nothing was changed
    #[error("`{operation}` requires state {required}, but the application is {actual}")]
    InvalidState {
        /// Rejected operation
        operation: &'static str,
        /// States in which it is legal
        required: StateSet,
        /// State it was called in
        actual: AppState,
    },

    /// Internal transition rejected by the state table
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        /// Current state
        from: AppState,
        /// Requested state
        to: AppState,
    },

    /// `join` gave up waiting; the application is still running
    #[error("Application did not finish within {0:?}")]
    Timeout(Duration),

    /// The launch hook failed
    #[error("Failed to launch application: {0:#}")]
    Launch(#[source] anyhow::Error),

    /// The completion check failed
    #[error("Failed to poll application: {0:#}")]
    Poll(#[source] anyhow::Error),

    /// Results could not be harvested
    #[error("Failed to evaluate application results: {0:#}")]
    Evaluation(#[source] anyhow::Error),

    /// The monitor task died without settling the application
    #[error("Application monitor panicked: {0}")]
    MonitorPanicked(String),
}

impl ControllerError {
    /// Whether the application is still usable after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::InvalidState { .. } | Self::Timeout(_))
    }
}
