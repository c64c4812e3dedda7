//! Controller configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a [`Controller`](crate::Controller).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Timeout applied when `join` is called without one (None = wait forever)
    pub default_join_timeout: Option<Duration>,
    /// Cancel the application when a join times out
    pub cancel_on_timeout: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            default_join_timeout: None,
            cancel_on_timeout: false,
        }
    }
}

impl ControllerConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default join timeout.
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.default_join_timeout = Some(timeout);
        self
    }

    /// Cancel the application when a join times out.
    pub fn cancel_on_timeout(mut self, cancel: bool) -> Self {
        self.cancel_on_timeout = cancel;
        self
    }
}
