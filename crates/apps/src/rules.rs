//! Courtesy rules for remote services.
//!
//! Public web services usually ask clients to keep a minimum distance
//! between requests. A [`RuleGuard`] tracks the last request and decides
//! what happens when the next one would come too early.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use crate::web::WebAppError;

/// What to do when a request would break the spacing rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RulePolicy {
    /// Sleep until the request is allowed
    #[default]
    Wait,
    /// Log a warning and send anyway
    Warn,
    /// Refuse with [`WebAppError::RuleViolation`]
    Reject,
}

/// Enforces a minimum spacing between requests.
#[derive(Debug, Clone)]
pub struct RuleGuard {
    min_spacing: Duration,
    policy: RulePolicy,
    last_request: Option<Instant>,
}

impl RuleGuard {
    /// Require `min_spacing` between two requests.
    pub fn new(min_spacing: Duration) -> Self {
        Self {
            min_spacing,
            policy: RulePolicy::default(),
            last_request: None,
        }
    }

    /// A guard that never delays anything.
    pub fn unrestricted() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Set the policy.
    pub fn with_policy(mut self, policy: RulePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Time still owed before the next request is allowed.
    pub fn check(&self) -> Duration {
        match self.last_request {
            Some(last) => self.min_spacing.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// Clear the way for one request, according to the policy.
    pub async fn acquire(&mut self) -> Result<(), WebAppError> {
        let owed = self.check();
        if !owed.is_zero() {
            match self.policy {
                RulePolicy::Wait => tokio::time::sleep(owed).await,
                RulePolicy::Warn => {
                    warn!("Request sent {:?} earlier than the service allows", owed)
                }
                RulePolicy::Reject => return Err(WebAppError::RuleViolation(owed)),
            }
        }
        self.last_request = Some(Instant::now());
        Ok(())
    }
}

impl Default for RuleGuard {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}
