//! The unit-of-work contract driven by a [`Controller`](crate::Controller).

use async_trait::async_trait;
use std::time::Duration;

/// An external computation (local process, remote job, ...) that can be
/// launched, polled for completion and harvested.
///
/// Implementations are handed to a [`Controller`](crate::Controller), which
/// calls the hooks in lifecycle order:
///
/// ```text
/// run() → (wait_interval(), is_finished())* → evaluate() → clean_up()
/// ```
///
/// `clean_up()` also runs on cancellation and on any failure. The controller
/// never calls two hooks concurrently.
#[async_trait]
pub trait Application: Send + 'static {
    /// Harvested results.
    type Output: Send + 'static;

    /// Launch the computation. Called once.
    async fn run(&mut self) -> Result<(), anyhow::Error>;

    /// Non-blocking completion check. Called repeatedly until it returns
    /// `true`; an error settles the application as failed.
    async fn is_finished(&mut self) -> Result<bool, anyhow::Error>;

    /// Delay before the next completion check.
    fn wait_interval(&mut self) -> Duration;

    /// Validate and materialize the results. Called once, after the first
    /// successful `is_finished()`.
    async fn evaluate(&mut self) -> Result<Self::Output, anyhow::Error>;

    /// Release external resources (kill a process, close a connection).
    async fn clean_up(&mut self) {}

    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}
