//! Poll cadence helpers for [`Application::wait_interval`](crate::Application::wait_interval).

use std::time::Duration;

/// Geometric backoff for completion polling.
///
/// Short jobs get noticed quickly; long remote jobs are not hammered.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    factor: f64,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Start at `initial`, multiply by `factor` after every poll, never
    /// exceed `max`.
    pub fn new(initial: Duration, factor: f64, max: Duration) -> Self {
        let factor = if factor.is_finite() && factor >= 1.0 {
            factor
        } else {
            1.0
        };
        let initial = initial.min(max);
        Self {
            initial,
            factor,
            max,
            current: initial,
        }
    }

    /// Constant interval.
    pub fn fixed(interval: Duration) -> Self {
        Self::new(interval, 1.0, interval)
    }

    /// Return the interval to wait now and advance.
    pub fn next(&mut self) -> Duration {
        let now = self.current;
        let grown = self.current.as_secs_f64() * self.factor;
        // Out of range once the product passes `Duration::MAX`.
        self.current = Duration::try_from_secs_f64(grown)
            .map_or(self.max, |grown| grown.min(self.max));
        now
    }

    /// Restart from the initial interval.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), 1.5, Duration::from_secs(5))
    }
}
