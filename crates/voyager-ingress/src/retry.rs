//! Per-ingress exponential backoff for retryable reconciliation errors

use std::time::Duration;

use dashmap::DashMap;
use kube::runtime::controller::Action;

use crate::compiler::ObjectKey;

/// Delay before the first retry
pub const BASE_DELAY: Duration = Duration::from_secs(5);
/// Upper bound for any single delay
pub const MAX_DELAY: Duration = Duration::from_secs(600);
/// Retries before the controller waits for a change instead
pub const MAX_ATTEMPTS: u32 = 12;

/// Tracks consecutive failures per ingress
#[derive(Debug, Default)]
pub struct RetryTracker {
    attempts: DashMap<ObjectKey, u32>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure and decide when to try again.
    ///
    /// Once [`MAX_ATTEMPTS`] is exceeded the counter is dropped and the
    /// ingress waits for the next watch event, which starts a fresh schedule.
    pub fn next_action(&self, key: &ObjectKey) -> Action {
        let attempt = {
            let mut entry = self.attempts.entry(key.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        if attempt > MAX_ATTEMPTS {
            self.attempts.remove(key);
            return Action::await_change();
        }
        Action::requeue(backoff(attempt))
    }

    /// Clear the failure count after a successful pass
    pub fn reset(&self, key: &ObjectKey) {
        self.attempts.remove(key);
    }

    pub fn attempts(&self, key: &ObjectKey) -> u32 {
        self.attempts.get(key).map(|a| *a).unwrap_or(0)
    }
}

/// Delay for the `attempt`-th consecutive failure (1-based)
pub fn backoff(attempt: u32) -> Duration {
    let doublings = attempt.saturating_sub(1).min(16);
    BASE_DELAY
        .checked_mul(1 << doublings)
        .map_or(MAX_DELAY, |d| d.min(MAX_DELAY))
}
