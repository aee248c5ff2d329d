//! Retry policy for queued jobs

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay, in seconds, before a failed job becomes available again
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 1;

/// How many attempts a job gets and what happens once they run out.
///
/// A policy is configuration, not per-attempt state: the attempt count lives
/// on the queue handle. All setters consume and return the policy so they can
/// be chained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempt ceiling, 0 means unlimited
    pub max_tries: u32,
    /// Advisory wall-clock limit for the worker supervisor, 0 means unlimited
    pub timeout_secs: u64,
    /// Drop the job quietly once the ceiling is reached
    pub ignore_max_attempts_exceeded: bool,
    /// Fixed delay handed to `release`
    pub retry_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_tries: 0,
            timeout_secs: 0,
            ignore_max_attempts_exceeded: false,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries;
        self
    }

    /// Not enforced here; the process supervisor reads it.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_ignore_max_attempts_exceeded(mut self, ignore: bool) -> Self {
        self.ignore_max_attempts_exceeded = ignore;
        self
    }

    pub fn with_retry_delay(mut self, secs: u64) -> Self {
        self.retry_delay_secs = secs;
        self
    }

    /// Advisory timeout, `None` when unlimited
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    /// Seconds to wait before the next attempt. Constant regardless of how
    /// many attempts have been made.
    pub fn retry_delay(&self) -> u64 {
        self.retry_delay_secs
    }

    /// True once `attempts` has reached a non-zero `limit`.
    pub fn ceiling_reached(attempts: u32, limit: u32) -> bool {
        limit > 0 && attempts >= limit
    }
}
