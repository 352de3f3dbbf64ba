//! Runtime configuration.

use crate::scene::TurnPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry and deadline policy for backend invocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,

    /// Delay before the second attempt, in milliseconds.
    pub base_backoff_ms: u64,

    /// Upper bound on any single backoff delay, in milliseconds.
    pub max_backoff_ms: u64,

    /// Deadline for each backend invocation, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 200,
            max_backoff_ms: 5_000,
            timeout_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no delay between tries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff_ms = base.as_millis() as u64;
        self.max_backoff_ms = max.as_millis() as u64;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delay after failed attempt `attempt` (1-based): base doubled per
    /// attempt, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }

    /// Attempts actually made; a zero setting still makes one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Configuration for a [`StorySession`](crate::StorySession).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum memory entries handed to the backend per invocation.
    pub memory_window: usize,

    /// Retry and deadline policy for backend calls.
    pub retry: RetryPolicy,

    /// Turn policy for scenes opened without an explicit one.
    pub turn_policy: TurnPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            memory_window: 20,
            retry: RetryPolicy::default(),
            turn_policy: TurnPolicy::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the memory window size.
    pub fn with_memory_window(mut self, entries: usize) -> Self {
        self.memory_window = entries;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the default turn policy for new scenes.
    pub fn with_turn_policy(mut self, policy: TurnPolicy) -> Self {
        self.turn_policy = policy;
        self
    }
}
