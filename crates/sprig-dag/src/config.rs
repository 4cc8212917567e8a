use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::DagResult;

/// Configuration for a [`TableGraphStore`](crate::TableGraphStore).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphStoreConfig {
    /// How long an operation waits for the table and log locks before failing with
    /// `StoreBusy`.
    pub busy_timeout_ms: u64,
    /// Sleep between lock attempts while waiting.
    pub busy_poll_interval_ms: u64,
    /// `fsync` the node log after every appended record.
    pub sync_on_commit: bool,
}

impl Default for GraphStoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            busy_poll_interval_ms: 2,
            sync_on_commit: true,
        }
    }
}

impl GraphStoreConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn busy_poll_interval(&self) -> Duration {
        Duration::from_millis(self.busy_poll_interval_ms)
    }
}

/// Caller-side retry with exponential backoff for retryable errors.
///
/// Only errors for which [`DagError::is_retryable`] holds are retried;
/// everything else is returned on the first occurrence.
///
/// [`DagError::is_retryable`]: crate::DagError::is_retryable
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first. `0` behaves like `1`.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 10,
            max_delay_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the retry following failed attempt number `attempt`
    /// (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Run `op`, retrying while it fails with a retryable error.
    pub fn run<T>(&self, mut op: impl FnMut() -> DagResult<T>) -> DagResult<T> {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying busy graph operation");
                    thread::sleep(delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
