//! Bounded exponential backoff for transient graph store failures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::GraphError;
use crate::graph::GraphResult;

/// Retry schedule for [`GraphError::Unavailable`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry; doubled on every further retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for a single delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    4
}
fn default_base_delay_ms() -> u64 {
    50
}
fn default_max_delay_ms() -> u64 {
    2_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// A policy that retries immediately; used in tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry.saturating_sub(1)).unwrap_or(u64::MAX);
        let ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Run `op`, retrying transient graph failures with exponential backoff.
    ///
    /// Non-transient errors are returned immediately. After the last attempt
    /// the final transient error is returned to the caller.
    pub fn run<T>(&self, what: &str, mut op: impl FnMut() -> GraphResult<T>) -> GraphResult<T> {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        op = what,
                        attempt,
                        wait_ms = delay.as_millis() as u64,
                        error = %e,
                        "graph store unavailable, retrying after backoff"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        tracing::error!(op = what, attempts, error = %e, "graph store retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unavailable() -> GraphError {
        GraphError::Unavailable {
            message: "connection refused".into(),
        }
    }

    #[test]
    fn delays_double_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 500,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(80), Duration::from_millis(500));
    }

    #[test]
    fn recovers_after_transient_failures() {
        let mut calls = 0;
        let result = RetryPolicy::immediate(3).run("test", || {
            calls += 1;
            if calls < 3 { Err(unavailable()) } else { Ok(calls) }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let mut calls = 0;
        let result: GraphResult<()> = RetryPolicy::immediate(4).run("test", || {
            calls += 1;
            Err(unavailable())
        });
        assert!(matches!(result, Err(GraphError::Unavailable { .. })));
        assert_eq!(calls, 4);
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let mut calls = 0;
        let result: GraphResult<()> = RetryPolicy::immediate(4).run("test", || {
            calls += 1;
            Err(GraphError::NodeNotFound { node_id: 1 })
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
