//! Cooperative cancellation and deadlines for propagation runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::PropagationError;
use crate::node::UserId;

/// Shared cancellation flag with an optional deadline.
///
/// Clones share the flag, so any clone can cancel the run. The engine checks
/// the token between tiers and right before persisting.
#[derive(Debug, Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    started: Instant,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// A token that never times out.
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            started: Instant::now(),
            deadline: None,
        }
    }

    /// A token that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        let started = Instant::now();
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            started,
            deadline: Some(started + timeout),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fail if the run was cancelled or its deadline passed.
    pub fn check(&self, user: UserId) -> Result<(), PropagationError> {
        if self.is_cancelled() {
            return Err(PropagationError::Cancelled {
                user: user.to_string(),
            });
        }
        if let Some(deadline) = self.deadline {
            let now = Instant::now();
            if now >= deadline {
                return Err(PropagationError::TimedOut {
                    user: user.to_string(),
                    elapsed_ms: now.duration_since(self.started).as_millis(),
                });
            }
        }
        Ok(())
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
