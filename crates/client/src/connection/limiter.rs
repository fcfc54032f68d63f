//! Fixed-window limiter for transport recreation.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use agora_shared::SyncError;

use crate::clock::SharedClock;

/// Allows one acquisition per `min_interval`. Rejected calls are dropped,
/// not queued.
pub struct RecreateLimiter {
    min_interval: Duration,
    clock: SharedClock,
    last: Mutex<Option<Instant>>,
}

impl RecreateLimiter {
    pub fn new(min_interval: Duration, clock: SharedClock) -> Self {
        Self {
            min_interval,
            clock,
            last: Mutex::new(None),
        }
    }

    pub fn try_acquire(&self) -> Result<(), SyncError> {
        let now = self.clock.now();
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = *last {
            let elapsed = now.saturating_duration_since(previous);
            if elapsed < self.min_interval {
                return Err(SyncError::RecreateRateLimited {
                    retry_in: self.min_interval - elapsed,
                });
            }
        }
        *last = Some(now);
        Ok(())
    }

    /// Time until the next acquisition succeeds; zero when available now.
    pub fn remaining(&self) -> Duration {
        let last = *self.last.lock().unwrap_or_else(PoisonError::into_inner);
        match last {
            Some(previous) => self
                .min_interval
                .saturating_sub(self.clock.now().saturating_duration_since(previous)),
            None => Duration::ZERO,
        }
    }
}
