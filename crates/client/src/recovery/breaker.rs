//! Circuit breaker guarding recovery batches.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use agora_shared::SyncError;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::SharedClock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    /// Batches run normally.
    Closed,
    /// Batches are skipped until the cooldown elapses.
    Open,
    /// One probe batch decides between closed and open.
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Operator view returned by `get_circuit_breaker_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStatus {
    pub state: BreakerState,
    pub failures: u32,
    pub threshold: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Time until an open breaker lets a probe through.
    pub retry_in_ms: u64,
}

struct BreakerInner {
    state: BreakerState,
    failures: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
}

pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    threshold: u32,
    cooldown: Duration,
    clock: SharedClock,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration, clock: SharedClock) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: 0,
                opened_at: None,
                last_failure_at: None,
            }),
            threshold: threshold.max(1),
            cooldown,
            clock,
        }
    }

    /// Current state. An open breaker whose cooldown has elapsed moves to
    /// half-open here.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.lock();
        self.advance(&mut inner);
        inner.state
    }

    /// `Ok` when a batch may run.
    pub fn check(&self) -> Result<(), SyncError> {
        let mut inner = self.lock();
        self.advance(&mut inner);
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => Err(SyncError::BreakerOpen {
                retry_in: self.retry_in(&inner),
            }),
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        self.advance(&mut inner);
        if inner.state != BreakerState::Closed {
            crate::log_info!("recovery"; "circuit breaker closed after successful batch");
        }
        inner.state = BreakerState::Closed;
        inner.failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        self.advance(&mut inner);
        inner.failures = inner.failures.saturating_add(1);
        inner.last_failure_at = Some(Utc::now());

        let trip = match inner.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => inner.failures >= self.threshold,
            BreakerState::Open => false,
        };
        if trip {
            crate::log_warn!(
                "recovery";
                "circuit breaker open after {} consecutive failed batch(es), cooling down for {:?}",
                inner.failures,
                self.cooldown
            );
            inner.state = BreakerState::Open;
            inner.opened_at = Some(self.clock.now());
        }
    }

    /// Force the breaker closed and clear its counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = BreakerState::Closed;
        inner.failures = 0;
        inner.opened_at = None;
        inner.last_failure_at = None;
    }

    pub fn status(&self) -> BreakerStatus {
        let mut inner = self.lock();
        self.advance(&mut inner);
        BreakerStatus {
            state: inner.state,
            failures: inner.failures,
            threshold: self.threshold,
            last_failure_at: inner.last_failure_at,
            retry_in_ms: self.retry_in(&inner).as_millis() as u64,
        }
    }

    fn advance(&self, inner: &mut BreakerInner) {
        if inner.state != BreakerState::Open {
            return;
        }
        if let Some(opened_at) = inner.opened_at {
            if self.clock.now().saturating_duration_since(opened_at) >= self.cooldown {
                crate::log_info!("recovery"; "circuit breaker half-open, next batch is a probe");
                inner.state = BreakerState::HalfOpen;
            }
        }
    }

    fn retry_in(&self, inner: &BreakerInner) -> Duration {
        match (inner.state, inner.opened_at) {
            (BreakerState::Open, Some(opened_at)) => self
                .cooldown
                .saturating_sub(self.clock.now().saturating_duration_since(opened_at)),
            _ => Duration::ZERO,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
