//! Connection Recovery Manager: graduated, prioritized cache recovery.
//!
//! After a connectivity event the cache may hold data that missed change
//! events. Recovery invalidates tracked queries in priority batches
//! (critical first), scoped by how serious the trigger was:
//!
//! | trigger              | strategy | priorities              |
//! |----------------------|----------|-------------------------|
//! | foreground resume    | LIGHT    | CRITICAL                |
//! | window focus         | LIGHT    | CRITICAL                |
//! | network reconnect    | FULL     | all                     |
//! | transport replaced   | FULL     | all                     |
//! | operator             | any      | per strategy            |
//!
//! A circuit breaker counts failed batches and short-circuits recovery
//! while the backend is known to be unhealthy.

mod breaker;

pub use breaker::{BreakerState, BreakerStatus, CircuitBreaker};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use agora_shared::{CacheError, CacheKey, GuardError, SyncError};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use rand::Rng;
use serde::Serialize;

use crate::cache::{KeyMatch, QueryCache, QueryPriority, QueryStatus, TrackedQuery};
use crate::clock::SharedClock;
use crate::config::{KeyTimeouts, SyncConfig};
use crate::connection::{StatusCause, StatusChange};
use crate::guard::{GuardOptions, OperationGuard};

/// How much of the cache a recovery touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryStrategy {
    Light,
    Partial,
    Full,
}

impl RecoveryStrategy {
    pub fn priorities(&self) -> &'static [QueryPriority] {
        match self {
            RecoveryStrategy::Light => &[QueryPriority::Critical],
            RecoveryStrategy::Partial => &[QueryPriority::Critical, QueryPriority::High],
            RecoveryStrategy::Full => &QueryPriority::ALL,
        }
    }

    pub fn includes(&self, priority: QueryPriority) -> bool {
        self.priorities().contains(&priority)
    }

    /// Strategy for an automatic trigger, if the cause warrants one.
    pub fn for_cause(cause: StatusCause) -> Option<Self> {
        match cause {
            StatusCause::Resumed | StatusCause::Focused => Some(RecoveryStrategy::Light),
            StatusCause::Reconnected | StatusCause::TransportReplaced => {
                Some(RecoveryStrategy::Full)
            }
            StatusCause::Connected
            | StatusCause::ConnectFailed
            | StatusCause::NetworkLost
            | StatusCause::Reconnecting
            | StatusCause::TransportLost => None,
        }
    }
}

/// Narrows `invalidate_with_strategy` to queries in a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    /// Queries with at least one observer.
    Active,
    Inactive,
    /// Queries whose last fetch failed.
    Errored,
}

impl StatusFilter {
    pub fn matches(&self, query: &TrackedQuery) -> bool {
        match self {
            StatusFilter::Active => query.is_active(),
            StatusFilter::Inactive => !query.is_active(),
            StatusFilter::Errored => query.status == QueryStatus::Error,
        }
    }
}

/// Outcome of one priority batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub priority: QueryPriority,
    pub success_count: usize,
    pub error_count: usize,
    /// Keys whose recovery was cancelled, e.g. when the app was suspended.
    /// They are retryable and say nothing about backend health.
    pub cancelled_count: usize,
    pub duration_ms: u64,
}

impl BatchResult {
    /// A batch fails when at least half of its settled keys failed.
    pub fn is_failure(&self) -> bool {
        self.error_count > 0 && self.error_count >= self.success_count
    }

    /// True when every key was cancelled before it settled.
    pub fn is_cancelled(&self) -> bool {
        self.success_count == 0 && self.error_count == 0 && self.cancelled_count > 0
    }
}

/// Accumulated recovery metrics. Reset only through `reset_metrics`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMetrics {
    pub total_batches: u64,
    pub total_success: u64,
    pub total_errors: u64,
    pub total_cancelled: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    /// Runs short-circuited by an open breaker.
    pub skipped_runs: u64,
    pub last_results: Vec<BatchResult>,
}

#[derive(Debug, Clone, Copy)]
enum BatchOp {
    Invalidate,
    Refetch,
}

pub struct RecoveryManager {
    cache: Arc<dyn QueryCache>,
    guard: OperationGuard,
    breaker: CircuitBreaker,
    clock: SharedClock,
    timeouts: KeyTimeouts,
    trigger_debounce: Duration,
    jitter: Duration,
    metrics: Mutex<BatchMetrics>,
    failed: Mutex<BTreeSet<CacheKey>>,
    last_automatic: Mutex<Option<Instant>>,
}

impl RecoveryManager {
    pub fn new(
        config: &SyncConfig,
        cache: Arc<dyn QueryCache>,
        guard: OperationGuard,
        clock: SharedClock,
    ) -> Self {
        Self {
            cache,
            guard,
            breaker: CircuitBreaker::new(
                config.breaker_threshold,
                config.breaker_cooldown,
                clock.clone(),
            ),
            clock,
            timeouts: config.key_timeouts(),
            trigger_debounce: config.trigger_debounce,
            jitter: config.recovery_jitter,
            metrics: Mutex::new(BatchMetrics::default()),
            failed: Mutex::new(BTreeSet::new()),
            last_automatic: Mutex::new(None),
        }
    }

    /// Operator-initiated recovery.
    pub async fn manual_recovery(&self, strategy: RecoveryStrategy) -> Vec<BatchResult> {
        crate::log_info!("recovery"; "manual {:?} recovery requested", strategy);
        self.invalidate_with_strategy(strategy, None).await
    }

    /// Invalidate every tracked query whose priority belongs to `strategy`,
    /// optionally narrowed by `filter`. Returns one result per batch that ran;
    /// empty when the breaker is open.
    pub async fn invalidate_with_strategy(
        &self,
        strategy: RecoveryStrategy,
        filter: Option<StatusFilter>,
    ) -> Vec<BatchResult> {
        let mut groups: BTreeMap<QueryPriority, Vec<CacheKey>> = BTreeMap::new();
        for query in self.cache.keys() {
            if filter.is_some_and(|f| !f.matches(&query)) {
                continue;
            }
            let priority = QueryPriority::of(&query.key);
            if strategy.includes(priority) {
                groups.entry(priority).or_default().push(query.key);
            }
        }
        self.run_batches(groups, BatchOp::Invalidate).await
    }

    /// React to a connection status change with the matching automatic
    /// recovery. Returns `None` when the change does not warrant one or a
    /// light trigger was absorbed by a recent recovery.
    pub async fn handle_status_change(&self, change: &StatusChange) -> Option<Vec<BatchResult>> {
        let strategy = RecoveryStrategy::for_cause(change.cause)?;

        {
            let now = self.clock.now();
            let mut last = self.lock_last();
            let recent = last.is_some_and(|at| now.saturating_duration_since(at) < self.trigger_debounce);
            if recent && strategy == RecoveryStrategy::Light {
                crate::log_debug!(
                    "recovery";
                    "{:?} trigger absorbed by a recovery started within {:?}",
                    change.cause,
                    self.trigger_debounce
                );
                return None;
            }
            *last = Some(now);
        }

        if !self.jitter.is_zero() {
            let max_ms = self.jitter.as_millis() as u64;
            let delay = Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms));
            tokio::time::sleep(delay).await;
        }

        crate::log_info!("recovery"; "{:?} recovery for {:?}", strategy, change.cause);
        Some(self.invalidate_with_strategy(strategy, None).await)
    }

    /// Refetch exactly the keys that failed in earlier runs. Never called
    /// automatically.
    pub async fn retry_failed_queries(&self) -> Vec<BatchResult> {
        let mut groups: BTreeMap<QueryPriority, Vec<CacheKey>> = BTreeMap::new();
        for key in self.failed_queries() {
            groups.entry(QueryPriority::of(&key)).or_default().push(key);
        }
        self.run_batches(groups, BatchOp::Refetch).await
    }

    pub fn failed_queries(&self) -> Vec<CacheKey> {
        self.lock_failed().iter().cloned().collect()
    }

    pub fn get_batch_metrics(&self) -> BatchMetrics {
        self.lock_metrics().clone()
    }

    pub fn reset_metrics(&self) {
        *self.lock_metrics() = BatchMetrics::default();
    }

    pub fn get_circuit_breaker_status(&self) -> BreakerStatus {
        self.breaker.status()
    }

    pub fn reset_circuit_breaker(&self) {
        crate::log_info!("recovery"; "circuit breaker reset by operator");
        self.breaker.reset();
    }

    async fn run_batches(
        &self,
        groups: BTreeMap<QueryPriority, Vec<CacheKey>>,
        op: BatchOp,
    ) -> Vec<BatchResult> {
        if let Err(err) = self.breaker.check() {
            self.record_skip(&err);
            return Vec::new();
        }

        let mut results = Vec::new();
        for (priority, batch) in groups {
            if batch.is_empty() {
                continue;
            }
            if let Err(err) = self.breaker.check() {
                self.record_skip(&err);
                break;
            }

            let started = tokio::time::Instant::now();
            let outcomes = join_all(batch.iter().map(|key| self.run_one(key, op))).await;

            let mut result = BatchResult {
                priority,
                success_count: 0,
                error_count: 0,
                cancelled_count: 0,
                duration_ms: 0,
            };
            {
                let mut failed = self.lock_failed();
                for (key, outcome) in batch.iter().zip(outcomes) {
                    match outcome {
                        Ok(()) => {
                            result.success_count += 1;
                            failed.remove(key);
                        }
                        Err(GuardError::Cancelled { reason, .. }) => {
                            crate::log_debug!("recovery"; "{} cancelled: {}", key, reason);
                            result.cancelled_count += 1;
                            failed.insert(key.clone());
                        }
                        Err(err) => {
                            crate::log_debug!("recovery"; "{} failed: {}", key, err);
                            result.error_count += 1;
                            failed.insert(key.clone());
                        }
                    }
                }
            }
            result.duration_ms = started.elapsed().as_millis() as u64;

            if result.is_failure() {
                crate::log_warn!(
                    "recovery";
                    "{:?} batch failed: {} of {} key(s) errored",
                    priority,
                    result.error_count,
                    batch.len()
                );
                self.breaker.record_failure();
            } else if result.is_cancelled() {
                crate::log_info!(
                    "recovery";
                    "{:?} batch cancelled, {} key(s) left for retry",
                    priority,
                    result.cancelled_count
                );
            } else {
                self.breaker.record_success();
            }

            {
                let mut metrics = self.lock_metrics();
                metrics.total_batches += 1;
                metrics.total_success += result.success_count as u64;
                metrics.total_errors += result.error_count as u64;
                metrics.total_cancelled += result.cancelled_count as u64;
            }
            results.push(result);
        }

        if !results.is_empty() {
            let mut metrics = self.lock_metrics();
            metrics.last_run_at = Some(Utc::now());
            metrics.last_results = results.clone();
        }
        results
    }

    async fn run_one(&self, key: &CacheKey, op: BatchOp) -> Result<(), GuardError<CacheError>> {
        let cache = self.cache.clone();
        let target = key.clone();
        self.guard
            .with_timeout(
                GuardOptions::keyed(format!("recovery:{}", key), self.timeouts.for_key(key)),
                move |_| async move {
                    match op {
                        BatchOp::Invalidate => cache.invalidate(&KeyMatch::Exact(target)).await,
                        BatchOp::Refetch => cache.refetch_active(&target).await,
                    }
                },
            )
            .await
    }

    fn record_skip(&self, err: &SyncError) {
        crate::log_warn!("recovery"; "recovery skipped: {}", err);
        self.lock_metrics().skipped_runs += 1;
    }

    fn lock_metrics(&self) -> MutexGuard<'_, BatchMetrics> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_failed(&self) -> MutexGuard<'_, BTreeSet<CacheKey>> {
        self.failed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_last(&self) -> MutexGuard<'_, Option<Instant>> {
        self.last_automatic.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
