//! Operation Guard: timeout, cooperative cancellation and key-based
//! deduplication for asynchronous operations.
//!
//! ```rust,ignore
//! let guard = OperationGuard::new(Duration::from_secs(5));
//! let profile = guard
//!     .with_timeout(GuardOptions::keyed("profile:me", Duration::from_secs(3)), |signal| {
//!         async move { backend.fetch_profile(signal).await }
//!     })
//!     .await?;
//! ```
//!
//! Keyed operations run on a spawned task and are registered until they
//! settle. Concurrent callers with the same key await the same outcome.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use agora_shared::GuardError;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const DEFAULT_CANCEL_REASON: &str = "cancelled by caller";

/// Per-call options.
#[derive(Debug, Clone)]
pub struct GuardOptions {
    pub timeout: Duration,
    pub key: Option<String>,
    pub on_timeout_message: Option<String>,
}

impl GuardOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            key: None,
            on_timeout_message: None,
        }
    }

    pub fn keyed(key: impl Into<String>, timeout: Duration) -> Self {
        Self {
            timeout,
            key: Some(key.into()),
            on_timeout_message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.on_timeout_message = Some(message.into());
        self
    }
}

impl Default for GuardOptions {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

/// Cancellation token handed to every guarded operation.
///
/// Cancellation is cooperative: the guard stops waiting as soon as the
/// signal fires, while the operation may poll [`CancelSignal::is_cancelled`]
/// or await [`CancelSignal::cancelled`] to stop its own work early.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<String>>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. The first reason wins.
    pub fn cancel(&self, reason: impl Into<String>) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(reason.into());
            }
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn reason(&self) -> Option<String> {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

type SharedOutcome<T, E> = Shared<BoxFuture<'static, Result<T, GuardError<E>>>>;

enum Plan<T, E> {
    Await(SharedOutcome<T, E>),
    Unshared(BoxFuture<'static, Result<T, GuardError<E>>>),
}

struct PendingEntry {
    id: u64,
    signal: CancelSignal,
    started_at: Instant,
    /// `SharedOutcome<T, E>` for the entry's result type.
    outcome: Box<dyn Any + Send + Sync>,
}

/// Debug view of one pending operation.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PendingOperation {
    pub key: String,
    pub age_ms: u64,
}

struct GuardInner {
    pending: Mutex<HashMap<String, PendingEntry>>,
    next_id: AtomicU64,
    default_timeout: Duration,
}

/// Registry of in-flight keyed operations. Cheap to clone.
#[derive(Clone)]
pub struct OperationGuard {
    inner: Arc<GuardInner>,
}

impl OperationGuard {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(GuardInner {
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                default_timeout,
            }),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    /// Options with this guard's default timeout.
    pub fn options(&self) -> GuardOptions {
        GuardOptions::new(self.inner.default_timeout)
    }

    /// Run `operation` under a timeout, deduplicating by key when one is set.
    ///
    /// Without a key the operation races a timer and nothing is registered.
    /// With a key, a caller arriving while an operation with that key is
    /// pending receives the same outcome instead of starting new work.
    pub async fn with_timeout<T, E, F, Fut>(
        &self,
        options: GuardOptions,
        operation: F,
    ) -> Result<T, GuardError<E>>
    where
        F: FnOnce(CancelSignal) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        let GuardOptions {
            timeout,
            key,
            on_timeout_message,
        } = options;
        let message = on_timeout_message
            .unwrap_or_else(|| format!("operation timed out after {}ms", timeout.as_millis()));

        let Some(key) = key else {
            let signal = CancelSignal::new();
            return race(operation(signal.clone()), signal, timeout, None, message).await;
        };

        let plan = {
            let mut pending = self.lock();
            let existing = pending
                .get(&key)
                .map(|entry| entry.outcome.downcast_ref::<SharedOutcome<T, E>>().cloned());

            match existing {
                Some(Some(shared)) => {
                    crate::log_debug!("guard"; "joining pending operation '{}'", key);
                    Plan::Await(shared)
                }
                Some(None) => {
                    crate::log_warn!("guard"; "key '{}' reused with a different result type, running unshared", key);
                    let signal = CancelSignal::new();
                    let fut = operation(signal.clone());
                    Plan::Unshared(race(fut, signal, timeout, Some(key.clone()), message).boxed())
                }
                None => {
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let signal = CancelSignal::new();
                    let fut = operation(signal.clone());

                    let registry = self.clone();
                    let task_key = key.clone();
                    let task_signal = signal.clone();
                    let handle = tokio::spawn(async move {
                        let outcome =
                            race(fut, task_signal, timeout, Some(task_key.clone()), message).await;
                        registry.remove_entry(&task_key, id);
                        outcome
                    });

                    let join_key = key.clone();
                    let shared: SharedOutcome<T, E> = async move {
                        match handle.await {
                            Ok(outcome) => outcome,
                            Err(join_err) => Err(GuardError::Cancelled {
                                key: Some(join_key),
                                reason: format!("operation task ended: {}", join_err),
                            }),
                        }
                    }
                    .boxed()
                    .shared();

                    pending.insert(
                        key.clone(),
                        PendingEntry {
                            id,
                            signal,
                            started_at: Instant::now(),
                            outcome: Box::new(shared.clone()),
                        },
                    );
                    Plan::Await(shared)
                }
            }
        };

        match plan {
            Plan::Await(shared) => shared.await,
            Plan::Unshared(fut) => fut.await,
        }
    }

    /// Cancel one pending operation. Its key is freed immediately.
    pub fn cancel(&self, key: &str) -> bool {
        let entry = self.lock().remove(key);
        match entry {
            Some(entry) => {
                entry.signal.cancel(DEFAULT_CANCEL_REASON);
                crate::log_debug!("guard"; "cancelled pending operation '{}'", key);
                true
            }
            None => false,
        }
    }

    /// Cancel every pending operation, returning how many were signalled.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let drained: Vec<(String, PendingEntry)> = self.lock().drain().collect();
        for (_, entry) in &drained {
            entry.signal.cancel(reason);
        }
        if !drained.is_empty() {
            crate::log_info!("guard"; "cancelled {} pending operation(s): {}", drained.len(), reason);
        }
        drained.len()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn pending_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn pending_operations(&self) -> Vec<PendingOperation> {
        let now = Instant::now();
        let mut ops: Vec<PendingOperation> = self
            .lock()
            .iter()
            .map(|(key, entry)| PendingOperation {
                key: key.clone(),
                age_ms: now.saturating_duration_since(entry.started_at).as_millis() as u64,
            })
            .collect();
        ops.sort_by(|a, b| a.key.cmp(&b.key));
        ops
    }

    /// Remove the entry for `key` only if it is still the one identified by
    /// `id`; a cancelled-and-replaced key keeps its newer entry.
    fn remove_entry(&self, key: &str, id: u64) {
        let mut pending = self.lock();
        if pending.get(key).is_some_and(|entry| entry.id == id) {
            pending.remove(key);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingEntry>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for OperationGuard {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

async fn race<T, E, Fut>(
    fut: Fut,
    signal: CancelSignal,
    timeout: Duration,
    key: Option<String>,
    message: String,
) -> Result<T, GuardError<E>>
where
    Fut: Future<Output = Result<T, E>>,
{
    tokio::select! {
        biased;
        _ = signal.cancelled() => Err(GuardError::Cancelled {
            key,
            reason: signal.reason().unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string()),
        }),
        outcome = tokio::time::timeout(timeout, fut) => match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(GuardError::Upstream(e)),
            Err(_) => Err(GuardError::Timeout { key, after: timeout, message }),
        },
    }
}
