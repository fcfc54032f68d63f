//! In-process reactive query store.
//!
//! Holds fetched query data keyed by [`CacheKey`], tracks how many consumers
//! observe each query, and refetches observed queries when they are
//! invalidated. Fetches go through the [`OperationGuard`] keyed by query and
//! invalidation epoch: concurrent fetches of one key share a request, but a
//! fetch started before an invalidation never satisfies it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use agora_shared::{CacheError, CacheKey, GuardError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::{join_all, BoxFuture};
use serde::Serialize;
use serde_json::Value;

use crate::cache::{KeyMatch, QueryCache, QueryCategory, QueryStatus, TrackedQuery};
use crate::config::KeyTimeouts;
use crate::guard::{CancelSignal, GuardOptions, OperationGuard};

/// Loads the data for one key from the backend.
pub type Fetcher =
    Arc<dyn Fn(CacheKey, CancelSignal) -> BoxFuture<'static, Result<Value, CacheError>> + Send + Sync>;

#[derive(Debug, Clone)]
struct QueryEntry {
    data: Option<Value>,
    status: QueryStatus,
    observers: usize,
    invalidated: bool,
    fetched_at: Option<DateTime<Utc>>,
    error: Option<String>,
    /// Bumped by every invalidation. Results of fetches started under an
    /// older epoch are dropped.
    epoch: u64,
}

impl QueryEntry {
    fn idle() -> Self {
        Self {
            data: None,
            status: QueryStatus::Idle,
            observers: 0,
            invalidated: false,
            fetched_at: None,
            error: None,
            epoch: 0,
        }
    }

    fn is_stale(&self, key: &CacheKey, now: DateTime<Utc>) -> bool {
        if self.invalidated {
            return true;
        }
        let Some(fetched_at) = self.fetched_at else {
            return true;
        };
        let stale_time = QueryCategory::of(key).policy().stale_time;
        match chrono::Duration::from_std(stale_time) {
            Ok(stale_time) => now - fetched_at >= stale_time,
            Err(_) => false,
        }
    }
}

/// Debug view of one stored query.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuerySnapshot {
    pub key: String,
    pub status: QueryStatus,
    pub observers: usize,
    pub stale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct QueryStore {
    entries: Arc<Mutex<BTreeMap<CacheKey, QueryEntry>>>,
    fetcher: Fetcher,
    guard: OperationGuard,
    timeouts: KeyTimeouts,
    fetches: Arc<AtomicU64>,
}

impl QueryStore {
    /// A store that gives every key the same fetch budget.
    pub fn new(fetcher: Fetcher, guard: OperationGuard, fetch_timeout: Duration) -> Self {
        Self::with_timeouts(fetcher, guard, KeyTimeouts::uniform(fetch_timeout))
    }

    /// A store whose fetch budget depends on the key's category.
    pub fn with_timeouts(fetcher: Fetcher, guard: OperationGuard, timeouts: KeyTimeouts) -> Self {
        Self {
            entries: Arc::new(Mutex::new(BTreeMap::new())),
            fetcher,
            guard,
            timeouts,
            fetches: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a consumer of `key`, creating the query if needed.
    pub fn observe(&self, key: &CacheKey) {
        self.lock()
            .entry(key.clone())
            .or_insert_with(QueryEntry::idle)
            .observers += 1;
    }

    pub fn unobserve(&self, key: &CacheKey) {
        if let Some(entry) = self.lock().get_mut(key) {
            entry.observers = entry.observers.saturating_sub(1);
        }
    }

    /// Store `data` as a fresh successful result.
    pub fn seed(&self, key: &CacheKey, data: Value) {
        let mut entries = self.lock();
        let entry = entries.entry(key.clone()).or_insert_with(QueryEntry::idle);
        entry.data = Some(data);
        entry.status = QueryStatus::Success;
        entry.invalidated = false;
        entry.fetched_at = Some(Utc::now());
        entry.error = None;
    }

    pub fn get(&self, key: &CacheKey) -> Option<Value> {
        self.lock().get(key).and_then(|entry| entry.data.clone())
    }

    pub fn is_stale(&self, key: &CacheKey) -> bool {
        let now = Utc::now();
        self.lock()
            .get(key)
            .map_or(true, |entry| entry.is_stale(key, now))
    }

    /// Total number of fetcher invocations.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Drop unobserved queries whose data is older than their category's
    /// `gc_time`. Returns how many were removed.
    pub fn collect_garbage(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|key, entry| {
            if entry.observers > 0 || entry.status == QueryStatus::Fetching {
                return true;
            }
            let gc_time = QueryCategory::of(key).policy().gc_time;
            match (entry.fetched_at, chrono::Duration::from_std(gc_time)) {
                (Some(fetched_at), Ok(gc_time)) => now - fetched_at < gc_time,
                _ => true,
            }
        });
        before - entries.len()
    }

    pub fn snapshot(&self) -> Vec<QuerySnapshot> {
        let now = Utc::now();
        self.lock()
            .iter()
            .map(|(key, entry)| QuerySnapshot {
                key: key.to_string(),
                status: entry.status,
                observers: entry.observers,
                stale: entry.is_stale(key, now),
                fetched_at: entry.fetched_at,
                error: entry.error.clone(),
            })
            .collect()
    }

    /// Fetch `key` now, sharing an in-flight fetch for the same key started
    /// since its last invalidation.
    pub async fn fetch(&self, key: &CacheKey) -> Result<Value, CacheError> {
        let epoch = {
            let mut entries = self.lock();
            let entry = entries.entry(key.clone()).or_insert_with(QueryEntry::idle);
            entry.status = QueryStatus::Fetching;
            entry.epoch
        };

        let fetcher = self.fetcher.clone();
        let fetches = self.fetches.clone();
        let task_key = key.clone();
        let result = self
            .guard
            .with_timeout(
                GuardOptions::keyed(format!("query:{}@{}", key, epoch), self.timeouts.for_key(key)),
                move |signal| {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    fetcher(task_key, signal)
                },
            )
            .await
            .map_err(|err| match err {
                GuardError::Upstream(err) => err,
                other => CacheError::Fetch {
                    key: key.to_string(),
                    reason: other.to_string(),
                },
            });

        let mut entries = self.lock();
        let entry = entries.entry(key.clone()).or_insert_with(QueryEntry::idle);
        if entry.epoch != epoch {
            crate::log_debug!("cache"; "dropping result for {}: invalidated while fetching", key);
            return result;
        }
        match &result {
            Ok(data) => {
                entry.data = Some(data.clone());
                entry.status = QueryStatus::Success;
                entry.invalidated = false;
                entry.fetched_at = Some(Utc::now());
                entry.error = None;
            }
            Err(err) => {
                entry.status = QueryStatus::Error;
                entry.error = Some(err.to_string());
            }
        }
        result
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<CacheKey, QueryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl QueryCache for QueryStore {
    fn keys(&self) -> Vec<TrackedQuery> {
        self.lock()
            .iter()
            .map(|(key, entry)| TrackedQuery {
                key: key.clone(),
                status: entry.status,
                observers: entry.observers,
            })
            .collect()
    }

    async fn invalidate(&self, target: &KeyMatch) -> Result<(), CacheError> {
        let active: Vec<CacheKey> = {
            let mut entries = self.lock();
            entries
                .iter_mut()
                .filter(|(key, _)| target.matches(key))
                .filter_map(|(key, entry)| {
                    entry.invalidated = true;
                    entry.epoch += 1;
                    (entry.observers > 0).then(|| key.clone())
                })
                .collect()
        };
        if active.is_empty() {
            return Ok(());
        }

        crate::log_debug!("cache"; "invalidated {}, refetching {} active query(ies)", target, active.len());
        let results = join_all(active.iter().map(|key| self.fetch(key))).await;
        match results.into_iter().find_map(Result::err) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn refetch_active(&self, key: &CacheKey) -> Result<(), CacheError> {
        let active = self
            .lock()
            .get(key)
            .is_some_and(|entry| entry.observers > 0);
        if active {
            self.fetch(key).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::keys;
    use agora_shared::EntityDomain;
    use futures_util::FutureExt;
    use serde_json::json;

    fn slow_store() -> QueryStore {
        let fetcher: Fetcher = Arc::new(|key: CacheKey, _signal: CancelSignal| {
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(json!({ "key": key.to_string() }))
            }
            .boxed()
        });
        QueryStore::new(fetcher, OperationGuard::default(), Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_refetches_only_active_queries() {
        let store = slow_store();
        let detail = keys::detail(EntityDomain::Post, "p1");
        let list = keys::list(EntityDomain::Post, "recent");
        store.observe(&detail);
        store.seed(&list, json!([]));

        store
            .invalidate(&KeyMatch::Prefix(CacheKey::new(["posts"])))
            .await
            .unwrap();

        assert_eq!(store.fetch_count(), 1);
        assert_eq!(store.get(&detail), Some(json!({"key": "posts/detail/p1"})));
        assert!(!store.is_stale(&detail));
        assert!(store.is_stale(&list));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_fetches_share_one_request() {
        let store = slow_store();
        let key = keys::session();
        store.observe(&key);

        let (a, b) = tokio::join!(store.fetch(&key), store.fetch(&key));
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(store.fetch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidation_during_fetch_is_not_absorbed() {
        let version = Arc::new(AtomicU64::new(1));
        let source = version.clone();
        let fetcher: Fetcher = Arc::new(move |_key: CacheKey, _signal: CancelSignal| {
            let seen = source.load(Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(json!(seen))
            }
            .boxed()
        });
        let store = QueryStore::new(fetcher, OperationGuard::default(), Duration::from_secs(1));
        let key = keys::detail(EntityDomain::Post, "p1");
        store.observe(&key);

        let (first, second) = tokio::join!(store.fetch(&key), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            version.store(2, Ordering::SeqCst);
            store.invalidate(&KeyMatch::Exact(key.clone())).await
        });

        assert_eq!(first.unwrap(), json!(1));
        second.unwrap();
        assert_eq!(store.get(&key), Some(json!(2)));
        assert!(!store.is_stale(&key));
        assert_eq!(store.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_fetches_use_the_identity_budget() {
        let fetcher: Fetcher = Arc::new(|key: CacheKey, _signal: CancelSignal| {
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(json!({ "key": key.to_string() }))
            }
            .boxed()
        });
        let timeouts = KeyTimeouts {
            identity: Duration::from_millis(100),
            backend: Duration::from_millis(500),
        };
        let store = QueryStore::with_timeouts(fetcher, OperationGuard::default(), timeouts);

        let err = store.fetch(&keys::session()).await.unwrap_err();
        assert!(matches!(err, CacheError::Fetch { .. }));
        assert_eq!(store.keys()[0].status, QueryStatus::Error);
        assert!(store.fetch(&keys::feed()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_invalidation_converges_to_same_state() {
        let store = slow_store();
        let key = keys::current_user();
        store.observe(&key);
        let target = KeyMatch::Exact(key.clone());

        store.invalidate(&target).await.unwrap();
        let once = store.get(&key);
        store.invalidate(&target).await.unwrap();

        assert_eq!(store.get(&key), once);
        assert!(store.fetch_count() <= 2);
        assert_eq!(store.keys().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_error_marks_query_errored() {
        let fetcher: Fetcher = Arc::new(|key: CacheKey, _signal: CancelSignal| {
            async move {
                Err(CacheError::Fetch {
                    key: key.to_string(),
                    reason: "503".into(),
                })
            }
            .boxed()
        });
        let store = QueryStore::new(fetcher, OperationGuard::default(), Duration::from_secs(1));
        let key = keys::leaderboard();
        store.observe(&key);

        assert!(store.refetch_active(&key).await.is_err());
        assert_eq!(store.keys()[0].status, QueryStatus::Error);
        assert!(store.snapshot()[0].error.as_deref().unwrap().contains("503"));
    }

    #[tokio::test]
    async fn test_refetch_active_skips_unobserved() {
        let store = slow_store();
        let key = keys::feed();
        store.seed(&key, json!([]));
        store.refetch_active(&key).await.unwrap();
        assert_eq!(store.fetch_count(), 0);
    }
}
