//! Test support: a query cache that records what it was told.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use agora_shared::{CacheError, CacheKey};
use async_trait::async_trait;

use crate::cache::{KeyMatch, QueryCache, QueryStatus, TrackedQuery};

#[derive(Default)]
pub struct RecordingCache {
    tracked: Mutex<BTreeMap<CacheKey, usize>>,
    failing: Mutex<HashSet<CacheKey>>,
    targets: Mutex<Vec<KeyMatch>>,
    refetched: Mutex<Vec<CacheKey>>,
    delay: Mutex<Option<Duration>>,
}

impl RecordingCache {
    pub fn with_keys(keys: impl IntoIterator<Item = CacheKey>) -> Self {
        let cache = Self::default();
        cache
            .tracked
            .lock()
            .unwrap()
            .extend(keys.into_iter().map(|key| (key, 0)));
        cache
    }

    pub fn set_observers(&self, key: &CacheKey, observers: usize) {
        self.tracked.lock().unwrap().insert(key.clone(), observers);
    }

    pub fn fail_key(&self, key: &CacheKey) {
        self.failing.lock().unwrap().insert(key.clone());
    }

    /// Make every invalidation and refetch take `delay` before settling.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn clear_failures(&self) {
        self.failing.lock().unwrap().clear();
    }

    /// Every invalidation target received so far, in call order.
    pub fn take_targets(&self) -> Vec<KeyMatch> {
        std::mem::take(&mut *self.targets.lock().unwrap())
    }

    /// Keys of the invalidation targets received so far.
    pub fn take_invalidated(&self) -> Vec<CacheKey> {
        self.take_targets()
            .into_iter()
            .map(|target| target.key().clone())
            .collect()
    }

    pub fn take_refetched(&self) -> Vec<CacheKey> {
        std::mem::take(&mut *self.refetched.lock().unwrap())
    }

    async fn settle(&self, key: &CacheKey) -> Result<(), CacheError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check(key)
    }

    fn check(&self, key: &CacheKey) -> Result<(), CacheError> {
        if self.failing.lock().unwrap().contains(key) {
            return Err(CacheError::Fetch {
                key: key.to_string(),
                reason: "backend unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl QueryCache for RecordingCache {
    fn keys(&self) -> Vec<TrackedQuery> {
        self.tracked
            .lock()
            .unwrap()
            .iter()
            .map(|(key, observers)| TrackedQuery {
                key: key.clone(),
                status: QueryStatus::Success,
                observers: *observers,
            })
            .collect()
    }

    async fn invalidate(&self, target: &KeyMatch) -> Result<(), CacheError> {
        self.targets.lock().unwrap().push(target.clone());
        self.settle(target.key()).await
    }

    async fn refetch_active(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.refetched.lock().unwrap().push(key.clone());
        self.settle(key).await
    }
}
