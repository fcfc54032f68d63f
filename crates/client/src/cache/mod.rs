//! Cache Strategy Policy and the reactive-cache boundary.
//!
//! The engine never stores query data. It only tells the cache which keys
//! are stale through [`QueryCache`]; fetching and storage stay with the
//! cache implementation (see [`crate::stores::QueryStore`]).

pub mod invalidation;
pub mod keys;
pub mod policy;

pub use invalidation::{InvalidationMap, InvalidationRule};
pub use policy::{CachePolicy, QueryCategory, QueryPriority};

use agora_shared::{CacheError, CacheKey};
use async_trait::async_trait;
use serde::Serialize;

/// Invalidation target: one key, or every key beneath a prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "match", content = "key", rename_all = "camelCase")]
pub enum KeyMatch {
    Exact(CacheKey),
    Prefix(CacheKey),
}

impl KeyMatch {
    pub fn key(&self) -> &CacheKey {
        match self {
            KeyMatch::Exact(key) | KeyMatch::Prefix(key) => key,
        }
    }

    pub fn matches(&self, candidate: &CacheKey) -> bool {
        match self {
            KeyMatch::Exact(key) => key == candidate,
            KeyMatch::Prefix(prefix) => candidate.starts_with(prefix),
        }
    }
}

impl std::fmt::Display for KeyMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyMatch::Exact(key) => write!(f, "{}", key),
            KeyMatch::Prefix(key) => write!(f, "{}/*", key),
        }
    }
}

/// Fetch state of a tracked query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryStatus {
    Idle,
    Fetching,
    Success,
    Error,
}

/// One query as reported by [`QueryCache::keys`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedQuery {
    pub key: CacheKey,
    pub status: QueryStatus,
    /// Number of mounted consumers; zero means the query is inactive.
    pub observers: usize,
}

impl TrackedQuery {
    pub fn is_active(&self) -> bool {
        self.observers > 0
    }
}

/// What the engine needs from the reactive query cache.
#[async_trait]
pub trait QueryCache: Send + Sync {
    /// Every query the cache currently tracks.
    fn keys(&self) -> Vec<TrackedQuery>;

    /// Mark matching queries stale; active ones refetch. Invalidating an
    /// already-stale key again must not trigger extra work beyond one fetch.
    async fn invalidate(&self, target: &KeyMatch) -> Result<(), CacheError>;

    /// Refetch one query if it has observers.
    async fn refetch_active(&self, key: &CacheKey) -> Result<(), CacheError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_match_respects_segment_boundaries() {
        let target = KeyMatch::Prefix(CacheKey::new(["posts", "detail", "p1"]));
        assert!(target.matches(&CacheKey::new(["posts", "detail", "p1"])));
        assert!(target.matches(&CacheKey::new(["posts", "detail", "p1", "stats"])));
        assert!(!target.matches(&CacheKey::new(["posts", "detail", "p10"])));

        let exact = KeyMatch::Exact(CacheKey::new(["posts", "list"]));
        assert!(!exact.matches(&CacheKey::new(["posts", "list", "recent"])));
        assert_eq!(target.to_string(), "posts/detail/p1/*");
    }
}
