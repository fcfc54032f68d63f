//! Per-category staleness and refetch policy, and recovery priorities.

use std::time::Duration;

use agora_shared::CacheKey;
use serde::Serialize;

use super::keys;

/// Recovery order of a cached query. `Critical` sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryPriority {
    Critical,
    High,
    Normal,
    Low,
}

impl QueryPriority {
    pub const ALL: [QueryPriority; 4] = [
        QueryPriority::Critical,
        QueryPriority::High,
        QueryPriority::Normal,
        QueryPriority::Low,
    ];

    /// Classify a key by its family.
    pub fn of(key: &CacheKey) -> Self {
        QueryCategory::of(key).priority()
    }
}

/// Staleness and refetch behavior for a group of queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachePolicy {
    /// How long fetched data counts as fresh.
    pub stale_time: Duration,
    /// How long an unobserved query is retained.
    pub gc_time: Duration,
    pub refetch_on_focus: bool,
    pub refetch_on_reconnect: bool,
}

/// Query families that share a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryCategory {
    /// Session and the signed-in user.
    Identity,
    /// Likes, bookmarks, comments.
    Social,
    Messaging,
    /// Entity detail views and participant lists.
    Content,
    /// Lists, feeds, trending.
    Feed,
    /// Stats, leaderboards.
    Analytics,
}

impl QueryCategory {
    pub fn of(key: &CacheKey) -> Self {
        match (key.segment(0), key.segment(1)) {
            (Some(keys::SESSION), _) | (Some("auth"), _) => QueryCategory::Identity,
            (Some("profiles"), Some(keys::ME)) => QueryCategory::Identity,
            (Some("likes" | "bookmarks" | keys::COMMENTS), _) => QueryCategory::Social,
            (Some(keys::MESSAGES | keys::NOTIFICATIONS), _) => QueryCategory::Messaging,
            (Some(keys::STATS | keys::LEADERBOARD | keys::ANALYTICS), _) => {
                QueryCategory::Analytics
            }
            (Some(_), Some(keys::DETAIL | keys::PARTICIPANTS)) => QueryCategory::Content,
            _ => QueryCategory::Feed,
        }
    }

    pub fn priority(&self) -> QueryPriority {
        match self {
            QueryCategory::Identity => QueryPriority::Critical,
            QueryCategory::Social | QueryCategory::Messaging => QueryPriority::High,
            QueryCategory::Content | QueryCategory::Feed => QueryPriority::Normal,
            QueryCategory::Analytics => QueryPriority::Low,
        }
    }

    pub fn policy(&self) -> CachePolicy {
        match self {
            QueryCategory::Identity => CachePolicy {
                stale_time: Duration::from_secs(5 * 60),
                gc_time: Duration::from_secs(30 * 60),
                refetch_on_focus: false,
                refetch_on_reconnect: true,
            },
            QueryCategory::Social => CachePolicy {
                stale_time: Duration::from_secs(30),
                gc_time: Duration::from_secs(5 * 60),
                refetch_on_focus: true,
                refetch_on_reconnect: true,
            },
            QueryCategory::Messaging => CachePolicy {
                stale_time: Duration::ZERO,
                gc_time: Duration::from_secs(5 * 60),
                refetch_on_focus: true,
                refetch_on_reconnect: true,
            },
            QueryCategory::Content => CachePolicy {
                stale_time: Duration::from_secs(2 * 60),
                gc_time: Duration::from_secs(10 * 60),
                refetch_on_focus: false,
                refetch_on_reconnect: true,
            },
            QueryCategory::Feed => CachePolicy {
                stale_time: Duration::from_secs(60),
                gc_time: Duration::from_secs(10 * 60),
                refetch_on_focus: true,
                refetch_on_reconnect: true,
            },
            QueryCategory::Analytics => CachePolicy {
                stale_time: Duration::from_secs(10 * 60),
                gc_time: Duration::from_secs(30 * 60),
                refetch_on_focus: false,
                refetch_on_reconnect: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_shared::{EntityDomain, InteractionKind};

    #[test]
    fn test_priority_lookup() {
        assert_eq!(QueryPriority::of(&keys::session()), QueryPriority::Critical);
        assert_eq!(QueryPriority::of(&keys::current_user()), QueryPriority::Critical);
        assert_eq!(
            QueryPriority::of(&keys::interactions(
                InteractionKind::Like,
                EntityDomain::Post,
                "p1"
            )),
            QueryPriority::High
        );
        assert_eq!(QueryPriority::of(&keys::unread("u1")), QueryPriority::High);
        assert_eq!(
            QueryPriority::of(&keys::list(EntityDomain::Post, "recent")),
            QueryPriority::Normal
        );
        assert_eq!(
            QueryPriority::of(&keys::detail(EntityDomain::Profile, "u2")),
            QueryPriority::Normal
        );
        assert_eq!(QueryPriority::of(&keys::leaderboard()), QueryPriority::Low);
        assert_eq!(QueryPriority::of(&CacheKey::new(["unknown"])), QueryPriority::Normal);
    }

    #[test]
    fn test_priorities_sort_critical_first() {
        let mut shuffled = vec![QueryPriority::Low, QueryPriority::Critical, QueryPriority::Normal];
        shuffled.sort();
        assert_eq!(shuffled[0], QueryPriority::Critical);
    }

    #[test]
    fn test_analytics_skip_reconnect_refetch() {
        assert!(!QueryCategory::Analytics.policy().refetch_on_reconnect);
        assert!(QueryCategory::Messaging.policy().stale_time.is_zero());
    }
}
