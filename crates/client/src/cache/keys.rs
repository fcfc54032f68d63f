//! Cache key registry.
//!
//! Every query key the platform uses is built here so invalidation rules and
//! query sites agree on the shape. Keys are paths: family first, then the
//! entity id, then any sub-filter.

use agora_shared::{CacheKey, EntityDomain, InteractionKind};

pub const SESSION: &str = "session";
pub const ME: &str = "me";
pub const LIST: &str = "list";
pub const DETAIL: &str = "detail";
pub const TRENDING: &str = "trending";
pub const POPULAR: &str = "popular";
pub const COMMENTS: &str = "comments";
pub const PARTICIPANTS: &str = "participants";
pub const MESSAGES: &str = "messages";
pub const CONVERSATIONS: &str = "conversations";
pub const CONVERSATION: &str = "conversation";
pub const UNREAD: &str = "unread";
pub const NOTIFICATIONS: &str = "notifications";
pub const FEED: &str = "feed";
pub const LEADERBOARD: &str = "leaderboard";
pub const STATS: &str = "stats";
pub const ANALYTICS: &str = "analytics";

pub fn session() -> CacheKey {
    CacheKey::new([SESSION])
}

/// The signed-in user's own profile.
pub fn current_user() -> CacheKey {
    CacheKey::new([EntityDomain::Profile.key_segment(), ME])
}

/// Prefix of every list query for a domain, e.g. `posts/list`.
pub fn lists(domain: EntityDomain) -> CacheKey {
    CacheKey::new([domain.key_segment(), LIST])
}

/// One filtered list, e.g. `posts/list/recent`.
pub fn list(domain: EntityDomain, filter: &str) -> CacheKey {
    lists(domain).child(filter)
}

pub fn detail(domain: EntityDomain, id: &str) -> CacheKey {
    CacheKey::new([domain.key_segment(), DETAIL, id])
}

pub fn trending(domain: EntityDomain) -> CacheKey {
    CacheKey::new([domain.key_segment(), TRENDING])
}

pub fn popular(domain: EntityDomain) -> CacheKey {
    CacheKey::new([domain.key_segment(), POPULAR])
}

pub fn comments_for(parent: EntityDomain, parent_id: &str) -> CacheKey {
    CacheKey::new([COMMENTS, parent.key_segment(), parent_id])
}

/// Interaction state of one target, e.g. `likes/posts/p1`.
pub fn interactions(kind: InteractionKind, target: EntityDomain, target_id: &str) -> CacheKey {
    CacheKey::new([kind.key_segment(), target.key_segment(), target_id])
}

/// Everything one user liked or bookmarked.
pub fn user_interactions(kind: InteractionKind, user_id: &str) -> CacheKey {
    CacheKey::new([kind.key_segment(), "user", user_id])
}

pub fn participants(activity_id: &str) -> CacheKey {
    CacheKey::new([
        EntityDomain::Activity.key_segment(),
        PARTICIPANTS,
        activity_id,
    ])
}

pub fn conversations(user_id: &str) -> CacheKey {
    CacheKey::new([MESSAGES, CONVERSATIONS, user_id])
}

pub fn conversation(conversation_id: &str) -> CacheKey {
    CacheKey::new([MESSAGES, CONVERSATION, conversation_id])
}

pub fn unread(user_id: &str) -> CacheKey {
    CacheKey::new([MESSAGES, UNREAD, user_id])
}

pub fn notifications(user_id: &str) -> CacheKey {
    CacheKey::new([NOTIFICATIONS, user_id])
}

pub fn feed() -> CacheKey {
    CacheKey::new([FEED])
}

pub fn leaderboard() -> CacheKey {
    CacheKey::new([LEADERBOARD])
}

pub fn stats(domain: EntityDomain) -> CacheKey {
    CacheKey::new([STATS, domain.key_segment()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_render_as_paths() {
        assert_eq!(detail(EntityDomain::Post, "p1").to_string(), "posts/detail/p1");
        assert_eq!(
            comments_for(EntityDomain::Activity, "a9").to_string(),
            "comments/activities/a9"
        );
        assert_eq!(
            interactions(InteractionKind::Bookmark, EntityDomain::Post, "p1").to_string(),
            "bookmarks/posts/p1"
        );
        assert!(list(EntityDomain::Post, "recent").starts_with(&lists(EntityDomain::Post)));
    }
}
