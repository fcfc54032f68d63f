//! Shared data models for the agora community platform's sync layer.

use serde::{Deserialize, Serialize};
use std::fmt;

// --- Backend tables ---

/// Backend tables that publish row-level change streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Posts,
    Activities,
    Profiles,
    Comments,
    Likes,
    Bookmarks,
    ActivityParticipants,
    Messages,
    MessageReads,
}

impl Table {
    pub const ALL: [Table; 9] = [
        Table::Posts,
        Table::Activities,
        Table::Profiles,
        Table::Comments,
        Table::Likes,
        Table::Bookmarks,
        Table::ActivityParticipants,
        Table::Messages,
        Table::MessageReads,
    ];

    /// Tables whose streams are shared by every signed-in user.
    pub const GLOBAL: [Table; 7] = [
        Table::Posts,
        Table::Activities,
        Table::Profiles,
        Table::Comments,
        Table::Likes,
        Table::Bookmarks,
        Table::ActivityParticipants,
    ];

    /// Tables whose streams only make sense for one principal.
    pub const SCOPED: [Table; 2] = [Table::Messages, Table::MessageReads];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Posts => "posts",
            Table::Activities => "activities",
            Table::Profiles => "profiles",
            Table::Comments => "comments",
            Table::Likes => "likes",
            Table::Bookmarks => "bookmarks",
            Table::ActivityParticipants => "activity_participants",
            Table::Messages => "messages",
            Table::MessageReads => "message_reads",
        }
    }

    pub fn is_scoped(&self) -> bool {
        Self::SCOPED.contains(self)
    }

    /// The entity domain stored in this table, if it is an entity table.
    pub fn entity_domain(&self) -> Option<EntityDomain> {
        match self {
            Table::Posts => Some(EntityDomain::Post),
            Table::Activities => Some(EntityDomain::Activity),
            Table::Profiles => Some(EntityDomain::Profile),
            _ => None,
        }
    }

    /// The interaction kind recorded in this table, if it is an interaction table.
    pub fn interaction_kind(&self) -> Option<InteractionKind> {
        match self {
            Table::Likes => Some(InteractionKind::Like),
            Table::Bookmarks => Some(InteractionKind::Bookmark),
            _ => None,
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Entities ---

/// Top-level entity types that own detail and list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityDomain {
    Post,
    Activity,
    Profile,
}

impl EntityDomain {
    /// The first cache key segment for queries about this entity type.
    pub fn key_segment(&self) -> &'static str {
        match self {
            EntityDomain::Post => "posts",
            EntityDomain::Activity => "activities",
            EntityDomain::Profile => "profiles",
        }
    }

    pub fn table(&self) -> Table {
        match self {
            EntityDomain::Post => Table::Posts,
            EntityDomain::Activity => Table::Activities,
            EntityDomain::Profile => Table::Profiles,
        }
    }

    /// Parse the `parent_type` / `target_type` column values used by
    /// comments and interactions. Accepts singular and plural forms.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "post" | "posts" => Some(EntityDomain::Post),
            "activity" | "activities" => Some(EntityDomain::Activity),
            "profile" | "profiles" | "user" | "users" => Some(EntityDomain::Profile),
            _ => None,
        }
    }
}

impl fmt::Display for EntityDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key_segment())
    }
}

/// Lightweight user-to-entity interactions with denormalized counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InteractionKind {
    Like,
    Bookmark,
}

impl InteractionKind {
    pub fn key_segment(&self) -> &'static str {
        match self {
            InteractionKind::Like => "likes",
            InteractionKind::Bookmark => "bookmarks",
        }
    }

    pub fn table(&self) -> Table {
        match self {
            InteractionKind::Like => Table::Likes,
            InteractionKind::Bookmark => Table::Bookmarks,
        }
    }
}

// --- Cache keys ---

/// Structured identifier for one cached query result.
///
/// A key is an ordered path such as `posts/detail/p1`. Two keys compare
/// segment by segment, and a key can target every query beneath it as a
/// prefix (`posts` matches `posts/list/recent` and `posts/detail/p1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey {
    segments: Vec<String>,
}

impl CacheKey {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn segment(&self, index: usize) -> Option<&str> {
        self.segments.get(index).map(String::as_str)
    }

    /// The first segment, naming the query family (e.g. "posts").
    pub fn domain(&self) -> Option<&str> {
        self.segment(0)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Returns a new key with `segment` appended.
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// True when every segment of `prefix` matches the start of this key.
    /// A key always starts with itself.
    pub fn starts_with(&self, prefix: &CacheKey) -> bool {
        prefix.segments.len() <= self.segments.len()
            && prefix
                .segments
                .iter()
                .zip(self.segments.iter())
                .all(|(a, b)| a == b)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

impl<S: Into<String>> FromIterator<S> for CacheKey {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self::new(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_matching_is_segment_wise() {
        let detail = CacheKey::new(["posts", "detail", "p1"]);
        assert!(detail.starts_with(&CacheKey::new(["posts"])));
        assert!(detail.starts_with(&detail));
        assert!(!detail.starts_with(&CacheKey::new(["posts", "det"])));
        assert!(!CacheKey::new(["posts"]).starts_with(&detail));
    }

    #[test]
    fn test_keys_order_by_segments() {
        let a = CacheKey::new(["posts", "detail", "a"]);
        let b = CacheKey::new(["posts", "detail", "b"]);
        let list = CacheKey::new(["posts", "list"]);
        let mut keys = vec![list.clone(), b.clone(), a.clone()];
        keys.sort();
        assert_eq!(keys, vec![a, b, list]);
    }

    #[test]
    fn test_cache_key_serializes_as_path_array() {
        let key = CacheKey::new(["comments", "posts", "p1"]);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, r#"["comments","posts","p1"]"#);
        assert_eq!(key.to_string(), "comments/posts/p1");
    }

    #[test]
    fn test_entity_domain_parse_accepts_both_forms() {
        assert_eq!(EntityDomain::parse("post"), Some(EntityDomain::Post));
        assert_eq!(EntityDomain::parse("Activities"), Some(EntityDomain::Activity));
        assert_eq!(EntityDomain::parse("group"), None);
    }

    #[test]
    fn test_global_and_scoped_tables_partition_all() {
        for table in Table::ALL {
            assert_ne!(Table::GLOBAL.contains(&table), table.is_scoped());
        }
    }
}
