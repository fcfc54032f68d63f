//! Table × event-type invalidation rules.
//!
//! The mapping is an explicit table built from an exhaustive `match`, so a
//! new [`Table`] cannot be added without deciding what its changes
//! invalidate. [`InvalidationMap::validate`] additionally rejects a map with
//! a missing or empty entry at engine construction.

use std::collections::HashMap;

use agora_shared::{ChangeEvent, ChangeKind, EntityDomain, InteractionKind, SyncError, Table};

use super::{keys, KeyMatch};

/// One way a change event turns into cache-key targets.
///
/// Column names refer to the changed row; the new row image is preferred,
/// the old one is used for deletes. [`InvalidationMap::resolve`] also
/// resolves the old image of an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationRule {
    /// Every list query of a domain.
    Lists(EntityDomain),
    /// Trending and popular views derived from a domain.
    Derived(EntityDomain),
    /// The combined home feed.
    Feed,
    /// Detail of a fixed domain, id taken from `id_column`.
    Detail {
        domain: EntityDomain,
        id_column: &'static str,
    },
    /// Detail of a polymorphic parent/target named by two columns.
    RelatedDetail {
        type_column: &'static str,
        id_column: &'static str,
    },
    /// Lists of the domain named by `type_column`.
    RelatedLists { type_column: &'static str },
    /// Comment list of the parent named by two columns.
    Comments {
        type_column: &'static str,
        id_column: &'static str,
    },
    /// Interaction state of the target named by two columns.
    Interaction {
        kind: InteractionKind,
        type_column: &'static str,
        id_column: &'static str,
    },
    /// One user's likes or bookmarks.
    UserInteractions {
        kind: InteractionKind,
        user_column: &'static str,
    },
    Participants { activity_column: &'static str },
    Conversation { conversation_column: &'static str },
    /// The principal's conversation list. Needs a principal.
    Conversations,
    /// The principal's unread counter. Needs a principal.
    Unread,
}

impl InvalidationRule {
    /// Resolve the keys this rule targets for `event`.
    ///
    /// A row without the referenced column yields no targets and a warning.
    pub fn resolve(&self, event: &ChangeEvent, principal: Option<&str>) -> Vec<KeyMatch> {
        self.resolve_image(event, principal, true)
    }

    fn resolve_image(&self, event: &ChangeEvent, principal: Option<&str>, warn: bool) -> Vec<KeyMatch> {
        let column = |name: &str| -> Option<String> {
            let value = event.field(name);
            if value.is_none() && warn {
                crate::log_warn!(
                    "cache";
                    "{} {} row has no '{}' column, skipping rule",
                    event.table,
                    event.kind,
                    name
                );
            }
            value
        };
        let domain_of = |name: &str| -> Option<EntityDomain> {
            let raw = column(name)?;
            let domain = EntityDomain::parse(&raw);
            if domain.is_none() && warn {
                crate::log_warn!("cache"; "{} row names unknown entity type {:?}", event.table, raw);
            }
            domain
        };

        match *self {
            InvalidationRule::Lists(domain) => vec![KeyMatch::Prefix(keys::lists(domain))],
            InvalidationRule::Derived(domain) => vec![
                KeyMatch::Prefix(keys::trending(domain)),
                KeyMatch::Prefix(keys::popular(domain)),
            ],
            InvalidationRule::Feed => vec![KeyMatch::Prefix(keys::feed())],
            InvalidationRule::Detail { domain, id_column } => column(id_column)
                .map(|id| vec![KeyMatch::Exact(keys::detail(domain, &id))])
                .unwrap_or_default(),
            InvalidationRule::RelatedDetail {
                type_column,
                id_column,
            } => match (domain_of(type_column), column(id_column)) {
                (Some(domain), Some(id)) => vec![KeyMatch::Exact(keys::detail(domain, &id))],
                _ => Vec::new(),
            },
            InvalidationRule::RelatedLists { type_column } => domain_of(type_column)
                .map(|domain| vec![KeyMatch::Prefix(keys::lists(domain))])
                .unwrap_or_default(),
            InvalidationRule::Comments {
                type_column,
                id_column,
            } => match (domain_of(type_column), column(id_column)) {
                (Some(domain), Some(id)) => {
                    vec![KeyMatch::Prefix(keys::comments_for(domain, &id))]
                }
                _ => Vec::new(),
            },
            InvalidationRule::Interaction {
                kind,
                type_column,
                id_column,
            } => match (domain_of(type_column), column(id_column)) {
                (Some(domain), Some(id)) => {
                    vec![KeyMatch::Prefix(keys::interactions(kind, domain, &id))]
                }
                _ => Vec::new(),
            },
            InvalidationRule::UserInteractions { kind, user_column } => column(user_column)
                .map(|user| vec![KeyMatch::Prefix(keys::user_interactions(kind, &user))])
                .unwrap_or_default(),
            InvalidationRule::Participants { activity_column } => column(activity_column)
                .map(|id| vec![KeyMatch::Prefix(keys::participants(&id))])
                .unwrap_or_default(),
            InvalidationRule::Conversation {
                conversation_column,
            } => column(conversation_column)
                .map(|id| vec![KeyMatch::Prefix(keys::conversation(&id))])
                .unwrap_or_default(),
            InvalidationRule::Conversations => principal
                .map(|user| vec![KeyMatch::Prefix(keys::conversations(user))])
                .unwrap_or_default(),
            InvalidationRule::Unread => principal
                .map(|user| vec![KeyMatch::Exact(keys::unread(user))])
                .unwrap_or_default(),
        }
    }
}

/// The standard rules for one table and event type.
fn standard_rules(table: Table, kind: ChangeKind) -> Vec<InvalidationRule> {
    use InvalidationRule::*;

    match table {
        Table::Posts | Table::Activities | Table::Profiles => {
            let domain = match table {
                Table::Posts => EntityDomain::Post,
                Table::Activities => EntityDomain::Activity,
                _ => EntityDomain::Profile,
            };
            let mut rules = match kind {
                ChangeKind::Insert | ChangeKind::Delete => vec![Lists(domain), Derived(domain)],
                ChangeKind::Update => vec![
                    Detail {
                        domain,
                        id_column: "id",
                    },
                    Lists(domain),
                ],
            };
            // Profiles never appear in the feed.
            if table != Table::Profiles {
                rules.push(Feed);
            }
            rules
        }
        Table::Comments => vec![
            Comments {
                type_column: "parent_type",
                id_column: "parent_id",
            },
            RelatedDetail {
                type_column: "parent_type",
                id_column: "parent_id",
            },
        ],
        Table::Likes | Table::Bookmarks => {
            let kind = if table == Table::Likes {
                InteractionKind::Like
            } else {
                InteractionKind::Bookmark
            };
            vec![
                Interaction {
                    kind,
                    type_column: "target_type",
                    id_column: "target_id",
                },
                UserInteractions {
                    kind,
                    user_column: "user_id",
                },
                RelatedDetail {
                    type_column: "target_type",
                    id_column: "target_id",
                },
                RelatedLists {
                    type_column: "target_type",
                },
            ]
        }
        Table::ActivityParticipants => vec![
            Participants {
                activity_column: "activity_id",
            },
            Detail {
                domain: EntityDomain::Activity,
                id_column: "activity_id",
            },
        ],
        Table::Messages => vec![
            Conversation {
                conversation_column: "conversation_id",
            },
            Conversations,
            Unread,
        ],
        Table::MessageReads => vec![
            Conversation {
                conversation_column: "conversation_id",
            },
            Unread,
        ],
    }
}

/// Explicit `(table, event type) → rules` table.
#[derive(Debug, Clone, Default)]
pub struct InvalidationMap {
    rules: HashMap<(Table, ChangeKind), Vec<InvalidationRule>>,
}

impl InvalidationMap {
    /// An empty map; every pair must be inserted before it validates.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The rule set for every table and event type.
    pub fn standard() -> Self {
        let rules = Table::ALL
            .iter()
            .flat_map(|&table| ChangeKind::ALL.iter().map(move |&kind| (table, kind)))
            .map(|(table, kind)| ((table, kind), standard_rules(table, kind)))
            .collect();
        Self { rules }
    }

    pub fn insert(&mut self, table: Table, kind: ChangeKind, rules: Vec<InvalidationRule>) {
        self.rules.insert((table, kind), rules);
    }

    pub fn rules(&self, table: Table, kind: ChangeKind) -> &[InvalidationRule] {
        self.rules
            .get(&(table, kind))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Fail when any table and event type pair has no rules.
    pub fn validate(&self) -> Result<(), SyncError> {
        let missing: Vec<String> = Table::ALL
            .iter()
            .flat_map(|&table| ChangeKind::ALL.iter().map(move |&kind| (table, kind)))
            .filter(|pair| self.rules.get(pair).map_or(true, Vec::is_empty))
            .map(|(table, kind)| format!("{}:{}", table, kind))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(SyncError::IncompleteInvalidationMap { missing })
        }
    }

    /// All distinct targets for `event`, in rule order. For an update each
    /// rule is resolved against the new row, then the old one.
    pub fn resolve(&self, event: &ChangeEvent, principal: Option<&str>) -> Vec<KeyMatch> {
        let previous = event.previous_image();
        let mut targets: Vec<KeyMatch> = Vec::new();
        for rule in self.rules(event.table, event.kind) {
            let mut resolved = rule.resolve(event, principal);
            if let Some(previous) = &previous {
                resolved.extend(rule.resolve_image(previous, principal, false));
            }
            for target in resolved {
                if !targets.contains(&target) {
                    targets.push(target);
                }
            }
        }
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rendered(targets: &[KeyMatch]) -> Vec<String> {
        targets.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_standard_map_is_complete() {
        assert!(InvalidationMap::standard().validate().is_ok());
    }

    #[test]
    fn test_missing_pairs_are_reported() {
        let mut map = InvalidationMap::empty();
        for table in Table::ALL {
            for kind in ChangeKind::ALL {
                map.insert(table, kind, standard_rules(table, kind));
            }
        }
        map.insert(Table::Likes, ChangeKind::Delete, Vec::new());
        match map.validate() {
            Err(SyncError::IncompleteInvalidationMap { missing }) => {
                assert_eq!(missing, vec!["likes:DELETE".to_string()])
            }
            other => panic!("expected incomplete map, got {:?}", other),
        }
    }

    #[test]
    fn test_entity_insert_targets_lists_and_derived_views() {
        let map = InvalidationMap::standard();
        let event = ChangeEvent::insert(Table::Posts, json!({"id": "p1", "title": "hi"}));
        assert_eq!(
            rendered(&map.resolve(&event, None)),
            vec!["posts/list/*", "posts/trending/*", "posts/popular/*", "feed/*"]
        );
    }

    #[test]
    fn test_profile_changes_leave_the_feed_alone() {
        let map = InvalidationMap::standard();
        let event = ChangeEvent::insert(Table::Profiles, json!({"id": "u1"}));
        assert_eq!(
            rendered(&map.resolve(&event, None)),
            vec!["profiles/list/*", "profiles/trending/*", "profiles/popular/*"]
        );
    }

    #[test]
    fn test_entity_update_targets_detail_and_lists() {
        let map = InvalidationMap::standard();
        let event = ChangeEvent::update(
            Table::Activities,
            json!({"id": "a1", "title": "old"}),
            json!({"id": "a1", "title": "new"}),
        );
        assert_eq!(
            rendered(&map.resolve(&event, None)),
            vec!["activities/detail/a1", "activities/list/*", "feed/*"]
        );
    }

    #[test]
    fn test_moved_comment_invalidates_old_and_new_parent() {
        let map = InvalidationMap::standard();
        let event = ChangeEvent::update(
            Table::Comments,
            json!({"id": "c1", "parent_type": "post", "parent_id": "p1"}),
            json!({"id": "c1", "parent_type": "post", "parent_id": "p2"}),
        );
        assert_eq!(
            rendered(&map.resolve(&event, None)),
            vec![
                "comments/posts/p2/*",
                "comments/posts/p1/*",
                "posts/detail/p2",
                "posts/detail/p1",
            ]
        );
    }

    #[test]
    fn test_comment_targets_parent_comments_and_detail() {
        let map = InvalidationMap::standard();
        let event = ChangeEvent::insert(
            Table::Comments,
            json!({"id": "c1", "parent_type": "post", "parent_id": "p1"}),
        );
        assert_eq!(
            rendered(&map.resolve(&event, None)),
            vec!["comments/posts/p1/*", "posts/detail/p1"]
        );
    }

    #[test]
    fn test_like_delete_reads_old_row() {
        let map = InvalidationMap::standard();
        let event = ChangeEvent::delete(
            Table::Likes,
            json!({"target_type": "activity", "target_id": 7, "user_id": "u1"}),
        );
        assert_eq!(
            rendered(&map.resolve(&event, None)),
            vec![
                "likes/activities/7/*",
                "likes/user/u1/*",
                "activities/detail/7",
                "activities/list/*",
            ]
        );
    }

    #[test]
    fn test_participants_target_activity() {
        let map = InvalidationMap::standard();
        let event = ChangeEvent::insert(
            Table::ActivityParticipants,
            json!({"activity_id": "a3", "user_id": "u1"}),
        );
        assert_eq!(
            rendered(&map.resolve(&event, None)),
            vec!["activities/participants/a3/*", "activities/detail/a3"]
        );
    }

    #[test]
    fn test_missing_column_yields_no_targets() {
        let map = InvalidationMap::standard();
        let event = ChangeEvent::insert(Table::Comments, json!({"id": "c1"}));
        assert!(map.resolve(&event, None).is_empty());
    }

    #[test]
    fn test_principal_rules_need_a_principal() {
        let map = InvalidationMap::standard();
        let event = ChangeEvent::insert(
            Table::Messages,
            json!({"conversation_id": "c9", "sender_id": "u2", "recipient_id": "u1"}),
        );
        assert_eq!(
            rendered(&map.resolve(&event, None)),
            vec!["messages/conversation/c9/*"]
        );
        assert_eq!(
            rendered(&map.resolve(&event, Some("u1"))),
            vec![
                "messages/conversation/c9/*",
                "messages/conversations/u1/*",
                "messages/unread/u1",
            ]
        );
    }
}
