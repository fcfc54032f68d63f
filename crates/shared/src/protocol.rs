//! Change-stream protocol: what a subscriber asks for and what it receives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::models::Table;

/// A row as delivered by the change stream.
pub type Row = Map<String, Value>;

/// Row-level event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub const ALL: [ChangeKind; 3] = [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which event types a subscription receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventFilter {
    All,
    Only(ChangeKind),
}

impl EventFilter {
    pub fn matches(&self, kind: ChangeKind) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Only(k) => *k == kind,
        }
    }
}

/// Equality filter on one or more columns, satisfied when any listed column
/// (in either the new or the old row image) equals `value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFilter {
    pub columns: Vec<String>,
    pub value: String,
}

impl RowFilter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            columns: vec![column.into()],
            value: value.into(),
        }
    }

    pub fn any_of<I, S>(columns: I, value: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            value: value.into(),
        }
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        self.columns
            .iter()
            .any(|column| event.touches(column, &self.value))
    }
}

/// A subscription request for one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSpec {
    pub table: Table,
    pub events: EventFilter,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_filter: Option<RowFilter>,
}

impl SubscriptionSpec {
    pub fn all_events(table: Table) -> Self {
        Self {
            table,
            events: EventFilter::All,
            row_filter: None,
        }
    }

    pub fn with_row_filter(mut self, filter: RowFilter) -> Self {
        self.row_filter = Some(filter);
        self
    }

    /// Whether `event` should be delivered under this spec.
    pub fn accepts(&self, event: &ChangeEvent) -> bool {
        event.table == self.table
            && self.events.matches(event.kind)
            && self.row_filter.as_ref().map_or(true, |f| f.matches(event))
    }
}

/// One row-level change published by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub id: Uuid,
    pub table: Table,
    pub kind: ChangeKind,
    /// Row image after the change (absent for deletes).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new: Option<Row>,
    /// Row image before the change (absent for inserts).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<Row>,
    pub committed_at: DateTime<Utc>,
}

impl ChangeEvent {
    fn build(table: Table, kind: ChangeKind, new: Option<Value>, old: Option<Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            table,
            kind,
            new: new.map(into_row),
            old: old.map(into_row),
            committed_at: Utc::now(),
        }
    }

    pub fn insert(table: Table, row: Value) -> Self {
        Self::build(table, ChangeKind::Insert, Some(row), None)
    }

    pub fn update(table: Table, old: Value, new: Value) -> Self {
        Self::build(table, ChangeKind::Update, Some(new), Some(old))
    }

    pub fn delete(table: Table, old: Value) -> Self {
        Self::build(table, ChangeKind::Delete, None, Some(old))
    }

    /// Read a column as a string, preferring the new row image.
    /// Numbers are rendered in decimal; other JSON types yield `None`.
    pub fn field(&self, column: &str) -> Option<String> {
        self.new
            .as_ref()
            .and_then(|row| column_as_string(row, column))
            .or_else(|| self.old.as_ref().and_then(|row| column_as_string(row, column)))
    }

    /// The pre-update row as an event of its own, for updates that carry an
    /// old image. Targets resolved from it cover a row that moved away from
    /// its previous parent.
    pub fn previous_image(&self) -> Option<ChangeEvent> {
        if self.kind != ChangeKind::Update {
            return None;
        }
        let old = self.old.clone()?;
        Some(Self {
            new: None,
            old: Some(old),
            ..self.clone()
        })
    }

    /// True when `column` equals `value` in either row image.
    pub fn touches(&self, column: &str, value: &str) -> bool {
        [self.new.as_ref(), self.old.as_ref()]
            .into_iter()
            .flatten()
            .any(|row| column_as_string(row, column).as_deref() == Some(value))
    }
}

fn into_row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

fn column_as_string(row: &Row, column: &str) -> Option<String> {
    match row.get(column)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_prefers_new_image() {
        let event = ChangeEvent::update(
            Table::Posts,
            json!({"id": "p1", "title": "old"}),
            json!({"id": "p1", "title": "new"}),
        );
        assert_eq!(event.field("title").as_deref(), Some("new"));
        assert_eq!(event.field("missing"), None);
    }

    #[test]
    fn test_previous_image_only_for_updates_with_old_row() {
        let moved = ChangeEvent::update(
            Table::Comments,
            json!({"id": "c1", "parent_id": "p1"}),
            json!({"id": "c1", "parent_id": "p2"}),
        );
        let previous = moved.previous_image().unwrap();
        assert_eq!(previous.field("parent_id").as_deref(), Some("p1"));
        assert_eq!(previous.id, moved.id);
        assert_eq!(previous.kind, ChangeKind::Update);

        let inserted = ChangeEvent::insert(Table::Comments, json!({"id": "c2"}));
        assert!(inserted.previous_image().is_none());
        let deleted = ChangeEvent::delete(Table::Comments, json!({"id": "c3"}));
        assert!(deleted.previous_image().is_none());
    }

    #[test]
    fn test_delete_reads_old_image() {
        let event = ChangeEvent::delete(Table::Comments, json!({"id": 42, "parent_id": "p1"}));
        assert_eq!(event.field("id").as_deref(), Some("42"));
        assert!(event.touches("parent_id", "p1"));
    }

    #[test]
    fn test_row_filter_matches_any_column() {
        let filter = RowFilter::any_of(["sender_id", "recipient_id"], "u1");
        let inbound = ChangeEvent::insert(
            Table::Messages,
            json!({"sender_id": "u2", "recipient_id": "u1"}),
        );
        let unrelated = ChangeEvent::insert(
            Table::Messages,
            json!({"sender_id": "u2", "recipient_id": "u3"}),
        );
        assert!(filter.matches(&inbound));
        assert!(!filter.matches(&unrelated));
    }

    #[test]
    fn test_spec_accepts_checks_table_kind_and_rows() {
        let spec = SubscriptionSpec {
            table: Table::Likes,
            events: EventFilter::Only(ChangeKind::Insert),
            row_filter: None,
        };
        assert!(spec.accepts(&ChangeEvent::insert(Table::Likes, json!({}))));
        assert!(!spec.accepts(&ChangeEvent::delete(Table::Likes, json!({}))));
        assert!(!spec.accepts(&ChangeEvent::insert(Table::Bookmarks, json!({}))));
    }
}
