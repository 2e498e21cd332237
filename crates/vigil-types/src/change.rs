//! Change sets and outbound notification messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Fingerprint;

/// An item that entered or changed in a result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemChange {
    /// Stable identity of the item (its primary key as a string).
    pub id: String,
    /// Zero-based position of the item in the new result.
    pub position: usize,
    /// The item's full content.
    pub data: Value,
}

/// Difference between two evaluations of the same query.
///
/// A change set is never mutated after construction; consumers share it
/// behind an `Arc` or receive their own clone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Items present now but absent before.
    pub added: Vec<ItemChange>,
    /// Items present in both evaluations whose content differs.
    pub changed: Vec<ItemChange>,
    /// Identities present before but absent now.
    pub removed: Vec<String>,
    /// The full new order, set only when surviving items moved.
    pub order: Option<Vec<String>>,
}

impl ChangeSet {
    /// Returns `true` if nothing changed, including order.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.changed.is_empty()
            && self.removed.is_empty()
            && self.order.is_none()
    }

    /// Total number of item-level changes (order excluded).
    pub fn len(&self) -> usize {
        self.added.len() + self.changed.len() + self.removed.len()
    }
}

/// Type of an outbound notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Added,
    Changed,
    Removed,
    Reordered,
    Error,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Changed => "changed",
            Self::Removed => "removed",
            Self::Reordered => "reordered",
            Self::Error => "error",
        }
    }
}

/// One item carried by a notification. Removed items carry only their id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationItem {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<&ItemChange> for NotificationItem {
    fn from(change: &ItemChange) -> Self {
        Self {
            id: change.id.clone(),
            position: Some(change.position),
            data: Some(change.data.clone()),
        }
    }
}

/// A message handed to the transport for exactly one subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub fingerprint: Fingerprint,
    pub subscriber_id: String,
    /// Evaluation sequence number this message reflects.
    pub seq: u64,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    /// Name of the identity column, so clients can match items.
    pub primary_key: String,
    #[serde(default)]
    pub items: Vec<NotificationItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NotificationMessage {
    /// Splits a change set into the ordered burst of messages one subscriber
    /// receives: added, changed, removed, reordered. Empty kinds are skipped.
    pub fn burst(
        fingerprint: &Fingerprint,
        subscriber_id: &str,
        seq: u64,
        primary_key: &str,
        changes: &ChangeSet,
    ) -> Vec<NotificationMessage> {
        let make = |kind, items: Vec<NotificationItem>, order: Option<Vec<String>>| {
            NotificationMessage {
                fingerprint: fingerprint.clone(),
                subscriber_id: subscriber_id.to_string(),
                seq,
                kind,
                primary_key: primary_key.to_string(),
                items,
                order,
                error: None,
            }
        };

        let mut messages = Vec::with_capacity(4);
        if !changes.added.is_empty() {
            messages.push(make(
                NotificationKind::Added,
                changes.added.iter().map(NotificationItem::from).collect(),
                None,
            ));
        }
        if !changes.changed.is_empty() {
            messages.push(make(
                NotificationKind::Changed,
                changes.changed.iter().map(NotificationItem::from).collect(),
                None,
            ));
        }
        if !changes.removed.is_empty() {
            let items = changes
                .removed
                .iter()
                .map(|id| NotificationItem {
                    id: id.clone(),
                    position: None,
                    data: None,
                })
                .collect();
            messages.push(make(NotificationKind::Removed, items, None));
        }
        if let Some(order) = &changes.order {
            messages.push(make(NotificationKind::Reordered, Vec::new(), Some(order.clone())));
        }
        messages
    }

    /// Builds the single `error` message sent when an evaluation fails.
    pub fn error(
        fingerprint: &Fingerprint,
        subscriber_id: &str,
        seq: u64,
        primary_key: &str,
        message: &str,
    ) -> Self {
        Self {
            fingerprint: fingerprint.clone(),
            subscriber_id: subscriber_id.to_string(),
            seq,
            kind: NotificationKind::Error,
            primary_key: primary_key.to_string(),
            items: Vec::new(),
            order: None,
            error: Some(message.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(id: &str, position: usize) -> ItemChange {
        ItemChange {
            id: id.to_string(),
            position,
            data: json!({"id": id}),
        }
    }

    #[test]
    fn empty_change_set() {
        let changes = ChangeSet::default();
        assert!(changes.is_empty());
        assert_eq!(changes.len(), 0);
    }

    #[test]
    fn order_alone_is_not_empty() {
        let changes = ChangeSet {
            order: Some(vec!["2".into(), "1".into()]),
            ..ChangeSet::default()
        };
        assert!(!changes.is_empty());
        assert_eq!(changes.len(), 0);
    }

    #[test]
    fn burst_emits_kinds_in_fixed_order() {
        let fp = Fingerprint::from_hex("ab".repeat(32));
        let changes = ChangeSet {
            added: vec![item("4", 2)],
            changed: vec![],
            removed: vec!["2".into()],
            order: Some(vec!["1".into(), "3".into(), "4".into()]),
        };

        let burst = NotificationMessage::burst(&fp, "sub-1", 7, "id", &changes);
        let kinds: Vec<_> = burst.iter().map(|m| m.kind).collect();
        assert_eq!(
            kinds,
            vec![
                NotificationKind::Added,
                NotificationKind::Removed,
                NotificationKind::Reordered
            ]
        );
        assert!(burst.iter().all(|m| m.seq == 7 && m.subscriber_id == "sub-1"));
        assert_eq!(burst[0].items[0].position, Some(2));
        assert_eq!(burst[1].items[0].data, None);
        assert_eq!(burst[2].order.as_ref().map(Vec::len), Some(3));
    }

    #[test]
    fn message_serialises_type_field() {
        let fp = Fingerprint::from_hex("cd".repeat(32));
        let msg = NotificationMessage::error(&fp, "sub-1", 3, "id", "no such table: items");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["error"], "no such table: items");
        assert!(value.get("order").is_none());
    }
}
