//! Result snapshots and the diff between two of them.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use sha2::{Digest, Sha256};
use vigil_types::{ChangeSet, ItemChange};

/// One item of a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotItem {
    pub id: String,
    pub checksum: String,
    pub data: Value,
}

impl SnapshotItem {
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            checksum: checksum(&data),
            data,
        }
    }
}

/// Ordered identities of a result with per-item content checksums.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub items: Vec<SnapshotItem>,
}

impl Snapshot {
    /// Builds a snapshot from result rows.
    ///
    /// Rows whose identity cannot be coerced to a string are skipped. When
    /// two rows share an identity only the first is kept.
    pub fn from_rows(rows: Vec<Value>, identity_column: &str) -> Self {
        let mut seen = HashSet::with_capacity(rows.len());
        let mut items = Vec::with_capacity(rows.len());

        for (position, row) in rows.into_iter().enumerate() {
            let Some(id) = row.get(identity_column).and_then(coerce_identity) else {
                tracing::warn!(
                    position,
                    column = identity_column,
                    "skipping row without a usable identity"
                );
                continue;
            };
            if !seen.insert(id.clone()) {
                tracing::warn!(id = %id, "duplicate identity in result, keeping first");
                continue;
            }
            items.push(SnapshotItem::new(id, row));
        }

        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|item| item.id.as_str())
    }
}

/// Canonical string form of an identity value.
///
/// Strings pass through, numbers and booleans use their JSON text. Null and
/// composite values have no canonical form.
pub fn coerce_identity(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Hex SHA-256 of the item's JSON encoding. Object keys are sorted, so equal
/// content always hashes equally.
pub fn checksum(data: &Value) -> String {
    let mut hasher = Sha256::new();
    // Writing into a hasher cannot fail.
    let _ = serde_json::to_writer(&mut hasher, data);
    hex::encode(hasher.finalize())
}

/// Computes the change set that turns `old` into `new`.
///
/// `order` is set when any item present in both snapshots sits at a
/// different index, and then holds the complete new order.
pub fn diff(old: &Snapshot, new: &Snapshot) -> ChangeSet {
    let previous: HashMap<&str, (usize, &str)> = old
        .items
        .iter()
        .enumerate()
        .map(|(pos, item)| (item.id.as_str(), (pos, item.checksum.as_str())))
        .collect();
    let current: HashSet<&str> = new.ids().collect();

    let mut changes = ChangeSet::default();
    let mut moved = false;

    for (position, item) in new.items.iter().enumerate() {
        match previous.get(item.id.as_str()) {
            None => changes.added.push(ItemChange {
                id: item.id.clone(),
                position,
                data: item.data.clone(),
            }),
            Some((old_position, old_checksum)) => {
                moved |= *old_position != position;
                if *old_checksum != item.checksum {
                    changes.changed.push(ItemChange {
                        id: item.id.clone(),
                        position,
                        data: item.data.clone(),
                    });
                }
            }
        }
    }

    changes.removed = old
        .ids()
        .filter(|id| !current.contains(id))
        .map(str::to_string)
        .collect();

    if moved {
        changes.order = Some(new.ids().map(str::to_string).collect());
    }

    changes
}
