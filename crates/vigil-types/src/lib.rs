//! Shared types for the Vigil reactive query engine.
//!
//! This crate provides the vocabulary used across all Vigil crates: query
//! descriptors and their fingerprints, change events emitted by the
//! persistence layer, change sets produced by evaluation, and the outbound
//! notification messages handed to a transport.
//!
//! No I/O happens here. Everything is plain data that serialises with
//! `serde`, so the same types travel through the database, the HTTP adapter
//! and the transport unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod change;
mod descriptor;

pub use change::{ChangeSet, ItemChange, NotificationItem, NotificationKind, NotificationMessage};
pub use descriptor::{
    DescriptorError, Filter, FilterOp, Fingerprint, Join, OrderBy, QueryDescriptor,
};

/// Prefix shared by every table the engine owns.
///
/// Mutations of these tables are bookkeeping and must never be routed back
/// into the change pipeline.
pub const ENGINE_TABLE_PREFIX: &str = "vigil_";

/// Returns `true` for tables that belong to the engine or to SQLite itself.
pub fn is_engine_table(table: &str) -> bool {
    table.starts_with(ENGINE_TABLE_PREFIX)
        || table.starts_with("_vigil_")
        || table.starts_with("sqlite_")
}

/// Evaluation state of an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObserverStatus {
    /// No evaluation running or queued.
    Idle,
    /// An invalidation arrived and an evaluation is queued.
    Pending,
    /// An evaluation currently holds the observer's lease.
    Running,
    /// The last evaluation failed; not retried until reset.
    Error,
    /// Disabled by the watchdog; not scheduled until reset.
    Stopped,
}

impl ObserverStatus {
    /// Returns the canonical string label stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }

    /// Returns `true` if the observer must not be scheduled until reset.
    pub fn is_halted(self) -> bool {
        matches!(self, Self::Error | Self::Stopped)
    }
}

impl std::fmt::Display for ObserverStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ObserverStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "error" => Ok(Self::Error),
            "stopped" => Ok(Self::Stopped),
            _ => Err(ParseStatusError(s.to_string())),
        }
    }
}

/// Error returned when parsing an unknown observer status string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown observer status: {0}")]
pub struct ParseStatusError(pub String);

/// Kind of committed mutation reported by the persistence layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    /// Rows were inserted.
    Insert,
    /// Rows were updated.
    Update,
    /// Rows were deleted.
    Delete,
}

impl ChangeOperation {
    /// Returns the canonical string label for this operation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// A committed mutation batch against one table.
///
/// Produced by the persistence layer's post-commit hook, never before the
/// mutating transaction commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// The mutated table.
    pub table: String,
    /// What kind of mutation happened.
    pub operation: ChangeOperation,
    /// Primary keys of the affected rows, when known.
    #[serde(default)]
    pub affected_keys: Vec<String>,
    /// Commit time of the batch.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    /// Creates an event stamped with the current time.
    pub fn new(table: impl Into<String>, operation: ChangeOperation, affected_keys: Vec<String>) -> Self {
        Self {
            table: table.into(),
            operation,
            affected_keys,
            timestamp: Utc::now(),
        }
    }
}

/// Operator-facing view of one observer, returned by the status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObserverState {
    /// The observer's fingerprint.
    pub fingerprint: Fingerprint,
    /// The observed relation.
    pub relation: String,
    /// Current evaluation state.
    pub status: ObserverStatus,
    /// When the last evaluation finished, if ever.
    pub last_evaluated_at: Option<DateTime<Utc>>,
    /// Number of subscribers currently linked.
    pub subscriber_count: u64,
    /// Errors since the last successful evaluation.
    pub consecutive_error_count: u64,
    /// Sequence number of the last published state.
    pub evaluation_seq: u64,
    /// Tables the last evaluation depended on.
    pub dependencies: Vec<String>,
    /// Message of the last evaluation error, if any.
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for status in [
            ObserverStatus::Idle,
            ObserverStatus::Pending,
            ObserverStatus::Running,
            ObserverStatus::Error,
            ObserverStatus::Stopped,
        ] {
            let parsed: ObserverStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn status_invalid() {
        assert!("paused".parse::<ObserverStatus>().is_err());
        assert!("".parse::<ObserverStatus>().is_err());
    }

    #[test]
    fn halted_statuses() {
        assert!(ObserverStatus::Error.is_halted());
        assert!(ObserverStatus::Stopped.is_halted());
        assert!(!ObserverStatus::Pending.is_halted());
        assert!(!ObserverStatus::Idle.is_halted());
    }

    #[test]
    fn engine_tables_are_recognised() {
        assert!(is_engine_table("vigil_observers"));
        assert!(is_engine_table("_vigil_migrations"));
        assert!(is_engine_table("sqlite_sequence"));
        assert!(!is_engine_table("items"));
        assert!(!is_engine_table("vigilance"));
    }

    #[test]
    fn change_event_deserialises_without_timestamp() {
        let event: ChangeEvent =
            serde_json::from_str(r#"{"table":"items","operation":"update"}"#).unwrap();
        assert_eq!(event.table, "items");
        assert_eq!(event.operation, ChangeOperation::Update);
        assert!(event.affected_keys.is_empty());
    }
}
