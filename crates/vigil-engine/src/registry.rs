//! Observer registry: persistent observer records, their dependency sets and
//! last snapshots.
//!
//! Observers are keyed by fingerprint, so concurrent creation of the same
//! query from several workers or processes converges on one row: the losing
//! insert is ignored and the caller reads the winner's record.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use vigil_types::{Fingerprint, ObserverState, ObserverStatus, QueryDescriptor};

use crate::diff::{Snapshot, SnapshotItem};
use crate::error::EngineError;

/// A stored observer.
#[derive(Debug, Clone, PartialEq)]
pub struct ObserverRecord {
    pub fingerprint: Fingerprint,
    pub descriptor: QueryDescriptor,
    pub status: ObserverStatus,
    pub evaluation_seq: u64,
    pub last_evaluated_at: Option<DateTime<Utc>>,
    pub consecutive_error_count: u64,
    pub last_error: Option<String>,
}

fn to_u64(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn parse_time(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn parse_status(raw: &str) -> ObserverStatus {
    raw.parse().unwrap_or_else(|e| {
        tracing::warn!("{}, treating as idle", e);
        ObserverStatus::Idle
    })
}

const RECORD_COLUMNS: &str = "fingerprint, descriptor_json, status, evaluation_seq, \
     last_evaluated_at, consecutive_error_count, last_error";

struct RawRecord {
    fingerprint: String,
    descriptor_json: String,
    status: String,
    evaluation_seq: i64,
    last_evaluated_at: Option<String>,
    consecutive_error_count: i64,
    last_error: Option<String>,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            fingerprint: row.get(0)?,
            descriptor_json: row.get(1)?,
            status: row.get(2)?,
            evaluation_seq: row.get(3)?,
            last_evaluated_at: row.get(4)?,
            consecutive_error_count: row.get(5)?,
            last_error: row.get(6)?,
        })
    }

    fn decode(self) -> Result<ObserverRecord, EngineError> {
        Ok(ObserverRecord {
            fingerprint: Fingerprint::from_hex(self.fingerprint),
            descriptor: serde_json::from_str(&self.descriptor_json)?,
            status: parse_status(&self.status),
            evaluation_seq: to_u64(self.evaluation_seq),
            last_evaluated_at: parse_time(self.last_evaluated_at),
            consecutive_error_count: to_u64(self.consecutive_error_count),
            last_error: self.last_error,
        })
    }
}

/// Loads an observer by fingerprint.
///
/// # Errors
///
/// Returns `EngineError::Database` on SQL failure or
/// `EngineError::Serialization` if the stored descriptor is corrupt.
pub fn load(conn: &Connection, fingerprint: &Fingerprint) -> Result<Option<ObserverRecord>, EngineError> {
    conn.query_row(
        &format!("SELECT {RECORD_COLUMNS} FROM vigil_observers WHERE fingerprint = ?1"),
        [fingerprint.as_str()],
        RawRecord::from_row,
    )
    .optional()?
    .map(RawRecord::decode)
    .transpose()
}

/// Inserts the observer unless it already exists. Returns `true` if this
/// call created it.
pub fn insert_if_absent(
    conn: &Connection,
    fingerprint: &Fingerprint,
    descriptor: &QueryDescriptor,
) -> Result<bool, EngineError> {
    let descriptor_json = serde_json::to_string(descriptor)?;
    let inserted = conn.execute(
        "INSERT INTO vigil_observers (fingerprint, descriptor_json) VALUES (?1, ?2)
         ON CONFLICT(fingerprint) DO NOTHING",
        params![fingerprint.as_str(), descriptor_json],
    )?;
    Ok(inserted == 1)
}

/// Returns the observer for `fingerprint`, creating it from `descriptor` if
/// needed, and whether this call created it.
///
/// Run it inside an immediate transaction: a concurrent creator then either
/// commits first, and this call reads its row, or waits for the write lock.
/// Lock contention surfaces as a transient error for the caller's retry.
pub fn get_or_create(
    conn: &Connection,
    fingerprint: &Fingerprint,
    descriptor: &QueryDescriptor,
) -> Result<(ObserverRecord, bool), EngineError> {
    let created = insert_if_absent(conn, fingerprint, descriptor)?;
    let record = load(conn, fingerprint)?.ok_or_else(|| EngineError::ObserverNotFound(fingerprint.clone()))?;
    Ok((record, created))
}

pub fn set_status(
    conn: &Connection,
    fingerprint: &Fingerprint,
    status: ObserverStatus,
) -> Result<bool, EngineError> {
    let updated = conn.execute(
        "UPDATE vigil_observers SET status = ?2 WHERE fingerprint = ?1",
        params![fingerprint.as_str(), status.as_str()],
    )?;
    Ok(updated == 1)
}

/// Puts an observer left `running` by an aborted evaluation back to idle.
pub fn clear_running(conn: &Connection, fingerprint: &Fingerprint) -> Result<bool, EngineError> {
    let updated = conn.execute(
        "UPDATE vigil_observers SET status = 'idle' WHERE fingerprint = ?1 AND status = 'running'",
        [fingerprint.as_str()],
    )?;
    Ok(updated == 1)
}

/// Records a successful evaluation. When `advance` is set the sequence
/// number is incremented. Returns the current sequence number.
pub fn record_success(
    conn: &Connection,
    fingerprint: &Fingerprint,
    advance: bool,
) -> Result<u64, EngineError> {
    let seq: i64 = conn.query_row(
        "UPDATE vigil_observers
         SET status = 'idle',
             evaluation_seq = evaluation_seq + ?2,
             last_evaluated_at = ?3,
             consecutive_error_count = 0,
             last_error = NULL
         WHERE fingerprint = ?1
         RETURNING evaluation_seq",
        params![fingerprint.as_str(), i64::from(advance), now_rfc3339()],
        |row| row.get(0),
    )?;
    Ok(to_u64(seq))
}

/// Records a failed or killed evaluation and advances the sequence number.
pub fn record_failure(
    conn: &Connection,
    fingerprint: &Fingerprint,
    status: ObserverStatus,
    message: &str,
) -> Result<u64, EngineError> {
    let seq: i64 = conn.query_row(
        "UPDATE vigil_observers
         SET status = ?2,
             evaluation_seq = evaluation_seq + 1,
             last_evaluated_at = ?3,
             consecutive_error_count = consecutive_error_count + 1,
             last_error = ?4
         WHERE fingerprint = ?1
         RETURNING evaluation_seq",
        params![fingerprint.as_str(), status.as_str(), now_rfc3339(), message],
        |row| row.get(0),
    )?;
    Ok(to_u64(seq))
}

/// Returns a halted observer to idle. Returns `false` if it was not halted.
pub fn reset(conn: &Connection, fingerprint: &Fingerprint) -> Result<bool, EngineError> {
    let updated = conn.execute(
        "UPDATE vigil_observers
         SET status = 'idle', consecutive_error_count = 0, last_error = NULL
         WHERE fingerprint = ?1 AND status IN ('error', 'stopped')",
        [fingerprint.as_str()],
    )?;
    Ok(updated == 1)
}

pub fn dependencies(conn: &Connection, fingerprint: &Fingerprint) -> Result<BTreeSet<String>, EngineError> {
    let mut stmt = conn.prepare_cached(
        "SELECT table_name FROM vigil_dependencies WHERE fingerprint = ?1",
    )?;
    let tables = stmt
        .query_map([fingerprint.as_str()], |row| row.get(0))?
        .collect::<Result<BTreeSet<String>, _>>()?;
    Ok(tables)
}

/// Stores a new dependency set. Returns `true` if it differed.
pub fn replace_dependencies(
    conn: &Connection,
    fingerprint: &Fingerprint,
    tables: &BTreeSet<String>,
) -> Result<bool, EngineError> {
    if dependencies(conn, fingerprint)? == *tables {
        return Ok(false);
    }
    conn.execute(
        "DELETE FROM vigil_dependencies WHERE fingerprint = ?1",
        [fingerprint.as_str()],
    )?;
    let mut insert = conn.prepare_cached(
        "INSERT INTO vigil_dependencies (fingerprint, table_name) VALUES (?1, ?2)",
    )?;
    for table in tables {
        insert.execute(params![fingerprint.as_str(), table])?;
    }
    Ok(true)
}

/// Dependency sets of every observer that should be routed: subscribed and
/// not halted. Observers without stored dependencies map to an empty set.
pub fn active_dependencies(conn: &Connection) -> Result<HashMap<Fingerprint, BTreeSet<String>>, EngineError> {
    let mut stmt = conn.prepare_cached(
        "SELECT o.fingerprint, d.table_name
         FROM vigil_observers o
         LEFT JOIN vigil_dependencies d ON d.fingerprint = o.fingerprint
         WHERE o.status NOT IN ('error', 'stopped')
           AND EXISTS (SELECT 1 FROM vigil_subscriptions s WHERE s.fingerprint = o.fingerprint)",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
    })?;

    let mut active: HashMap<Fingerprint, BTreeSet<String>> = HashMap::new();
    for row in rows {
        let (fingerprint, table) = row?;
        let tables = active.entry(Fingerprint::from_hex(fingerprint)).or_default();
        tables.extend(table);
    }
    Ok(active)
}

/// Subscribed, schedulable observers that depend on any of `tables`.
pub fn mark_impacted(conn: &Connection, tables: &[&str]) -> Result<BTreeSet<Fingerprint>, EngineError> {
    let mut stmt = conn.prepare_cached(
        "SELECT DISTINCT d.fingerprint
         FROM vigil_dependencies d
         JOIN vigil_observers o ON o.fingerprint = d.fingerprint
         WHERE d.table_name = ?1
           AND o.status NOT IN ('error', 'stopped')
           AND EXISTS (SELECT 1 FROM vigil_subscriptions s WHERE s.fingerprint = d.fingerprint)",
    )?;
    let mut impacted = BTreeSet::new();
    for table in tables {
        let rows = stmt.query_map([table], |row| row.get::<_, String>(0))?;
        for fingerprint in rows {
            impacted.insert(Fingerprint::from_hex(fingerprint?));
        }
    }
    Ok(impacted)
}

pub fn load_snapshot(conn: &Connection, fingerprint: &Fingerprint) -> Result<Snapshot, EngineError> {
    let mut stmt = conn.prepare_cached(
        "SELECT item_id, checksum, data_json FROM vigil_items
         WHERE fingerprint = ?1 ORDER BY position",
    )?;
    let rows = stmt
        .query_map([fingerprint.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut items = Vec::with_capacity(rows.len());
    for (id, checksum, data_json) in rows {
        items.push(SnapshotItem {
            id,
            checksum,
            data: serde_json::from_str(&data_json)?,
        });
    }
    Ok(Snapshot { items })
}

pub fn store_snapshot(
    conn: &Connection,
    fingerprint: &Fingerprint,
    snapshot: &Snapshot,
) -> Result<(), EngineError> {
    conn.execute("DELETE FROM vigil_items WHERE fingerprint = ?1", [fingerprint.as_str()])?;
    let mut insert = conn.prepare_cached(
        "INSERT INTO vigil_items (fingerprint, item_id, position, checksum, data_json)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for (position, item) in snapshot.items.iter().enumerate() {
        insert.execute(params![
            fingerprint.as_str(),
            item.id,
            to_i64(position),
            item.checksum,
            serde_json::to_string(&item.data)?,
        ])?;
    }
    Ok(())
}

/// Operator view of every observer, newest first.
pub fn list_states(conn: &Connection) -> Result<Vec<ObserverState>, EngineError> {
    let mut stmt = conn.prepare_cached(
        "SELECT o.fingerprint, o.descriptor_json, o.status, o.evaluation_seq,
                o.last_evaluated_at, o.consecutive_error_count, o.last_error,
                (SELECT COUNT(*) FROM vigil_subscriptions s WHERE s.fingerprint = o.fingerprint)
         FROM vigil_observers o
         ORDER BY o.created_at DESC, o.fingerprint",
    )?;
    let rows = stmt
        .query_map([], |row| Ok((RawRecord::from_row(row)?, row.get::<_, i64>(7)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut states = Vec::with_capacity(rows.len());
    for (raw, subscribers) in rows {
        let record = raw.decode()?;
        states.push(ObserverState {
            dependencies: dependencies(conn, &record.fingerprint)?.into_iter().collect(),
            fingerprint: record.fingerprint,
            relation: record.descriptor.relation,
            status: record.status,
            last_evaluated_at: record.last_evaluated_at,
            subscriber_count: to_u64(subscribers),
            consecutive_error_count: record.consecutive_error_count,
            evaluation_seq: record.evaluation_seq,
            last_error: record.last_error,
        });
    }
    Ok(states)
}

/// Deletes observers that have no subscribers and no live lease. Returns the
/// fingerprints removed.
pub fn reclaim(conn: &Connection, now_ms: i64) -> Result<Vec<Fingerprint>, EngineError> {
    let mut stmt = conn.prepare_cached(
        "DELETE FROM vigil_observers
         WHERE NOT EXISTS (SELECT 1 FROM vigil_subscriptions s WHERE s.fingerprint = vigil_observers.fingerprint)
           AND NOT EXISTS (SELECT 1 FROM vigil_leases l
                           WHERE l.fingerprint = vigil_observers.fingerprint AND l.expires_at_ms > ?1)
         RETURNING fingerprint",
    )?;
    let removed = stmt
        .query_map([now_ms], |row| row.get::<_, String>(0).map(Fingerprint::from_hex))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(removed)
}

/// Counts removed by [`clear_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ClearReport {
    pub observers: usize,
    pub subscribers: usize,
}

/// Deletes every observer, subscriber, link, snapshot and lease.
pub fn clear_all(conn: &mut Connection) -> Result<ClearReport, EngineError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let observers = tx.execute("DELETE FROM vigil_observers", [])?;
    let subscribers = tx.execute("DELETE FROM vigil_subscribers", [])?;
    // Cascades cover the rest; these catch rows orphaned with foreign keys off.
    for table in ["vigil_subscriptions", "vigil_dependencies", "vigil_items", "vigil_leases"] {
        tx.execute(&format!("DELETE FROM {table}"), [])?;
    }
    tx.commit()?;
    Ok(ClearReport {
        observers,
        subscribers,
    })
}
