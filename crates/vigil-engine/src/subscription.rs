//! Subscription table: many-to-many subscriber to observer links with
//! per-link delivery state.
//!
//! `last_delivered_seq` records the newest evaluation a subscriber has seen,
//! either through its subscribe response or through a notification. The
//! publisher only ever moves it forward.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use vigil_types::Fingerprint;

use crate::error::EngineError;

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Creates the subscriber if absent. Metadata is replaced when given.
pub fn ensure_subscriber(
    conn: &Connection,
    subscriber_id: &str,
    metadata: Option<&Value>,
) -> Result<(), EngineError> {
    let metadata_json = metadata.map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO vigil_subscribers (subscriber_id, metadata_json) VALUES (?1, ?2)
         ON CONFLICT(subscriber_id) DO UPDATE
         SET metadata_json = COALESCE(excluded.metadata_json, vigil_subscribers.metadata_json)",
        params![subscriber_id, metadata_json],
    )?;
    Ok(())
}

/// Links a subscriber to an observer at `seq`. Idempotent; a repeated link
/// only moves the delivery mark forward. Returns `true` for a new link.
pub fn link(
    conn: &Connection,
    fingerprint: &Fingerprint,
    subscriber_id: &str,
    seq: u64,
) -> Result<bool, EngineError> {
    let existed: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM vigil_subscriptions WHERE fingerprint = ?1 AND subscriber_id = ?2)",
        params![fingerprint.as_str(), subscriber_id],
        |row| row.get(0),
    )?;
    conn.execute(
        "INSERT INTO vigil_subscriptions (fingerprint, subscriber_id, last_delivered_seq)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(fingerprint, subscriber_id) DO UPDATE
         SET last_delivered_seq = MAX(vigil_subscriptions.last_delivered_seq, excluded.last_delivered_seq)",
        params![fingerprint.as_str(), subscriber_id, to_i64(seq)],
    )?;
    Ok(!existed)
}

/// Outcome of removing one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unlinked {
    /// Whether a link existed.
    pub removed: bool,
    /// Subscribers the observer still has.
    pub remaining: u64,
}

/// Removes a link. A no-op when the link does not exist.
pub fn unlink(
    conn: &Connection,
    fingerprint: &Fingerprint,
    subscriber_id: &str,
) -> Result<Unlinked, EngineError> {
    let removed = conn.execute(
        "DELETE FROM vigil_subscriptions WHERE fingerprint = ?1 AND subscriber_id = ?2",
        params![fingerprint.as_str(), subscriber_id],
    )? == 1;
    let remaining = subscriber_count(conn, fingerprint)?;
    Ok(Unlinked { removed, remaining })
}

/// Deletes a subscriber with all its links. Returns the observers that were
/// left without any subscriber, or `None` if the subscriber did not exist.
pub fn remove_subscriber(
    conn: &Connection,
    subscriber_id: &str,
) -> Result<Option<Vec<Fingerprint>>, EngineError> {
    let fingerprints = fingerprints_of(conn, subscriber_id)?;
    let deleted = conn.execute(
        "DELETE FROM vigil_subscribers WHERE subscriber_id = ?1",
        [subscriber_id],
    )?;
    if deleted == 0 {
        return Ok(None);
    }
    // With foreign keys enabled the cascade already removed the links.
    conn.execute(
        "DELETE FROM vigil_subscriptions WHERE subscriber_id = ?1",
        [subscriber_id],
    )?;

    let mut orphaned = Vec::new();
    for fingerprint in fingerprints {
        if subscriber_count(conn, &fingerprint)? == 0 {
            orphaned.push(fingerprint);
        }
    }
    Ok(Some(orphaned))
}

pub fn subscriber_count(conn: &Connection, fingerprint: &Fingerprint) -> Result<u64, EngineError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM vigil_subscriptions WHERE fingerprint = ?1",
        [fingerprint.as_str()],
        |row| row.get(0),
    )?;
    Ok(u64::try_from(count).unwrap_or(0))
}

pub fn subscribers(conn: &Connection, fingerprint: &Fingerprint) -> Result<Vec<String>, EngineError> {
    let mut stmt = conn.prepare_cached(
        "SELECT subscriber_id FROM vigil_subscriptions WHERE fingerprint = ?1 ORDER BY subscriber_id",
    )?;
    let ids = stmt
        .query_map([fingerprint.as_str()], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

pub fn fingerprints_of(conn: &Connection, subscriber_id: &str) -> Result<Vec<Fingerprint>, EngineError> {
    let mut stmt = conn.prepare_cached(
        "SELECT fingerprint FROM vigil_subscriptions WHERE subscriber_id = ?1 ORDER BY fingerprint",
    )?;
    let fingerprints = stmt
        .query_map([subscriber_id], |row| row.get::<_, String>(0).map(Fingerprint::from_hex))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(fingerprints)
}

pub fn last_delivered(
    conn: &Connection,
    fingerprint: &Fingerprint,
    subscriber_id: &str,
) -> Result<Option<u64>, EngineError> {
    let seq: Option<i64> = conn
        .query_row(
            "SELECT last_delivered_seq FROM vigil_subscriptions WHERE fingerprint = ?1 AND subscriber_id = ?2",
            params![fingerprint.as_str(), subscriber_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(seq.map(|s| u64::try_from(s).unwrap_or(0)))
}

/// Claims every subscriber that has not yet seen `seq` and marks it as
/// delivered. Read at publish time, so subscribers who joined during the
/// evaluation are included unless their subscribe response already carried
/// this state.
pub fn claim_recipients(
    conn: &Connection,
    fingerprint: &Fingerprint,
    seq: u64,
) -> Result<Vec<String>, EngineError> {
    let mut stmt = conn.prepare_cached(
        "UPDATE vigil_subscriptions SET last_delivered_seq = ?2
         WHERE fingerprint = ?1 AND last_delivered_seq < ?2
         RETURNING subscriber_id",
    )?;
    let mut recipients = stmt
        .query_map(params![fingerprint.as_str(), to_i64(seq)], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    recipients.sort();
    Ok(recipients)
}
