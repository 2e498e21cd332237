//! Per-observer evaluation leases.
//!
//! A lease row in `vigil_leases` grants one holder the exclusive right to
//! evaluate an observer. Every process sharing the database competes for
//! the same rows, so exclusivity holds across process boundaries. Leases
//! expire so a crashed holder never wedges an observer.

use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection};
use vigil_types::Fingerprint;

use crate::error::EngineError;
use crate::retry::RetryPolicy;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// A held lease. Release it with [`Lease::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    fingerprint: Fingerprint,
    holder: String,
}

impl Lease {
    /// Attempts a single compare-and-swap acquisition: insert the lease, or
    /// take over one that expired. Returns `Ok(None)` if it is held.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Database`, e.g. a foreign key violation when the
    /// observer row does not exist.
    pub fn try_acquire(
        conn: &Connection,
        fingerprint: &Fingerprint,
        ttl: Duration,
    ) -> Result<Option<Self>, EngineError> {
        let holder = uuid::Uuid::new_v4().to_string();
        let now = now_ms();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let acquired = conn.execute(
            "INSERT INTO vigil_leases (fingerprint, holder, expires_at_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(fingerprint) DO UPDATE
             SET holder = excluded.holder, expires_at_ms = excluded.expires_at_ms
             WHERE vigil_leases.expires_at_ms <= ?4",
            params![fingerprint.as_str(), holder, now.saturating_add(ttl_ms), now],
        )?;

        if acquired == 1 {
            Ok(Some(Self {
                fingerprint: fingerprint.clone(),
                holder,
            }))
        } else {
            Ok(None)
        }
    }

    /// Acquires with retries on transient conflicts.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Busy`] if another holder has the lease and
    /// [`EngineError::TransientFailure`] when conflicts outlast `retry`.
    pub fn acquire(
        conn: &Connection,
        fingerprint: &Fingerprint,
        ttl: Duration,
        retry: &RetryPolicy,
    ) -> Result<Self, EngineError> {
        retry
            .run(|| Self::try_acquire(conn, fingerprint, ttl))?
            .ok_or(EngineError::Busy)
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Returns `true` while this lease is recorded for its holder and has
    /// not expired. Once expired it may be taken over at any moment, so a
    /// result computed under it must be discarded.
    pub fn is_held(&self, conn: &Connection) -> Result<bool, EngineError> {
        let held = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM vigil_leases
                           WHERE fingerprint = ?1 AND holder = ?2 AND expires_at_ms > ?3)",
            params![self.fingerprint.as_str(), self.holder, now_ms()],
            |row| row.get(0),
        )?;
        Ok(held)
    }

    /// Releases the lease if this holder still owns it.
    pub fn release(self, conn: &Connection) -> Result<bool, EngineError> {
        let deleted = conn.execute(
            "DELETE FROM vigil_leases WHERE fingerprint = ?1 AND holder = ?2",
            params![self.fingerprint.as_str(), self.holder],
        )?;
        Ok(deleted == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_types::QueryDescriptor;

    use crate::test_support::{get_or_create, test_pool};

    const TTL: Duration = Duration::from_secs(30);

    fn observer(pool: &vigil_db::DbPool) -> Fingerprint {
        get_or_create(pool, &QueryDescriptor::new("items"), &RetryPolicy::default())
            .unwrap()
            .0
            .fingerprint
    }

    #[test]
    fn second_acquire_is_busy_until_release() {
        let (_dir, pool) = test_pool();
        let fp = observer(&pool);
        let conn = pool.get().unwrap();
        let retry = RetryPolicy::default();

        let lease = Lease::acquire(&conn, &fp, TTL, &retry).unwrap();
        assert!(matches!(
            Lease::acquire(&conn, &fp, TTL, &retry),
            Err(EngineError::Busy)
        ));
        assert!(lease.is_held(&conn).unwrap());
        assert!(lease.release(&conn).unwrap());

        let again = Lease::acquire(&conn, &fp, TTL, &retry).unwrap();
        assert!(again.is_held(&conn).unwrap());
    }

    #[test]
    fn expired_lease_is_taken_over() {
        let (_dir, pool) = test_pool();
        let fp = observer(&pool);
        let conn = pool.get().unwrap();

        let stale = Lease::try_acquire(&conn, &fp, Duration::ZERO).unwrap().unwrap();
        let fresh = Lease::try_acquire(&conn, &fp, TTL).unwrap().unwrap();
        assert_ne!(stale.holder(), fresh.holder());

        assert!(!stale.is_held(&conn).unwrap());
        assert!(!stale.release(&conn).unwrap(), "stale holder cannot release");
        assert!(fresh.is_held(&conn).unwrap());
    }

    #[test]
    fn expired_lease_is_no_longer_held() {
        let (_dir, pool) = test_pool();
        let fp = observer(&pool);
        let conn = pool.get().unwrap();

        let lease = Lease::try_acquire(&conn, &fp, Duration::from_millis(20)).unwrap().unwrap();
        assert!(lease.is_held(&conn).unwrap());
        std::thread::sleep(Duration::from_millis(40));
        assert!(!lease.is_held(&conn).unwrap(), "expired before anyone took over");
    }

    #[test]
    fn missing_observer_exhausts_retries() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();
        let retry = RetryPolicy::new(2, Duration::from_millis(1));
        let ghost = Fingerprint::from_hex("00".repeat(32));

        assert!(matches!(
            Lease::acquire(&conn, &ghost, TTL, &retry),
            Err(EngineError::TransientFailure { attempts: 2 })
        ));
    }

    #[test]
    fn only_one_thread_wins() {
        let (_dir, pool) = test_pool();
        let fp = observer(&pool);

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let pool = pool.clone();
                let fp = fp.clone();
                std::thread::spawn(move || {
                    let conn = pool.get().unwrap();
                    Lease::try_acquire(&conn, &fp, TTL).unwrap().is_some()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
