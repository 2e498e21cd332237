//! In-memory dependency index: table name to dependent observers.
//!
//! The index is the listener's routing table. It holds subscribed observers
//! that are not halted. Local changes are applied as they commit: evaluators
//! replace an observer's set, subscribe adds one, unsubscribe and halting
//! remove one. A periodic refresh merges in what other processes sharing
//! the database committed.
//!
//! A refresh reads storage without holding the index lock, so a local change
//! can land between the read and the merge. Every local change is stamped
//! with a logical clock and the merge leaves observers stamped after the
//! read alone.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use vigil_db::DbPool;
use vigil_types::Fingerprint;

use crate::registry;

#[derive(Debug, Default)]
struct Inner {
    by_table: HashMap<String, HashSet<Fingerprint>>,
    by_observer: HashMap<Fingerprint, BTreeSet<String>>,
    clock: u64,
    /// Clock value of the latest local change per observer, removals included.
    touched: HashMap<Fingerprint, u64>,
    cleared_at: u64,
}

impl Inner {
    fn unlink(&mut self, fingerprint: &Fingerprint) -> Option<BTreeSet<String>> {
        let tables = self.by_observer.remove(fingerprint)?;
        for table in &tables {
            if let Some(observers) = self.by_table.get_mut(table) {
                observers.remove(fingerprint);
                if observers.is_empty() {
                    self.by_table.remove(table);
                }
            }
        }
        Some(tables)
    }

    fn link(&mut self, fingerprint: &Fingerprint, tables: BTreeSet<String>) {
        for table in &tables {
            self.by_table
                .entry(table.clone())
                .or_default()
                .insert(fingerprint.clone());
        }
        self.by_observer.insert(fingerprint.clone(), tables);
    }

    fn touch(&mut self, fingerprint: &Fingerprint) {
        self.clock += 1;
        self.touched.insert(fingerprint.clone(), self.clock);
    }

    fn touched_since(&self, fingerprint: &Fingerprint, version: u64) -> bool {
        self.touched.get(fingerprint).is_some_and(|&at| at > version)
    }
}

/// Thread-safe reverse index with O(1) lookup per table.
#[derive(Debug, Default)]
pub struct DependencyIndex {
    inner: RwLock<Inner>,
}

impl DependencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|poisoned: PoisonError<_>| {
            tracing::error!("dependency index lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|poisoned: PoisonError<_>| {
            tracing::error!("dependency index lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Observers that depend on `table`. Empty for unknown tables.
    pub fn lookup(&self, table: &str) -> Vec<Fingerprint> {
        self.read()
            .by_table
            .get(table)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Tables `fingerprint` currently depends on.
    pub fn tables_of(&self, fingerprint: &Fingerprint) -> Option<BTreeSet<String>> {
        self.read().by_observer.get(fingerprint).cloned()
    }

    /// Replaces an observer's dependency set. Returns `true` if it changed.
    pub fn replace(&self, fingerprint: &Fingerprint, tables: BTreeSet<String>) -> bool {
        let mut inner = self.write();
        inner.touch(fingerprint);
        if inner.by_observer.get(fingerprint) == Some(&tables) {
            return false;
        }
        inner.unlink(fingerprint);
        inner.link(fingerprint, tables);
        true
    }

    /// Adds tables to an observer's dependency set without dropping any.
    pub fn extend<I>(&self, fingerprint: &Fingerprint, tables: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut inner = self.write();
        inner.touch(fingerprint);
        let mut merged = inner.unlink(fingerprint).unwrap_or_default();
        merged.extend(tables);
        inner.link(fingerprint, merged);
    }

    pub fn remove(&self, fingerprint: &Fingerprint) -> bool {
        let mut inner = self.write();
        inner.touch(fingerprint);
        inner.unlink(fingerprint).is_some()
    }

    pub fn clear(&self) {
        let mut inner = self.write();
        inner.by_table.clear();
        inner.by_observer.clear();
        inner.touched.clear();
        inner.clock += 1;
        inner.cleared_at = inner.clock;
    }

    /// Current logical clock. Read it before loading the state passed to
    /// [`DependencyIndex::merge`].
    pub fn version(&self) -> u64 {
        self.read().clock
    }

    /// Merges stored dependency sets of every routable observer, loaded
    /// after [`DependencyIndex::version`] returned `version`.
    ///
    /// Observers missing from `stored` are dropped and stored sets are
    /// united with the live ones, except for observers changed locally
    /// since `version`: those keep their live state. A load that predates a
    /// [`DependencyIndex::clear`] is ignored.
    pub fn merge(&self, version: u64, stored: HashMap<Fingerprint, BTreeSet<String>>) {
        let mut inner = self.write();
        if inner.cleared_at > version {
            return;
        }

        let mut fresh = Inner {
            clock: inner.clock,
            cleared_at: inner.cleared_at,
            touched: std::mem::take(&mut inner.touched),
            ..Inner::default()
        };
        for (fingerprint, mut tables) in stored {
            if fresh.touched_since(&fingerprint, version) {
                continue;
            }
            if let Some(live) = inner.by_observer.get(&fingerprint) {
                tables.extend(live.iter().cloned());
            }
            fresh.link(&fingerprint, tables);
        }
        for (fingerprint, tables) in std::mem::take(&mut inner.by_observer) {
            if fresh.touched_since(&fingerprint, version) {
                fresh.link(&fingerprint, tables);
            }
        }
        // Older stamps can no longer race a load.
        fresh.touched.retain(|_, at| *at > version);
        *inner = fresh;
    }

    /// Number of observers in the index.
    pub fn len(&self) -> usize {
        self.read().by_observer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Merges the stored dependencies of every routable observer into `index`.
/// Returns the number of indexed observers.
///
/// # Errors
///
/// Returns the underlying storage error.
pub fn hydrate(pool: &DbPool, index: &DependencyIndex) -> Result<usize, crate::EngineError> {
    let version = index.version();
    let conn = pool.get()?;
    let stored = registry::active_dependencies(&conn)?;
    index.merge(version, stored);
    Ok(index.len())
}

/// Periodically merges storage into the index.
pub async fn refresh_task(pool: DbPool, index: Arc<DependencyIndex>, period: Duration) {
    if period.is_zero() {
        tracing::debug!("dependency index refresh disabled");
        return;
    }

    let mut ticker = tokio::time::interval(period);
    // The first tick completes immediately; the index was hydrated at start.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let pool = pool.clone();
        let index = Arc::clone(&index);
        let res = tokio::task::spawn_blocking(move || hydrate(&pool, &index)).await;

        match res {
            Ok(Ok(observers)) => tracing::debug!(observers, "dependency index refreshed"),
            Ok(Err(e)) => tracing::error!("failed to refresh dependency index: {}", e),
            Err(e) => tracing::error!("dependency index refresh join error: {}", e),
        }
    }
}
