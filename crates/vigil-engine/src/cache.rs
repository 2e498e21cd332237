//! Bounded LRU cache of prepared executors.
//!
//! Entries are handed out as `Arc`s. An entry whose `Arc` is still held by a
//! running evaluation is never evicted; when every entry is in use the cache
//! may exceed its capacity until one is released.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use vigil_types::Fingerprint;

use crate::executor::Executor;

/// The executor cache used by the engine.
pub type ExecutorCache = LruCache<Executor>;

/// LRU cache keyed by observer fingerprint.
#[derive(Debug)]
pub struct LruCache<V> {
    capacity: usize,
    inner: Mutex<Inner<V>>,
}

#[derive(Debug)]
struct Inner<V> {
    entries: HashMap<Fingerprint, (Arc<V>, u64)>,
    /// Access tick -> key. The first entry is the least recently used.
    recency: BTreeMap<u64, Fingerprint>,
    tick: u64,
}

impl<V> Inner<V> {
    fn touch(&mut self, key: &Fingerprint) -> Option<Arc<V>> {
        self.tick += 1;
        let tick = self.tick;
        let (value, last) = self.entries.get_mut(key)?;
        self.recency.remove(&*last);
        *last = tick;
        self.recency.insert(tick, key.clone());
        Some(Arc::clone(value))
    }

    fn evict_over(&mut self, capacity: usize) -> usize {
        let mut evicted = 0;
        if self.entries.len() <= capacity {
            return evicted;
        }
        let candidates: Vec<(u64, Fingerprint)> = self
            .recency
            .iter()
            .map(|(tick, key)| (*tick, key.clone()))
            .collect();
        for (tick, key) in candidates {
            if self.entries.len() <= capacity {
                break;
            }
            let in_use = self
                .entries
                .get(&key)
                .is_some_and(|(value, _)| Arc::strong_count(value) > 1);
            if in_use {
                continue;
            }
            self.entries.remove(&key);
            self.recency.remove(&tick);
            evicted += 1;
        }
        evicted
    }
}

impl<V> LruCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                tick: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<V>> {
        self.inner.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
            tracing::error!("executor cache lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &Fingerprint) -> bool {
        self.lock().entries.contains_key(key)
    }

    /// Returns the entry and marks it most recently used.
    pub fn get(&self, key: &Fingerprint) -> Option<Arc<V>> {
        self.lock().touch(key)
    }

    /// Inserts `value`, replacing any previous entry for `key`, and evicts
    /// least recently used entries that are not in use.
    pub fn insert(&self, key: Fingerprint, value: V) -> Arc<V> {
        let mut inner = self.lock();
        inner.tick += 1;
        let tick = inner.tick;
        let value = Arc::new(value);
        if let Some((_, old_tick)) = inner.entries.insert(key.clone(), (Arc::clone(&value), tick)) {
            inner.recency.remove(&old_tick);
        }
        inner.recency.insert(tick, key);
        let evicted = inner.evict_over(self.capacity);
        if evicted > 0 {
            tracing::debug!(evicted, size = inner.entries.len(), "executor cache eviction");
        }
        value
    }

    /// Returns the cached entry or builds one outside the lock.
    ///
    /// If two callers race on the same key, the first insert wins and the
    /// other caller's build is discarded.
    ///
    /// # Errors
    ///
    /// Propagates the error returned by `build`; nothing is cached then.
    pub fn get_or_try_insert_with<E>(
        &self,
        key: &Fingerprint,
        build: impl FnOnce() -> Result<V, E>,
    ) -> Result<Arc<V>, E> {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        let built = build()?;
        if let Some(existing) = self.get(key) {
            return Ok(existing);
        }
        Ok(self.insert(key.clone(), built))
    }

    pub fn remove(&self, key: &Fingerprint) -> bool {
        let mut inner = self.lock();
        match inner.entries.remove(key) {
            Some((_, tick)) => {
                inner.recency.remove(&tick);
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.recency.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u32) -> Fingerprint {
        Fingerprint::from_hex(format!("{n:064x}"))
    }

    #[test]
    fn inserting_past_capacity_evicts_least_recently_used() {
        let cache = LruCache::new(3);
        for n in 0..3 {
            cache.insert(key(n), n);
        }
        cache.insert(key(3), 3);

        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(&key(0)));
        for n in 1..4 {
            assert!(cache.contains(&key(n)));
        }
    }

    #[test]
    fn access_refreshes_recency() {
        let cache = LruCache::new(3);
        for n in 0..3 {
            cache.insert(key(n), n);
        }
        assert_eq!(cache.get(&key(0)).as_deref(), Some(&0));
        cache.insert(key(3), 3);

        assert!(cache.contains(&key(0)));
        assert!(!cache.contains(&key(1)), "key 1 became least recently used");
    }

    #[test]
    fn entries_in_use_are_not_evicted() {
        let cache = LruCache::new(2);
        let held = cache.insert(key(0), 0);
        cache.insert(key(1), 1);
        cache.insert(key(2), 2);

        assert!(cache.contains(&key(0)), "held entry survives");
        assert!(!cache.contains(&key(1)));
        assert_eq!(cache.len(), 2);
        drop(held);
    }

    #[test]
    fn capacity_may_be_exceeded_while_everything_is_in_use() {
        let cache = LruCache::new(1);
        let a = cache.insert(key(0), 0);
        let b = cache.insert(key(1), 1);
        assert_eq!(cache.len(), 2);

        drop(a);
        drop(b);
        cache.insert(key(2), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&key(2)));
    }

    #[test]
    fn get_or_try_insert_builds_once() {
        let cache: LruCache<u32> = LruCache::new(4);
        let mut builds = 0;
        for _ in 0..3 {
            let value = cache
                .get_or_try_insert_with(&key(7), || {
                    builds += 1;
                    Ok::<_, ()>(7)
                })
                .unwrap();
            assert_eq!(*value, 7);
        }
        assert_eq!(builds, 1);

        let failed = cache.get_or_try_insert_with(&key(8), || Err("boom"));
        assert_eq!(failed, Err("boom"));
        assert!(!cache.contains(&key(8)));
    }

    #[test]
    fn remove_and_clear() {
        let cache = LruCache::new(4);
        cache.insert(key(0), 0);
        cache.insert(key(1), 1);
        assert!(cache.remove(&key(0)));
        assert!(!cache.remove(&key(0)));
        cache.clear();
        assert!(cache.is_empty());
    }
}
