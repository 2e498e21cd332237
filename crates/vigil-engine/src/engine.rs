//! The engine facade: wires the pipeline together and exposes the boundary
//! operations (subscribe, unsubscribe, change ingestion, status, admin).
//!
//! Every method except [`Engine::start`] and [`Engine::shutdown`] performs
//! blocking database I/O and must be called off the async executor.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use rusqlite::TransactionBehavior;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use vigil_db::DbPool;
use vigil_types::{ChangeEvent, Fingerprint, ObserverState, ObserverStatus, QueryDescriptor};

use crate::cache::ExecutorCache;
use crate::capture::ChangeCapture;
use crate::dispatch;
use crate::error::EngineError;
use crate::evaluator::{Evaluation, Evaluator};
use crate::executor;
use crate::index::{self, DependencyIndex};
use crate::lease;
use crate::listener;
use crate::publisher::{self, Publisher, Transport};
use crate::registry::{self, ClearReport};
use crate::retry::RetryPolicy;
use crate::settings::EngineSettings;
use crate::stats::{EngineStats, StatsSnapshot};
use crate::subscription;
use crate::throttle::{self, SchedulerHandle, ThrottlePolicy};

/// Result of a subscribe call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscribeOutcome {
    pub fingerprint: Fingerprint,
    /// Whether this call created the observer.
    pub created: bool,
    /// Sequence number of the returned snapshot. Notifications continue
    /// from the next one.
    pub seq: u64,
    /// Key under which each item carries its identity.
    pub primary_key: String,
    /// Current snapshot, in result order. Empty until the first evaluation.
    pub items: Vec<Value>,
}

struct Inner {
    pool: DbPool,
    settings: EngineSettings,
    retry: RetryPolicy,
    cache: Arc<ExecutorCache>,
    index: Arc<DependencyIndex>,
    stats: Arc<EngineStats>,
    publisher: Arc<Publisher>,
    evaluator: Arc<Evaluator>,
    scheduler: SchedulerHandle,
    changes: mpsc::UnboundedSender<ChangeEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a running engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Migrates the database, hydrates the dependency index and spawns the
    /// scheduler, workers, listener and maintenance tasks.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are inconsistent or migrations or
    /// index hydration fail.
    pub fn start(
        pool: DbPool,
        settings: EngineSettings,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, EngineError> {
        settings.validate()?;
        {
            let conn = pool.get()?;
            vigil_db::run_migrations(&conn)?;
        }

        let stats = Arc::new(EngineStats::default());
        let cache = Arc::new(ExecutorCache::new(settings.executor_cache_capacity));
        let index = Arc::new(DependencyIndex::new());
        let hydrated = index::hydrate(&pool, &index)?;

        let batching = settings.batch_window_ms > 0;
        let publisher = Arc::new(Publisher::new(transport, batching, Arc::clone(&stats)));
        let evaluator = Arc::new(Evaluator::new(
            pool.clone(),
            Arc::clone(&cache),
            Arc::clone(&index),
            Arc::clone(&publisher),
            Arc::clone(&stats),
            &settings,
        ));

        let retry = settings.retry_policy();
        let policy = ThrottlePolicy {
            interval: settings.throttle(),
            conflict_delay: retry.base_delay,
        };
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (scheduler, scheduler_task) = throttle::spawn_scheduler(policy, jobs_tx, Arc::clone(&stats));

        let mut tasks = vec![scheduler_task];
        tasks.extend(dispatch::spawn_workers(
            settings.workers,
            jobs_rx,
            Arc::clone(&evaluator),
            scheduler.clone(),
        ));

        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        tasks.push(tokio::spawn(listener::listen(
            changes_rx,
            Arc::clone(&index),
            scheduler.clone(),
            Arc::clone(&stats),
        )));
        tasks.push(tokio::spawn(index::refresh_task(
            pool.clone(),
            Arc::clone(&index),
            settings.index_refresh(),
        )));
        if batching {
            tasks.push(tokio::spawn(publisher::flush_task(
                Arc::clone(&publisher),
                settings.batch_window(),
            )));
        }

        tracing::info!(
            observers = hydrated,
            workers = settings.workers,
            throttle_ms = settings.throttle_ms,
            "engine started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                pool,
                settings,
                retry,
                cache,
                index,
                stats,
                publisher,
                evaluator,
                scheduler,
                changes: changes_tx,
                tasks: Mutex::new(tasks),
            }),
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    pub fn pool(&self) -> &DbPool {
        &self.inner.pool
    }

    /// Subscribes `subscriber_id` to the observer for `descriptor`, creating
    /// the observer if needed. Idempotent.
    ///
    /// An evaluation is scheduled when the observer is new, has never been
    /// evaluated, had no subscribers (its snapshot may be stale), or was
    /// halted; resubscribing resets a halted observer.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Descriptor` or `EngineError::InvalidSubscriber`
    /// for bad input and `EngineError::TransientFailure` under contention.
    pub fn subscribe(
        &self,
        subscriber_id: &str,
        descriptor: &QueryDescriptor,
        metadata: Option<&Value>,
    ) -> Result<SubscribeOutcome, EngineError> {
        if subscriber_id.trim().is_empty() {
            return Err(EngineError::InvalidSubscriber(subscriber_id.to_string()));
        }
        let fingerprint = descriptor.fingerprint()?;
        let primary_key = executor::identity_column(descriptor);

        let (outcome, needs_evaluation, dependencies) = self.inner.retry.run(|| {
            let mut conn = self.inner.pool.get()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let (record, created) = registry::get_or_create(&tx, &fingerprint, descriptor)?;
            let prior_subscribers = subscription::subscriber_count(&tx, &fingerprint)?;
            let halted = record.status.is_halted();
            if halted {
                registry::reset(&tx, &fingerprint)?;
            }

            subscription::ensure_subscriber(&tx, subscriber_id, metadata)?;
            subscription::link(&tx, &fingerprint, subscriber_id, record.evaluation_seq)?;
            let snapshot = registry::load_snapshot(&tx, &fingerprint)?;
            let dependencies = registry::dependencies(&tx, &fingerprint)?;
            tx.commit()?;

            let needs_evaluation =
                created || record.last_evaluated_at.is_none() || prior_subscribers == 0 || halted;
            let outcome = SubscribeOutcome {
                fingerprint: fingerprint.clone(),
                created,
                seq: record.evaluation_seq,
                primary_key: primary_key.clone(),
                items: snapshot.items.into_iter().map(|item| item.data).collect(),
            };
            Ok((outcome, needs_evaluation, dependencies))
        })?;

        self.route(&fingerprint, descriptor, dependencies);
        if needs_evaluation {
            self.inner.scheduler.invalidate(fingerprint.clone());
        }

        tracing::info!(
            fingerprint = %fingerprint.short(),
            subscriber_id,
            relation = %descriptor.relation,
            created = outcome.created,
            "subscribed"
        );
        Ok(outcome)
    }

    /// Removes one subscription. Returns `false` if it did not exist.
    ///
    /// The last unsubscribe leaves the observer in place for
    /// [`Engine::reclaim`]; it is not evaluated again meanwhile.
    pub fn unsubscribe(&self, fingerprint: &Fingerprint, subscriber_id: &str) -> Result<bool, EngineError> {
        let conn = self.inner.pool.get()?;
        let unlinked = subscription::unlink(&conn, fingerprint, subscriber_id)?;
        if unlinked.removed && unlinked.remaining == 0 {
            self.retire(fingerprint);
        }
        if unlinked.removed {
            tracing::info!(fingerprint = %fingerprint.short(), subscriber_id, "unsubscribed");
        }
        Ok(unlinked.removed)
    }

    /// Removes a subscriber and all of its subscriptions, e.g. when its
    /// session ends. Returns `false` if it did not exist.
    pub fn remove_subscriber(&self, subscriber_id: &str) -> Result<bool, EngineError> {
        let mut conn = self.inner.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let orphaned = subscription::remove_subscriber(&tx, subscriber_id)?;
        tx.commit()?;

        let Some(orphaned) = orphaned else {
            return Ok(false);
        };
        for fingerprint in &orphaned {
            self.retire(fingerprint);
        }
        tracing::info!(subscriber_id, orphaned = orphaned.len(), "subscriber removed");
        Ok(true)
    }

    /// Makes an observer reachable by change routing. Its first evaluation
    /// narrows the set to what the query actually reads.
    fn route(&self, fingerprint: &Fingerprint, descriptor: &QueryDescriptor, stored: BTreeSet<String>) {
        let tables = stored
            .into_iter()
            .chain(descriptor.referenced_tables().map(str::to_string));
        self.inner.index.extend(fingerprint, tables);
    }

    fn retire(&self, fingerprint: &Fingerprint) {
        self.inner.scheduler.forget(fingerprint.clone());
        self.inner.index.remove(fingerprint);
    }

    /// Feeds a committed change event to the listener.
    pub fn ingest(&self, event: ChangeEvent) -> bool {
        self.inner.changes.send(event).is_ok()
    }

    /// Sender for change events, for external change hooks.
    pub fn change_sender(&self) -> mpsc::UnboundedSender<ChangeEvent> {
        self.inner.changes.clone()
    }

    /// Write helper that reports its own commits to this engine.
    pub fn change_capture(&self) -> ChangeCapture {
        ChangeCapture::new(self.inner.pool.clone(), self.change_sender())
    }

    /// Requests an evaluation, bypassing change routing.
    pub fn invalidate(&self, fingerprint: Fingerprint) {
        self.inner.scheduler.invalidate(fingerprint);
    }

    /// Runs one evaluation on the calling thread, outside the scheduler.
    pub fn evaluate_now(&self, fingerprint: &Fingerprint) -> Result<Evaluation, EngineError> {
        self.inner.evaluator.evaluate(fingerprint)
    }

    /// Subscribed observers that depend on any of `tables`, read from storage.
    pub fn mark_impacted(&self, tables: &[&str]) -> Result<BTreeSet<Fingerprint>, EngineError> {
        let conn = self.inner.pool.get()?;
        registry::mark_impacted(&conn, tables)
    }

    /// Operator view of every observer.
    pub fn status(&self) -> Result<Vec<ObserverState>, EngineError> {
        let conn = self.inner.pool.get()?;
        let mut states = registry::list_states(&conn)?;
        for state in &mut states {
            if state.status == ObserverStatus::Idle && self.inner.scheduler.is_pending(&state.fingerprint) {
                state.status = ObserverStatus::Pending;
            }
        }
        Ok(states)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Returns a halted observer to idle and schedules an evaluation.
    /// Returns `false` if the observer was not halted.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ObserverNotFound` for unknown fingerprints.
    pub fn reset(&self, fingerprint: &Fingerprint) -> Result<bool, EngineError> {
        let conn = self.inner.pool.get()?;
        let Some(record) = registry::load(&conn, fingerprint)? else {
            return Err(EngineError::ObserverNotFound(fingerprint.clone()));
        };
        let reset = registry::reset(&conn, fingerprint)?;
        if reset {
            tracing::info!(fingerprint = %fingerprint.short(), "observer reset");
            if subscription::subscriber_count(&conn, fingerprint)? > 0 {
                self.route(fingerprint, &record.descriptor, registry::dependencies(&conn, fingerprint)?);
            }
            self.inner.scheduler.invalidate(fingerprint.clone());
        }
        Ok(reset)
    }

    /// Deletes every observer and subscriber. Safe while workers run:
    /// in-flight evaluations lose their lease and discard their result.
    pub fn admin_clear(&self) -> Result<ClearReport, EngineError> {
        let mut conn = self.inner.pool.get()?;
        let report = registry::clear_all(&mut conn)?;
        self.inner.cache.clear();
        self.inner.index.clear();
        self.inner.scheduler.clear();
        tracing::warn!(
            observers = report.observers,
            subscribers = report.subscribers,
            "all observers cleared"
        );
        Ok(report)
    }

    /// Deletes observers without subscribers that are not being evaluated.
    pub fn reclaim(&self) -> Result<usize, EngineError> {
        let conn = self.inner.pool.get()?;
        let removed = registry::reclaim(&conn, lease::now_ms())?;
        for fingerprint in &removed {
            self.inner.cache.remove(fingerprint);
            self.retire(fingerprint);
        }
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "reclaimed unsubscribed observers");
        }
        Ok(removed.len())
    }

    /// Stops every background task and flushes batched notifications.
    pub async fn shutdown(&self) {
        let tasks = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
        self.inner.publisher.flush();
        tracing::info!("engine stopped");
    }
}
