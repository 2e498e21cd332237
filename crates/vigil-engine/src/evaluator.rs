//! Evaluator, diff hand-off and watchdog.
//!
//! One evaluation runs entirely under the observer's lease:
//!
//! 1. acquire the lease (or report [`EngineError::Busy`]);
//! 2. run the query through the executor cache, interrupting it once it
//!    passes the watchdog's kill threshold;
//! 3. diff against the stored snapshot;
//! 4. in one transaction, and only if the lease is still held, store the new
//!    snapshot and dependency set, advance the sequence number and claim the
//!    recipients;
//! 5. hand the change set to the publisher;
//! 6. release the lease.
//!
//! Releasing after the hand-off keeps one observer's notification stream in
//! evaluation order: the next evaluation cannot publish before this one has.
//! The lease outlives the kill threshold, so an interrupted query never runs
//! past it either.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::{Connection, TransactionBehavior};
use vigil_db::DbPool;
use vigil_types::{Fingerprint, ObserverStatus};

use crate::cache::ExecutorCache;
use crate::diff::{diff, Snapshot};
use crate::error::{is_interrupted, is_transient_sqlite, EngineError};
use crate::executor::{self, Executor};
use crate::index::DependencyIndex;
use crate::lease::Lease;
use crate::publisher::Publisher;
use crate::registry::{self, ObserverRecord};
use crate::retry::RetryPolicy;
use crate::settings::EngineSettings;
use crate::stats::EngineStats;
use crate::subscription;

/// SQLite VM steps between two deadline checks.
const DEADLINE_CHECK_OPS: i32 = 1_000;

/// Duration thresholds for a single evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watchdog {
    pub warn_after: Duration,
    pub kill_after: Duration,
}

/// The watchdog's judgement of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Normal,
    Slow,
    Kill,
}

impl Watchdog {
    pub fn judge(&self, elapsed: Duration) -> Verdict {
        if elapsed > self.kill_after {
            Verdict::Kill
        } else if elapsed > self.warn_after {
            Verdict::Slow
        } else {
            Verdict::Normal
        }
    }
}

/// Why an evaluation did not produce a result.
#[derive(Debug, thiserror::Error)]
pub enum EvaluationError {
    /// The query could not be prepared or executed.
    #[error("query failed: {0}")]
    Query(#[source] rusqlite::Error),

    /// The watchdog stopped the observer.
    #[error("evaluation took {elapsed_ms} ms, over the {limit_ms} ms limit")]
    Killed {
        /// Measured duration.
        elapsed_ms: u64,
        /// Configured kill threshold.
        limit_ms: u64,
    },
}

/// Why an evaluation was not attempted or its result discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The observer no longer exists.
    Missing,
    /// The observer is in `error` or `stopped` state.
    Halted,
    /// Nobody is subscribed.
    NoSubscribers,
    /// The lease disappeared or expired mid-evaluation, e.g. through an
    /// admin clear.
    LeaseLost,
}

/// What one evaluation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationOutcome {
    /// A non-empty change set was committed and published.
    Published {
        seq: u64,
        changes: usize,
        recipients: usize,
    },
    /// The result did not change.
    Unchanged { seq: u64 },
    /// The query failed; the observer is now in `error` state.
    Failed { seq: u64 },
    /// The watchdog stopped the observer.
    Stopped { seq: u64 },
    Skipped(SkipReason),
}

/// Result of [`Evaluator::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub outcome: EvaluationOutcome,
    /// Set for poll-mode observers that should run again after this delay.
    pub repoll: Option<Duration>,
}

impl Evaluation {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            outcome: EvaluationOutcome::Skipped(reason),
            repoll: None,
        }
    }
}

/// Runs `query` with a progress handler that interrupts it at `deadline`.
fn run_until<T>(
    conn: &Connection,
    deadline: Instant,
    query: impl FnOnce() -> Result<T, rusqlite::Error>,
) -> Result<T, rusqlite::Error> {
    conn.progress_handler(DEADLINE_CHECK_OPS, Some(move || Instant::now() >= deadline));
    let result = query();
    conn.progress_handler(DEADLINE_CHECK_OPS, None::<fn() -> bool>);
    result
}

/// Runs evaluations. Shared by every worker.
#[derive(Debug)]
pub struct Evaluator {
    pool: DbPool,
    cache: Arc<ExecutorCache>,
    index: Arc<DependencyIndex>,
    publisher: Arc<Publisher>,
    stats: Arc<EngineStats>,
    watchdog: Watchdog,
    retry: RetryPolicy,
    lease_ttl: Duration,
    max_result_length: usize,
}

impl Evaluator {
    pub fn new(
        pool: DbPool,
        cache: Arc<ExecutorCache>,
        index: Arc<DependencyIndex>,
        publisher: Arc<Publisher>,
        stats: Arc<EngineStats>,
        settings: &EngineSettings,
    ) -> Self {
        Self {
            pool,
            cache,
            index,
            publisher,
            stats,
            watchdog: settings.watchdog(),
            retry: settings.retry_policy(),
            lease_ttl: settings.lease_ttl(),
            max_result_length: settings.max_result_length,
        }
    }

    /// Evaluates one observer. Blocks; run it off the async executor.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Busy`] if another worker holds the lease,
    /// a transient error the caller should requeue on, or a storage error.
    /// Query failures are not errors: they are recorded on the observer.
    pub fn evaluate(&self, fingerprint: &Fingerprint) -> Result<Evaluation, EngineError> {
        let mut conn = self.pool.get()?;

        let Some(record) = registry::load(&conn, fingerprint)? else {
            return Ok(Evaluation::skipped(SkipReason::Missing));
        };
        if record.status.is_halted() {
            self.index.remove(fingerprint);
            return Ok(Evaluation::skipped(SkipReason::Halted));
        }
        if subscription::subscriber_count(&conn, fingerprint)? == 0 {
            return Ok(Evaluation::skipped(SkipReason::NoSubscribers));
        }

        let lease = Lease::acquire(&conn, fingerprint, self.lease_ttl, &self.retry)?;
        let result = self.evaluate_leased(&mut conn, &record, &lease);
        if result.is_err() {
            if let Err(e) = registry::clear_running(&conn, fingerprint) {
                tracing::warn!(fingerprint = %fingerprint.short(), "failed to reset observer status: {}", e);
            }
        }
        if let Err(e) = lease.release(&conn) {
            tracing::warn!(fingerprint = %fingerprint.short(), "failed to release lease: {}", e);
        }
        result
    }

    fn evaluate_leased(
        &self,
        conn: &mut Connection,
        record: &ObserverRecord,
        lease: &Lease,
    ) -> Result<Evaluation, EngineError> {
        let fingerprint = &record.fingerprint;
        registry::set_status(conn, fingerprint, ObserverStatus::Running)?;
        self.stats.add_evaluations(1);

        let reader: &Connection = conn;
        let started = Instant::now();
        let deadline = started + self.watchdog.kill_after;
        let run = self
            .cache
            .get_or_try_insert_with(fingerprint, || Executor::build(reader, &record.descriptor))
            .and_then(|executor| {
                run_until(reader, deadline, || executor.run(reader)).map(|rows| (executor, rows))
            });
        let elapsed = started.elapsed();
        let duration_ms = elapsed.as_millis() as u64;

        let (executor, rows) = match run {
            Ok(ok) => ok,
            Err(e) if is_transient_sqlite(&e) => return Err(EngineError::Database(e)),
            Err(e) if is_interrupted(&e) => {
                self.stats.add_watchdog_kills(1);
                let error = EvaluationError::Killed {
                    elapsed_ms: duration_ms,
                    limit_ms: self.watchdog.kill_after.as_millis() as u64,
                };
                tracing::error!(
                    fingerprint = %fingerprint.short(),
                    relation = %record.descriptor.relation,
                    duration_ms,
                    "observer query interrupted by watchdog"
                );
                return self.fail(conn, record, lease, ObserverStatus::Stopped, &error);
            }
            Err(e) => {
                self.cache.remove(fingerprint);
                let error = EvaluationError::Query(e);
                tracing::warn!(fingerprint = %fingerprint.short(), "observer evaluation failed: {}", error);
                return self.fail(conn, record, lease, ObserverStatus::Error, &error);
            }
        };

        match self.watchdog.judge(elapsed) {
            Verdict::Kill => {
                self.stats.add_watchdog_kills(1);
                let error = EvaluationError::Killed {
                    elapsed_ms: duration_ms,
                    limit_ms: self.watchdog.kill_after.as_millis() as u64,
                };
                tracing::error!(
                    fingerprint = %fingerprint.short(),
                    relation = %record.descriptor.relation,
                    duration_ms,
                    "observer stopped by watchdog"
                );
                return self.fail(conn, record, lease, ObserverStatus::Stopped, &error);
            }
            Verdict::Slow => tracing::warn!(
                fingerprint = %fingerprint.short(),
                relation = %record.descriptor.relation,
                duration_ms,
                "slow observer evaluation"
            ),
            Verdict::Normal => {}
        }

        if rows.len() > self.max_result_length {
            tracing::warn!(
                fingerprint = %fingerprint.short(),
                relation = %record.descriptor.relation,
                rows = rows.len(),
                limit = self.max_result_length,
                "observer result is very long, consider pagination"
            );
        }

        let identity_column = executor.identity_column().to_string();
        let tables = executor.tables().clone();
        let snapshot = Snapshot::from_rows(rows, &identity_column);
        drop(executor);

        let previous = registry::load_snapshot(conn, fingerprint)?;
        let changes = diff(&previous, &snapshot);
        let advance = !changes.is_empty();

        let committed = self.retry.run(|| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if !lease.is_held(&tx)? {
                return Ok(None);
            }
            if advance {
                registry::store_snapshot(&tx, fingerprint, &snapshot)?;
            }
            registry::replace_dependencies(&tx, fingerprint, &tables)?;
            let seq = registry::record_success(&tx, fingerprint, advance)?;
            let recipients = if advance {
                subscription::claim_recipients(&tx, fingerprint, seq)?
            } else {
                Vec::new()
            };
            tx.commit()?;
            Ok(Some((seq, recipients)))
        })?;

        let Some((seq, recipients)) = committed else {
            tracing::info!(fingerprint = %fingerprint.short(), "lease lost, discarding evaluation");
            return Ok(Evaluation::skipped(SkipReason::LeaseLost));
        };

        if self.index.replace(fingerprint, tables) {
            tracing::debug!(fingerprint = %fingerprint.short(), "dependency set updated");
        }

        let repoll = record.descriptor.poll_interval_ms.map(Duration::from_millis);
        if !advance {
            tracing::debug!(fingerprint = %fingerprint.short(), duration_ms, "observer unchanged");
            return Ok(Evaluation {
                outcome: EvaluationOutcome::Unchanged { seq },
                repoll,
            });
        }

        self.publisher
            .publish(fingerprint, seq, &identity_column, &changes, &recipients);
        tracing::debug!(
            fingerprint = %fingerprint.short(),
            seq,
            duration_ms,
            added = changes.added.len(),
            changed = changes.changed.len(),
            removed = changes.removed.len(),
            reordered = changes.order.is_some(),
            recipients = recipients.len(),
            "observer evaluated"
        );

        Ok(Evaluation {
            outcome: EvaluationOutcome::Published {
                seq,
                changes: changes.len(),
                recipients: recipients.len(),
            },
            repoll,
        })
    }

    /// Records a failed evaluation and tells current subscribers once.
    fn fail(
        &self,
        conn: &mut Connection,
        record: &ObserverRecord,
        lease: &Lease,
        status: ObserverStatus,
        error: &EvaluationError,
    ) -> Result<Evaluation, EngineError> {
        let fingerprint = &record.fingerprint;
        let message = error.to_string();
        self.stats.add_errors(1);

        let committed = self.retry.run(|| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if !lease.is_held(&tx)? {
                return Ok(None);
            }
            let seq = registry::record_failure(&tx, fingerprint, status, &message)?;
            let recipients = subscription::claim_recipients(&tx, fingerprint, seq)?;
            tx.commit()?;
            Ok(Some((seq, recipients)))
        })?;

        let Some((seq, recipients)) = committed else {
            return Ok(Evaluation::skipped(SkipReason::LeaseLost));
        };
        // Halted observers leave change routing until reset.
        self.index.remove(fingerprint);

        self.publisher.publish_error(
            fingerprint,
            seq,
            &executor::identity_column(&record.descriptor),
            &message,
            &recipients,
        );

        let outcome = match status {
            ObserverStatus::Stopped => EvaluationOutcome::Stopped { seq },
            _ => EvaluationOutcome::Failed { seq },
        };
        Ok(Evaluation {
            outcome,
            repoll: None,
        })
    }
}
