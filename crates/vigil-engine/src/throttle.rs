//! Throttler and scheduler.
//!
//! A single task owns the per-observer scheduling state and turns
//! invalidations into evaluation jobs:
//!
//! - idle observer: dispatch now, or at `last_started + throttle` if it ran
//!   too recently;
//! - already scheduled, or running with a follow-up pending: coalesce;
//! - running: remember that one follow-up is needed.
//!
//! When a job completes with a follow-up pending, exactly one more job is
//! scheduled. Evaluation starts of one observer are therefore at least
//! `throttle` apart, and the last invalidation is always followed by an
//! evaluation that starts after it.
//!
//! A dropped job (halted, unsubscribed, missing) and a forgotten observer
//! leave no state behind, so nothing is scheduled for them again until the
//! next invalidation.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use vigil_types::Fingerprint;

use crate::stats::EngineStats;

/// An evaluation request for one observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub fingerprint: Fingerprint,
}

/// How a dispatched job ended, as reported by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Evaluated. Poll-mode observers ask to run again after a delay.
    Done { repoll: Option<Duration> },
    /// Another worker held the lease.
    Busy,
    /// Retries were exhausted on a transient conflict.
    Transient,
    /// Nothing further to do: halted, missing, unsubscribed or failed.
    Dropped,
}

#[derive(Debug)]
enum Command {
    Invalidate(Fingerprint),
    Completed(Fingerprint, JobOutcome),
    Forget(Fingerprint),
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Scheduled(Instant),
    Running,
    RunningPending,
    /// Running, but forgotten meanwhile. Its completion is discarded.
    Retiring,
}

#[derive(Debug)]
struct Entry {
    phase: Phase,
    last_started: Option<Instant>,
    /// Consecutive busy or transient outcomes, for backoff.
    conflicts: u32,
}

impl Default for Entry {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            last_started: None,
            conflicts: 0,
        }
    }
}

/// Fingerprints with an evaluation queued but not yet started.
#[derive(Debug, Default)]
pub struct PendingSet {
    inner: Mutex<HashSet<Fingerprint>>,
}

impl PendingSet {
    fn set(&self, fingerprint: &Fingerprint, pending: bool) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if pending {
            inner.insert(fingerprint.clone());
        } else {
            inner.remove(fingerprint);
        }
    }

    fn clear(&self) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(fingerprint)
    }
}

/// Cloneable handle used to feed the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Command>,
    pending: Arc<PendingSet>,
}

impl SchedulerHandle {
    fn send(&self, command: Command) -> bool {
        if self.tx.send(command).is_err() {
            tracing::debug!("scheduler stopped, command dropped");
            return false;
        }
        true
    }

    /// Requests an evaluation of `fingerprint`.
    pub fn invalidate(&self, fingerprint: Fingerprint) -> bool {
        self.send(Command::Invalidate(fingerprint))
    }

    /// Reports the end of a dispatched job.
    pub fn complete(&self, fingerprint: Fingerprint, outcome: JobOutcome) -> bool {
        self.send(Command::Completed(fingerprint, outcome))
    }

    /// Drops any queued evaluation of `fingerprint`.
    pub fn forget(&self, fingerprint: Fingerprint) -> bool {
        self.send(Command::Forget(fingerprint))
    }

    /// Drops every queued evaluation and every running job's follow-up.
    pub fn clear(&self) -> bool {
        self.send(Command::Clear)
    }

    /// Whether an evaluation is queued and not yet started.
    pub fn is_pending(&self, fingerprint: &Fingerprint) -> bool {
        self.pending.contains(fingerprint)
    }
}

/// Scheduling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottlePolicy {
    /// Minimum spacing between evaluation starts of one observer.
    pub interval: Duration,
    /// First delay after a busy or transient outcome. Doubles per conflict.
    pub conflict_delay: Duration,
}

impl ThrottlePolicy {
    fn conflict_backoff(&self, conflicts: u32) -> Duration {
        let factor = 1u32.checked_shl(conflicts.min(16)).unwrap_or(u32::MAX);
        let cap = self.interval.max(self.conflict_delay);
        self.conflict_delay.saturating_mul(factor).min(cap)
    }
}

struct Scheduler {
    policy: ThrottlePolicy,
    entries: HashMap<Fingerprint, Entry>,
    deadlines: BTreeSet<(Instant, Fingerprint)>,
    jobs: mpsc::UnboundedSender<Job>,
    pending: Arc<PendingSet>,
    stats: Arc<EngineStats>,
}

impl Scheduler {
    fn dispatch(&mut self, fingerprint: &Fingerprint, now: Instant) {
        let entry = self.entries.entry(fingerprint.clone()).or_default();
        entry.phase = Phase::Running;
        entry.last_started = Some(now);
        self.pending.set(fingerprint, false);
        self.stats.add_dispatched(1);
        if self
            .jobs
            .send(Job {
                fingerprint: fingerprint.clone(),
            })
            .is_err()
        {
            tracing::warn!(fingerprint = %fingerprint.short(), "worker pool gone, job dropped");
        }
    }

    fn schedule_at(&mut self, fingerprint: &Fingerprint, deadline: Instant) {
        let entry = self.entries.entry(fingerprint.clone()).or_default();
        if let Phase::Scheduled(previous) = entry.phase {
            self.deadlines.remove(&(previous, fingerprint.clone()));
        }
        entry.phase = Phase::Scheduled(deadline);
        self.deadlines.insert((deadline, fingerprint.clone()));
        self.pending.set(fingerprint, true);
    }

    /// Earliest start allowed by the throttle.
    fn earliest(&self, fingerprint: &Fingerprint, now: Instant) -> Instant {
        self.entries
            .get(fingerprint)
            .and_then(|e| e.last_started)
            .map(|started| (started + self.policy.interval).max(now))
            .unwrap_or(now)
    }

    fn invalidate(&mut self, fingerprint: Fingerprint, now: Instant) {
        self.stats.add_invalidations(1);
        let phase = self
            .entries
            .get(&fingerprint)
            .map(|e| e.phase)
            .unwrap_or(Phase::Idle);

        match phase {
            Phase::Idle => {
                let at = self.earliest(&fingerprint, now);
                if at <= now {
                    self.dispatch(&fingerprint, now);
                } else {
                    self.schedule_at(&fingerprint, at);
                }
            }
            Phase::Running | Phase::Retiring => {
                if let Some(entry) = self.entries.get_mut(&fingerprint) {
                    entry.phase = Phase::RunningPending;
                }
                self.pending.set(&fingerprint, true);
            }
            Phase::Scheduled(_) | Phase::RunningPending => self.stats.add_coalesced(1),
        }
    }

    fn complete(&mut self, fingerprint: Fingerprint, outcome: JobOutcome, now: Instant) {
        let Some(entry) = self.entries.get_mut(&fingerprint) else {
            return;
        };
        match entry.phase {
            Phase::Running | Phase::RunningPending => {}
            Phase::Retiring => {
                self.entries.remove(&fingerprint);
                return;
            }
            Phase::Idle | Phase::Scheduled(_) => return,
        }
        let follow_up = entry.phase == Phase::RunningPending;
        entry.phase = Phase::Idle;

        match outcome {
            JobOutcome::Done { repoll } => {
                entry.conflicts = 0;
                if follow_up {
                    let at = self.earliest(&fingerprint, now);
                    self.schedule_at(&fingerprint, at);
                } else if let Some(delay) = repoll {
                    let at = self.earliest(&fingerprint, now).max(now + delay);
                    self.schedule_at(&fingerprint, at);
                }
            }
            JobOutcome::Busy | JobOutcome::Transient => {
                if outcome == JobOutcome::Busy {
                    self.stats.add_busy_requeues(1);
                } else {
                    self.stats.add_transient_failures(1);
                }
                entry.conflicts = entry.conflicts.saturating_add(1);
                let delay = self.policy.conflict_backoff(entry.conflicts - 1);
                tracing::debug!(
                    fingerprint = %fingerprint.short(),
                    ?outcome,
                    delay_ms = delay.as_millis() as u64,
                    "requeueing evaluation"
                );
                self.schedule_at(&fingerprint, now + delay);
            }
            JobOutcome::Dropped => {
                if follow_up {
                    entry.conflicts = 0;
                    let at = self.earliest(&fingerprint, now);
                    self.schedule_at(&fingerprint, at);
                } else {
                    self.entries.remove(&fingerprint);
                    self.pending.set(&fingerprint, false);
                }
            }
        }
    }

    fn forget(&mut self, fingerprint: Fingerprint) {
        self.pending.set(&fingerprint, false);
        let Some(entry) = self.entries.get_mut(&fingerprint) else {
            return;
        };
        match entry.phase {
            // The running job still reports back.
            Phase::Running | Phase::RunningPending | Phase::Retiring => entry.phase = Phase::Retiring,
            Phase::Scheduled(at) => {
                self.deadlines.remove(&(at, fingerprint.clone()));
                self.entries.remove(&fingerprint);
            }
            Phase::Idle => {
                self.entries.remove(&fingerprint);
            }
        }
    }

    fn clear(&mut self) {
        self.pending.clear();
        self.deadlines.clear();
        for entry in self.entries.values_mut() {
            if matches!(entry.phase, Phase::Running | Phase::RunningPending) {
                entry.phase = Phase::Retiring;
            }
        }
        self.entries.retain(|_, entry| entry.phase == Phase::Retiring);
    }

    fn fire_due(&mut self, now: Instant) {
        while let Some((at, fingerprint)) = self.deadlines.first().cloned() {
            if at > now {
                break;
            }
            self.deadlines.remove(&(at, fingerprint.clone()));
            let scheduled = self
                .entries
                .get(&fingerprint)
                .is_some_and(|e| e.phase == Phase::Scheduled(at));
            if scheduled {
                self.dispatch(&fingerprint, now);
            }
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            // A far-away deadline stands in when nothing is scheduled; the
            // branch is disabled then anyway.
            let next = self.deadlines.first().map(|(at, _)| *at);
            let wake = next.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    let now = Instant::now();
                    match command {
                        Command::Invalidate(fingerprint) => self.invalidate(fingerprint, now),
                        Command::Completed(fingerprint, outcome) => self.complete(fingerprint, outcome, now),
                        Command::Forget(fingerprint) => self.forget(fingerprint),
                        Command::Clear => self.clear(),
                    }
                }
                _ = sleep_until(wake), if next.is_some() => {
                    self.fire_due(Instant::now());
                }
            }
        }
        tracing::debug!("scheduler stopped");
    }
}

/// Starts the scheduler task. Jobs are sent to `jobs`.
pub fn spawn_scheduler(
    policy: ThrottlePolicy,
    jobs: mpsc::UnboundedSender<Job>,
    stats: Arc<EngineStats>,
) -> (SchedulerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = Arc::new(PendingSet::default());
    let scheduler = Scheduler {
        policy,
        entries: HashMap::new(),
        deadlines: BTreeSet::new(),
        jobs,
        pending: Arc::clone(&pending),
        stats,
    };
    let task = tokio::spawn(scheduler.run(rx));
    (SchedulerHandle { tx, pending }, task)
}
