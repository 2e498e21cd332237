//! Worker dispatch: a fixed pool of workers pulling evaluation jobs from a
//! shared queue.
//!
//! Workers never block the async executor; every evaluation runs on the
//! blocking pool. Mutual exclusion per observer is the lease's job, so any
//! number of pools, in any number of processes, may share one database.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::error::EngineError;
use crate::evaluator::{EvaluationOutcome, Evaluator};
use crate::throttle::{Job, JobOutcome, SchedulerHandle};

/// Maps an evaluation result onto what the scheduler needs to know.
pub fn classify(result: &Result<crate::evaluator::Evaluation, EngineError>) -> JobOutcome {
    match result {
        Ok(evaluation) => match evaluation.outcome {
            EvaluationOutcome::Published { .. } | EvaluationOutcome::Unchanged { .. } => {
                JobOutcome::Done {
                    repoll: evaluation.repoll,
                }
            }
            EvaluationOutcome::Failed { .. }
            | EvaluationOutcome::Stopped { .. }
            | EvaluationOutcome::Skipped(_) => JobOutcome::Dropped,
        },
        Err(EngineError::Busy) => JobOutcome::Busy,
        Err(EngineError::TransientFailure { .. }) => JobOutcome::Transient,
        Err(e) if e.is_transient() => JobOutcome::Transient,
        Err(_) => JobOutcome::Dropped,
    }
}

async fn worker(
    id: usize,
    jobs: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
    evaluator: Arc<Evaluator>,
    scheduler: SchedulerHandle,
) {
    loop {
        let job = { jobs.lock().await.recv().await };
        let Some(Job { fingerprint }) = job else {
            break;
        };

        let evaluator = Arc::clone(&evaluator);
        let target = fingerprint.clone();
        let joined = tokio::task::spawn_blocking(move || evaluator.evaluate(&target)).await;

        let outcome = match joined {
            Ok(result) => {
                if let Err(e) = &result {
                    if !matches!(e, EngineError::Busy) {
                        tracing::error!(worker = id, fingerprint = %fingerprint.short(), "evaluation error: {}", e);
                    }
                }
                classify(&result)
            }
            Err(e) => {
                tracing::error!(worker = id, fingerprint = %fingerprint.short(), "evaluation task join error: {}", e);
                JobOutcome::Dropped
            }
        };

        if !scheduler.complete(fingerprint, outcome) {
            break;
        }
    }
    tracing::debug!(worker = id, "worker stopped");
}

/// Spawns `workers` workers sharing one job queue.
pub fn spawn_workers(
    workers: usize,
    jobs: mpsc::UnboundedReceiver<Job>,
    evaluator: Arc<Evaluator>,
    scheduler: SchedulerHandle,
) -> Vec<JoinHandle<()>> {
    let jobs = Arc::new(Mutex::new(jobs));
    let count = workers.max(1);
    tracing::info!(workers = count, "starting evaluation workers");
    (0..count)
        .map(|id| {
            tokio::spawn(worker(
                id,
                Arc::clone(&jobs),
                Arc::clone(&evaluator),
                scheduler.clone(),
            ))
        })
        .collect()
}
