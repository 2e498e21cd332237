//! Reactive query engine for Vigil.
//!
//! Clients subscribe to declarative queries. The engine records which tables
//! each query reads, listens for committed changes to those tables, and
//! re-evaluates affected queries under a per-observer throttle. Each
//! evaluation is diffed against the stored snapshot and only the difference
//! is delivered, in order, to the observer's subscribers.
//!
//! The pipeline, end to end:
//!
//! ```text
//! ChangeEvent ─▶ listener ─▶ DependencyIndex ─▶ scheduler (throttle)
//!                                                   │ Job
//!                                                   ▼
//!                       Publisher ◀─ Evaluator ◀─ workers
//!                           │          │ lease, executor cache, diff
//!                           ▼          ▼
//!                       Transport    SQLite (registry, snapshots)
//! ```
//!
//! All durable state lives in the database, so several engine processes may
//! share one file; leases keep evaluations of one observer exclusive.

pub mod cache;
pub mod capture;
pub mod diff;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod index;
pub mod interceptor;
pub mod lease;
pub mod listener;
pub mod publisher;
pub mod registry;
pub mod retry;
pub mod settings;
pub mod stats;
pub mod subscription;
pub mod throttle;

pub use cache::{ExecutorCache, LruCache};
pub use capture::ChangeCapture;
pub use diff::{diff, Snapshot, SnapshotItem};
pub use engine::{Engine, SubscribeOutcome};
pub use error::EngineError;
pub use evaluator::{Evaluation, EvaluationOutcome, Evaluator, SkipReason};
pub use executor::Executor;
pub use index::DependencyIndex;
pub use publisher::{ChannelTransport, Delivery, Publisher, Transport};
pub use registry::{ClearReport, ObserverRecord};
pub use retry::RetryPolicy;
pub use settings::{EngineSettings, SettingsError};
pub use stats::StatsSnapshot;
