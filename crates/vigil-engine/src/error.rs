//! Error types for the engine.

use vigil_types::{DescriptorError, Fingerprint};

use crate::settings::SettingsError;

/// Errors surfaced by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A database operation failed.
    #[error("engine database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No pooled connection could be obtained.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Schema migrations could not be applied.
    #[error(transparent)]
    Migration(#[from] vigil_db::MigrationError),

    /// The engine settings are inconsistent.
    #[error("invalid engine settings: {0}")]
    Settings(#[from] SettingsError),

    /// The query descriptor was rejected.
    #[error("invalid query descriptor: {0}")]
    Descriptor(#[from] DescriptorError),

    /// JSON serialization or deserialization failed.
    #[error("engine serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The referenced observer does not exist.
    #[error("observer {0} not found")]
    ObserverNotFound(Fingerprint),

    /// The subscriber id is empty or otherwise unusable.
    #[error("invalid subscriber id: {0:?}")]
    InvalidSubscriber(String),

    /// Another worker holds the observer's evaluation lease.
    ///
    /// Never surfaced to API callers; the scheduler requeues the job.
    #[error("observer is being evaluated by another worker")]
    Busy,

    /// A conflict persisted after every retry attempt.
    #[error("transient failure after {attempts} attempts")]
    TransientFailure {
        /// How many attempts were made.
        attempts: u32,
    },
}

impl EngineError {
    /// Returns `true` for conflicts that may succeed when retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(e) => is_transient_sqlite(e),
            Self::Pool(_) => true,
            _ => false,
        }
    }
}

/// SQLite errors worth retrying: lock contention, and foreign key violations
/// raised when a referenced observer row is not visible yet.
pub(crate) fn is_transient_sqlite(err: &rusqlite::Error) -> bool {
    use rusqlite::ffi::ErrorCode;

    match err {
        rusqlite::Error::SqliteFailure(e, _) => match e.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => true,
            ErrorCode::ConstraintViolation => {
                e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
            }
            _ => false,
        },
        _ => false,
    }
}

/// Whether `err` is SQLite's answer to an interrupted statement.
pub(crate) fn is_interrupted(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ffi::ErrorCode::OperationInterrupted
    )
}
