//! The connection pool shared by the engine and the application.
//!
//! Every pooled connection opens the same database file in WAL mode, so
//! evaluations read while application transactions and engine bookkeeping
//! write. Lock waits are bounded by the busy timeout; a wait that outlasts
//! it surfaces as `SQLITE_BUSY`, which the engine retries.

use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

/// Connection and pool tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// How long a statement waits on a locked database, in milliseconds.
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled connections. Each evaluation worker and
    /// each blocking API call holds one while it runs.
    pub pool_max_size: u32,

    /// Prepared statements cached per connection. Evaluations re-run the
    /// same statements, so this should cover the executors in use at once.
    pub statement_cache_capacity: usize,

    /// How long checking out a connection may wait, in milliseconds. Zero
    /// is raised to one.
    pub acquire_timeout_ms: u64,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
            statement_cache_capacity: 64,
            acquire_timeout_ms: 30_000,
        }
    }
}

pub type DbPool = Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum PoolError {
    /// The path names a private in-memory database. Each pooled connection
    /// would see its own empty database.
    #[error("database path {0:?} cannot be shared between pooled connections")]
    Unshareable(String),

    #[error("failed to create database connection pool: {0}")]
    PoolInit(#[from] r2d2::Error),
}

fn is_private(db_path: &str) -> bool {
    // An empty path opens a private temporary database.
    db_path.is_empty() || db_path == ":memory:"
}

/// Applies the pragmas every engine connection relies on.
///
/// # Errors
///
/// Fails if a pragma is rejected, or if the database cannot switch to WAL
/// mode.
pub fn configure_connection(conn: &Connection, settings: &DbRuntimeSettings) -> rusqlite::Result<()> {
    let journal_mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    if !journal_mode.eq_ignore_ascii_case("wal") {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some(format!("failed to set WAL journal mode, got: {}", journal_mode)),
        ));
    }
    // WAL commits stay durable across application crashes with NORMAL.
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.busy_timeout(Duration::from_millis(settings.busy_timeout_ms))?;
    conn.set_prepared_statement_cache_capacity(settings.statement_cache_capacity);
    Ok(())
}

/// Opens a pool over the database file at `db_path`, creating it if needed.
///
/// `file:` URIs are accepted, so `file:name?mode=memory&cache=shared` gives
/// a shared in-memory database.
///
/// # Errors
///
/// Returns `PoolError::Unshareable` for private in-memory paths and
/// `PoolError::PoolInit` if the first connection cannot be configured.
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool, PoolError> {
    if is_private(db_path) {
        return Err(PoolError::Unshareable(db_path.to_string()));
    }

    // Read-write, create and URI filenames; r2d2 hands each connection to
    // one thread at a time, so SQLite's own mutex stays off.
    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(OpenFlags::default())
        .with_init(move |conn| configure_connection(conn, &settings));

    let pool = Pool::builder()
        .max_size(settings.pool_max_size)
        .connection_timeout(Duration::from_millis(settings.acquire_timeout_ms.max(1)))
        .build(manager)?;

    tracing::debug!(
        path = db_path,
        max_size = settings.pool_max_size,
        busy_timeout_ms = settings.busy_timeout_ms,
        "database pool created"
    );

    Ok(pool)
}
