//! Dependency interception.
//!
//! A statement is prepared with a SQLite authorizer installed. SQLite
//! consults the authorizer for every column it will read while compiling the
//! statement, including reads through views, subqueries and triggers, so the
//! collected set is exactly the tables the statement can observe.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use rusqlite::hooks::{AuthAction, AuthContext, Authorization};
use rusqlite::Connection;

/// Prepares `sql` under instrumentation and returns every table it reads.
///
/// SQLite's own schema tables are left out. Nothing is executed.
///
/// # Errors
///
/// Returns the prepare error, e.g. when a referenced relation is missing.
pub fn read_tables(conn: &Connection, sql: &str) -> Result<BTreeSet<String>, rusqlite::Error> {
    let seen = Arc::new(Mutex::new(BTreeSet::new()));
    let sink = Arc::clone(&seen);

    conn.authorizer(Some(move |ctx: AuthContext<'_>| {
        if let AuthAction::Read { table_name, .. } = ctx.action {
            if !table_name.starts_with("sqlite_") {
                sink.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(table_name.to_string());
            }
        }
        Authorization::Allow
    }));

    // `prepare`, not `prepare_cached`: a cached statement is not recompiled
    // and would bypass the authorizer.
    let prepared = conn.prepare(sql).map(drop);
    conn.authorizer(None::<fn(AuthContext<'_>) -> Authorization>);
    prepared?;

    let tables = std::mem::take(&mut *seen.lock().unwrap_or_else(PoisonError::into_inner));
    Ok(tables)
}
