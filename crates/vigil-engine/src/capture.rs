//! Change capture for application writes to a SQLite store.
//!
//! [`ChangeCapture::write`] runs a write transaction with an update hook
//! installed and, only after the commit succeeds, emits one
//! [`ChangeEvent`] per `(table, operation)` with the affected row ids.
//! Rolled back transactions emit nothing. Engine tables are never reported.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use rusqlite::hooks::Action;
use rusqlite::Transaction;
use tokio::sync::mpsc;
use vigil_db::DbPool;
use vigil_types::{is_engine_table, ChangeEvent, ChangeOperation};

use crate::error::EngineError;

type Captured = BTreeMap<(String, ChangeOperation), Vec<String>>;

/// Post-commit change hook feeding the engine.
#[derive(Debug, Clone)]
pub struct ChangeCapture {
    pool: DbPool,
    sink: mpsc::UnboundedSender<ChangeEvent>,
}

impl ChangeCapture {
    pub fn new(pool: DbPool, sink: mpsc::UnboundedSender<ChangeEvent>) -> Self {
        Self { pool, sink }
    }

    /// Runs `f` inside a transaction and reports its mutations after commit.
    ///
    /// Blocks; call it off the async executor. Row ids are reported as the
    /// affected keys, which equal the primary key for `INTEGER PRIMARY KEY`
    /// tables.
    ///
    /// # Errors
    ///
    /// Returns the error of `f` or of the commit. No event is emitted then.
    pub fn write<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, rusqlite::Error>,
    ) -> Result<T, EngineError> {
        let mut conn = self.pool.get()?;
        let captured: Arc<Mutex<Captured>> = Arc::default();
        let hook_sink = Arc::clone(&captured);

        conn.update_hook(Some(move |action: Action, _db: &str, table: &str, rowid: i64| {
            if is_engine_table(table) {
                return;
            }
            let operation = match action {
                Action::SQLITE_INSERT => ChangeOperation::Insert,
                Action::SQLITE_UPDATE => ChangeOperation::Update,
                Action::SQLITE_DELETE => ChangeOperation::Delete,
                _ => return,
            };
            hook_sink
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry((table.to_string(), operation))
                .or_default()
                .push(rowid.to_string());
        }));

        let result = (|| {
            let tx = conn.transaction()?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok::<_, rusqlite::Error>(value)
        })();
        conn.update_hook(None::<fn(Action, &str, &str, i64)>);

        let value = result?;
        let captured = std::mem::take(&mut *captured.lock().unwrap_or_else(PoisonError::into_inner));
        for ((table, operation), affected_keys) in captured {
            tracing::debug!(table = %table, operation = operation.as_str(), rows = affected_keys.len(), "captured change");
            if self.sink.send(ChangeEvent::new(table, operation, affected_keys)).is_err() {
                tracing::warn!("change listener gone, event dropped");
            }
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;

    use crate::test_support::test_pool;

    fn capture() -> (tempfile::TempDir, ChangeCapture, mpsc::UnboundedReceiver<ChangeEvent>) {
        let (dir, pool) = test_pool();
        pool.get()
            .unwrap()
            .execute_batch("CREATE TABLE items (id INTEGER PRIMARY KEY, title TEXT)")
            .unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        (dir, ChangeCapture::new(pool, tx), rx)
    }

    #[test]
    fn committed_writes_are_reported_per_table_and_operation() {
        let (_dir, capture, mut rx) = capture();
        capture
            .write(|tx| {
                tx.execute("INSERT INTO items (id, title) VALUES (1, 'a'), (2, 'b')", [])?;
                tx.execute("UPDATE items SET title = 'c' WHERE id = ?1", params![2])?;
                tx.execute(
                    "INSERT INTO vigil_subscribers (subscriber_id) VALUES ('internal')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.len(), 2, "engine tables are not reported");
        assert_eq!(events[0].table, "items");
        assert_eq!(events[0].operation, ChangeOperation::Insert);
        assert_eq!(events[0].affected_keys, vec!["1".to_string(), "2".to_string()]);
        assert_eq!(events[1].operation, ChangeOperation::Update);
        assert_eq!(events[1].affected_keys, vec!["2".to_string()]);
    }

    #[test]
    fn rolled_back_writes_emit_nothing() {
        let (_dir, capture, mut rx) = capture();
        let result: Result<(), _> = capture.write(|tx| {
            tx.execute("INSERT INTO items (id, title) VALUES (1, 'a')", [])?;
            tx.execute("INSERT INTO missing_table VALUES (1)", [])?;
            Ok(())
        });
        assert!(result.is_err());
        assert!(rx.try_recv().is_err());

        let count: i64 = capture
            .write(|tx| tx.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0)))
            .unwrap();
        assert_eq!(count, 0, "the insert was rolled back");
    }
}
