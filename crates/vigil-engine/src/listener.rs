//! Change listener: routes committed change events to the scheduler.

use std::sync::Arc;

use tokio::sync::mpsc;
use vigil_types::{is_engine_table, ChangeEvent, Fingerprint};

use crate::index::DependencyIndex;
use crate::stats::EngineStats;
use crate::throttle::SchedulerHandle;

/// Observers impacted by `event`. Engine bookkeeping tables impact nothing.
pub fn route(event: &ChangeEvent, index: &DependencyIndex) -> Vec<Fingerprint> {
    if is_engine_table(&event.table) {
        return Vec::new();
    }
    index.lookup(&event.table)
}

/// Consumes change events until every sender is dropped.
pub async fn listen(
    mut events: mpsc::UnboundedReceiver<ChangeEvent>,
    index: Arc<DependencyIndex>,
    scheduler: SchedulerHandle,
    stats: Arc<EngineStats>,
) {
    while let Some(event) = events.recv().await {
        stats.add_change_events(1);
        if is_engine_table(&event.table) {
            stats.add_ignored_events(1);
            tracing::debug!(table = %event.table, "ignoring engine bookkeeping change");
            continue;
        }

        let impacted = route(&event, &index);
        if impacted.is_empty() {
            continue;
        }
        tracing::debug!(
            table = %event.table,
            operation = event.operation.as_str(),
            keys = event.affected_keys.len(),
            observers = impacted.len(),
            "change event routed"
        );
        for fingerprint in impacted {
            scheduler.invalidate(fingerprint);
        }
    }
    tracing::debug!("change listener stopped");
}
