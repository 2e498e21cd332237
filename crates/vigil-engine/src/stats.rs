//! Engine-wide counters reported with the status query.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counters updated lock-free by every engine component.
#[derive(Debug, Default)]
pub struct EngineStats {
    change_events: AtomicU64,
    ignored_events: AtomicU64,
    invalidations: AtomicU64,
    coalesced: AtomicU64,
    dispatched: AtomicU64,
    evaluations: AtomicU64,
    busy_requeues: AtomicU64,
    transient_failures: AtomicU64,
    notifications: AtomicU64,
    errors: AtomicU64,
    watchdog_kills: AtomicU64,
}

/// A point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub change_events: u64,
    pub ignored_events: u64,
    pub invalidations: u64,
    pub coalesced: u64,
    pub dispatched: u64,
    pub evaluations: u64,
    pub busy_requeues: u64,
    pub transient_failures: u64,
    pub notifications: u64,
    pub errors: u64,
    pub watchdog_kills: u64,
}

macro_rules! counters {
    ($($name:ident => $field:ident),* $(,)?) => {
        impl EngineStats {
            $(
                pub(crate) fn $name(&self, n: u64) {
                    self.$field.fetch_add(n, Ordering::Relaxed);
                }
            )*

            /// Reads every counter.
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    add_change_events => change_events,
    add_ignored_events => ignored_events,
    add_invalidations => invalidations,
    add_coalesced => coalesced,
    add_dispatched => dispatched,
    add_evaluations => evaluations,
    add_busy_requeues => busy_requeues,
    add_transient_failures => transient_failures,
    add_notifications => notifications,
    add_errors => errors,
    add_watchdog_kills => watchdog_kills,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = EngineStats::default();
        stats.add_invalidations(3);
        stats.add_coalesced(2);
        stats.add_notifications(1);
        stats.add_invalidations(1);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.invalidations, 4);
        assert_eq!(snapshot.coalesced, 2);
        assert_eq!(snapshot.notifications, 1);
        assert_eq!(snapshot.evaluations, 0);
    }
}
