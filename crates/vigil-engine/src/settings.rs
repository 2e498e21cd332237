//! Engine tunables.

use std::time::Duration;

use crate::evaluator::Watchdog;
use crate::retry::RetryPolicy;

/// Runtime tunables for the engine. Every interval is in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Minimum spacing between two evaluation starts of one observer.
    pub throttle_ms: u64,

    /// Number of evaluation workers.
    pub workers: usize,

    /// Capacity of the executor cache.
    pub executor_cache_capacity: usize,

    /// Evaluations slower than this are logged.
    pub warn_threshold_ms: u64,

    /// Evaluations slower than this stop the observer.
    pub kill_threshold_ms: u64,

    /// Results longer than this are logged.
    pub max_result_length: usize,

    /// Lifetime of an evaluation lease. Must exceed `kill_threshold_ms`, the
    /// longest a query is allowed to run under it.
    pub lease_ttl_ms: u64,

    /// Attempts for transient storage conflicts.
    pub retry_attempts: u32,

    /// First backoff delay for transient conflicts.
    pub retry_base_ms: u64,

    /// Notification batching window. Zero delivers immediately.
    pub batch_window_ms: u64,

    /// Period of the dependency index refresh. Zero disables it.
    pub index_refresh_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            throttle_ms: 2_000,
            workers: 4,
            executor_cache_capacity: 256,
            warn_threshold_ms: 1_000,
            kill_threshold_ms: 20_000,
            max_result_length: 1_000,
            lease_ttl_ms: 30_000,
            retry_attempts: 3,
            retry_base_ms: 25,
            batch_window_ms: 0,
            index_refresh_ms: 30_000,
        }
    }
}

/// Settings that cannot work together.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("lease_ttl_ms ({lease_ttl_ms}) must exceed kill_threshold_ms ({kill_threshold_ms})")]
    LeaseOutlivedByWatchdog {
        lease_ttl_ms: u64,
        kill_threshold_ms: u64,
    },
}

impl EngineSettings {
    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::LeaseOutlivedByWatchdog`] when a query could
    /// still be running after its lease expired.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.lease_ttl_ms <= self.kill_threshold_ms {
            return Err(SettingsError::LeaseOutlivedByWatchdog {
                lease_ttl_ms: self.lease_ttl_ms,
                kill_threshold_ms: self.kill_threshold_ms,
            });
        }
        Ok(())
    }

    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn index_refresh(&self) -> Duration {
        Duration::from_millis(self.index_refresh_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, Duration::from_millis(self.retry_base_ms))
    }

    pub fn watchdog(&self) -> Watchdog {
        Watchdog {
            warn_after: Duration::from_millis(self.warn_threshold_ms),
            kill_after: Duration::from_millis(self.kill_threshold_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(EngineSettings::default().validate(), Ok(()));
    }

    #[test]
    fn lease_must_outlast_the_watchdog() {
        let settings = EngineSettings {
            kill_threshold_ms: 30_000,
            lease_ttl_ms: 30_000,
            ..EngineSettings::default()
        };
        assert_eq!(
            settings.validate(),
            Err(SettingsError::LeaseOutlivedByWatchdog {
                lease_ttl_ms: 30_000,
                kill_threshold_ms: 30_000,
            })
        );
    }
}
