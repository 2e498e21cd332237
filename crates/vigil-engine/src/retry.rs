//! Bounded retry with exponential backoff for transient storage conflicts.

use std::time::Duration;

use crate::error::EngineError;

/// How often and how patiently transient conflicts are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    /// Delay before the first retry. Doubles on each subsequent retry.
    pub base_delay: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(25),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
            ..Self::default()
        }
    }

    /// Delay to wait after the given failed attempt (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Blocks the calling thread between attempts, so it must only be used
    /// off the async executor (inside `spawn_blocking` or plain threads).
    ///
    /// # Errors
    ///
    /// Non-transient errors are returned unchanged on first occurrence.
    /// Exhaustion yields [`EngineError::TransientFailure`].
    pub fn run<T>(&self, mut op: impl FnMut() -> Result<T, EngineError>) -> Result<T, EngineError> {
        let attempts = self.attempts.max(1);
        for attempt in 0..attempts {
            match op() {
                Err(e) if e.is_transient() => {
                    tracing::debug!(attempt, error = %e, "transient conflict");
                    if attempt + 1 < attempts {
                        std::thread::sleep(self.delay_for(attempt));
                    }
                }
                other => return other,
            }
        }
        tracing::warn!(attempts, "retries exhausted");
        Err(EngineError::TransientFailure { attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::ffi;

    fn busy() -> EngineError {
        EngineError::Database(rusqlite::Error::SqliteFailure(
            ffi::Error::new(ffi::SQLITE_BUSY),
            None,
        ))
    }

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1))
    }

    #[test]
    fn delays_grow_exponentially_and_cap() {
        let policy = RetryPolicy {
            attempts: 10,
            base_delay: Duration::from_millis(25),
            max_delay: Duration::from_millis(150),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(25));
        assert_eq!(policy.delay_for(1), Duration::from_millis(50));
        assert_eq!(policy.delay_for(2), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(150));
        assert_eq!(policy.delay_for(40), Duration::from_millis(150));
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let mut calls = 0;
        let result = fast(3).run(|| {
            calls += 1;
            if calls < 3 {
                Err(busy())
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn exhaustion_is_transient_failure() {
        let mut calls = 0;
        let result: Result<(), _> = fast(4).run(|| {
            calls += 1;
            Err(busy())
        });
        assert!(matches!(result, Err(EngineError::TransientFailure { attempts: 4 })));
        assert_eq!(calls, 4);
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let mut calls = 0;
        let result: Result<(), _> = fast(5).run(|| {
            calls += 1;
            Err(EngineError::InvalidSubscriber(String::new()))
        });
        assert!(matches!(result, Err(EngineError::InvalidSubscriber(_))));
        assert_eq!(calls, 1);
    }
}
