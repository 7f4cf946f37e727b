//! Bounded caller-side retry for `Busy` failures.

use crate::error::{CoreError, CoreResult};
use std::time::Duration;
use tracing::debug;

/// Retries an operation while it fails with [`CoreError::Busy`].
///
/// The delay doubles after each attempt. Any other error, and the last
/// `Busy`, is returned unchanged.
///
/// ```rust
/// use docsync_core::{BusyRetry, ConcurrencyPolicy, Database, Document};
/// use std::time::Duration;
///
/// let db = Database::open_in_memory().unwrap();
/// let mut doc = Document::with_id("doc1").unwrap();
/// BusyRetry::new(3, Duration::from_millis(10))
///     .run(|| db.save(&mut doc, ConcurrencyPolicy::LastWriteWins))
///     .unwrap();
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusyRetry {
    attempts: u32,
    delay: Duration,
}

impl BusyRetry {
    /// Creates a policy making at most `attempts` calls (at least one).
    #[must_use]
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// Returns the maximum number of calls.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Runs `op`, retrying on `Busy`.
    ///
    /// # Errors
    ///
    /// Returns the first non-`Busy` error, or `Busy` once attempts run out.
    pub fn run<T, F>(&self, mut op: F) -> CoreResult<T>
    where
        F: FnMut() -> CoreResult<T>,
    {
        let mut delay = self.delay;
        let mut attempt = 1;
        loop {
            match op() {
                Err(CoreError::Busy) if attempt < self.attempts => {
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "store busy, retrying");
                    std::thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

impl Default for BusyRetry {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(20))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_busy_until_success() {
        let mut calls = 0;
        let result = BusyRetry::new(3, Duration::ZERO).run(|| {
            calls += 1;
            if calls < 3 {
                Err(CoreError::Busy)
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn gives_up_after_attempts() {
        let mut calls = 0;
        let result: CoreResult<()> = BusyRetry::new(2, Duration::ZERO).run(|| {
            calls += 1;
            Err(CoreError::Busy)
        });
        assert!(matches!(result, Err(CoreError::Busy)));
        assert_eq!(calls, 2);
    }

    #[test]
    fn other_errors_are_not_retried() {
        let mut calls = 0;
        let result: CoreResult<()> = BusyRetry::new(5, Duration::ZERO).run(|| {
            calls += 1;
            Err(CoreError::not_found("x"))
        });
        assert!(matches!(result, Err(CoreError::NotFound { .. })));
        assert_eq!(calls, 1);
    }
}
