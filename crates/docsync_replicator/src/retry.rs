//! Error classification and reconnect backoff.

use crate::error::ReplicatorError;
use crate::transport::CLOSE_GOING_AWAY;
use rand::Rng;
use std::time::Duration;

/// How a session failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Likely to clear after a delay: reconnect with backoff.
    Transient,
    /// Likely to clear only after the network changes: wait for a
    /// reachability signal.
    NetworkDependent,
    /// Retrying will not help: stop the session.
    Fatal,
}

/// What the session does after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Go offline. Reconnect after `delay`, or only on a reachability
    /// signal if `delay` is `None`.
    Offline {
        /// Backoff before the next attempt.
        delay: Option<Duration>,
    },
    /// Stop the session and report the error.
    Stop,
}

/// Reconnect policy of a replication session.
///
/// Continuous sessions retry transient failures without limit and wait out
/// network-dependent ones. One-shot sessions retry transient failures at
/// most `max_one_shot_retries` times and treat everything else as fatal.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first reconnect.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Growth factor between attempts.
    pub multiplier: f64,
    /// Add up to 25% random jitter.
    pub jitter: bool,
    /// Reconnect attempts allowed to a one-shot session.
    pub max_one_shot_retries: u32,
}

impl RetryPolicy {
    /// Creates the default policy: 2 s doubling to 10 min, with jitter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(600),
            multiplier: 2.0,
            jitter: true,
            max_one_shot_retries: 2,
        }
    }

    /// Sets the first delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the growth factor. Values below 1 (and NaN) become 1.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Sets the one-shot retry budget.
    #[must_use]
    pub fn with_max_one_shot_retries(mut self, retries: u32) -> Self {
        self.max_one_shot_retries = retries;
        self
    }

    /// Classifies a session failure.
    #[must_use]
    pub fn classify(error: &ReplicatorError) -> ErrorClass {
        match error {
            ReplicatorError::Timeout
            | ReplicatorError::ConnectionReset
            | ReplicatorError::ConnectionRefused => ErrorClass::Transient,
            ReplicatorError::RemoteClosed { code } if *code == CLOSE_GOING_AWAY => {
                ErrorClass::Transient
            }
            ReplicatorError::Http { status, .. } if is_transient_status(*status) => {
                ErrorClass::Transient
            }
            ReplicatorError::Core(err) if err.is_busy() => ErrorClass::Transient,
            ReplicatorError::HostUnreachable
            | ReplicatorError::UnknownHost(_)
            | ReplicatorError::NetworkDown => ErrorClass::NetworkDependent,
            _ => ErrorClass::Fatal,
        }
    }

    /// Decides how to handle `error` after `retry_count` reconnects have
    /// already been scheduled since the session was last connected.
    #[must_use]
    pub fn decide(&self, error: &ReplicatorError, continuous: bool, retry_count: u32) -> RetryDecision {
        let class = Self::classify(error);
        let offline = match class {
            ErrorClass::Transient => true,
            ErrorClass::NetworkDependent => continuous,
            ErrorClass::Fatal => false,
        };
        if !offline || (!continuous && retry_count >= self.max_one_shot_retries) {
            return RetryDecision::Stop;
        }

        let delay = match class {
            ErrorClass::Transient => Some(self.delay_for_attempt(retry_count + 1)),
            _ => None,
        };
        RetryDecision::Offline { delay }
    }

    /// Returns the backoff before reconnect `attempt` (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let multiplier = self.multiplier.max(1.0);
        let base = self.initial_delay.as_secs_f64() * multiplier.powi(exponent);
        let cap = self.max_delay.as_secs_f64();
        let mut secs = base.min(cap);
        if self.jitter {
            secs = (secs * (1.0 + 0.25 * rand::thread_rng().gen::<f64>())).min(cap);
        }
        Duration::try_from_secs_f64(secs).map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_core::CoreError;
    use proptest::prelude::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new().with_jitter(false)
    }

    #[test]
    fn classification() {
        assert_eq!(RetryPolicy::classify(&ReplicatorError::Timeout), ErrorClass::Transient);
        assert_eq!(
            RetryPolicy::classify(&ReplicatorError::http(503, "")),
            ErrorClass::Transient
        );
        assert_eq!(
            RetryPolicy::classify(&CoreError::Busy.into()),
            ErrorClass::Transient
        );
        assert_eq!(
            RetryPolicy::classify(&ReplicatorError::RemoteClosed { code: CLOSE_GOING_AWAY }),
            ErrorClass::Transient
        );
        assert_eq!(
            RetryPolicy::classify(&ReplicatorError::HostUnreachable),
            ErrorClass::NetworkDependent
        );
        assert_eq!(
            RetryPolicy::classify(&ReplicatorError::UnknownHost("h".into())),
            ErrorClass::NetworkDependent
        );
        assert_eq!(
            RetryPolicy::classify(&ReplicatorError::AuthenticationFailed("no".into())),
            ErrorClass::Fatal
        );
        assert_eq!(
            RetryPolicy::classify(&ReplicatorError::http(401, "")),
            ErrorClass::Fatal
        );
        assert_eq!(
            RetryPolicy::classify(&ReplicatorError::Tls("bad cert".into())),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn delays_double_from_two_seconds() {
        let p = policy();
        assert_eq!(p.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(p.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(p.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(p.delay_for_attempt(20), Duration::from_secs(600));
    }

    #[test]
    fn degenerate_settings_never_panic() {
        let shrinking = policy().with_multiplier(-3.0);
        assert_eq!(shrinking.multiplier, 1.0);
        assert_eq!(shrinking.delay_for_attempt(2), Duration::from_secs(2));

        let mut raw = policy();
        raw.multiplier = -3.0;
        assert_eq!(raw.delay_for_attempt(2), Duration::from_secs(2));
        raw.multiplier = f64::NAN;
        assert_eq!(raw.delay_for_attempt(4), Duration::from_secs(2));

        let unbounded = RetryPolicy::new()
            .with_initial_delay(Duration::MAX)
            .with_max_delay(Duration::MAX);
        assert!(unbounded.delay_for_attempt(3) <= Duration::MAX);
        assert!(unbounded.with_jitter(false).delay_for_attempt(1) > Duration::ZERO);
    }

    #[test]
    fn continuous_waits_out_network_errors() {
        let p = policy();
        assert_eq!(
            p.decide(&ReplicatorError::NetworkDown, true, 100),
            RetryDecision::Offline { delay: None }
        );
        assert_eq!(
            p.decide(&ReplicatorError::Timeout, true, 0),
            RetryDecision::Offline {
                delay: Some(Duration::from_secs(2))
            }
        );
    }

    #[test]
    fn one_shot_retry_budget() {
        let p = policy();
        let err = ReplicatorError::ConnectionReset;
        assert!(matches!(p.decide(&err, false, 0), RetryDecision::Offline { .. }));
        assert!(matches!(p.decide(&err, false, 1), RetryDecision::Offline { .. }));
        assert_eq!(p.decide(&err, false, 2), RetryDecision::Stop);
        assert_eq!(p.decide(&ReplicatorError::NetworkDown, false, 0), RetryDecision::Stop);
    }

    #[test]
    fn fatal_always_stops() {
        let p = policy();
        let err = ReplicatorError::AuthenticationFailed("bad password".into());
        assert_eq!(p.decide(&err, true, 0), RetryDecision::Stop);
        assert_eq!(p.decide(&err, false, 0), RetryDecision::Stop);
    }

    proptest! {
        #[test]
        fn jittered_delay_stays_in_bounds(attempt in 1u32..64) {
            let p = RetryPolicy::new();
            let plain = policy().delay_for_attempt(attempt);
            let jittered = p.delay_for_attempt(attempt);
            prop_assert!(jittered >= plain);
            prop_assert!(jittered <= p.max_delay);
            prop_assert!(jittered.as_secs_f64() <= plain.as_secs_f64() * 1.25 + 1e-9);
        }
    }
}
