//! Attempt-counted retry loop with exponential backoff.
//!
//! Shared by every provider adapter so that backoff behaviour is defined
//! in one place:
//!
//! ```text
//! delay(k) = clamp(base * 2^k, min_backoff, max_backoff)     k = failed attempt index (0-based)
//! ```

use crate::config::RetryPolicy;
use chorus_env::ChorusContext;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Final result of a retried operation.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    /// Attempts made, including the last one
    pub attempts: u32,
}

/// Delay before the attempt following failed attempt `attempt` (0-based).
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    let raw = policy
        .base_backoff
        .checked_mul(factor)
        .unwrap_or(policy.max_backoff);
    raw.min(policy.max_backoff).max(policy.min_backoff)
}

/// Runs `op` up to `policy.max_attempts` times.
///
/// `op` receives the 1-based attempt number. An error for which
/// `retryable` returns false ends the loop immediately. Sleeps go
/// through the context so simulated runs do not wait in real time.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    ctx: &dyn ChorusContext,
    policy: &RetryPolicy,
    retryable: R,
    mut op: F,
) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => {
                return RetryOutcome { result: Ok(value), attempts: attempt };
            }
            Err(e) if attempt < max_attempts && retryable(&e) => {
                let delay = backoff_delay(policy, attempt - 1);
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, backing off"
                );
                ctx.sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                return RetryOutcome { result: Err(e), attempts: attempt };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::SystemTime;

    /// Records sleeps instead of performing them.
    #[derive(Default)]
    struct RecordingClock {
        slept: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl ChorusContext for RecordingClock {
        fn now(&self) -> Duration {
            self.slept.lock().unwrap().iter().sum()
        }

        fn system_time(&self) -> SystemTime {
            SystemTime::UNIX_EPOCH + self.now()
        }

        async fn sleep(&self, duration: Duration) {
            self.slept.lock().unwrap().push(duration);
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            min_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_backoff_doubles_and_clamps() {
        let p = policy();
        assert_eq!(backoff_delay(&p, 0), Duration::from_secs(2)); // 1s raised to min
        assert_eq!(backoff_delay(&p, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(&p, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(&p, 3), Duration::from_secs(8));
        assert_eq!(backoff_delay(&p, 5), Duration::from_secs(30));
        assert_eq!(backoff_delay(&p, 40), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_retry_stops_after_max_attempts() {
        let clock = RecordingClock::default();
        let outcome: RetryOutcome<(), String> =
            retry_with_backoff(&clock, &policy(), |_| true, |_| async { Err("boom".to_string()) }).await;

        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(
            *clock.slept.lock().unwrap(),
            vec![Duration::from_secs(2), Duration::from_secs(2)]
        );
    }

    #[tokio::test]
    async fn test_retry_returns_first_success() {
        let clock = RecordingClock::default();
        let outcome: RetryOutcome<u32, String> = retry_with_backoff(&clock, &policy(), |_| true, |attempt| async move {
            if attempt < 2 {
                Err("transient".to_string())
            } else {
                Ok(attempt)
            }
        })
        .await;

        assert_eq!(outcome.result.unwrap(), 2);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(clock.slept.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_error_short_circuits() {
        let clock = RecordingClock::default();
        let outcome: RetryOutcome<(), String> =
            retry_with_backoff(&clock, &policy(), |_| false, |_| async { Err("fatal".to_string()) }).await;

        assert_eq!(outcome.attempts, 1);
        assert!(clock.slept.lock().unwrap().is_empty());
    }
}
