//! Bounded retry for transient control-plane failures.
//!
//! Delays grow exponentially from `base_delay`, are capped at `max_delay`, and
//! are spread by +/-25% random jitter. No attempt starts past the caller's deadline.
use crate::error::{ReconcileError, ReconcileResult};
use rand::Rng;
use std::time::{Duration, Instant};

const DEFAULT_MAX_ATTEMPTS: u32 = 4;
const DEFAULT_BASE_DELAY_MS: u64 = 500;
const DEFAULT_MAX_DELAY_MS: u64 = 20_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// A policy that never sleeps; used by tests and dry runs over fakes.
    pub fn immediate(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self.base_delay.saturating_mul(2u32.saturating_pow(exponent));
        delay.min(self.max_delay)
    }

    fn jittered(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        if delay_ms == 0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0..=delay_ms / 2);
        Duration::from_millis(delay_ms.saturating_sub(delay_ms / 4).saturating_add(jitter))
    }

    /// Run `op` until it succeeds, fails with a non-transient error, runs out
    /// of attempts, or would sleep past `deadline`.
    pub fn run<T, F>(&self, label: &str, deadline: Option<Instant>, mut op: F) -> ReconcileResult<T>
    where
        F: FnMut() -> ReconcileResult<T>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = self.jittered(attempt);
                    if let Some(deadline) = deadline {
                        if Instant::now() + delay >= deadline {
                            tracing::warn!(label, attempt, "deadline reached, giving up");
                            return Err(ReconcileError::Transient(format!(
                                "{label}: deadline reached after {attempt} attempts ({})",
                                err.message()
                            )));
                        }
                    }
                    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                    tracing::warn!(
                        label,
                        attempt,
                        max_attempts,
                        delay_ms,
                        error = %err,
                        "transient failure, will retry"
                    );
                    std::thread::sleep(delay);
                }
                Err(err) => {
                    if err.is_retryable() {
                        tracing::error!(label, attempt, error = %err, "retries exhausted");
                    }
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(30), Duration::from_millis(350));
    }

    #[test]
    fn transient_errors_retry_until_success() {
        let calls = Cell::new(0);
        let result = RetryPolicy::immediate(3).run("probe", None, || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(ReconcileError::Transient("throttled".into()))
            } else {
                Ok("done")
            }
        });
        assert_eq!(result, Ok("done"));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn non_transient_errors_are_not_retried() {
        let calls = Cell::new(0);
        let result: ReconcileResult<()> = RetryPolicy::immediate(5).run("probe", None, || {
            calls.set(calls.get() + 1);
            Err(ReconcileError::Permission("denied".into()))
        });
        assert!(matches!(result, Err(ReconcileError::Permission(_))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn attempts_are_bounded() {
        let calls = Cell::new(0);
        let result: ReconcileResult<()> = RetryPolicy::immediate(2).run("probe", None, || {
            calls.set(calls.get() + 1);
            Err(ReconcileError::Transient("timeout".into()))
        });
        assert!(matches!(result, Err(ReconcileError::Transient(_))));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn expired_deadline_stops_retrying() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(50),
        };
        let calls = Cell::new(0);
        let deadline = Instant::now();
        let result: ReconcileResult<()> = policy.run("probe", Some(deadline), || {
            calls.set(calls.get() + 1);
            Err(ReconcileError::Transient("timeout".into()))
        });
        assert!(matches!(result, Err(ReconcileError::Transient(msg)) if msg.contains("deadline")));
        assert_eq!(calls.get(), 1);
    }
}
