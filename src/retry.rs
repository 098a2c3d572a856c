//! Bounded retry with configurable delay growth.
//!
//! One [`RetryPolicy`] type covers every retry loop in the bridge:
//! optional-tier installs use a fixed delay, the activation handshake uses a
//! delay that grows linearly with the attempt number.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Retry configuration.
///
/// `delay_for_attempt(n)` is `base_delay * (1 + (n - 1) * (multiplier - 1))`
/// for `multiplier >= 1`, i.e. fixed when the multiplier is 1 and
/// `base_delay * n` when it is 2. Delays never decrease with `n`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt, in milliseconds.
    pub base_delay_ms: u64,
    /// Growth factor per attempt (1.0 = fixed, 2.0 = linear).
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Same delay between every attempt.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: duration_ms(delay),
            backoff_multiplier: 1.0,
        }
    }

    /// `delay * attempt` between attempts.
    pub fn linear(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: duration_ms(delay),
            backoff_multiplier: 2.0,
        }
    }

    /// Set the maximum number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = duration_ms(delay);
        self
    }

    /// Set the growth factor. Values below 1.0 are clamped to 1.0.
    pub fn with_backoff_multiplier(mut self, backoff_multiplier: f64) -> Self {
        self.backoff_multiplier = backoff_multiplier;
        self
    }

    /// Delay to sleep after failed attempt number `attempt` (1-based).
    ///
    /// Attempt 0 has no delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base = self.base_delay_ms as f64;
        let step = (self.backoff_multiplier.max(1.0) - 1.0) * f64::from(attempt - 1);
        let delay = base * (1.0 + step);
        if !delay.is_finite() || delay >= u64::MAX as f64 {
            return Duration::from_millis(u64::MAX);
        }
        Duration::from_millis(delay as u64)
    }

    /// Runs `op` until it succeeds, `should_retry` rejects the error, or the
    /// attempts are exhausted. `op` receives the 1-based attempt number.
    ///
    /// Returns the last error on failure.
    pub async fn run<T, E, F, Fut, R>(&self, mut op: F, should_retry: R) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < max_attempts && should_retry(&e) => {
                    let delay = self.delay_for_attempt(attempt);
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn fixed_delay_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(5));
    }

    #[test]
    fn linear_delay_grows_with_attempt() {
        let policy = RetryPolicy::linear(3, Duration::from_millis(2_000));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(4_000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(6_000));
    }

    #[test]
    fn attempt_zero_has_no_delay() {
        assert_eq!(RetryPolicy::default().delay_for_attempt(0), Duration::ZERO);
    }

    #[test]
    fn delays_never_decrease() {
        let policy = RetryPolicy::default().with_backoff_multiplier(0.25);
        let mut prev = Duration::ZERO;
        for n in 1..10 {
            let d = policy.delay_for_attempt(n);
            assert!(d >= prev);
            prev = d;
        }
    }

    #[test]
    fn huge_delay_saturates() {
        let policy = RetryPolicy::default()
            .with_base_delay(Duration::from_millis(u64::MAX / 2))
            .with_backoff_multiplier(1e30);
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn config_roundtrip_via_toml() {
        let policy = RetryPolicy::linear(4, Duration::from_millis(250));
        let s = toml::to_string(&policy).unwrap();
        let back: RetryPolicy = toml::from_str(&s).unwrap();
        assert_eq!(back, policy);
    }

    #[tokio::test(start_paused = true)]
    async fn run_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::fixed(3, Duration::from_secs(5));
        let c = Arc::clone(&calls);
        let result: Result<u32, &str> = policy
            .run(
                move |attempt| {
                    let c = Arc::clone(&c);
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        if attempt < 3 { Err("not yet") } else { Ok(attempt) }
                    }
                },
                |_| true,
            )
            .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_non_retryable_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result: Result<(), &str> = RetryPolicy::fixed(5, Duration::from_secs(1))
            .run(
                move |_| {
                    let c = Arc::clone(&c);
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Err("permanent")
                    }
                },
                |e| *e != "permanent",
            )
            .await;
        assert_eq!(result, Err("permanent"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_returns_last_error_when_exhausted() {
        let result: Result<(), u32> = RetryPolicy::fixed(3, Duration::from_secs(5))
            .run(|attempt| async move { Err(attempt) }, |_| true)
            .await;
        assert_eq!(result, Err(3));
    }
}
