//! Retry middleware: exponential backoff with jitter for transient failures.
//!
//! Only failures whose `FailureKind::is_transient()` holds are retried.
//! Permanent failures (validation, business) surface immediately, as does
//! exhaustion of the attempt budget.

use std::time::Duration;

use rand::Rng;
use weft_types::error::StepFailure;

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Backoff schedule shared by step dispatch and compensation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Jitter fraction applied to each delay (0.25 = +/-25%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep after a failed attempt. `attempt` is 1-based: the
    /// delay after the first failure is `base_delay`, doubling thereafter
    /// up to `max_delay`, with jitter applied last.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self.base_delay.as_millis() as u64 * (1u64 << exp);
        let capped = raw.min(self.max_delay.as_millis() as u64);

        if self.jitter <= 0.0 {
            return Duration::from_millis(capped);
        }

        let spread = (capped as f64 * self.jitter) as i64;
        let offset = if spread > 0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0
        };
        Duration::from_millis(capped.saturating_add_signed(offset))
    }
}

// ---------------------------------------------------------------------------
// Retry loop
// ---------------------------------------------------------------------------

/// Run `operation` until it succeeds, fails permanently, or exhausts
/// `max_attempts`. Returns the final result together with the number of
/// attempts actually made.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    max_attempts: u32,
    mut operation: F,
) -> (Result<T, StepFailure>, u32)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StepFailure>>,
{
    let budget = max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return (Ok(value), attempt),
            Err(failure) if failure.kind.is_transient() && attempt < budget => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt,
                    max_attempts = budget,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(failure) => return (Err(failure), attempt),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
