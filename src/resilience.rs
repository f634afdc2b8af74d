//! Retry with exponential backoff and per-service circuit breakers.
//!
//! Every outbound call goes through [`call_with_retry`]. Circuit state is
//! process-local: each workflow run constructs a fresh
//! [`CircuitBreakers`] registry and drops it at exit, so a tripped
//! circuit never outlives the run that tripped it.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::error::{ErrorKind, PipelineError};

/// Retry policy for one call site.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first (default 3).
    pub max_attempts: u32,
    /// Base for the exponential wait: attempt k waits `base^k` seconds.
    pub backoff_base: f64,
    /// Ceiling on a single wait.
    pub backoff_max: Duration,
    /// Failure kinds worth retrying; anything else surfaces immediately.
    pub retry_on: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: 2.0,
            backoff_max: Duration::from_secs(30),
            retry_on: vec![ErrorKind::Api, ErrorKind::RateLimit, ErrorKind::Timeout],
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    fn retries(&self, kind: ErrorKind) -> bool {
        self.retry_on.contains(&kind)
    }

    /// Wait before the attempt after attempt `k`: `min(base^k, max)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let secs = self.backoff_base.powi(attempt as i32);
        Duration::from_secs_f64(secs.min(self.backoff_max.as_secs_f64()))
    }
}

struct BreakerState {
    consecutive_failures: u32,
    open: bool,
}

/// Per-service consecutive-failure counters. Lookups and updates are safe
/// from concurrent workers within one process.
pub struct CircuitBreakers {
    states: Mutex<HashMap<String, BreakerState>>,
    thresholds: HashMap<&'static str, u32>,
    default_threshold: u32,
}

impl CircuitBreakers {
    pub fn new() -> Self {
        let thresholds = HashMap::from([
            ("reddit", 5),
            ("search", 5),
            ("llm", 5),
            ("marketplace", 3),
            ("store", 3),
            ("image_gen", 3),
            ("object_store", 3),
        ]);
        Self {
            states: Mutex::new(HashMap::new()),
            thresholds,
            default_threshold: 5,
        }
    }

    fn threshold(&self, service: &str) -> u32 {
        self.thresholds
            .get(service)
            .copied()
            .unwrap_or(self.default_threshold)
    }

    pub fn is_open(&self, service: &str) -> bool {
        self.states
            .lock()
            .get(service)
            .map(|s| s.open)
            .unwrap_or(false)
    }

    /// Fail fast when the circuit is open; no underlying call is made.
    pub fn check(&self, service: &str) -> Result<(), PipelineError> {
        if self.is_open(service) {
            warn!(service, "circuit open, skipping call");
            return Err(PipelineError::CircuitOpen {
                service: service.to_string(),
            });
        }
        Ok(())
    }

    /// Any success zeroes the counter and closes the circuit.
    pub fn record_success(&self, service: &str) {
        let mut states = self.states.lock();
        if let Some(state) = states.get_mut(service) {
            if state.consecutive_failures > 0 {
                debug!(service, "circuit breaker reset after success");
            }
            state.consecutive_failures = 0;
            state.open = false;
        }
    }

    /// Record a failure. Returns true when this failure tripped the
    /// circuit open.
    pub fn record_failure(&self, service: &str) -> bool {
        let threshold = self.threshold(service);
        let mut states = self.states.lock();
        let state = states.entry(service.to_string()).or_insert(BreakerState {
            consecutive_failures: 0,
            open: false,
        });
        state.consecutive_failures += 1;
        if state.consecutive_failures >= threshold && !state.open {
            state.open = true;
            warn!(
                service,
                failures = state.consecutive_failures,
                "circuit breaker OPEN"
            );
            return true;
        }
        false
    }

    pub fn consecutive_failures(&self, service: &str) -> u32 {
        self.states
            .lock()
            .get(service)
            .map(|s| s.consecutive_failures)
            .unwrap_or(0)
    }

    /// Reset all circuits (e.g. at the start of a new run).
    pub fn reset_all(&self) {
        self.states.lock().clear();
    }
}

impl Default for CircuitBreakers {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `op` against `service` under the retry policy and circuit breaker.
///
/// Non-retryable failures surface after the first attempt without
/// touching the breaker. Retryable failures count toward the breaker and
/// end in `RetryExhausted` carrying the last underlying failure; a
/// circuit tripping mid-sequence stops further attempts.
pub async fn call_with_retry<T, F, Fut>(
    breakers: &CircuitBreakers,
    service: &str,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, PipelineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PipelineError>>,
{
    breakers.check(service)?;

    let mut last: Option<PipelineError> = None;
    for attempt in 1..=policy.max_attempts {
        match op().await {
            Ok(value) => {
                breakers.record_success(service);
                return Ok(value);
            }
            Err(err) if !policy.retries(err.kind()) => {
                return Err(err);
            }
            Err(err) => {
                breakers.record_failure(service);
                warn!(
                    service,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %err,
                    "attempt failed"
                );
                last = Some(err);
                if breakers.is_open(service) {
                    error!(service, attempt, "circuit tripped, abandoning retries");
                    break;
                }
                if attempt < policy.max_attempts {
                    tokio::time::sleep(policy.backoff_delay(attempt)).await;
                }
            }
        }
    }

    let last = last.expect("loop ran at least once");
    Err(PipelineError::RetryExhausted {
        attempts: policy.max_attempts,
        last: Box::new(last),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn flaky(fail_first: u32, calls: &AtomicU32) -> Result<u32, PipelineError> {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= fail_first {
            Err(PipelineError::api("marketplace", format!("boom {n}")))
        } else {
            Ok(n)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_transient_failures() {
        let breakers = CircuitBreakers::new();
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);

        let result = call_with_retry(&breakers, "marketplace", &policy, || async {
            flaky(2, &calls)
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Success closed the window again.
        assert_eq!(breakers.consecutive_failures("marketplace"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted_carries_attempt_count() {
        let breakers = CircuitBreakers::new();
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);

        let result: Result<u32, _> = call_with_retry(&breakers, "reddit", &policy, || async {
            flaky(10, &calls)
        })
        .await;

        match result {
            Err(PipelineError::RetryExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last.kind(), ErrorKind::Api);
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_surfaces_after_first_attempt() {
        let breakers = CircuitBreakers::new();
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = call_with_retry(&breakers, "marketplace", &policy, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(PipelineError::Validation("bad payload".to_string()))
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Validation);
        // Non-retryable failures do not feed the breaker.
        assert_eq!(breakers.consecutive_failures("marketplace"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_at_threshold_and_fails_fast() {
        let breakers = CircuitBreakers::new();
        // marketplace threshold is 3; one exhausted sequence of 3 attempts trips it.
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);

        let _ = call_with_retry(&breakers, "marketplace", &policy, || async {
            flaky(10, &calls)
        })
        .await;
        assert!(breakers.is_open("marketplace"));

        // Next call fails immediately with circuit_open, no op invocation.
        let before = calls.load(Ordering::SeqCst);
        let result: Result<u32, _> = call_with_retry(&breakers, "marketplace", &policy, || async {
            flaky(10, &calls)
        })
        .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::CircuitOpen);
        assert_eq!(calls.load(Ordering::SeqCst), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_closes_open_circuit_counter() {
        let breakers = CircuitBreakers::new();
        for _ in 0..3 {
            breakers.record_failure("image_gen");
        }
        assert!(breakers.is_open("image_gen"));
        breakers.record_success("image_gen");
        assert!(!breakers.is_open("image_gen"));
        assert_eq!(breakers.consecutive_failures("image_gen"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_all_clears_state() {
        let breakers = CircuitBreakers::new();
        for _ in 0..5 {
            breakers.record_failure("reddit");
        }
        assert!(breakers.is_open("reddit"));
        breakers.reset_all();
        assert!(!breakers.is_open("reddit"));
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(4));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(8));
        assert_eq!(policy.backoff_delay(10), Duration::from_secs(30));
    }
}
