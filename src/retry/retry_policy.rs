//! Backoff policy and the retry loop for remote calls

use super::retry_errors::{FailureClass, RemoteError};
use crate::admission::{AdmissionController, CallOutcome};
use crate::config::ConfigError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Backoff policy for retryable remote-call failures
///
/// `delay(attempt) = min(max_delay, base_delay * 2^attempt) * uniform(jitter_min, jitter_max)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_jitter_min")]
    pub jitter_min: f64,

    #[serde(default = "default_jitter_max")]
    pub jitter_max: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_min() -> f64 {
    0.5
}

fn default_jitter_max() -> f64 {
    1.5
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_min: default_jitter_min(),
            jitter_max: default_jitter_max(),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Short delays for tests and local simulation
    pub fn fast(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 20,
            ..Self::default()
        }
    }

    /// Capped exponential delay before jitter
    fn capped_backoff_ms(&self, attempt: u32) -> f64 {
        let exp_backoff = (self.base_delay_ms as f64) * 2_f64.powi(attempt.min(63) as i32);
        exp_backoff.min(self.max_delay_ms as f64)
    }

    /// Range the jittered delay for `attempt` (0-indexed) falls in
    pub fn delay_bounds(&self, attempt: u32) -> (Duration, Duration) {
        let capped = self.capped_backoff_ms(attempt);
        (
            Duration::from_millis((capped * self.jitter_min) as u64),
            Duration::from_millis((capped * self.jitter_max) as u64),
        )
    }

    /// Jittered delay for `attempt`, floored at a server Retry-After hint
    pub fn calculate_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let capped = self.capped_backoff_ms(attempt);

        let jitter = if self.jitter_min < self.jitter_max {
            rand::thread_rng().gen_range(self.jitter_min..self.jitter_max)
        } else {
            self.jitter_min
        };

        let delay = Duration::from_millis((capped * jitter).max(0.0) as u64);
        match retry_after {
            Some(hint) => delay.max(hint),
            None => delay,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_delay_ms == 0 {
            return Err(ConfigError::Validation(
                "retry.base_delay_ms must be > 0".to_string(),
            ));
        }

        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::Validation(format!(
                "retry.max_delay_ms ({}) is below retry.base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            )));
        }

        if self.jitter_min.is_nan() || self.jitter_min <= 0.0 || !self.jitter_max.is_finite() {
            return Err(ConfigError::Validation(
                "retry jitter bounds must be positive and finite".to_string(),
            ));
        }

        if self.jitter_min > self.jitter_max {
            return Err(ConfigError::Validation(format!(
                "retry.jitter_min ({}) exceeds retry.jitter_max ({})",
                self.jitter_min, self.jitter_max
            )));
        }

        Ok(())
    }
}

/// A remote call that eventually succeeded
#[derive(Debug, Clone)]
pub struct CallSuccess<T> {
    pub value: T,
    /// Retries needed before the successful attempt
    pub retry_count: u32,
    /// Attempts issued, including the successful one
    pub attempts: u32,
}

/// A remote call that could not complete
#[derive(Debug, Clone)]
pub struct CallFailure {
    /// Last underlying error
    pub error: RemoteError,
    pub class: FailureClass,
    pub retry_count: u32,
    pub attempts: u32,
}

impl CallFailure {
    fn new(error: RemoteError, retry_count: u32, attempts: u32) -> Self {
        Self {
            class: error.class(),
            error,
            retry_count,
            attempts,
        }
    }
}

/// Issue one remote call with admission control, a per-call timeout and
/// retries
///
/// Every attempt (retries included) holds its own admission permit and
/// reports its outcome back to the controller. `call` receives the 0-indexed
/// attempt number. Fatal failures return immediately; retryable ones are
/// retried up to `policy.max_retries` times.
pub async fn execute_with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    admission: &AdmissionController,
    call_timeout: Duration,
    label: &str,
    mut call: F,
) -> Result<CallSuccess<T>, CallFailure>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let metrics = crate::metrics::metrics();
    let start_time = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        if attempt > 0 {
            debug!(
                operation = label,
                attempt = attempt + 1,
                max_attempts = policy.max_retries + 1,
                "Retrying remote call"
            );
        }

        let permit = match admission.acquire().await {
            Ok(permit) => permit,
            Err(err) => {
                return Err(CallFailure::new(
                    RemoteError::Internal(err.to_string()),
                    attempt,
                    attempt,
                ));
            }
        };

        metrics.remote_attempts.inc();
        let call_start = Instant::now();
        let result = match tokio::time::timeout(call_timeout, call(attempt)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout {
                timeout_ms: call_timeout.as_millis() as u64,
            }),
        };
        metrics
            .call_duration_seconds
            .observe(call_start.elapsed().as_secs_f64());

        let outcome = match &result {
            Ok(_) => CallOutcome::Success,
            Err(err) if err.is_rate_limit() => CallOutcome::RateLimited,
            Err(_) => CallOutcome::Failure,
        };
        // Adjust the limit before the slot is handed to a waiter
        admission.record_outcome(outcome);
        permit.release();

        let err = match result {
            Ok(value) => {
                if attempt > 0 {
                    debug!(
                        operation = label,
                        attempts = attempt + 1,
                        duration_ms = start_time.elapsed().as_millis() as u64,
                        "Remote call succeeded after retry"
                    );
                }
                return Ok(CallSuccess {
                    value,
                    retry_count: attempt,
                    attempts: attempt + 1,
                });
            }
            Err(err) => err,
        };

        if !err.is_retryable() {
            warn!(
                operation = label,
                error = %err,
                class = err.class().as_str(),
                "Fatal remote error, not retrying"
            );
            return Err(CallFailure::new(err, attempt, attempt + 1));
        }

        if attempt >= policy.max_retries {
            warn!(
                operation = label,
                attempts = attempt + 1,
                error = %err,
                "All retry attempts exhausted"
            );
            return Err(CallFailure::new(err, attempt, attempt + 1));
        }

        let backoff = policy.calculate_delay(attempt, err.retry_after());
        debug!(
            operation = label,
            attempt = attempt + 1,
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            class = err.class().as_str(),
            "Retryable remote error, backing off"
        );
        metrics.retries_total.inc();
        metrics.backoff_seconds.observe(backoff.as_secs_f64());

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = admission.closed() => {
                return Err(CallFailure::new(
                    RemoteError::Internal("shutdown during retry backoff".to_string()),
                    attempt,
                    attempt + 1,
                ));
            }
        }

        attempt += 1;
    }
}
