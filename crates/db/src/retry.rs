//! Retry policy with exponential backoff.
//!
//! This module decides whether a classified failure may be re-attempted and
//! how long to wait first. Only transient kinds (`CONNECTION_FAILED`,
//! `TIMEOUT`) whose `retryable` flag is also set are retried; everything else,
//! including domain outcomes such as position conflicts, is surfaced at once.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::classify::{ClassifiedError, ErrorClassifier, ErrorKind, StorageFailure};
use crate::metrics::DbMetrics;

/// Hard ceiling on any single backoff delay.
pub const MAX_DELAY: Duration = Duration::from_secs(30);

/// Fraction of the exponential delay added as jitter, at most.
pub const JITTER_FACTOR: f64 = 0.1;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY_MS: u64 = 100;

/// Configuration for retry behavior.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of calls to the operation, first attempt included.
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: get_env_or_default("TASKBOARD_RETRY_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)
                .max(1),
            base_delay_ms: get_env_or_default(
                "TASKBOARD_RETRY_BASE_DELAY_MS",
                DEFAULT_BASE_DELAY_MS,
            ),
        }
    }
}

fn get_env_or_default<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl RetryConfig {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
        }
    }

    /// Create a config for high-contention scenarios (more attempts, longer delays).
    pub fn high_contention() -> Self {
        Self::new(6, 200)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

/// Whether a classified failure should be re-attempted.
///
/// Both gates must pass: the `retryable` flag and a transient kind. A
/// misclassified flag alone can never cause a retry.
pub fn should_retry(error: &ClassifiedError) -> bool {
    error.retryable && matches!(error.kind, ErrorKind::ConnectionFailed | ErrorKind::Timeout)
}

/// Backoff delay for a 1-indexed attempt with an explicit jitter sample.
///
/// `base * 2^(attempt-1)` plus `jitter_sample * 10%` of that value, capped at
/// [`MAX_DELAY`]. `jitter_sample` is clamped into `[0, 1]`.
pub fn delay_with_jitter(attempt: u32, base: Duration, jitter_sample: f64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(63);
    let exponential = base
        .as_millis()
        .saturating_mul(1u128 << exponent)
        .min(MAX_DELAY.as_millis());
    let jitter = (exponential as f64 * JITTER_FACTOR * jitter_sample.clamp(0.0, 1.0)) as u128;
    let millis = exponential.saturating_add(jitter).min(MAX_DELAY.as_millis());
    Duration::from_millis(millis as u64)
}

/// Backoff delay for a 1-indexed attempt with uniform random jitter.
pub fn delay(attempt: u32, base: Duration) -> Duration {
    let sample = rand::rng().random_range(0.0..=1.0);
    delay_with_jitter(attempt, base, sample)
}

/// Execute an operation with exponential backoff retry.
///
/// The operation is called at most `config.max_attempts` times. On a failure
/// that is not retryable, or once attempts are exhausted, the original error
/// is returned unmodified so callers can still classify it.
///
/// # Example
/// ```ignore
/// use db::{ErrorClassifier, RetryConfig, with_retry};
///
/// let rows = with_retry(&RetryConfig::default(), &ErrorClassifier::default(), "list_tasks", || async {
///     sqlx::query("SELECT id FROM tasks").fetch_all(&pool).await
/// })
/// .await?;
/// ```
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    classifier: &ErrorClassifier,
    operation_name: &str,
    f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: StorageFailure + std::fmt::Debug,
{
    let never = CancellationToken::new();
    with_retry_until(config, classifier, operation_name, &never, None, f).await
}

/// [`with_retry`] that aborts pending backoff when `cancel` fires.
///
/// Cancellation returns the failure that scheduled the backoff, verbatim.
pub async fn with_retry_until<F, Fut, T, E>(
    config: &RetryConfig,
    classifier: &ErrorClassifier,
    operation_name: &str,
    cancel: &CancellationToken,
    metrics: Option<&DbMetrics>,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: StorageFailure + std::fmt::Debug,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match f().await {
            Ok(result) => {
                if attempt > 1 {
                    if let Some(metrics) = metrics {
                        metrics.record_retry(true);
                    }
                    tracing::debug!(
                        operation = operation_name,
                        attempts = attempt,
                        "Storage operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                let Some(signal) = e.signal() else {
                    return Err(e);
                };
                let classified = classifier.classify(&signal);

                if !should_retry(&classified) {
                    return Err(e);
                }

                if attempt >= max_attempts {
                    if let Some(metrics) = metrics {
                        metrics.record_retry(false);
                    }
                    tracing::error!(
                        operation = operation_name,
                        attempts = attempt,
                        kind = %classified.kind,
                        error = ?e,
                        "Storage operation failed after all retries"
                    );
                    return Err(e);
                }

                let wait = delay(attempt, config.base_delay());
                tracing::warn!(
                    operation = operation_name,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    delay_ms = wait.as_millis() as u64,
                    kind = %classified.kind,
                    error = ?e,
                    "Transient storage error, retrying with backoff"
                );

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        tracing::info!(
                            operation = operation_name,
                            attempt = attempt,
                            "Retry aborted by request cancellation"
                        );
                        return Err(e);
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
                attempt += 1;
            }
        }
    }
}
