// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Retry policies with exponential backoff.
//!
//! A [`RetryPolicy`] is a plain value describing *how* to retry (schedule, jitter,
//! attempt and time caps). It is consumed by one combinator, [`retry_with_policy`],
//! and by the change queue's per-key rate limiter, so the schedule can be tested
//! without running the operation it wraps.

use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Maximum total time to spend retrying a Kubernetes API call (5 minutes)
const MAX_ELAPSED_TIME_SECS: u64 = 300;

/// Initial retry interval (100ms)
const INITIAL_INTERVAL_MILLIS: u64 = 100;

/// Maximum interval between retries (30 seconds)
const MAX_INTERVAL_SECS: u64 = 30;

/// Backoff multiplier (exponential growth factor)
const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Randomization factor to prevent thundering herd (±10%)
const RANDOMIZATION_FACTOR: f64 = 0.1;

/// Queue requeue initial interval (5ms)
const QUEUE_INITIAL_INTERVAL_MILLIS: u64 = 5;

/// Queue requeue maximum interval (1000 seconds)
const QUEUE_MAX_INTERVAL_SECS: u64 = 1000;

/// Declarative retry schedule.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial_interval: Duration,
    /// Upper bound of a single delay
    pub max_interval: Duration,
    /// Growth factor between consecutive delays (1.0 = fixed interval)
    pub multiplier: f64,
    /// Jitter applied to each delay (e.g., 0.1 for ±10%)
    pub randomization_factor: f64,
    /// Maximum number of attempts, including the first one
    pub max_attempts: Option<u32>,
    /// Maximum total time spent retrying
    pub max_elapsed_time: Option<Duration>,
}

impl RetryPolicy {
    /// Policy for Kubernetes API calls.
    ///
    /// # Retry Schedule
    ///
    /// 100ms, 200ms, 400ms, ... capped at 30s, ±10% jitter, for at most 5 minutes.
    #[must_use]
    pub fn kube_api() -> Self {
        Self {
            initial_interval: Duration::from_millis(INITIAL_INTERVAL_MILLIS),
            max_interval: Duration::from_secs(MAX_INTERVAL_SECS),
            multiplier: BACKOFF_MULTIPLIER,
            randomization_factor: RANDOMIZATION_FACTOR,
            max_attempts: None,
            max_elapsed_time: Some(Duration::from_secs(MAX_ELAPSED_TIME_SECS)),
        }
    }

    /// Per-key requeue policy of the change queue.
    ///
    /// 5ms doubling up to 1000s, no jitter, dropped after `max_attempts` failures.
    #[must_use]
    pub fn queue(max_attempts: u32) -> Self {
        Self {
            initial_interval: Duration::from_millis(QUEUE_INITIAL_INTERVAL_MILLIS),
            max_interval: Duration::from_secs(QUEUE_MAX_INTERVAL_SECS),
            multiplier: BACKOFF_MULTIPLIER,
            randomization_factor: 0.0,
            max_attempts: Some(max_attempts),
            max_elapsed_time: None,
        }
    }

    /// Fixed interval, unlimited attempts.
    #[must_use]
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial_interval: interval,
            max_interval: interval,
            multiplier: 1.0,
            randomization_factor: 0.0,
            max_attempts: None,
            max_elapsed_time: None,
        }
    }

    /// Cap the number of attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Deterministic delay before retry number `attempt` (1-based), without jitter.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64);
        let exponent = i32::try_from(exponent).unwrap_or(i32::MAX);
        let secs = self.initial_interval.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_interval.as_secs_f64() {
            return self.max_interval;
        }
        Duration::from_secs_f64(secs)
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    #[must_use]
    pub fn allows_attempt(&self, attempts: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempts < max)
    }

    /// Start a stateful backoff following this policy.
    #[must_use]
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            self.initial_interval,
            self.max_interval,
            self.max_elapsed_time,
            self.multiplier,
            self.randomization_factor,
        )
    }
}

/// Simple exponential backoff implementation.
///
/// Provides exponential backoff with randomization (jitter) to prevent thundering herd.
pub struct ExponentialBackoff {
    /// Current interval duration
    pub current_interval: Duration,
    /// Initial interval duration
    pub initial_interval: Duration,
    /// Maximum interval duration
    pub max_interval: Duration,
    /// Maximum total elapsed time
    pub max_elapsed_time: Option<Duration>,
    /// Backoff multiplier (typically 2.0 for doubling)
    pub multiplier: f64,
    /// Randomization factor (e.g., 0.1 for ±10%)
    pub randomization_factor: f64,
    /// Start time for tracking total elapsed time
    start_time: Instant,
}

impl ExponentialBackoff {
    fn new(
        initial_interval: Duration,
        max_interval: Duration,
        max_elapsed_time: Option<Duration>,
        multiplier: f64,
        randomization_factor: f64,
    ) -> Self {
        Self {
            current_interval: initial_interval,
            initial_interval,
            max_interval,
            max_elapsed_time,
            multiplier,
            randomization_factor,
            start_time: Instant::now(),
        }
    }

    /// Get the next backoff interval, or None if max elapsed time exceeded.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if let Some(max_elapsed) = self.max_elapsed_time {
            if self.start_time.elapsed() >= max_elapsed {
                return None;
            }
        }

        let interval = self.current_interval;
        let jittered = self.apply_jitter(interval);

        let next = interval.as_secs_f64() * self.multiplier;
        self.current_interval = Duration::from_secs_f64(next).min(self.max_interval);

        Some(jittered)
    }

    /// Restart the schedule from the initial interval.
    pub fn reset(&mut self) {
        self.current_interval = self.initial_interval;
        self.start_time = Instant::now();
    }

    fn apply_jitter(&self, interval: Duration) -> Duration {
        if self.randomization_factor == 0.0 {
            return interval;
        }

        let secs = interval.as_secs_f64();
        let delta = secs * self.randomization_factor;
        // Uniform in [secs - delta, secs + delta)
        let jittered = secs - delta + rand::random::<f64>() * 2.0 * delta;

        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// Create default exponential backoff configuration for Kubernetes API retries.
#[must_use]
pub fn default_backoff() -> ExponentialBackoff {
    RetryPolicy::kube_api().backoff()
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or `policy`
/// gives up. The last error is returned when retries are exhausted.
///
/// # Errors
///
/// Returns the operation's error if it is not retryable, or the last error seen once
/// the attempt or elapsed-time budget is spent.
pub async fn retry_with_policy<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: R,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut backoff = policy.backoff();
    let start_time = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(
                        operation = operation_name,
                        attempt = attempt,
                        elapsed = ?start_time.elapsed(),
                        "Operation succeeded after retries"
                    );
                }
                return Ok(value);
            }
            Err(e) => {
                if !is_retryable(&e) {
                    debug!(
                        operation = operation_name,
                        error = %e,
                        "Non-retryable error, returning to caller"
                    );
                    return Err(e);
                }

                if !policy.allows_attempt(attempt) {
                    error!(
                        operation = operation_name,
                        attempt = attempt,
                        error = %e,
                        "Max attempts reached, giving up"
                    );
                    return Err(e);
                }

                let Some(duration) = backoff.next_backoff() else {
                    error!(
                        operation = operation_name,
                        attempt = attempt,
                        elapsed = ?start_time.elapsed(),
                        error = %e,
                        "Backoff exhausted, giving up"
                    );
                    return Err(e);
                };

                warn!(
                    operation = operation_name,
                    attempt = attempt,
                    retry_after = ?duration,
                    error = %e,
                    "Retryable error, will retry"
                );
                tokio::time::sleep(duration).await;
            }
        }
    }
}

/// Retry a Kubernetes API call with the [`RetryPolicy::kube_api`] schedule.
///
/// Retries on transient errors (HTTP 429, 5xx, network) and fails immediately on
/// permanent errors (4xx client errors except 429).
///
/// # Errors
///
/// Returns the last Kubernetes error once it is non-retryable or the budget is spent.
///
/// # Example
///
/// ```no_run
/// use k8s_openapi::api::core::v1::Service;
/// use kube::{Api, Client};
/// use gateport::reconcilers::retry::retry_api_call;
///
/// # async fn example() -> anyhow::Result<()> {
/// let client = Client::try_default().await?;
/// let api: Api<Service> = Api::namespaced(client, "istio-system");
///
/// let service = retry_api_call(|| api.get("istio-ingressgateway"), "get ingress service").await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_api_call<T, F, Fut>(operation: F, operation_name: &str) -> Result<T, kube::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, kube::Error>>,
{
    retry_with_policy(
        &RetryPolicy::kube_api(),
        operation_name,
        is_retryable_error,
        operation,
    )
    .await
}

/// Determine if a Kubernetes error is retryable.
///
/// # Retryable Errors
///
/// - **HTTP 429** (Too Many Requests) - Rate limiting
/// - **HTTP 5xx** (Server Errors) - Temporary API server issues
/// - **Service Errors** - Network/connection issues
///
/// Everything else (400, 401, 403, 404, 409, ...) is returned to the caller.
#[must_use]
pub fn is_retryable_error(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(api_err) => {
            api_err.code == 429 || (api_err.code >= 500 && api_err.code < 600)
        }
        kube::Error::Service(_) => true,
        _ => false,
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod retry_tests;
