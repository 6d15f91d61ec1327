//! Retry logic with exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::NoticeError;

/// Backoff strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Uses a fixed delay between retries.
    Fixed {
        /// Delay between retries.
        delay: Duration,
    },
    /// Uses an exponential delay between retries.
    ///
    /// The delay is `min(base * 2^attempt, max)` plus a random extra of up to
    /// `jitter * delay`.
    Exponential {
        /// The initial backoff duration.
        base: Duration,
        /// The maximum duration before jitter.
        max: Duration,
        /// Fraction of the delay added at random, in `[0, 1]`.
        jitter: f64,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_millis(250),
            max: Duration::from_secs(5),
            jitter: 0.2,
        }
    }
}

impl Backoff {
    /// Calculate the delay for a given retry attempt.
    ///
    /// # Arguments
    ///
    /// * `attempt` - The retry attempt number (0-based)
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Exponential { base, max, jitter } => {
                let scale = 2_f64.powi(attempt.min(62) as i32);
                let capped = (base.as_secs_f64() * scale).min(max.as_secs_f64());
                let jitter = jitter.clamp(0.0, 1.0);
                let extra = if jitter > 0.0 {
                    capped * jitter * fastrand::f64()
                } else {
                    0.0
                };
                Duration::from_secs_f64(capped + extra)
            }
        }
    }
}

/// Configuration for the retry loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enables or disables retries.
    pub enabled: bool,
    /// Retries after the first attempt. Total attempts = `max_retries + 1`.
    pub max_retries: u32,
    /// The backoff strategy to use between retries.
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration with exponential backoff.
    pub fn exponential(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Create a new retry configuration with fixed backoff.
    pub fn fixed(delay: Duration, max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed { delay },
            ..Self::default()
        }
    }

    /// Disable retries.
    pub fn no_retry() -> Self {
        Self {
            enabled: false,
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Calculate the delay for a given retry attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }
}

/// Sleep for `delay` unless `cancel` fires first.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<(), NoticeError> {
    tokio::select! {
        () = cancel.cancelled() => Err(NoticeError::Cancelled),
        () = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or the
/// retry budget is spent. The final error propagates unchanged; sleeps happen
/// only between attempts and end early on cancellation.
pub async fn retry_with_backoff<T, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, NoticeError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, NoticeError>>,
{
    let mut attempt = 0_u32;
    loop {
        if cancel.is_cancelled() {
            return Err(NoticeError::Cancelled);
        }

        let error = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        let exhausted = !config.enabled || attempt >= config.max_retries;
        if exhausted || !error.is_retryable() {
            return Err(error);
        }

        let delay = config.delay_for_attempt(attempt);
        tracing::warn!(
            attempt = attempt + 1,
            max_retries = config.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retrying after failure"
        );
        sleep_or_cancel(delay, cancel).await?;
        attempt += 1;
    }
}
