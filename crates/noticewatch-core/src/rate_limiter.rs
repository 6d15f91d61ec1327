//! Per-destination request windows with failure penalties.
//!
//! Independent of the circuit breaker: the breaker decides whether a
//! destination is healthy, the limiter decides how often it may be called.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::retry::sleep_or_cancel;
use crate::NoticeError;

/// Request window and penalty tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests allowed per window.
    pub max_requests: u32,
    pub window: Duration,
    /// Penalty after the first failure.
    pub retry_delay: Duration,
    /// Growth of the penalty per further consecutive failure.
    pub backoff_multiplier: f64,
    /// Upper bound on a single penalty.
    pub max_penalty: Duration,
    /// Attempts made by [`RateLimiter::run`] before giving up.
    pub max_attempts: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_secs(1),
            retry_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_penalty: Duration::from_secs(60),
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone)]
struct RateLimitWindow {
    count: u32,
    window_reset_at: Instant,
    consecutive_failures: u32,
    penalty_until: Option<Instant>,
    last_used: Instant,
}

impl RateLimitWindow {
    fn new(now: Instant, window: Duration) -> Self {
        Self {
            count: 0,
            window_reset_at: now + window,
            consecutive_failures: 0,
            penalty_until: None,
            last_used: now,
        }
    }
}

/// Metrics view of one destination window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitSnapshot {
    pub destination: String,
    pub count: u32,
    pub consecutive_failures: u32,
    pub penalty_remaining_ms: u64,
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, RateLimitWindow>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// `Ok` when a call may go out now, otherwise the wait before asking again.
    pub fn can_make_request(&self, destination: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let mut windows = self
            .windows
            .lock()
            .expect("rate limiter lock is not poisoned");
        let window = windows
            .entry(destination.to_owned())
            .or_insert_with(|| RateLimitWindow::new(now, self.config.window));
        window.last_used = now;

        if let Some(until) = window.penalty_until {
            if until > now {
                return Err(until - now);
            }
            window.penalty_until = None;
        }

        if now >= window.window_reset_at {
            window.count = 0;
            window.window_reset_at = now + self.config.window;
        }

        if window.count < self.config.max_requests {
            Ok(())
        } else {
            Err(window.window_reset_at - now)
        }
    }

    /// Count a completed call. The count may pass the cap by the calls that
    /// were already in flight when it was reached.
    pub fn record_success(&self, destination: &str) {
        let now = Instant::now();
        let mut windows = self
            .windows
            .lock()
            .expect("rate limiter lock is not poisoned");
        let window = windows
            .entry(destination.to_owned())
            .or_insert_with(|| RateLimitWindow::new(now, self.config.window));
        window.count = window.count.saturating_add(1);
        window.consecutive_failures = 0;
        window.penalty_until = None;
        window.last_used = now;
    }

    /// Open a penalty of `retry_delay * multiplier^(failures - 1)` and return it.
    pub fn record_failure(&self, destination: &str) -> Duration {
        self.open_penalty(destination, Duration::ZERO)
    }

    /// Like [`record_failure`](Self::record_failure) for a `429`: the penalty is
    /// at least the server's `retry_after`, even past `max_penalty`.
    pub fn record_rate_limited(&self, destination: &str, retry_after: Duration) -> Duration {
        self.open_penalty(destination, retry_after)
    }

    fn open_penalty(&self, destination: &str, floor: Duration) -> Duration {
        let now = Instant::now();
        let mut windows = self
            .windows
            .lock()
            .expect("rate limiter lock is not poisoned");
        let window = windows
            .entry(destination.to_owned())
            .or_insert_with(|| RateLimitWindow::new(now, self.config.window));
        window.consecutive_failures = window.consecutive_failures.saturating_add(1);
        window.last_used = now;

        let exponent = window.consecutive_failures.saturating_sub(1).min(62) as i32;
        let scaled = self.config.retry_delay.as_secs_f64()
            * self.config.backoff_multiplier.max(1.0).powi(exponent);
        let backoff = Duration::from_secs_f64(scaled.min(self.config.max_penalty.as_secs_f64()));
        let penalty = backoff.max(floor);
        window.penalty_until = Some(now + penalty);

        tracing::debug!(
            destination,
            consecutive_failures = window.consecutive_failures,
            penalty_ms = penalty.as_millis() as u64,
            retry_after_ms = floor.as_millis() as u64,
            "rate limiter penalty opened"
        );
        penalty
    }

    /// Wait until `destination` may be called. The wait ends early on
    /// cancellation.
    pub async fn acquire(&self, destination: &str, cancel: &CancellationToken) -> Result<(), NoticeError> {
        loop {
            if cancel.is_cancelled() {
                return Err(NoticeError::Cancelled);
            }
            match self.can_make_request(destination) {
                Ok(()) => return Ok(()),
                Err(wait) => sleep_or_cancel(wait, cancel).await?,
            }
        }
    }

    /// Acquire a slot, run `operation`, record the outcome, and try again after
    /// a retryable failure up to `max_attempts` times in total.
    pub async fn run<T, F, Fut>(
        &self,
        destination: &str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, NoticeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, NoticeError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts = 0_u32;
        loop {
            self.acquire(destination, cancel).await?;
            let error = match operation().await {
                Ok(value) => {
                    self.record_success(destination);
                    return Ok(value);
                }
                Err(error) => error,
            };

            let rate_limited = match &error {
                NoticeError::RateLimited { retry_after_ms, .. } => {
                    self.record_rate_limited(destination, Duration::from_millis(*retry_after_ms));
                    true
                }
                other => {
                    if other.counts_as_failure() {
                        self.record_failure(destination);
                    }
                    false
                }
            };
            attempts += 1;
            if attempts >= max_attempts || !(rate_limited || error.is_retryable()) {
                return Err(error);
            }
        }
    }

    /// Drop windows unused for longer than `max_idle` with no active penalty.
    /// Returns how many were removed.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut windows = self
            .windows
            .lock()
            .expect("rate limiter lock is not poisoned");
        let before = windows.len();
        windows.retain(|_, window| {
            let penalized = window.penalty_until.is_some_and(|until| until > now);
            penalized || now.duration_since(window.last_used) <= max_idle
        });
        before - windows.len()
    }

    pub fn tracked_destinations(&self) -> usize {
        self.windows
            .lock()
            .expect("rate limiter lock is not poisoned")
            .len()
    }

    pub fn snapshots(&self) -> Vec<RateLimitSnapshot> {
        let now = Instant::now();
        let windows = self
            .windows
            .lock()
            .expect("rate limiter lock is not poisoned");
        let mut snapshots: Vec<RateLimitSnapshot> = windows
            .iter()
            .map(|(destination, window)| RateLimitSnapshot {
                destination: destination.clone(),
                count: window.count,
                consecutive_failures: window.consecutive_failures,
                penalty_remaining_ms: window
                    .penalty_until
                    .map(|until| until.saturating_duration_since(now).as_millis() as u64)
                    .unwrap_or(0),
            })
            .collect();
        snapshots.sort_by(|a, b| a.destination.cmp(&b.destination));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn limiter(max_requests: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            max_requests,
            window: Duration::from_secs(1),
            retry_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_penalty: Duration::from_secs(1),
            max_attempts: 3,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn window_blocks_at_cap_and_rolls_forward() {
        let limiter = limiter(2);

        assert!(limiter.can_make_request("api").is_ok());
        limiter.record_success("api");
        limiter.record_success("api");

        let wait = limiter.can_make_request("api").expect_err("window is full");
        assert!(wait <= Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.can_make_request("api").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn penalty_grows_with_consecutive_failures() {
        let limiter = limiter(10);

        assert_eq!(limiter.record_failure("api"), Duration::from_millis(100));
        assert_eq!(limiter.record_failure("api"), Duration::from_millis(200));
        assert_eq!(limiter.record_failure("api"), Duration::from_millis(400));
        assert!(limiter.can_make_request("api").is_err());

        limiter.record_success("api");
        assert!(limiter.can_make_request("api").is_ok());
        assert_eq!(limiter.record_failure("api"), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn penalty_is_capped() {
        let limiter = limiter(10);
        for _ in 0..10 {
            limiter.record_failure("api");
        }
        assert_eq!(limiter.record_failure("api"), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_sets_a_floor_under_the_penalty() {
        let limiter = limiter(10);

        assert_eq!(
            limiter.record_rate_limited("api", Duration::from_secs(2)),
            Duration::from_secs(2)
        );
        assert_eq!(
            limiter.can_make_request("api").expect_err("penalized"),
            Duration::from_secs(2)
        );
        assert_eq!(
            limiter.record_rate_limited("api", Duration::from_millis(10)),
            Duration::from_millis(200)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn run_waits_out_the_server_retry_after() {
        let limiter = limiter(10);
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        limiter
            .run("api", &cancel, || {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call == 0 {
                        Err(NoticeError::RateLimited {
                            destination: String::from("api"),
                            retry_after_ms: 3_000,
                        })
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .expect("second attempt succeeds");

        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn destinations_are_independent() {
        let limiter = limiter(1);
        limiter.record_success("api");
        assert!(limiter.can_make_request("api").is_err());
        assert!(limiter.can_make_request("board").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn run_retries_retryable_failures_up_to_the_cap() {
        let limiter = limiter(10);
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = limiter
            .run("api", &cancel, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(NoticeError::network("api", "reset")) }
            })
            .await;

        assert!(matches!(result, Err(NoticeError::Network { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn run_sleeps_out_the_penalty_then_succeeds() {
        let limiter = limiter(10);
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let value = limiter
            .run("api", &cancel, || {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call == 0 {
                        Err(NoticeError::network("api", "reset"))
                    } else {
                        Ok(call)
                    }
                }
            })
            .await
            .expect("second attempt succeeds");

        assert_eq!(value, 1);
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(limiter.snapshots()[0].consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_windows_are_evicted() {
        let limiter = limiter(10);
        limiter.record_success("api");
        limiter.record_success("board");

        tokio::time::advance(Duration::from_secs(30)).await;
        limiter.record_success("board");

        assert_eq!(limiter.evict_idle(Duration::from_secs(10)), 1);
        assert_eq!(limiter.tracked_destinations(), 1);
        assert_eq!(limiter.snapshots()[0].destination, "board");
    }

    #[tokio::test]
    async fn acquire_stops_on_cancellation() {
        let limiter = limiter(10);
        limiter.record_failure("api");
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(
            limiter.acquire("api", &cancel).await,
            Err(NoticeError::Cancelled)
        ));
    }
}
