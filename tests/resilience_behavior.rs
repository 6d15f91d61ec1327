//! Behavior-driven tests for upstream resilience
//!
//! These tests verify HOW the circuit breaker, rate limiter and retry loop
//! protect a struggling upstream.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use noticewatch_core::retry::retry_with_backoff;
use noticewatch_core::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, NoticeError, RateLimitConfig, RateLimiter,
    RetryConfig,
};
use tokio_util::sync::CancellationToken;

fn breaker(threshold: u32) -> CircuitBreaker {
    CircuitBreaker::new(
        "api.exchange.test",
        CircuitBreakerConfig {
            failure_threshold: threshold,
            open_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(5),
        },
    )
}

async fn fail(breaker: &CircuitBreaker) -> Result<(), NoticeError> {
    breaker
        .execute(|| async { Err::<(), _>(NoticeError::network("api.exchange.test", "connection reset")) })
        .await
}

async fn succeed(breaker: &CircuitBreaker) -> Result<(), NoticeError> {
    breaker.execute(|| async { Ok(()) }).await
}

// =============================================================================
// Circuit breaker: State machine
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_failures_reach_the_threshold_then_the_circuit_opens() {
    // Given: A closed breaker with threshold 3
    let breaker = breaker(3);

    // When: Two failures happen
    for _ in 0..2 {
        assert!(fail(&breaker).await.is_err());
    }

    // Then: It is still closed; the third failure opens it
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert!(fail(&breaker).await.is_err());
    assert_eq!(breaker.state(), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn when_the_circuit_is_open_then_calls_fail_fast_without_running() {
    // Given: An open breaker
    let breaker = breaker(1);
    assert!(fail(&breaker).await.is_err());
    let calls = AtomicU32::new(0);

    // When: A call is attempted before the open timeout
    let result = breaker
        .execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;

    // Then: It is rejected and the operation never ran
    assert!(matches!(result, Err(NoticeError::CircuitOpen { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn when_the_open_timeout_elapses_then_a_successful_probe_closes_the_circuit() {
    // Given: An open breaker
    let breaker = breaker(1);
    assert!(fail(&breaker).await.is_err());

    // When: The open timeout elapses
    tokio::time::advance(Duration::from_secs(30)).await;

    // Then: The next request moves to half-open and a success closes it
    assert!(breaker.allow_request());
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    assert!(succeed(&breaker).await.is_ok());
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.consecutive_errors(), 0);
}

#[tokio::test(start_paused = true)]
async fn when_a_half_open_probe_fails_then_the_circuit_reopens() {
    // Given: A breaker that has reached half-open
    let breaker = breaker(2);
    for _ in 0..2 {
        assert!(fail(&breaker).await.is_err());
    }
    tokio::time::advance(Duration::from_secs(31)).await;

    // When: The probe fails
    assert!(fail(&breaker).await.is_err());

    // Then: The circuit is open again and counts a second opening
    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(breaker.snapshot().open_count, 2);
}

#[tokio::test(start_paused = true)]
async fn when_an_upstream_rate_limits_then_the_breaker_is_not_tripped() {
    // Given: A breaker with threshold 1
    let breaker = breaker(1);

    // When: The upstream answers with a rate limit
    let result = breaker
        .execute(|| async {
            Err::<(), _>(NoticeError::RateLimited {
                destination: "api.exchange.test".to_string(),
                retry_after_ms: 1_000,
            })
        })
        .await;

    // Then: The error surfaces but the circuit stays closed
    assert!(matches!(result, Err(NoticeError::RateLimited { .. })));
    assert_eq!(breaker.state(), CircuitState::Closed);
}

// =============================================================================
// Rate limiter: Windows and penalties
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_a_window_is_full_then_requests_wait_for_the_next_window() {
    // Given: A limiter allowing two requests per second
    let limiter = RateLimiter::new(RateLimitConfig {
        max_requests: 2,
        window: Duration::from_secs(1),
        ..RateLimitConfig::default()
    });

    // When: Two requests complete and a third asks for a slot
    for _ in 0..2 {
        assert!(limiter.can_make_request("api").is_ok());
        limiter.record_success("api");
    }
    let wait = limiter.can_make_request("api").expect_err("window is full");

    // Then: The third waits at most a window, and other destinations are unaffected
    assert!(wait <= Duration::from_secs(1));
    assert!(limiter.can_make_request("board").is_ok());
    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(limiter.can_make_request("api").is_ok());
}

#[tokio::test(start_paused = true)]
async fn when_failures_repeat_then_the_penalty_grows_and_is_capped() {
    // Given: A limiter with a 1s base penalty capped at 3s
    let limiter = RateLimiter::new(RateLimitConfig {
        retry_delay: Duration::from_secs(1),
        backoff_multiplier: 2.0,
        max_penalty: Duration::from_secs(3),
        ..RateLimitConfig::default()
    });

    // When: Three failures are recorded
    let penalties: Vec<Duration> = (0..3).map(|_| limiter.record_failure("api")).collect();

    // Then: 1s, 2s, then capped at 3s; a success clears the penalty
    assert_eq!(
        penalties,
        vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(3)]
    );
    assert!(limiter.can_make_request("api").is_err());
    limiter.record_success("api");
    assert!(limiter.can_make_request("api").is_ok());
}

// =============================================================================
// Retry: Bounded attempts
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_a_call_keeps_failing_then_retries_stop_after_the_configured_count() {
    // Given: Two retries with a fixed delay
    let config = RetryConfig::fixed(Duration::from_millis(100), 2);
    let attempts = AtomicU32::new(0);

    // When: Every attempt fails with a retryable error
    let result: Result<(), NoticeError> = retry_with_backoff(&config, &CancellationToken::new(), |_| {
        attempts.fetch_add(1, Ordering::SeqCst);
        async { Err(NoticeError::network("api.exchange.test", "connection reset")) }
    })
    .await;

    // Then: Three attempts were made in total
    assert!(matches!(result, Err(NoticeError::Network { .. })));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn when_shutdown_is_requested_then_the_backoff_sleep_is_cut_short() {
    // Given: A long backoff
    let config = RetryConfig::fixed(Duration::from_secs(3_600), 5);
    let cancel = CancellationToken::new();
    let attempts = AtomicU32::new(0);

    // When: Shutdown is requested while the first attempt fails
    let result: Result<(), NoticeError> = retry_with_backoff(&config, &cancel, |_| {
        attempts.fetch_add(1, Ordering::SeqCst);
        cancel.cancel();
        async { Err(NoticeError::network("api.exchange.test", "connection reset")) }
    })
    .await;

    // Then: The loop ends as cancelled instead of sleeping
    assert!(matches!(result, Err(NoticeError::Cancelled)));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}
