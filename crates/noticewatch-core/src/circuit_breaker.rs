use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::domain::Timestamp;
use crate::NoticeError;

/// Runtime circuit state for one upstream destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker thresholds and timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before allowing a probe.
    pub open_timeout: Duration,
    /// Hard deadline for each guarded call.
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(5),
        }
    }
}

/// Point-in-time view of a breaker, for metrics export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub destination: String,
    pub state: CircuitState,
    pub consecutive_errors: u32,
    pub total_errors: u64,
    pub total_successes: u64,
    pub last_error_at: Option<Timestamp>,
    pub last_success_at: Option<Timestamp>,
    pub open_count: u64,
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    consecutive_errors: u32,
    total_errors: u64,
    total_successes: u64,
    last_error_at: Option<Timestamp>,
    last_success_at: Option<Timestamp>,
    open_count: u64,
    opened_at: Option<Instant>,
}

impl Default for CircuitInner {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_errors: 0,
            total_errors: 0,
            total_successes: 0,
            last_error_at: None,
            last_success_at: None,
            open_count: 0,
            opened_at: None,
        }
    }
}

/// Thread-safe circuit breaker guarding calls to one destination.
#[derive(Debug)]
pub struct CircuitBreaker {
    destination: String,
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(destination: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            destination: destination.into(),
            config,
            inner: Mutex::new(CircuitInner::default()),
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    /// Whether a call may go out now. Moves OPEN to HALF_OPEN once the open
    /// timeout has elapsed.
    pub fn allow_request(&self) -> bool {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let can_probe = inner
                    .opened_at
                    .map(|opened_at| opened_at.elapsed() >= self.config.open_timeout)
                    .unwrap_or(false);

                if can_probe {
                    inner.state = CircuitState::HalfOpen;
                    inner.opened_at = None;
                    tracing::info!(destination = %self.destination, "circuit half-open, probing");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        if inner.state != CircuitState::Closed {
            tracing::info!(destination = %self.destination, "circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_errors = 0;
        inner.opened_at = None;
        inner.total_successes = inner.total_successes.saturating_add(1);
        inner.last_success_at = Some(Timestamp::now());
    }

    pub fn record_failure(&self) {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        inner.consecutive_errors = inner.consecutive_errors.saturating_add(1);
        inner.total_errors = inner.total_errors.saturating_add(1);
        inner.last_error_at = Some(Timestamp::now());

        let trips = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_errors >= self.config.failure_threshold,
            CircuitState::Open => false,
        };
        if trips {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.open_count = inner.open_count.saturating_add(1);
            tracing::warn!(
                destination = %self.destination,
                consecutive_errors = inner.consecutive_errors,
                open_for_ms = self.config.open_timeout.as_millis() as u64,
                "circuit opened"
            );
        }
    }

    pub fn state(&self) -> CircuitState {
        let inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        inner.state
    }

    pub fn consecutive_errors(&self) -> u32 {
        let inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        inner.consecutive_errors
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        CircuitSnapshot {
            destination: self.destination.clone(),
            state: inner.state,
            consecutive_errors: inner.consecutive_errors,
            total_errors: inner.total_errors,
            total_successes: inner.total_successes,
            last_error_at: inner.last_error_at,
            last_success_at: inner.last_success_at,
            open_count: inner.open_count,
        }
    }

    /// Run `operation` under the breaker and the call timeout.
    ///
    /// An open circuit fails fast with [`NoticeError::CircuitOpen`] without
    /// running the operation. A timeout counts as a failure.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, NoticeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, NoticeError>>,
    {
        if !self.allow_request() {
            return Err(NoticeError::CircuitOpen {
                destination: self.destination.clone(),
            });
        }

        let outcome = match tokio::time::timeout(self.config.call_timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(NoticeError::Timeout {
                destination: self.destination.clone(),
                timeout_ms: self.config.call_timeout.as_millis() as u64,
            }),
        };

        match &outcome {
            Ok(_) => self.record_success(),
            Err(error) if error.counts_as_failure() => self.record_failure(),
            Err(_) => {}
        }
        outcome
    }

    /// Like [`execute`](Self::execute), but any failure, including a rejected
    /// call on an open circuit, is handed to `fallback`.
    pub async fn execute_or_else<T, F, Fut, FB>(
        &self,
        operation: F,
        fallback: FB,
    ) -> Result<T, NoticeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, NoticeError>>,
        FB: FnOnce(NoticeError) -> Result<T, NoticeError>,
    {
        match self.execute(operation).await {
            Ok(value) => Ok(value),
            Err(error) => fallback(error),
        }
    }
}
